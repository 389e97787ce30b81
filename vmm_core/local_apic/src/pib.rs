// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pending-interrupt bitmaps.
//!
//! Any thread may post an interrupt by setting a bit here; only the owning
//! processor drains the bits into IRR. Posting never takes a lock and never
//! touches the register page beyond reading IRR.

use crate::ipi::TriggerMode;
use crate::page::VectorRegister;
use crate::telemetry::ApicEvent;
use crate::ApicPlatform;
use crate::SharedState;
use crate::WorkFlags;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use x86defs::apic::Esr;
use x86defs::apic::APIC_ILLEGAL_VECTOR_END;

/// Set in a source tag when more than one source posted the same vector.
pub const SOURCE_TAG_MULTIPLE: u32 = 0x8000_0000;

/// The saved contents of a [`PendingInterruptBitmap`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct PibState {
    /// The pending vectors, 64 per word.
    pub words: [u64; 4],
    /// Whether a notification is outstanding.
    pub outstanding: bool,
}

/// 256 pending-vector bits and a coalescing notification flag.
#[derive(Debug, Default)]
pub(crate) struct PendingInterruptBitmap {
    words: [AtomicU64; 4],
    outstanding: AtomicBool,
}

impl PendingInterruptBitmap {
    pub fn set_vector(&self, vector: u8) {
        self.words[vector as usize / 64].fetch_or(1 << (vector % 64), Ordering::Release);
    }

    /// Raises the notification flag. Returns true if it was not already
    /// raised, in which case the owner needs to be told to drain.
    #[must_use]
    pub fn notify(&self) -> bool {
        !self.outstanding.swap(true, Ordering::AcqRel)
    }

    /// Takes the notification flag, returning whether it was raised.
    pub fn take_notification(&self) -> bool {
        self.outstanding.load(Ordering::Relaxed) && self.outstanding.swap(false, Ordering::AcqRel)
    }

    /// Takes word `index`, leaving it zero.
    pub fn take_word(&self, index: usize) -> u64 {
        if self.words[index].load(Ordering::Relaxed) == 0 {
            return 0;
        }
        self.words[index].swap(0, Ordering::Acquire)
    }

    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
        self.outstanding.store(false, Ordering::Relaxed);
    }

    pub fn state(&self) -> PibState {
        PibState {
            words: std::array::from_fn(|i| self.words[i].load(Ordering::Relaxed)),
            outstanding: self.outstanding.load(Ordering::Relaxed),
        }
    }

    pub fn restore(&self, state: &PibState) {
        for (word, &value) in self.words.iter().zip(&state.words) {
            word.store(value, Ordering::Relaxed);
        }
        self.outstanding.store(state.outstanding, Ordering::Release);
    }
}

/// Per-vector tags naming the source of each in-flight interrupt.
#[derive(Debug)]
pub(crate) struct SourceTags([AtomicU32; 256]);

impl SourceTags {
    pub fn new() -> Self {
        Self(std::array::from_fn(|_| AtomicU32::new(0)))
    }

    pub fn record(&self, vector: u8, tag: u32) {
        // The closure never returns `None`.
        let _ = self.0[vector as usize].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
            Some(if old == 0 {
                tag
            } else {
                tag | SOURCE_TAG_MULTIPLE
            })
        });
    }

    pub fn take(&self, vector: u8) -> u32 {
        self.0[vector as usize].swap(0, Ordering::Relaxed)
    }

    pub fn clear(&self) {
        for tag in &self.0 {
            tag.store(0, Ordering::Relaxed);
        }
    }

    pub fn state(&self) -> [u32; 256] {
        std::array::from_fn(|i| self.0[i].load(Ordering::Relaxed))
    }

    pub fn restore(&self, tags: &[u32; 256]) {
        for (tag, &value) in self.0.iter().zip(tags) {
            tag.store(value, Ordering::Relaxed);
        }
    }
}

/// The outcome of posting an interrupt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PostResult {
    /// The vector is illegal.
    Rejected,
    /// The interrupt is pending.
    Accepted,
    /// The interrupt is pending and the owner must be woken to fold it.
    AcceptedNeedsWake,
}

impl PostResult {
    pub fn accepted(self) -> bool {
        self != Self::Rejected
    }
}

impl SharedState {
    fn pib(&self, trigger: TriggerMode) -> &PendingInterruptBitmap {
        match trigger {
            TriggerMode::Edge => &self.pib_edge,
            TriggerMode::Level => &self.pib_level,
        }
    }

    /// Stages a fixed interrupt. Callable from any thread.
    pub(crate) fn post_interrupt(
        &self,
        vector: u8,
        trigger: TriggerMode,
        source_tag: u32,
    ) -> PostResult {
        let vp = self.vp_index.index();
        if vector <= APIC_ILLEGAL_VECTOR_END {
            tracing::debug!(vp, vector, "illegal vector posted");
            self.set_error(Esr::new().with_receive_illegal_vector(true));
            self.record(ApicEvent::PostIllegalVector);
            return PostResult::Rejected;
        }

        if self.page.test_vector(VectorRegister::Irr, vector) {
            tracing::trace!(vp, vector, "interrupt already pending");
            self.record(ApicEvent::PostAlreadyPending);
            return PostResult::Accepted;
        }

        tracing::trace!(vp, vector, ?trigger, source_tag, "post interrupt");
        self.source_tags.record(vector, source_tag);
        let pib = self.pib(trigger);
        pib.set_vector(vector);
        self.record(ApicEvent::PostAccepted);
        if pib.notify() {
            self.raise(WorkFlags::new().with_update(true));
            PostResult::AcceptedNeedsWake
        } else {
            PostResult::Accepted
        }
    }

    /// Posts an interrupt and wakes the owner if needed.
    pub(crate) fn post_and_wake(
        &self,
        vector: u8,
        trigger: TriggerMode,
        source_tag: u32,
        platform: &mut dyn ApicPlatform,
    ) -> bool {
        let result = self.post_interrupt(vector, trigger, source_tag);
        if result == PostResult::AcceptedNeedsWake {
            platform.wake(self.vp_index);
        }
        result.accepted()
    }
}
