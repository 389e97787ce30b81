// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Saving and restoring APIC state.

use crate::ApicMaxMode;
use crate::ApicMode;
use crate::ApicStats;
use crate::ApicWork;
use crate::LocalApic;
use crate::PibState;
use crate::VmTime;
use crate::VpIndex;
use crate::WorkFlags;
use std::sync::atomic::Ordering;
use thiserror::Error;
use x86defs::apic::ApicBase;
use x86defs::apic::ApicRegister;
use x86defs::apic::APIC_BASE_PAGE;
use x86defs::apic::APIC_PAGE_SIZE;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The saved state of a local APIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApicSavedState {
    /// The processor the state belongs to.
    pub vp_index: VpIndex,
    /// The APIC base MSR.
    pub apic_base: u64,
    /// The register page, one entry per 16-byte register slot.
    pub registers: [u32; ApicRegister::COUNT],
    /// Edge-triggered interrupts posted but not yet folded into IRR.
    pub pib_edge: PibState,
    /// Level-triggered interrupts posted but not yet folded into IRR.
    pub pib_level: PibState,
    /// The source tag of each in-flight vector.
    pub source_tags: [u32; 256],
    /// Errors not yet latched into ESR.
    pub pending_errors: u32,
    /// The input level of LINT0 and LINT1.
    pub active_lint: [bool; 2],
    /// Processor-level signals not yet collected.
    pub signals: ApicWork,
    /// The timer initial count.
    pub timer_initial_count: u32,
    /// When the current timer period started.
    pub timer_armed_at: Option<VmTime>,
    /// When the current timer period ends.
    pub timer_deadline: Option<VmTime>,
    /// The event counters.
    pub stats: ApicStats,
}

/// A register as laid out in the 4KB xAPIC page.
#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
struct ApicRegisterSlot {
    value: u32,
    zero: [u32; 3],
}

#[repr(C)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
struct ApicPageImage {
    registers: [ApicRegisterSlot; ApicRegister::COUNT],
    unused: [u8; APIC_PAGE_SIZE - ApicRegister::COUNT * 16],
}

impl ApicSavedState {
    /// Returns the registers as an xAPIC page image.
    pub fn page_image(&self) -> [u8; APIC_PAGE_SIZE] {
        let image = ApicPageImage {
            registers: self.registers.map(|value| ApicRegisterSlot {
                value,
                zero: [0; 3],
            }),
            unused: [0; APIC_PAGE_SIZE - ApicRegister::COUNT * 16],
        };
        zerocopy::transmute!(image)
    }

    /// Replaces the registers with the contents of an xAPIC page image.
    ///
    /// Bytes outside the architectural register slots are ignored.
    pub fn load_page_image(&mut self, page: &[u8; APIC_PAGE_SIZE]) {
        let image: ApicPageImage = zerocopy::transmute!(*page);
        self.registers = image.registers.map(|reg| reg.value);
    }
}

/// An error restoring APIC state.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// The saved APIC base MSR cannot be represented by this APIC.
    #[error("invalid apic base {0:#x}")]
    InvalidApicBase(u64),
    /// The state was saved from a different processor.
    #[error("saved state for vp {saved} restored to vp {current}")]
    VpMismatch {
        /// The processor the state was saved from.
        saved: u32,
        /// The processor being restored.
        current: u32,
    },
}

impl LocalApic {
    /// Returns the APIC state.
    ///
    /// Posted interrupts are left in the pending-interrupt bitmaps rather than
    /// folded, so saving does not change the APIC.
    pub fn save(&self) -> ApicSavedState {
        let shared = &self.shared;
        let timer = shared.timer.lock();
        let work = shared.work();
        ApicSavedState {
            vp_index: shared.vp_index,
            apic_base: shared.apic_base.load(Ordering::Acquire),
            registers: shared.page.registers(),
            pib_edge: shared.pib_edge.state(),
            pib_level: shared.pib_level.state(),
            source_tags: shared.source_tags.state(),
            pending_errors: shared.pending_errors.load(Ordering::Relaxed),
            active_lint: [0, 1].map(|i| shared.active_lint[i].load(Ordering::Relaxed)),
            signals: ApicWork {
                interrupt: work.interrupt(),
                nmi: work.nmi(),
                smi: work.smi(),
                extint: work.extint(),
            },
            timer_initial_count: timer.initial_count,
            timer_armed_at: timer.armed_at,
            timer_deadline: timer.deadline,
            stats: shared.counters.snapshot(),
        }
    }

    /// Restores the APIC state.
    pub fn restore(&mut self, state: &ApicSavedState) -> Result<(), RestoreError> {
        let shared = &self.shared;
        if state.vp_index != shared.vp_index {
            return Err(RestoreError::VpMismatch {
                saved: state.vp_index.index(),
                current: shared.vp_index.index(),
            });
        }

        let base = ApicBase::from(state.apic_base);
        let mode = ApicMode::from_base(base);
        let allowed = match mode {
            ApicMode::Disabled => true,
            ApicMode::XApic => self.global.max_mode != ApicMaxMode::None,
            ApicMode::X2Apic => self.global.max_mode == ApicMaxMode::X2Apic,
            ApicMode::Invalid => false,
        };
        if base.base_page() != APIC_BASE_PAGE || !allowed {
            return Err(RestoreError::InvalidApicBase(state.apic_base));
        }

        shared
            .apic_base
            .store(state.apic_base, Ordering::Release);
        shared.page.load_registers(&state.registers);
        shared.pib_edge.restore(&state.pib_edge);
        shared.pib_level.restore(&state.pib_level);
        shared.source_tags.restore(&state.source_tags);
        shared
            .pending_errors
            .store(state.pending_errors, Ordering::Relaxed);
        for (line, &active) in shared.active_lint.iter().zip(&state.active_lint) {
            line.store(active, Ordering::Relaxed);
        }
        {
            let mut timer = shared.timer.lock();
            timer.initial_count = state.timer_initial_count;
            timer.armed_at = state.timer_armed_at;
            timer.deadline = state.timer_deadline;
        }
        shared.counters.load(&state.stats);

        let ApicWork {
            interrupt: _,
            nmi,
            smi,
            extint,
        } = state.signals;
        let outstanding = state.pib_edge.outstanding || state.pib_level.outstanding;
        shared.work.store(
            WorkFlags::new()
                .with_nmi(nmi)
                .with_smi(smi)
                .with_extint(extint)
                .with_update(outstanding)
                .into_bits(),
            Ordering::Release,
        );
        self.update_ppr();
        self.signal_next_pending();

        tracing::debug!(
            vp = self.shared.vp_index.index(),
            apic_base = state.apic_base,
            ?mode,
            "apic restored"
        );
        Ok(())
    }
}
