// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-APIC event counters and the outbound telemetry sink.

use crate::VpIndex;
use inspect_counters::SharedCounter;
use std::fmt;

/// An event reported to an [`ApicTelemetry`] sink.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ApicEvent {
    /// A guest MMIO read of the register page.
    MmioRead,
    /// A guest MMIO write of the register page.
    MmioWrite,
    /// A guest MSR read.
    MsrRead,
    /// A guest MSR write.
    MsrWrite,
    /// An interrupt was staged in a pending-interrupt bitmap.
    PostAccepted,
    /// An interrupt was posted while already pending in IRR.
    PostAlreadyPending,
    /// An interrupt with a vector in `0..=15` was posted.
    PostIllegalVector,
    /// An interrupt was moved from IRR to ISR for injection.
    Delivered,
    /// The highest pending interrupt was blocked by TPR.
    MaskedByTpr,
    /// The highest pending interrupt was blocked by an in-service interrupt.
    MaskedByPpr,
    /// An end-of-interrupt for an in-service vector.
    Eoi,
    /// An end-of-interrupt for a level-triggered vector.
    LevelEoi,
    /// An end-of-interrupt with nothing in service.
    SpuriousEoi,
    /// An IPI was sent through ICR or SELF_IPI.
    IpiSent,
    /// The local timer expired.
    TimerFired,
    /// TPR was written.
    TprWrite,
    /// ICR was written.
    IcrWrite,
}

impl ApicEvent {
    /// The number of distinct events.
    pub const COUNT: usize = Self::ALL.len();

    /// Every event, in counter order.
    pub const ALL: [Self; 17] = [
        Self::MmioRead,
        Self::MmioWrite,
        Self::MsrRead,
        Self::MsrWrite,
        Self::PostAccepted,
        Self::PostAlreadyPending,
        Self::PostIllegalVector,
        Self::Delivered,
        Self::MaskedByTpr,
        Self::MaskedByPpr,
        Self::Eoi,
        Self::LevelEoi,
        Self::SpuriousEoi,
        Self::IpiSent,
        Self::TimerFired,
        Self::TprWrite,
        Self::IcrWrite,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// A fire-and-forget sink for APIC events.
///
/// Called on the emulation hot path, possibly from several vCPU threads at
/// once. Implementations must not block and cannot fail.
pub trait ApicTelemetry: Send + Sync {
    /// Records an event for the APIC of `vp`.
    fn record(&self, vp: VpIndex, event: ApicEvent);
}

/// A telemetry sink that discards everything.
#[derive(Debug, Default)]
pub struct NullTelemetry;

impl ApicTelemetry for NullTelemetry {
    fn record(&self, _vp: VpIndex, _event: ApicEvent) {}
}

/// A snapshot of an APIC's event counters.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct ApicStats([u64; ApicEvent::COUNT]);

impl ApicStats {
    /// Returns the count for `event`.
    pub fn get(&self, event: ApicEvent) -> u64 {
        self.0[event.index()]
    }

    /// Iterates over every event and its count.
    pub fn iter(&self) -> impl Iterator<Item = (ApicEvent, u64)> + '_ {
        ApicEvent::ALL.iter().map(|&e| (e, self.get(e)))
    }
}

impl fmt::Debug for ApicStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().filter(|&(_, n)| n != 0))
            .finish()
    }
}

/// Live counters, incremented from any thread.
pub(crate) struct Counters([SharedCounter; ApicEvent::COUNT]);

impl Counters {
    pub fn new() -> Self {
        Self(std::array::from_fn(|_| SharedCounter::new()))
    }

    pub fn increment(&self, event: ApicEvent) {
        self.0[event.index()].increment();
    }

    pub fn snapshot(&self) -> ApicStats {
        ApicStats(std::array::from_fn(|i| self.0[i].get()))
    }

    /// Sets the counters to `stats`.
    pub fn load(&self, stats: &ApicStats) {
        // Counters only add, and addition wraps.
        for (counter, &value) in self.0.iter().zip(&stats.0) {
            counter.add(value.wrapping_sub(counter.get()));
        }
    }
}

impl fmt::Debug for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.snapshot().fmt(f)
    }
}
