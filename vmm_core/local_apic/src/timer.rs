// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The APIC timer.
//!
//! The timer counts down at [`TIMER_FREQUENCY`](crate::TIMER_FREQUENCY)
//! divided by the DCR divider. Rather than counting, it records when it was
//! armed and when it is due; the current count is reconstructed from the
//! elapsed time. Expiry may run on any thread, so the arming state lives
//! behind a mutex shared with the owning processor.

use crate::ApicEvent;
use crate::ApicPlatform;
use crate::LocalApic;
use crate::SharedState;
use crate::TriggerMode;
use crate::VmTime;
use crate::NANOS_PER_TICK;
use std::time::Duration;
use x86defs::apic::ApicRegister;
use x86defs::apic::Dcr;
use x86defs::apic::Lvt;
use x86defs::apic::TimerMode;

#[derive(Debug, Default)]
pub(crate) struct TimerState {
    pub initial_count: u32,
    /// When the current period started.
    pub armed_at: Option<VmTime>,
    /// When the current period ends.
    pub deadline: Option<VmTime>,
}

impl TimerState {
    pub fn deadline(&self) -> Option<VmTime> {
        self.deadline
    }

    fn stop(&mut self) {
        self.armed_at = None;
        self.deadline = None;
    }
}

fn period(count: u32, shift: u8) -> Duration {
    Duration::from_nanos((u64::from(count) << shift) * NANOS_PER_TICK)
}

impl SharedState {
    fn timer_shift(&self) -> u8 {
        Dcr::from(self.page.read(ApicRegister::TIMER_DCR)).divider_shift()
    }

    fn timer_mode(&self) -> TimerMode {
        TimerMode(Lvt::from(self.page.read(ApicRegister::LVT_TIMER)).timer_mode())
    }

    /// Fires the timer if it is due at `now`. Callable from any thread.
    ///
    /// Returns true if the timer fired.
    pub(crate) fn expire_timer(&self, now: VmTime, platform: &mut dyn ApicPlatform) -> bool {
        let mut timer = self.timer.lock();
        let Some(deadline) = timer.deadline else {
            return false;
        };
        if now.is_before(deadline) {
            return false;
        }

        let lvt = Lvt::from(self.page.read(ApicRegister::LVT_TIMER));
        let period = period(timer.initial_count, self.timer_shift());
        if TimerMode(lvt.timer_mode()) == TimerMode::PERIODIC && !period.is_zero() {
            // Skip any periods that were missed entirely.
            let late = now.checked_sub(deadline).unwrap_or_default();
            let missed = late.as_nanos() / period.as_nanos();
            let skipped = u64::try_from(missed * period.as_nanos()).unwrap_or(u64::MAX);
            let start = deadline.wrapping_add(Duration::from_nanos(skipped));
            timer.armed_at = Some(start);
            timer.deadline = Some(start.wrapping_add(period));
        } else {
            timer.stop();
            self.page.write(ApicRegister::TIMER_CCR, 0);
        }
        drop(timer);

        tracing::trace!(vp = self.vp_index.index(), vector = lvt.vector(), "timer fired");
        self.record(ApicEvent::TimerFired);
        if !lvt.masked() {
            self.post_and_wake(lvt.vector(), TriggerMode::Edge, 0, platform);
        }
        true
    }
}

impl LocalApic {
    /// Writes the initial-count register, arming or stopping the timer.
    pub(crate) fn set_timer_initial_count(&mut self, count: u32, now: VmTime) {
        let shared = &self.shared;
        // Initial-count writes are ignored in TSC-deadline mode.
        if self.global.tsc_deadline && shared.timer_mode() == TimerMode::TSC_DEADLINE {
            return;
        }

        let mut timer = shared.timer.lock();
        shared.page.write(ApicRegister::TIMER_ICR, count);
        shared.page.write(ApicRegister::TIMER_CCR, count);
        timer.initial_count = count;
        if count == 0 {
            timer.stop();
        } else {
            let deadline = now.wrapping_add(period(count, shared.timer_shift()));
            timer.armed_at = Some(now);
            timer.deadline = Some(deadline);
        }
        tracing::trace!(
            vp = shared.vp_index.index(),
            count,
            deadline = timer.deadline.map(|t| t.as_nanos()),
            "timer initial count"
        );
    }

    /// Reconstructs the current-count register at `now`.
    pub(crate) fn timer_current_count(&self, now: VmTime) -> u32 {
        let shared = &self.shared;
        if shared.timer_mode() == TimerMode::TSC_DEADLINE {
            return 0;
        }
        let timer = shared.timer.lock();
        if timer.initial_count == 0 || timer.deadline.is_none() {
            return 0;
        }
        let Some(armed_at) = timer.armed_at else {
            return 0;
        };
        let elapsed = now.checked_sub(armed_at).unwrap_or_default();
        let ticks = (elapsed.as_nanos() / u128::from(NANOS_PER_TICK)) >> shared.timer_shift();
        u64::try_from(ticks)
            .ok()
            .and_then(|ticks| u64::from(timer.initial_count).checked_sub(ticks))
            .map_or(0, |count| count as u32)
    }

    /// Returns when the timer is next due, for the caller to schedule a call
    /// to [`LocalApicSet::timer_expired`](crate::LocalApicSet::timer_expired)
    /// or [`Self::scan`].
    pub fn next_timer_deadline(&self) -> Option<VmTime> {
        self.shared.timer.lock().deadline()
    }

    /// Stops the timer. The initial-count register keeps its value.
    pub fn stop_timer(&mut self) {
        let mut timer = self.shared.timer.lock();
        timer.stop();
        self.shared.page.write(ApicRegister::TIMER_CCR, 0);
        tracing::debug!(vp = self.shared.vp_index.index(), "timer stopped");
    }
}
