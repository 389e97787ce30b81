// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interrupt priority arbitration: folding posted interrupts into IRR,
//! maintaining PPR, and choosing the next vector to inject.

use crate::page::VectorRegister;
use crate::ApicClient;
use crate::ApicEvent;
use crate::LocalApic;
use crate::WorkFlags;
use x86defs::apic::ApicRegister;
use x86defs::apic::DeliveryMode;
use x86defs::apic::Lvt;

/// Returns the priority class of a vector or priority register value.
pub(crate) fn priority(v: u8) -> u8 {
    v >> 4
}

/// The result of [`LocalApic::next_interrupt`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NextInterrupt {
    /// The vector has been moved from IRR to ISR and should be injected.
    Pending {
        /// The vector.
        vector: u8,
        /// The tag supplied by whoever posted the interrupt.
        source_tag: u32,
    },
    /// Nothing is deliverable, either because IRR is empty, the APIC is
    /// disabled, or an in-service interrupt has equal or higher priority.
    NotPending,
    /// The highest pending vector is blocked by TPR.
    MaskedByTpr(u8),
}

/// The task priority and the highest pending vector, for CR8 handling.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TaskPriority {
    /// The TPR value.
    pub tpr: u8,
    /// The highest vector in IRR, regardless of masking.
    pub pending: Option<u8>,
}

impl LocalApic {
    fn tpr_value(&self) -> u8 {
        self.shared.page.read(ApicRegister::TPR) as u8
    }

    /// Recomputes PPR from TPR and the highest in-service vector.
    pub(crate) fn update_ppr(&self) {
        let page = &self.shared.page;
        let isrv = page.highest_vector(VectorRegister::Isr).unwrap_or(0);
        let tpr = self.tpr_value();
        let ppr = if priority(tpr) >= priority(isrv) {
            tpr
        } else {
            isrv & 0xf0
        };
        page.write(ApicRegister::PPR, ppr.into());
    }

    /// Raises or clears the interrupt work flag depending on whether the
    /// highest pending vector outranks everything in service. TPR is not
    /// considered here.
    pub(crate) fn signal_next_pending(&self) {
        let shared = &self.shared;
        let flag = WorkFlags::new().with_interrupt(true);
        if shared.software_enabled() {
            if let Some(irrv) = shared.page.highest_vector(VectorRegister::Irr) {
                let isrv = shared.page.highest_vector(VectorRegister::Isr).unwrap_or(0);
                if priority(irrv) > priority(isrv) {
                    shared.raise(flag);
                    return;
                }
            }
        }
        shared.lower(flag);
    }

    /// Drains both pending-interrupt bitmaps into IRR and TMR.
    ///
    /// Returns true if any vector was folded.
    pub fn fold_pending_interrupts(&mut self) -> bool {
        let shared = &self.shared;
        // Lower the update flag first so that a concurrent post raises it
        // again.
        shared.lower(WorkFlags::new().with_update(true));

        let page = &shared.page;
        let mut folded = false;
        for (pib, level) in [(&shared.pib_edge, false), (&shared.pib_level, true)] {
            while pib.take_notification() {
                for i in 0..4 {
                    let bits = pib.take_word(i);
                    if bits == 0 {
                        continue;
                    }
                    folded = true;
                    for (fragment, bits) in [(i * 2, bits as u32), (i * 2 + 1, (bits >> 32) as u32)]
                    {
                        page.or_fragment(VectorRegister::Irr, fragment, bits);
                        if level {
                            page.or_fragment(VectorRegister::Tmr, fragment, bits);
                        } else {
                            page.clear_fragment_bits(VectorRegister::Tmr, fragment, bits);
                        }
                    }
                }
            }
        }

        if folded {
            tracing::trace!(vp = shared.vp_index.index(), "folded pending interrupts");
            if !shared.work().interrupt() {
                self.signal_next_pending();
            }
        }
        folded
    }

    /// Returns the next interrupt to inject, moving it from IRR to ISR.
    pub fn next_interrupt(&mut self) -> NextInterrupt {
        let shared = &self.shared;
        if !shared.hardware_enabled() || !shared.software_enabled() {
            return NextInterrupt::NotPending;
        }
        let Some(vector) = shared.page.highest_vector(VectorRegister::Irr) else {
            return NextInterrupt::NotPending;
        };

        let vp = shared.vp_index.index();
        let tpr = self.tpr_value();
        if tpr > 0 && priority(vector) <= priority(tpr) {
            tracing::debug!(vp, vector, tpr, "interrupt masked by tpr");
            shared.record(ApicEvent::MaskedByTpr);
            return NextInterrupt::MaskedByTpr(vector);
        }

        let ppr = shared.page.read(ApicRegister::PPR) as u8;
        if ppr != 0 && priority(vector) <= priority(ppr) {
            tracing::debug!(vp, vector, ppr, "interrupt masked by ppr");
            shared.record(ApicEvent::MaskedByPpr);
            return NextInterrupt::NotPending;
        }

        shared.page.clear_vector(VectorRegister::Irr, vector);
        shared.page.set_vector(VectorRegister::Isr, vector);
        self.update_ppr();
        self.signal_next_pending();
        let source_tag = shared.source_tags.take(vector);
        tracing::trace!(vp, vector, source_tag, "deliver interrupt");
        shared.record(ApicEvent::Delivered);
        NextInterrupt::Pending { vector, source_tag }
    }

    /// Moves `vector` from IRR to ISR, committing an injection made outside
    /// of [`Self::next_interrupt`].
    ///
    /// Returns false if `vector` was not pending.
    pub fn queue_to_service(&mut self, vector: u8) -> bool {
        let page = &self.shared.page;
        if !page.test_vector(VectorRegister::Irr, vector) {
            return false;
        }
        page.clear_vector(VectorRegister::Irr, vector);
        page.set_vector(VectorRegister::Isr, vector);
        self.update_ppr();
        true
    }

    /// Moves `vector` from ISR back to IRR, undoing an injection that the
    /// guest never observed.
    ///
    /// Returns false if `vector` was not in service.
    pub fn dequeue_from_service(&mut self, vector: u8) -> bool {
        let page = &self.shared.page;
        if !page.test_vector(VectorRegister::Isr, vector) {
            return false;
        }
        page.clear_vector(VectorRegister::Isr, vector);
        page.set_vector(VectorRegister::Irr, vector);
        self.update_ppr();
        true
    }

    /// Returns the highest vector in IRR.
    pub fn highest_pending_interrupt(&self) -> Option<u8> {
        self.shared.page.highest_vector(VectorRegister::Irr)
    }

    /// Returns TPR and the highest pending vector, or `None` if the APIC is
    /// hardware disabled.
    pub fn tpr(&self) -> Option<TaskPriority> {
        self.shared.hardware_enabled().then(|| TaskPriority {
            tpr: self.tpr_value(),
            pending: self.highest_pending_interrupt(),
        })
    }

    /// Sets TPR, as through a CR8 write.
    pub fn set_tpr(&mut self, tpr: u8) {
        self.write_tpr(tpr);
    }

    pub(crate) fn write_tpr(&mut self, tpr: u8) {
        tracing::trace!(vp = self.shared.vp_index.index(), tpr, "tpr");
        self.shared.page.write(ApicRegister::TPR, tpr.into());
        self.shared.record(ApicEvent::TprWrite);
        self.update_ppr();
        self.signal_next_pending();
    }

    /// Completes the highest in-service interrupt.
    pub(crate) fn end_of_interrupt(&mut self, client: &mut impl ApicClient) {
        let shared = &self.shared;
        let page = &shared.page;
        let vp = shared.vp_index.index();
        let Some(vector) = page.highest_vector(VectorRegister::Isr) else {
            tracing::debug!(vp, "eoi with nothing in service");
            shared.record(ApicEvent::SpuriousEoi);
            return;
        };

        tracing::trace!(vp, vector, "eoi");
        shared.record(ApicEvent::Eoi);
        if page.test_vector(VectorRegister::Tmr, vector) {
            // Level triggered: tell the IO-APIC, and release LINT0 if it is
            // the source.
            client.eoi(vector);
            page.clear_vector(VectorRegister::Tmr, vector);
            let lint0 = Lvt::from(page.read(ApicRegister::LVT_LINT0));
            if lint0.remote_irr()
                && lint0.vector() == vector
                && DeliveryMode(lint0.delivery_mode()) == DeliveryMode::FIXED
            {
                page.fetch_and(
                    ApicRegister::LVT_LINT0,
                    !Lvt::new().with_remote_irr(true).into_bits(),
                );
            }
            shared.record(ApicEvent::LevelEoi);
        }

        page.clear_vector(VectorRegister::Isr, vector);
        self.update_ppr();
        self.signal_next_pending();
    }
}
