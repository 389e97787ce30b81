// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The APIC base MSR, mode transitions, reset and INIT.

use crate::page::VectorRegister;
use crate::LocalApic;
use crate::MsrAccessError;
use crate::MsrAccessErrorKind;
use crate::APIC_VERSION;
use std::sync::atomic::Ordering;
use x86defs::apic::ApicBase;
use x86defs::apic::ApicRegister;
use x86defs::apic::Dfr;
use x86defs::apic::X2ApicLogicalId;
use x86defs::apic::APIC_BASE_PAGE;
use x86defs::apic::LVT_RESET;
use x86defs::X86X_MSR_APIC_BASE;

/// The operating mode of an APIC, as decoded from the base MSR.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApicMode {
    /// Hardware disabled.
    Disabled,
    /// Legacy xAPIC mode, with MMIO register access.
    XApic,
    /// x2APIC mode, with MSR register access.
    X2Apic,
    /// x2APIC enabled without the global enable. Never a resting state.
    Invalid,
}

impl ApicMode {
    pub(crate) fn from_base(base: ApicBase) -> Self {
        match (base.enable(), base.x2apic()) {
            (false, false) => Self::Disabled,
            (false, true) => Self::Invalid,
            (true, false) => Self::XApic,
            (true, true) => Self::X2Apic,
        }
    }
}

/// The most capable mode the guest may enable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApicMaxMode {
    /// The platform has no APIC. The base MSR resets to disabled and cannot
    /// be written.
    None,
    /// xAPIC only.
    XApic,
    /// xAPIC and x2APIC.
    X2Apic,
}

impl LocalApic {
    /// Returns the current mode.
    pub fn mode(&self) -> ApicMode {
        self.shared.mode()
    }

    /// Gets the APIC base MSR.
    pub fn apic_base(&self) -> u64 {
        self.shared.apic_base().into()
    }

    /// Gets the APIC base address, if the APIC is enabled and in xAPIC mode.
    pub fn base_address(&self) -> Option<u64> {
        let base = self.shared.apic_base();
        (ApicMode::from_base(base) == ApicMode::XApic).then(|| u64::from(base.base_page()) << 12)
    }

    /// Sets the APIC base MSR.
    ///
    /// Only the enable and x2APIC bits may change. Disabling the APIC resets
    /// its registers; x2APIC can only be entered from xAPIC and xAPIC only
    /// from disabled.
    pub fn set_apic_base(&mut self, apic_base: u64) -> Result<(), MsrAccessError> {
        let vp = self.shared.vp_index.index();
        let current = self.shared.apic_base();
        let requested = ApicBase::from(apic_base);
        let error = |kind| Err(MsrAccessError::new(X86X_MSR_APIC_BASE, kind));

        if requested.base_page() != APIC_BASE_PAGE {
            tracelimit::warn_ratelimited!(vp, apic_base, "apic base relocation is not supported");
            return error(MsrAccessErrorKind::WriteInvalid);
        }

        if self.global.max_mode == ApicMaxMode::None {
            return error(MsrAccessErrorKind::WriteDisallowedConfig);
        }

        let old_mode = ApicMode::from_base(current);
        let new_mode = ApicMode::from_base(requested);
        if old_mode == new_mode {
            return Ok(());
        }

        let new = match new_mode {
            ApicMode::Disabled => current.with_enable(false).with_x2apic(false),
            ApicMode::XApic => {
                if old_mode != ApicMode::Disabled {
                    tracing::debug!(vp, ?old_mode, "xapic can only be entered from disabled");
                    return error(MsrAccessErrorKind::WriteInvalid);
                }
                current.with_enable(true)
            }
            ApicMode::X2Apic => {
                if self.global.max_mode != ApicMaxMode::X2Apic {
                    tracing::debug!(vp, "x2apic is not available");
                    return error(MsrAccessErrorKind::WriteInvalid);
                }
                if old_mode != ApicMode::XApic {
                    tracing::debug!(vp, ?old_mode, "x2apic can only be entered from xapic");
                    return error(MsrAccessErrorKind::WriteInvalid);
                }
                // The x2APIC ID and logical ID derive from the processor index.
                let page = &self.shared.page;
                page.write(ApicRegister::ID, vp);
                page.write(ApicRegister::LDR, X2ApicLogicalId::from_apic_id(vp).into());
                current.with_enable(true).with_x2apic(true)
            }
            ApicMode::Invalid => return error(MsrAccessErrorKind::WriteInvalid),
        };

        tracing::debug!(vp, ?old_mode, ?new_mode, "apic mode change");
        self.shared.apic_base.store(new.into(), Ordering::Release);
        if new_mode == ApicMode::Disabled {
            self.reset_registers();
        }
        Ok(())
    }

    /// Resets the APIC to its power-on state.
    pub fn reset(&mut self) {
        let vp_index = self.shared.vp_index;
        let apic_base = ApicBase::new()
            .with_base_page(APIC_BASE_PAGE)
            .with_bsp(vp_index.is_bsp())
            .with_enable(self.global.max_mode != ApicMaxMode::None);

        tracing::debug!(vp = vp_index.index(), apic_base = u64::from(apic_base), "apic reset");
        self.shared
            .apic_base
            .store(apic_base.into(), Ordering::Release);
        self.reset_registers();
    }

    /// Resets the registers to their state after an INIT IPI. The mode, ID
    /// and version survive.
    pub fn init(&mut self) {
        let shared = &self.shared;
        let page = &shared.page;
        for register in [VectorRegister::Irr, VectorRegister::Isr, VectorRegister::Tmr] {
            page.clear_vectors(register);
        }
        for register in [
            ApicRegister::ICR0,
            ApicRegister::ICR1,
            ApicRegister::LDR,
            ApicRegister::TPR,
            ApicRegister::PPR,
            ApicRegister::TIMER_ICR,
            ApicRegister::TIMER_CCR,
            ApicRegister::TIMER_DCR,
            ApicRegister::ESR,
            ApicRegister::SELF_IPI,
        ] {
            page.write(register, 0);
        }
        page.write(ApicRegister::DFR, Dfr::FLAT_MODE.0);
        for register in ApicRegister::LVT {
            page.write(register, LVT_RESET);
        }
        page.write(ApicRegister::SVR, 0xff);

        shared.pib_edge.clear();
        shared.pib_level.clear();
        shared.source_tags.clear();
        for line in &shared.active_lint {
            line.store(false, Ordering::Relaxed);
        }
        shared.pending_errors.store(0, Ordering::Relaxed);
        shared.work.store(0, Ordering::Release);
        {
            let mut timer = shared.timer.lock();
            *timer = Default::default();
        }
        if shared.x2apic_enabled() {
            let id = shared.vp_index.index();
            page.write(ApicRegister::LDR, X2ApicLogicalId::from_apic_id(id).into());
        }
        tracing::debug!(vp = shared.vp_index.index(), "apic init");
    }

    /// INIT plus the version and xAPIC ID registers.
    fn reset_registers(&mut self) {
        self.init();
        let page = &self.shared.page;
        page.write(ApicRegister::VERSION, APIC_VERSION);
        page.write(ApicRegister::ID, self.shared.vp_index.index() << 24);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalApicSet;
    use crate::VpIndex;
    use x86defs::apic::APIC_BASE_ADDRESS;

    const EN: u64 = 1 << 11;
    const EXTD: u64 = 1 << 10;
    const BSP: u64 = 1 << 8;
    const BASE: u64 = APIC_BASE_ADDRESS as u64;

    fn apics(set: &LocalApicSet, count: u32) -> Vec<LocalApic> {
        (0..count).map(|i| set.add_apic(VpIndex::new(i))).collect()
    }

    fn kind(result: Result<(), MsrAccessError>) -> MsrAccessErrorKind {
        result.unwrap_err().kind
    }

    #[test]
    fn reset_state() {
        let set = LocalApicSet::builder().build();
        let apics = apics(&set, 4);
        let (bsp, ap) = (&apics[0], &apics[3]);
        assert_eq!(bsp.apic_base(), BASE | EN | BSP);
        assert_eq!(ap.apic_base(), BASE | EN);
        assert_eq!(bsp.mode(), ApicMode::XApic);
        assert_eq!(bsp.base_address(), Some(BASE));
        assert_eq!(ap.register(ApicRegister::ID), 3 << 24);
        assert_eq!(ap.register(ApicRegister::VERSION), 0x50014);
        assert_eq!(ap.register(ApicRegister::DFR), 0xffff_ffff);
        assert_eq!(ap.register(ApicRegister::SVR), 0xff);
        assert_eq!(ap.register(ApicRegister::LVT_LINT0), 0x10000);
    }

    #[test]
    fn no_apic_resets_disabled() {
        let set = LocalApicSet::builder().max_mode(ApicMaxMode::None).build();
        let mut apic = set.add_apic(VpIndex::BSP);
        assert_eq!(apic.mode(), ApicMode::Disabled);
        assert_eq!(
            kind(apic.set_apic_base(BASE | EN | BSP)),
            MsrAccessErrorKind::WriteDisallowedConfig
        );
    }

    #[test]
    fn mode_transitions() {
        let set = LocalApicSet::builder().build();
        let mut apic = apics(&set, 0x14).pop().unwrap();

        // Disabled to x2APIC directly is rejected.
        apic.set_apic_base(BASE).unwrap();
        assert_eq!(apic.mode(), ApicMode::Disabled);
        assert_eq!(apic.base_address(), None);
        assert_eq!(
            kind(apic.set_apic_base(BASE | EN | EXTD)),
            MsrAccessErrorKind::WriteInvalid
        );
        assert_eq!(
            kind(apic.set_apic_base(BASE | EXTD)),
            MsrAccessErrorKind::WriteInvalid
        );

        apic.set_apic_base(BASE | EN).unwrap();
        apic.set_apic_base(BASE | EN | EXTD).unwrap();
        assert_eq!(apic.mode(), ApicMode::X2Apic);
        assert_eq!(apic.register(ApicRegister::ID), 0x13);
        assert_eq!(apic.register(ApicRegister::LDR), 0x0001_0008);

        // Back to xAPIC requires going through disabled.
        assert_eq!(
            kind(apic.set_apic_base(BASE | EN)),
            MsrAccessErrorKind::WriteInvalid
        );
        apic.set_apic_base(BASE).unwrap();
        assert_eq!(apic.register(ApicRegister::ID), 0x13 << 24);
        assert_eq!(apic.register(ApicRegister::LDR), 0);
    }

    #[test]
    fn x2apic_requires_capability() {
        let set = LocalApicSet::builder().max_mode(ApicMaxMode::XApic).build();
        let mut apic = set.add_apic(VpIndex::BSP);
        assert_eq!(
            kind(apic.set_apic_base(BASE | EN | EXTD | BSP)),
            MsrAccessErrorKind::WriteInvalid
        );
    }

    #[test]
    fn relocation_rejected() {
        let set = LocalApicSet::builder().build();
        let mut apic = set.add_apic(VpIndex::BSP);
        assert_eq!(
            kind(apic.set_apic_base(0xfec0_0000 | EN | BSP)),
            MsrAccessErrorKind::WriteInvalid
        );
        assert_eq!(apic.apic_base(), BASE | EN | BSP);
    }

    #[test]
    fn disable_clears_registers() {
        let set = LocalApicSet::builder().build();
        let mut apic = set.add_apic(VpIndex::BSP);
        apic.shared.page.write(ApicRegister::SVR, 0x1ff);
        apic.shared.page.write(ApicRegister::TPR, 0x30);
        apic.shared.page.set_vector(VectorRegister::Irr, 0x50);
        apic.set_apic_base(BASE | BSP).unwrap();
        assert_eq!(apic.register(ApicRegister::SVR), 0xff);
        assert_eq!(apic.register(ApicRegister::TPR), 0);
        assert_eq!(apic.highest_pending_interrupt(), None);
        // BSP is kept from the current value.
        assert_eq!(apic.apic_base(), BASE | BSP);
    }

    #[test]
    fn init_keeps_mode_and_id() {
        let set = LocalApicSet::builder().build();
        let mut apic = set.add_apic(VpIndex::new(0));
        apic.set_apic_base(BASE | EN | EXTD | BSP).unwrap();
        apic.shared.page.write(ApicRegister::TPR, 0x20);
        apic.init();
        assert_eq!(apic.mode(), ApicMode::X2Apic);
        assert_eq!(apic.register(ApicRegister::VERSION), 0x50014);
        assert_eq!(apic.register(ApicRegister::TPR), 0);
        assert_eq!(apic.register(ApicRegister::LDR), 0x0000_0001);
        assert_eq!(apic.register(ApicRegister::LVT_TIMER), 0x10000);
    }
}
