// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest register access through the xAPIC MMIO page, the x2APIC MSRs, the
//! APIC base MSR and the Hyper-V synthetic APIC MSRs.
//!
//! MMIO accesses never fault: reserved bits are dropped and bad offsets latch
//! an illegal-register-address error in ESR. MSR accesses validate strictly
//! and report an [`MsrAccessError`], which the caller turns into #GP(0).

use crate::ApicClient;
use crate::ApicEvent;
use crate::LocalApic;
use crate::PrivilegeRequired;
use crate::TriggerMode;
use crate::TIMER_FREQUENCY;
use std::sync::atomic::Ordering;
use thiserror::Error;
use x86defs::apic::ApicRegister;
use x86defs::apic::DeliveryMode;
use x86defs::apic::Esr;
use x86defs::apic::Lvt;
use x86defs::apic::Svr;
use x86defs::apic::APIC_ILLEGAL_VECTOR_END;
use x86defs::apic::APIC_MAX_REGISTER_OFFSET;
use x86defs::apic::DCR_VALID;
use x86defs::apic::DFR_RESERVED_ONES;
use x86defs::apic::DFR_VALID;
use x86defs::apic::ICR_LOW_WRITE_VALID;
use x86defs::apic::LVT_TIMER_TSC_DEADLINE;
use x86defs::apic::SVR_VALID;
use x86defs::apic::X2APIC_MSR_BASE;
use x86defs::apic::X2APIC_MSR_END;
use x86defs::apic::XAPIC_ICR_HIGH_VALID;
use x86defs::apic::XAPIC_LDR_VALID;
use x86defs::X86X_MSR_APIC_BASE;

/// Hyper-V synthetic MSR reporting the APIC timer frequency.
pub const HV_X64_MSR_APIC_FREQUENCY: u32 = 0x40000023;
/// Hyper-V synthetic EOI MSR.
pub const HV_X64_MSR_EOI: u32 = 0x40000070;
/// Hyper-V synthetic ICR MSR.
pub const HV_X64_MSR_ICR: u32 = 0x40000071;
/// Hyper-V synthetic TPR MSR.
pub const HV_X64_MSR_TPR: u32 = 0x40000072;

/// The reason an MSR access faults.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MsrAccessErrorKind {
    /// Read of an x2APIC MSR while not in x2APIC mode.
    InvalidReadMode,
    /// Write of an x2APIC MSR while not in x2APIC mode.
    InvalidWriteMode,
    /// Read of a reserved or unknown MSR.
    ReadReservedOrUnknown,
    /// Write of a reserved or unknown MSR.
    WriteReservedOrUnknown,
    /// Read of a write-only MSR.
    ReadWriteOnly,
    /// Write of a read-only MSR.
    WriteReadOnly,
    /// Read with reserved bits set.
    ReadReservedBits,
    /// Write with reserved bits set.
    WriteReservedBits,
    /// Write of an invalid value.
    WriteInvalid,
    /// Write disallowed by the platform configuration.
    WriteDisallowedConfig,
    /// Read disallowed by the platform configuration.
    ReadDisallowedConfig,
}

/// A faulting MSR access.
#[derive(Debug, Error)]
#[error("apic msr {msr:#x} access error: {kind:?}")]
pub struct MsrAccessError {
    /// The MSR.
    pub msr: u32,
    /// What went wrong.
    pub kind: MsrAccessErrorKind,
}

impl MsrAccessError {
    pub(crate) fn new(msr: u32, kind: MsrAccessErrorKind) -> Self {
        Self { msr, kind }
    }

    fn register(register: ApicRegister, kind: MsrAccessErrorKind) -> Self {
        Self::new(register.x2apic_msr(), kind)
    }
}

/// An error from a guest register access.
#[derive(Debug, Error)]
pub enum ApicAccessError {
    /// The access faults. The caller should inject #GP(0).
    #[error("access raises a general protection fault")]
    Gp(#[from] MsrAccessError),
    /// The access needs to start or reset a processor and the current context
    /// cannot. The caller should retry the access from a context that can.
    #[error("access must be retried from a privileged context")]
    RetryPrivileged,
}

impl From<PrivilegeRequired> for ApicAccessError {
    fn from(_: PrivilegeRequired) -> Self {
        Self::RetryPrivileged
    }
}

/// Guest access to an APIC's registers, obtained from
/// [`LocalApic::access`].
pub struct LocalApicAccess<'a, T> {
    apic: &'a mut LocalApic,
    client: &'a mut T,
}

impl<'a, T: ApicClient> LocalApicAccess<'a, T> {
    pub(crate) fn new(apic: &'a mut LocalApic, client: &'a mut T) -> Self {
        Self { apic, client }
    }

    fn x2apic_enabled(&self) -> bool {
        self.apic.shared.x2apic_enabled()
    }

    fn log_error<R>(&mut self, result: Result<R, ApicAccessError>) -> Result<R, ApicAccessError> {
        if let Err(ApicAccessError::Gp(err)) = &result {
            self.apic.log_access_error(err);
        }
        result
    }

    /// Reads the 32-bit register at `offset` in the xAPIC MMIO page.
    ///
    /// `offset` must be 16-byte aligned and within the register range.
    pub fn mmio_read(&mut self, offset: u16) -> u32 {
        assert!(
            offset % 16 == 0 && offset <= APIC_MAX_REGISTER_OFFSET,
            "invalid apic mmio offset {offset:#x}"
        );
        let shared = &self.apic.shared;
        if !shared.hardware_enabled() || shared.x2apic_enabled() {
            tracing::debug!(
                vp = shared.vp_index.index(),
                offset,
                mode = ?shared.mode(),
                "apic mmio read outside xapic mode"
            );
            return !0;
        }
        shared.record(ApicEvent::MmioRead);

        let register = ApicRegister::from_offset(offset);
        let value = match register {
            ApicRegister::PPR => self.apic.ppr(),
            ApicRegister::TIMER_CCR => self.apic.timer_current_count(self.client.now()),
            // Not present on P4 and Xeon.
            ApicRegister::APR => 0,
            ApicRegister::ID
            | ApicRegister::VERSION
            | ApicRegister::TPR
            | ApicRegister::EOI
            | ApicRegister::RRD
            | ApicRegister::LDR
            | ApicRegister::DFR
            | ApicRegister::SVR
            | ApicRegister::ESR
            | ApicRegister::ICR0
            | ApicRegister::ICR1
            | ApicRegister::LVT_TIMER
            | ApicRegister::LVT_THERMAL
            | ApicRegister::LVT_PMC
            | ApicRegister::LVT_LINT0
            | ApicRegister::LVT_LINT1
            | ApicRegister::LVT_ERROR
            | ApicRegister::TIMER_ICR
            | ApicRegister::TIMER_DCR => self.apic.shared.page.read(register),
            reg if (ApicRegister::ISR0..=ApicRegister::IRR7).contains(&reg) => {
                self.apic.shared.page.read(reg)
            }
            register => {
                tracelimit::warn_ratelimited!(
                    vp = self.apic.shared.vp_index.index(),
                    ?register,
                    "illegal apic register read"
                );
                self.apic
                    .shared
                    .set_error(Esr::new().with_illegal_register_address(true));
                0
            }
        };
        tracing::trace!(vp = self.apic.shared.vp_index.index(), ?register, value, "mmio read");
        value
    }

    /// Writes the 32-bit register at `offset` in the xAPIC MMIO page.
    ///
    /// `offset` must be 16-byte aligned and within the register range.
    pub fn mmio_write(&mut self, offset: u16, value: u32) -> Result<(), ApicAccessError> {
        assert!(
            offset % 16 == 0 && offset <= APIC_MAX_REGISTER_OFFSET,
            "invalid apic mmio offset {offset:#x}"
        );
        let shared = &self.apic.shared;
        if !shared.hardware_enabled() || shared.x2apic_enabled() {
            tracing::debug!(
                vp = shared.vp_index.index(),
                offset,
                value,
                mode = ?shared.mode(),
                "apic mmio write outside xapic mode"
            );
            return Ok(());
        }
        shared.record(ApicEvent::MmioWrite);

        let register = ApicRegister::from_offset(offset);
        tracing::trace!(vp = shared.vp_index.index(), ?register, value, "mmio write");
        let result = match register {
            ApicRegister::TPR => self.set_tpr_ex(value, false).map_err(Into::into),
            ApicRegister::EOI => self.set_eoi(value, false).map_err(Into::into),
            ApicRegister::LDR => {
                self.set_ldr(value);
                Ok(())
            }
            ApicRegister::DFR => {
                self.set_dfr(value);
                Ok(())
            }
            ApicRegister::SVR => self.set_svr(value).map_err(Into::into),
            ApicRegister::ESR => self.set_esr(value).map_err(Into::into),
            ApicRegister::ICR0 => self.set_icr_low(value),
            ApicRegister::ICR1 => {
                self.set_icr_high(value);
                Ok(())
            }
            ApicRegister::TIMER_ICR => {
                let now = self.client.now();
                self.apic.set_timer_initial_count(value, now);
                Ok(())
            }
            ApicRegister::TIMER_DCR => self.set_dcr(value).map_err(Into::into),
            register if register.lvt_valid_mask().is_some() => {
                self.set_lvt(register, value).map_err(Into::into)
            }
            // Read-only, and writes do not latch an error.
            ApicRegister::ID | ApicRegister::VERSION | ApicRegister::APR | ApicRegister::RRD => {
                Ok(())
            }
            register => {
                tracelimit::warn_ratelimited!(
                    vp = self.apic.shared.vp_index.index(),
                    ?register,
                    value,
                    "illegal apic register write"
                );
                self.apic
                    .shared
                    .set_error(Esr::new().with_illegal_register_address(true));
                Ok(())
            }
        };
        self.log_error(result)
    }

    /// Reads the APIC base MSR, an x2APIC MSR or a Hyper-V APIC MSR.
    pub fn msr_read(&mut self, msr: u32) -> Result<u64, ApicAccessError> {
        let result = self.msr_read_inner(msr).map_err(Into::into);
        self.log_error(result)
    }

    fn msr_read_inner(&mut self, msr: u32) -> Result<u64, MsrAccessError> {
        let enlightened = self.apic.global.hyperv_enlightenments;
        let value = match msr {
            X86X_MSR_APIC_BASE => self.apic.apic_base(),
            X2APIC_MSR_BASE..=X2APIC_MSR_END => {
                let register = ApicRegister((msr - X2APIC_MSR_BASE) as u8);
                self.x2apic_read(register)?
            }
            HV_X64_MSR_APIC_FREQUENCY if enlightened => TIMER_FREQUENCY,
            HV_X64_MSR_EOI if enlightened => {
                return Err(MsrAccessError::new(msr, MsrAccessErrorKind::ReadWriteOnly))
            }
            HV_X64_MSR_ICR if enlightened => {
                if !self.apic.shared.hardware_enabled() {
                    return Err(MsrAccessError::new(msr, MsrAccessErrorKind::InvalidReadMode));
                }
                self.hv_icr()
            }
            HV_X64_MSR_TPR if enlightened => self.hv_tpr().into(),
            _ => {
                return Err(MsrAccessError::new(
                    msr,
                    MsrAccessErrorKind::ReadReservedOrUnknown,
                ))
            }
        };
        Ok(value)
    }

    fn x2apic_read(&mut self, register: ApicRegister) -> Result<u64, MsrAccessError> {
        let shared = &self.apic.shared;
        if !shared.hardware_enabled() {
            let kind = if self.apic.global.max_mode == crate::ApicMaxMode::None {
                MsrAccessErrorKind::ReadDisallowedConfig
            } else {
                MsrAccessErrorKind::ReadReservedOrUnknown
            };
            return Err(MsrAccessError::register(register, kind));
        }
        if !shared.x2apic_enabled() && !self.apic.global.hyperv_compat {
            return Err(MsrAccessError::register(
                register,
                MsrAccessErrorKind::InvalidReadMode,
            ));
        }
        shared.record(ApicEvent::MsrRead);

        let value = match register {
            ApicRegister::ICR0 => self.icr(),
            ApicRegister::TIMER_CCR => self.apic.timer_current_count(self.client.now()).into(),
            ApicRegister::PPR => self.apic.ppr().into(),
            ApicRegister::ID
            | ApicRegister::VERSION
            | ApicRegister::TPR
            | ApicRegister::LDR
            | ApicRegister::SVR
            | ApicRegister::ESR
            | ApicRegister::LVT_TIMER
            | ApicRegister::LVT_THERMAL
            | ApicRegister::LVT_PMC
            | ApicRegister::LVT_LINT0
            | ApicRegister::LVT_LINT1
            | ApicRegister::LVT_ERROR
            | ApicRegister::TIMER_ICR
            | ApicRegister::TIMER_DCR => shared.page.read(register).into(),
            reg if (ApicRegister::ISR0..=ApicRegister::IRR7).contains(&reg) => {
                shared.page.read(reg).into()
            }
            ApicRegister::EOI | ApicRegister::SELF_IPI => {
                return Err(MsrAccessError::register(
                    register,
                    MsrAccessErrorKind::ReadWriteOnly,
                ))
            }
            // Hyper-V guests read the "high half" of LDR here.
            ApicRegister::DFR if self.apic.global.hyperv_compat => 0,
            _ => {
                return Err(MsrAccessError::register(
                    register,
                    MsrAccessErrorKind::ReadReservedOrUnknown,
                ))
            }
        };
        Ok(value)
    }

    /// Writes the APIC base MSR, an x2APIC MSR or a Hyper-V APIC MSR.
    pub fn msr_write(&mut self, msr: u32, value: u64) -> Result<(), ApicAccessError> {
        let result = self.msr_write_inner(msr, value);
        self.log_error(result)
    }

    fn msr_write_inner(&mut self, msr: u32, value: u64) -> Result<(), ApicAccessError> {
        let enlightened = self.apic.global.hyperv_enlightenments;
        match msr {
            X86X_MSR_APIC_BASE => self.apic.set_apic_base(value)?,
            X2APIC_MSR_BASE..=X2APIC_MSR_END => {
                let register = ApicRegister((msr - X2APIC_MSR_BASE) as u8);
                self.x2apic_write(register, value)?
            }
            HV_X64_MSR_APIC_FREQUENCY if enlightened => {
                return Err(MsrAccessError::new(msr, MsrAccessErrorKind::WriteReadOnly).into())
            }
            HV_X64_MSR_EOI if enlightened => {
                if !self.apic.shared.hardware_enabled() {
                    return Err(
                        MsrAccessError::new(msr, MsrAccessErrorKind::InvalidWriteMode).into(),
                    );
                }
                let value = u32::try_from(value).map_err(|_| {
                    MsrAccessError::new(msr, MsrAccessErrorKind::WriteReservedBits)
                })?;
                self.set_eoi(value, true)?
            }
            HV_X64_MSR_ICR if enlightened => {
                if !self.apic.shared.hardware_enabled() {
                    return Err(
                        MsrAccessError::new(msr, MsrAccessErrorKind::InvalidWriteMode).into(),
                    );
                }
                self.set_icr(value)?
            }
            HV_X64_MSR_TPR if enlightened => self.write_hv_tpr(value)?,
            _ => {
                return Err(
                    MsrAccessError::new(msr, MsrAccessErrorKind::WriteReservedOrUnknown).into(),
                )
            }
        }
        Ok(())
    }

    fn x2apic_write(&mut self, register: ApicRegister, value: u64) -> Result<(), ApicAccessError> {
        let shared = &self.apic.shared;
        if !shared.hardware_enabled() {
            let kind = if self.apic.global.max_mode == crate::ApicMaxMode::None {
                MsrAccessErrorKind::WriteDisallowedConfig
            } else {
                MsrAccessErrorKind::WriteReservedOrUnknown
            };
            return Err(MsrAccessError::register(register, kind).into());
        }
        // Only ICR is 64 bits wide.
        if register != ApicRegister::ICR0 && value >> 32 != 0 {
            return Err(
                MsrAccessError::register(register, MsrAccessErrorKind::WriteReservedBits).into(),
            );
        }
        if !shared.x2apic_enabled() && !self.apic.global.hyperv_compat {
            return Err(
                MsrAccessError::register(register, MsrAccessErrorKind::InvalidWriteMode).into(),
            );
        }
        shared.record(ApicEvent::MsrWrite);
        tracing::trace!(vp = shared.vp_index.index(), ?register, value, "msr write");

        let value32 = value as u32;
        match register {
            ApicRegister::TPR => self.set_tpr_ex(value32, false)?,
            ApicRegister::ICR0 => self.set_icr(value)?,
            ApicRegister::SVR => self.set_svr(value32)?,
            ApicRegister::ESR => self.set_esr(value32)?,
            ApicRegister::TIMER_DCR => self.set_dcr(value32)?,
            ApicRegister::TIMER_ICR => {
                let now = self.client.now();
                self.apic.set_timer_initial_count(value32, now);
            }
            ApicRegister::EOI => self.set_eoi(value32, false)?,
            ApicRegister::SELF_IPI => {
                let vector = value32 as u8;
                tracing::trace!(vp = shared.vp_index.index(), vector, "self ipi");
                shared.post_and_wake(vector, TriggerMode::Edge, 0, &mut *self.client);
            }
            register if register.lvt_valid_mask().is_some() => self.set_lvt(register, value32)?,
            // Hyper-V guests write the "high half" of LDR here.
            ApicRegister::DFR if self.apic.global.hyperv_compat => {}
            ApicRegister::LDR if self.apic.global.hyperv_compat => self.set_ldr(value32),
            ApicRegister::ID
            | ApicRegister::VERSION
            | ApicRegister::PPR
            | ApicRegister::LDR
            | ApicRegister::TIMER_CCR => {
                return Err(
                    MsrAccessError::register(register, MsrAccessErrorKind::WriteReadOnly).into(),
                )
            }
            reg if (ApicRegister::ISR0..=ApicRegister::IRR7).contains(&reg) => {
                return Err(
                    MsrAccessError::register(register, MsrAccessErrorKind::WriteReadOnly).into(),
                )
            }
            _ => {
                return Err(MsrAccessError::register(
                    register,
                    MsrAccessErrorKind::WriteReservedOrUnknown,
                )
                .into())
            }
        }
        Ok(())
    }

    /// Sets TPR through the Hyper-V TPR MSR.
    pub fn hv_set_tpr(&mut self, value: u64) -> Result<(), ApicAccessError> {
        let result = self.write_hv_tpr(value).map_err(Into::into);
        self.log_error(result)
    }

    fn write_hv_tpr(&mut self, value: u64) -> Result<(), MsrAccessError> {
        let value = u32::try_from(value).map_err(|_| {
            MsrAccessError::register(ApicRegister::TPR, MsrAccessErrorKind::WriteReservedBits)
        })?;
        self.set_tpr_ex(value, true)
    }

    /// Reads TPR through the Hyper-V TPR MSR.
    pub fn hv_tpr(&self) -> u8 {
        self.apic.shared.page.read(ApicRegister::TPR) as u8
    }

    /// Writes ICR through the Hyper-V ICR MSR, sending an IPI.
    pub fn hv_set_icr(&mut self, value: u64) -> Result<(), ApicAccessError> {
        let result = self.set_icr(value);
        self.log_error(result)
    }

    /// Reads ICR through the Hyper-V ICR MSR.
    pub fn hv_icr(&self) -> u64 {
        self.icr()
    }

    /// Signals EOI through the Hyper-V EOI MSR.
    pub fn hv_set_eoi(&mut self, value: u32) -> Result<(), ApicAccessError> {
        let result = self.set_eoi(value, true).map_err(Into::into);
        self.log_error(result)
    }

    fn icr(&self) -> u64 {
        let page = &self.apic.shared.page;
        u64::from(page.read(ApicRegister::ICR1)) << 32 | u64::from(page.read(ApicRegister::ICR0))
    }

    fn set_tpr_ex(&mut self, value: u32, force_x2apic: bool) -> Result<(), MsrAccessError> {
        if (self.x2apic_enabled() || force_x2apic) && value & !0xff != 0 {
            return Err(MsrAccessError::register(
                ApicRegister::TPR,
                MsrAccessErrorKind::WriteReservedBits,
            ));
        }
        self.apic.write_tpr(value as u8);
        Ok(())
    }

    fn set_eoi(&mut self, value: u32, force_x2apic: bool) -> Result<(), MsrAccessError> {
        if (self.x2apic_enabled() || force_x2apic) && value != 0 {
            return Err(MsrAccessError::register(
                ApicRegister::EOI,
                MsrAccessErrorKind::WriteReservedBits,
            ));
        }
        self.apic.end_of_interrupt(&mut *self.client);
        Ok(())
    }

    fn set_svr(&mut self, value: u32) -> Result<(), MsrAccessError> {
        if self.x2apic_enabled() && value & !SVR_VALID != 0 {
            return Err(MsrAccessError::register(
                ApicRegister::SVR,
                MsrAccessErrorKind::WriteReservedBits,
            ));
        }
        let shared = &self.apic.shared;
        let svr = Svr::from(value & SVR_VALID);
        shared.page.write(ApicRegister::SVR, svr.into());
        if !svr.enable() {
            let masked = Lvt::new().with_masked(true).into_bits();
            for register in ApicRegister::LVT {
                shared.page.fetch_or(register, masked);
            }
        }
        tracing::debug!(
            vp = shared.vp_index.index(),
            enabled = svr.enable(),
            vector = svr.vector(),
            "svr"
        );
        self.apic.signal_next_pending();
        Ok(())
    }

    fn set_lvt(&mut self, register: ApicRegister, value: u32) -> Result<(), MsrAccessError> {
        let x2apic = self.x2apic_enabled();
        let shared = &self.apic.shared;
        let mut value = value;
        if register == ApicRegister::LVT_TIMER
            && !self.apic.global.tsc_deadline
            && value & LVT_TIMER_TSC_DEADLINE != 0
        {
            if x2apic {
                return Err(MsrAccessError::register(
                    register,
                    MsrAccessErrorKind::WriteReservedBits,
                ));
            }
            value &= !LVT_TIMER_TSC_DEADLINE;
        }

        let Some(valid) = register.lvt_valid_mask() else {
            return Err(MsrAccessError::register(
                register,
                MsrAccessErrorKind::WriteReservedOrUnknown,
            ));
        };
        if x2apic && value & !valid != 0 {
            return Err(MsrAccessError::register(
                register,
                MsrAccessErrorKind::WriteReservedBits,
            ));
        }

        // Delivery status and remote IRR are owned by the APIC.
        let status = Lvt::new()
            .with_delivery_status(true)
            .with_remote_irr(true)
            .into_bits();
        let current = shared.page.read(register);
        let mut lvt = Lvt::from((value & valid & !status) | (current & status));
        if !shared.software_enabled() {
            lvt.set_masked(true);
        }
        if lvt.vector() <= APIC_ILLEGAL_VECTOR_END
            && DeliveryMode(lvt.delivery_mode()) == DeliveryMode::FIXED
        {
            shared.set_error(Esr::new().with_send_illegal_vector(true));
        }
        tracing::trace!(vp = shared.vp_index.index(), ?register, ?lvt, "lvt");
        shared.page.write(register, lvt.into());
        Ok(())
    }

    fn set_esr(&mut self, value: u32) -> Result<(), MsrAccessError> {
        if self.x2apic_enabled() && value != 0 {
            return Err(MsrAccessError::register(
                ApicRegister::ESR,
                MsrAccessErrorKind::WriteReservedBits,
            ));
        }
        // A write latches the errors collected since the previous write.
        let shared = &self.apic.shared;
        let errors = shared.pending_errors.swap(0, Ordering::Relaxed);
        shared.page.write(ApicRegister::ESR, errors);
        Ok(())
    }

    fn set_ldr(&mut self, value: u32) {
        self.apic
            .shared
            .page
            .write(ApicRegister::LDR, value & XAPIC_LDR_VALID);
    }

    fn set_dfr(&mut self, value: u32) {
        self.apic
            .shared
            .page
            .write(ApicRegister::DFR, (value & DFR_VALID) | DFR_RESERVED_ONES);
    }

    fn set_dcr(&mut self, value: u32) -> Result<(), MsrAccessError> {
        if self.x2apic_enabled() && value & !DCR_VALID != 0 {
            return Err(MsrAccessError::register(
                ApicRegister::TIMER_DCR,
                MsrAccessErrorKind::WriteReservedBits,
            ));
        }
        self.apic
            .shared
            .page
            .write(ApicRegister::TIMER_DCR, value & DCR_VALID);
        Ok(())
    }

    fn set_icr_high(&mut self, value: u32) {
        self.apic
            .shared
            .page
            .write(ApicRegister::ICR1, value & XAPIC_ICR_HIGH_VALID);
    }

    /// Writes the low half of ICR, which sends the IPI.
    fn set_icr_low(&mut self, value: u32) -> Result<(), ApicAccessError> {
        let shared = &self.apic.shared;
        shared
            .page
            .write(ApicRegister::ICR0, value & ICR_LOW_WRITE_VALID);
        shared.record(ApicEvent::IcrWrite);
        self.apic.send_ipi(&mut *self.client)?;
        Ok(())
    }

    /// Writes the full 64-bit ICR, as through the x2APIC or Hyper-V MSR.
    fn set_icr(&mut self, value: u64) -> Result<(), ApicAccessError> {
        let low = value as u32;
        if low & !ICR_LOW_WRITE_VALID != 0 {
            return Err(MsrAccessError::register(
                ApicRegister::ICR0,
                MsrAccessErrorKind::WriteReservedBits,
            )
            .into());
        }
        self.apic
            .shared
            .page
            .write(ApicRegister::ICR1, (value >> 32) as u32);
        self.set_icr_low(low)
    }
}

impl LocalApic {
    fn ppr(&self) -> u32 {
        self.shared.page.read(ApicRegister::PPR)
    }
}
