// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! APIC-related definitions.
//!
//! The local APIC exposes the same register file through two views: the
//! legacy xAPIC MMIO page, where each register sits at a 16-byte aligned
//! offset, and the x2APIC MSR range, where MSR `0x800 + (offset >> 4)` maps to
//! the register at `offset`.

use bitfield_struct::bitfield;
use open_enum::open_enum;

/// The physical address of the APIC at reset.
pub const APIC_BASE_ADDRESS: u32 = 0xfee00000;
/// The 4KB page number of the physical address of the APIC at reset.
pub const APIC_BASE_PAGE: u32 = APIC_BASE_ADDRESS >> 12;

/// The size of the xAPIC register page.
pub const APIC_PAGE_SIZE: usize = 0x1000;
/// The highest offset in the xAPIC page that holds an architectural register.
pub const APIC_MAX_REGISTER_OFFSET: u16 = 0x3f0;

/// Vectors 0 through this value are illegal for fixed interrupt delivery.
pub const APIC_ILLEGAL_VECTOR_END: u8 = 15;

/// The xAPIC physical destination that addresses every APIC.
pub const XAPIC_BROADCAST_DESTINATION: u32 = 0xff;
/// The x2APIC physical destination that addresses every APIC.
pub const X2APIC_BROADCAST_DESTINATION: u32 = 0xffff_ffff;

/// The APIC base MSR.
#[bitfield(u64)]
pub struct ApicBase {
    _reserved: u8,
    /// True if this processor is the BSP.
    pub bsp: bool,
    _reserved2: bool,
    /// x2APIC mode enable (EXTD).
    pub x2apic: bool,
    /// Global APIC enable (EN).
    pub enable: bool,
    /// The page number of the APIC (usually APIC_BASE_PAGE).
    #[bits(24)]
    pub base_page: u32,
    #[bits(28)]
    _reserved3: u64,
}

/// Spurious vector register.
#[bitfield(u32)]
pub struct Svr {
    pub vector: u8,
    pub enable: bool,
    pub focus_processor_checking: bool,
    #[bits(2)]
    _rsvd: u32,
    pub eoi_broadcast_suppression: bool,
    #[bits(19)]
    _rsvd2: u32,
}

/// The writable SVR bits for an APIC without EOI-broadcast suppression.
pub const SVR_VALID: u32 = Svr::new()
    .with_vector(0xff)
    .with_enable(true)
    .with_focus_processor_checking(true)
    .into_bits();

/// Local vector table
#[bitfield(u32)]
pub struct Lvt {
    pub vector: u8,
    #[bits(3)]
    pub delivery_mode: u8,
    _rsvd: bool,
    pub delivery_status: bool,
    pub input_pin_polarity: bool,
    pub remote_irr: bool,
    pub trigger_mode_level: bool,
    pub masked: bool,
    #[bits(2)]
    pub timer_mode: u8,
    #[bits(13)]
    _rsvd2: u32,
}

/// The LVT entry value after reset: masked, everything else clear.
pub const LVT_RESET: u32 = Lvt::new().with_masked(true).into_bits();

/// Valid bits of the timer LVT entry.
pub const LVT_TIMER_VALID: u32 = Lvt::new()
    .with_vector(0xff)
    .with_delivery_status(true)
    .with_masked(true)
    .with_timer_mode(0b11)
    .into_bits();

/// The TSC-deadline bit of the timer LVT entry.
pub const LVT_TIMER_TSC_DEADLINE: u32 = Lvt::new().with_timer_mode(0b10).into_bits();

/// Valid bits of the thermal and performance-counter LVT entries.
pub const LVT_THERMAL_VALID: u32 = Lvt::new()
    .with_vector(0xff)
    .with_delivery_mode(0b111)
    .with_delivery_status(true)
    .with_masked(true)
    .into_bits();

/// Valid bits of the LINT0 and LINT1 LVT entries.
pub const LVT_LINT_VALID: u32 = Lvt::new()
    .with_vector(0xff)
    .with_delivery_mode(0b111)
    .with_delivery_status(true)
    .with_input_pin_polarity(true)
    .with_remote_irr(true)
    .with_trigger_mode_level(true)
    .with_masked(true)
    .into_bits();

/// Valid bits of the error LVT entry.
pub const LVT_ERROR_VALID: u32 = Lvt::new()
    .with_vector(0xff)
    .with_delivery_status(true)
    .with_masked(true)
    .into_bits();

open_enum! {
    pub enum TimerMode: u8 {
        ONE_SHOT = 0,
        PERIODIC = 1,
        TSC_DEADLINE = 2,
    }
}

/// Timer divide configuration register.
#[bitfield(u32)]
pub struct Dcr {
    #[bits(2)]
    pub value_low: u8,
    _rsvd: bool,
    #[bits(1)]
    pub value_high: u8,
    #[bits(28)]
    _rsvd2: u32,
}

/// Valid bits of the divide configuration register.
pub const DCR_VALID: u32 = Dcr::new()
    .with_value_low(0b11)
    .with_value_high(1)
    .into_bits();

impl Dcr {
    /// The shift applied to the timer clock, `0..=7`. A divider of 1 wraps
    /// around to shift 0.
    pub const fn divider_shift(&self) -> u8 {
        let value = self.value_low() | (self.value_high() << 2);
        value.wrapping_add(1) & 0b111
    }
}

open_enum! {
    pub enum Dfr: u32 {
        FLAT_MODE = 0xffff_ffff,
        CLUSTERED_MODE = 0x0fff_ffff,
    }
}

/// Writable bits of the destination format register (the model field).
pub const DFR_VALID: u32 = 0xf000_0000;
/// Bits of the destination format register that always read as one.
pub const DFR_RESERVED_ONES: u32 = 0x0fff_ffff;

/// Writable bits of the xAPIC logical destination register.
pub const XAPIC_LDR_VALID: u32 = 0xff00_0000;

#[bitfield(u64)]
pub struct Icr {
    pub vector: u8,
    #[bits(3)]
    pub delivery_mode: u8,
    pub destination_mode_logical: bool,
    pub delivery_pending: bool,
    pub reserved1: bool,
    pub level_assert: bool,
    pub trigger_mode_level: bool,
    #[bits(2)]
    pub remote_read_status: u8,
    #[bits(2)]
    pub destination_shorthand: u8,
    #[bits(12)]
    pub reserved3: u16,
    pub x2apic_mda: u32,
}

impl Icr {
    pub const fn xapic_mda(&self) -> u8 {
        (self.x2apic_mda() >> 24) as u8
    }

    pub const fn with_xapic_mda(self, value: u8) -> Self {
        self.with_x2apic_mda((value as u32) << 24)
    }

    /// The low half of the register.
    pub const fn low(&self) -> u32 {
        self.into_bits() as u32
    }
}

/// Bits of the low ICR dword that software may write.
pub const ICR_LOW_WRITE_VALID: u32 = Icr::new()
    .with_vector(0xff)
    .with_delivery_mode(0b111)
    .with_destination_mode_logical(true)
    .with_level_assert(true)
    .with_trigger_mode_level(true)
    .with_destination_shorthand(0b11)
    .low();

/// Bits of the high ICR dword that software may write in xAPIC mode.
pub const XAPIC_ICR_HIGH_VALID: u32 = 0xff00_0000;

#[bitfield(u32)]
pub struct X2ApicLogicalId {
    pub logical_id: u16,
    pub cluster_id: u16,
}

impl X2ApicLogicalId {
    /// The logical ID the hardware derives from an x2APIC ID.
    pub const fn from_apic_id(id: u32) -> Self {
        Self::new()
            .with_cluster_id((id >> 4) as u16)
            .with_logical_id(1 << (id & 0xf))
    }
}

#[bitfield(u8)]
pub struct XApicClusterLogicalId {
    #[bits(4)]
    pub logical_id: u8,
    #[bits(4)]
    pub cluster_id: u8,
}

/// Error status register.
#[bitfield(u32)]
pub struct Esr {
    pub send_checksum_error: bool,
    pub receive_checksum_error: bool,
    pub send_accept_error: bool,
    pub receive_accept_error: bool,
    pub redirectable_ipi: bool,
    pub send_illegal_vector: bool,
    pub receive_illegal_vector: bool,
    pub illegal_register_address: bool,
    #[bits(24)]
    _rsvd: u32,
}

open_enum! {
    pub enum DeliveryMode: u8 {
        FIXED = 0,
        LOWEST_PRIORITY = 1,
        SMI = 2,
        REMOTE_READ = 3,
        NMI = 4,
        INIT = 5,
        SIPI = 6,
        EXTINT = 7,
    }
}

open_enum! {
    pub enum DestinationShorthand: u8 {
        NONE = 0,
        SELF = 1,
        ALL_INCLUDING_SELF = 2,
        ALL_EXCLUDING_SELF = 3,
    }
}

open_enum! {
    pub enum ApicRegister: u8 {
        ID = 0x2,               // RO (x2APIC), write ignored (xAPIC)
        VERSION = 0x3,          // RO
        TPR = 0x8,              // RW
        APR = 0x9,              // RO, xAPIC only
        PPR = 0xa,              // RO
        EOI = 0xb,              // WO
        RRD = 0xc,              // RO, xAPIC only
        LDR = 0xd,              // RW (xAPIC), RO (x2APIC)
        DFR = 0xe,              // RW, xAPIC only
        SVR = 0xf,              // RW
        ISR0 = 0x10,            // RO
        ISR1 = 0x11,
        ISR2 = 0x12,
        ISR3 = 0x13,
        ISR4 = 0x14,
        ISR5 = 0x15,
        ISR6 = 0x16,
        ISR7 = 0x17,
        TMR0 = 0x18,            // RO
        TMR1 = 0x19,
        TMR2 = 0x1a,
        TMR3 = 0x1b,
        TMR4 = 0x1c,
        TMR5 = 0x1d,
        TMR6 = 0x1e,
        TMR7 = 0x1f,
        IRR0 = 0x20,            // RO
        IRR1 = 0x21,
        IRR2 = 0x22,
        IRR3 = 0x23,
        IRR4 = 0x24,
        IRR5 = 0x25,
        IRR6 = 0x26,
        IRR7 = 0x27,
        ESR = 0x28,             // RW
        INTEL_LVT_CMCI = 0x2f,  // reserved here
        ICR0 = 0x30,            // RW, 64 bits wide in x2APIC
        ICR1 = 0x31,            // RW, xAPIC only
        LVT_TIMER = 0x32,       // RW
        LVT_THERMAL = 0x33,     // RW
        LVT_PMC = 0x34,         // RW
        LVT_LINT0 = 0x35,       // RW
        LVT_LINT1 = 0x36,       // RW
        LVT_ERROR = 0x37,       // RW
        TIMER_ICR = 0x38,       // RW
        TIMER_CCR = 0x39,       // RO
        TIMER_DCR = 0x3e,       // RW
        SELF_IPI = 0x3f,        // WO, x2APIC only
    }
}

/// The first x2APIC MSR.
pub const X2APIC_MSR_BASE: u32 = 0x800;
/// The last MSR in the architectural x2APIC range.
pub const X2APIC_MSR_END: u32 = 0x8ff;

impl ApicRegister {
    /// The number of registers in the page, at 16-byte stride.
    pub const COUNT: usize = 0x40;

    /// The LVT entries, in register order.
    pub const LVT: [Self; 6] = [
        Self::LVT_TIMER,
        Self::LVT_THERMAL,
        Self::LVT_PMC,
        Self::LVT_LINT0,
        Self::LVT_LINT1,
        Self::LVT_ERROR,
    ];

    /// Returns the register at a 16-byte aligned page offset.
    pub const fn from_offset(offset: u16) -> Self {
        Self((offset >> 4) as u8)
    }

    /// Returns the register for an MSR in the x2APIC range.
    pub const fn from_x2apic_msr(msr: u32) -> Option<Self> {
        if msr >= X2APIC_MSR_BASE && msr <= X2APIC_MSR_END {
            Some(Self((msr - X2APIC_MSR_BASE) as u8))
        } else {
            None
        }
    }

    /// The byte offset of this register in the xAPIC page.
    pub const fn offset(&self) -> u16 {
        (self.0 as u16) << 4
    }

    pub const fn x2apic_msr(&self) -> u32 {
        X2APIC_MSR_BASE + self.0 as u32
    }

    /// Returns the valid-bit mask of an LVT register, or `None` if this is not
    /// an LVT register.
    pub const fn lvt_valid_mask(&self) -> Option<u32> {
        let mask = match *self {
            Self::LVT_TIMER => LVT_TIMER_VALID,
            Self::LVT_THERMAL | Self::LVT_PMC => LVT_THERMAL_VALID,
            Self::LVT_LINT0 | Self::LVT_LINT1 => LVT_LINT_VALID,
            Self::LVT_ERROR => LVT_ERROR_VALID,
            _ => return None,
        };
        Some(mask)
    }
}

#[bitfield(u32)]
pub struct ApicVersion {
    pub version: u8,
    _rsvd: u8,
    pub max_lvt_entry: u8,
    pub eoi_broadcast_suppression: bool,
    #[bits(7)]
    _rsvd2: u8,
}
