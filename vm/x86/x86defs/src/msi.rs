// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! x86 definitions of non-translated MSI address and data.
//!
//! A message-signaled interrupt is a DWORD write to the APIC address window.
//! The address selects the destination APIC(s) and the data carries the same
//! vector and mode bits as the low half of [`Icr`](super::apic::Icr).

use crate::apic::APIC_BASE_ADDRESS;
use bitfield_struct::bitfield;

/// The layout of the MSI address element.
#[bitfield(u32)]
pub struct MsiAddress {
    #[bits(2)]
    _reserved: u32,
    pub destination_mode_logical: bool,
    pub redirection_hint: bool,
    pub extended_destination: u8,
    pub destination: u8,
    #[bits(12)]
    pub address: u16,
}

/// The expected value for MsiAddress::address.
pub const MSI_ADDRESS: u16 = (APIC_BASE_ADDRESS >> 20) as u16;

impl MsiAddress {
    /// Returns true if the address falls in the architectural interrupt
    /// message window at `0xfeexxxxx`.
    pub const fn is_interrupt_window(&self) -> bool {
        self.address() == MSI_ADDRESS
    }
}

/// The layout of the MSI data element.
#[bitfield(u32)]
pub struct MsiData {
    pub vector: u8,
    #[bits(3)]
    pub delivery_mode: u8,
    pub destination_mode_logical: bool,
    #[bits(2)]
    _reserved: u8,
    pub assert: bool,
    pub trigger_mode_level: bool,
    _reserved2: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_message() {
        let address = MsiAddress::from(0xfee0_300c);
        assert!(address.is_interrupt_window());
        assert_eq!(address.destination(), 3);
        assert!(address.destination_mode_logical());

        let data = MsiData::from(0xc131);
        assert_eq!(data.vector(), 0x31);
        assert_eq!(data.delivery_mode(), 1);
        assert!(data.assert());
        assert!(data.trigger_mode_level());
    }
}
