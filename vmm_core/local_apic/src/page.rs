// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The APIC register page.
//!
//! The page holds the architectural register file at the xAPIC MMIO offsets.
//! The x2APIC MSR view maps onto the same offsets, so both views share these
//! accessors. Each 32-bit word is atomic so that other processors can read
//! the fields they need for destination matching (LDR, DFR, TPR, SVR) while
//! the owning processor mutates the page.

use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use x86defs::apic::ApicRegister;
use x86defs::apic::APIC_PAGE_SIZE;

const WORDS: usize = APIC_PAGE_SIZE / 4;

/// Returns the fragment index and bit mask for `vector` in a 256-bit
/// register.
pub(crate) fn bank_mask(vector: u8) -> (usize, u32) {
    (vector as usize / 32, 1 << (vector % 32))
}

/// One of the 256-bit vector registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum VectorRegister {
    Isr,
    Tmr,
    Irr,
}

impl VectorRegister {
    fn fragment(self, index: usize) -> ApicRegister {
        let base = match self {
            Self::Isr => ApicRegister::ISR0,
            Self::Tmr => ApicRegister::TMR0,
            Self::Irr => ApicRegister::IRR0,
        };
        debug_assert!(index < 8);
        ApicRegister(base.0 + index as u8)
    }
}

pub(crate) struct RegisterPage {
    words: [AtomicU32; WORDS],
}

impl RegisterPage {
    pub fn new() -> Self {
        Self {
            words: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Reads the 32-bit word at byte `offset`.
    pub fn read_raw32(&self, offset: u16) -> u32 {
        debug_assert!(offset % 4 == 0 && (offset as usize) < APIC_PAGE_SIZE);
        self.words[offset as usize / 4].load(Ordering::Relaxed)
    }

    /// Writes the 32-bit word at byte `offset`.
    pub fn write_raw32(&self, offset: u16, value: u32) {
        debug_assert!(offset % 4 == 0 && (offset as usize) < APIC_PAGE_SIZE);
        self.words[offset as usize / 4].store(value, Ordering::Relaxed);
    }

    pub fn read(&self, register: ApicRegister) -> u32 {
        self.read_raw32(register.offset())
    }

    pub fn write(&self, register: ApicRegister, value: u32) {
        self.write_raw32(register.offset(), value)
    }

    fn word(&self, register: ApicRegister) -> &AtomicU32 {
        &self.words[register.offset() as usize / 4]
    }

    /// Atomically ORs `bits` into `register`, returning the old value.
    pub fn fetch_or(&self, register: ApicRegister, bits: u32) -> u32 {
        self.word(register).fetch_or(bits, Ordering::AcqRel)
    }

    /// Atomically ANDs `bits` into `register`, returning the old value.
    pub fn fetch_and(&self, register: ApicRegister, bits: u32) -> u32 {
        self.word(register).fetch_and(bits, Ordering::AcqRel)
    }

    pub fn test_vector(&self, register: VectorRegister, vector: u8) -> bool {
        let (bank, mask) = bank_mask(vector);
        self.read(register.fragment(bank)) & mask != 0
    }

    pub fn set_vector(&self, register: VectorRegister, vector: u8) {
        let (bank, mask) = bank_mask(vector);
        self.fetch_or(register.fragment(bank), mask);
    }

    pub fn clear_vector(&self, register: VectorRegister, vector: u8) {
        let (bank, mask) = bank_mask(vector);
        self.fetch_and(register.fragment(bank), !mask);
    }

    pub fn or_fragment(&self, register: VectorRegister, index: usize, bits: u32) {
        if bits != 0 {
            self.fetch_or(register.fragment(index), bits);
        }
    }

    pub fn clear_fragment_bits(&self, register: VectorRegister, index: usize, bits: u32) {
        if bits != 0 {
            self.fetch_and(register.fragment(index), !bits);
        }
    }

    /// Returns the highest vector set in `register`.
    pub fn highest_vector(&self, register: VectorRegister) -> Option<u8> {
        (0..8).rev().find_map(|i| {
            let v = self.read(register.fragment(i));
            (v != 0).then(|| (i as u32 * 32 + 31 - v.leading_zeros()) as u8)
        })
    }

    #[cfg(test)]
    pub fn vector_bits(&self, register: VectorRegister) -> [u32; 8] {
        std::array::from_fn(|i| self.read(register.fragment(i)))
    }

    pub fn clear_vectors(&self, register: VectorRegister) {
        for i in 0..8 {
            self.write(register.fragment(i), 0);
        }
    }

    /// Returns the value of every architectural register, in register order.
    pub fn registers(&self) -> [u32; ApicRegister::COUNT] {
        std::array::from_fn(|i| self.read(ApicRegister(i as u8)))
    }

    /// Replaces every architectural register.
    pub fn load_registers(&self, registers: &[u32; ApicRegister::COUNT]) {
        for (i, &value) in registers.iter().enumerate() {
            self.write(ApicRegister(i as u8), value);
        }
    }
}

impl fmt::Debug for RegisterPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the architectural registers, skipping zero values.
        let mut map = f.debug_map();
        for index in 0..ApicRegister::COUNT as u8 {
            let register = ApicRegister(index);
            let value = self.read(register);
            if value != 0 {
                map.entry(&register, &format_args!("{value:#x}"));
            }
        }
        map.finish()
    }
}
