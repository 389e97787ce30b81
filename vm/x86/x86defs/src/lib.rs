// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions relating to the x86 local interrupt controller (APIC) and the
//! MSRs and interrupt messages that reach it.

#![no_std]
#![forbid(unsafe_code)]

pub mod apic;
pub mod msi;

/// The `IA32_APIC_BASE` MSR.
pub const X86X_MSR_APIC_BASE: u32 = 0x1b;
