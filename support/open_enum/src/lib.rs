// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![no_std]

//! Provides the [`open_enum`] macro.

/// Declares an "open" enumeration: a `#[repr(transparent)]` newtype over an
/// integer with one associated constant per named value.
///
/// Architectural fields such as an APIC delivery mode or register index can
/// hold any bit pattern the guest writes, including values with no name.
/// Matching on an open enum must therefore always have a fallback arm, and
/// converting a raw field into one can never fail.
///
/// The generated type derives `Copy`, `Clone`, `Eq`, `PartialEq`, `Hash`,
/// `Ord` and `PartialOrd`, and implements `Debug` by printing the constant's
/// name, or the raw value when it has none. `name()` returns the same name
/// for use in structured logging.
///
/// # Examples
///
/// ```
/// use open_enum::open_enum;
/// open_enum! {
///     pub enum DeliveryMode: u8 {
///         #![allow(missing_docs)]
///         FIXED = 0,
///         NMI = 4,
///     }
/// }
///
/// // Expands to roughly:
/// //
/// // #[repr(transparent)]
/// // #[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
/// // pub struct DeliveryMode(pub u8);
/// //
/// // impl DeliveryMode {
/// //     pub const FIXED: DeliveryMode = DeliveryMode(0);
/// //     pub const NMI: DeliveryMode = DeliveryMode(4);
/// // }
///
/// let mode = DeliveryMode(4);
/// assert_eq!(mode, DeliveryMode::NMI);
/// assert_eq!(mode.name(), Some("NMI"));
/// assert_eq!(DeliveryMode(3).name(), None);
/// assert_eq!(format!("{:?}", DeliveryMode(3)), "3");
/// ```
#[macro_export]
macro_rules! open_enum {
    (
        $(#[$a:meta])*
        $v:vis enum $name:ident : $storage:ty {
            $(#![$implattr:meta])*
            $(
                $(#[$vattr:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        #[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        #[repr(transparent)]
        $(#[$a])*
        $v struct $name(pub $storage);
        $(#[$implattr])*
        impl $name {
            $(
                $(#[$vattr])*
                pub const $variant: $name = $name($value);
            )*
        }
        impl $name {
            /// Returns the name of this value, or `None` if it has no name.
            #[allow(dead_code, unreachable_patterns)]
            pub const fn name(&self) -> Option<&'static str> {
                match *self {
                    $( Self::$variant => Some(stringify!($variant)), )*
                    _ => None,
                }
            }
        }
        impl ::core::fmt::Debug for $name {
            fn fmt(&self, fmt: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                match self.name() {
                    Some(name) => fmt.pad(name),
                    None => ::core::fmt::Debug::fmt(&self.0, fmt),
                }
            }
        }
    }
}
