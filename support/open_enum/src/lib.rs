// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A macro for defining "open" enums: integer newtypes with named constants.
//!
//! Protocol fields frequently carry values that the receiver does not know
//! about. A Rust `enum` cannot represent those without a catch-all variant and
//! a fallible conversion, so wire-facing code uses a transparent newtype with
//! associated constants instead. Unknown values round-trip unchanged and
//! `Debug` prints the constant name when one matches.
//!
//! ```
//! open_enum::open_enum! {
//!     /// Lane speeds.
//!     pub enum Speed: u8 {
//!         GEN2 = 2,
//!         GEN3 = 3,
//!     }
//! }
//!
//! assert_eq!(format!("{:?}", Speed::GEN3), "GEN3");
//! assert_eq!(format!("{:?}", Speed(7)), "7");
//! ```

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

/// Defines an open enum. See the crate documentation.
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
        #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
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

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                #![allow(unreachable_patterns)]
                let s = match *self {
                    $( Self::$variant => stringify!($variant), )*
                    _ => return ::core::fmt::Debug::fmt(&self.0, f),
                };
                f.pad(s)
            }
        }
    };
}
