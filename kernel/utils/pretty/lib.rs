// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides pretty printing for various data types.
//!
//! This crate provides helper types for pretty printing units, such
//! as a number of bytes or a number of memory pages.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

use core::fmt;

/// Contains a number of bytes.
///
/// When formatted, the value is scaled to the largest
/// power-of-two unit that keeps the integer part nonzero.
///
pub struct Bytes(usize);

impl Bytes {
    /// Wraps a number of bytes.
    ///
    pub const fn from_usize(n: usize) -> Self {
        Bytes(n)
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let units = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
        let mut b = self.0;
        let width = f.width();
        for unit in units.iter() {
            if b >= 1024 {
                b >>= 10;
                continue;
            }

            return match width {
                None => write!(f, "{} {}", b, unit),
                Some(width) => write!(
                    f,
                    "{:width$} {}",
                    b,
                    unit,
                    width = width.saturating_sub(1 + unit.len())
                ),
            };
        }

        write!(f, "{} ZiB", b)
    }
}

/// Contains a number of 4 KiB memory pages.
///
/// When formatted, both the page count and the byte
/// quantity it covers are printed.
///
pub struct Pages(usize);

impl Pages {
    /// Wraps a number of pages.
    ///
    pub const fn from_usize(n: usize) -> Self {
        Pages(n)
    }
}

impl fmt::Display for Pages {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} pages ({})", self.0, Bytes(self.0 * 4096))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_bytes() {
        assert_eq!(format!("{}", Bytes::from_usize(1)), "1 B");
        assert_eq!(format!("{}", Bytes::from_usize(1000)), "1000 B");
        assert_eq!(format!("{}", Bytes::from_usize(1023)), "1023 B");
        assert_eq!(format!("{}", Bytes::from_usize(1024)), "1 KiB");
        assert_eq!(format!("{}", Bytes::from_usize(1000 * 1024)), "1000 KiB");
        assert_eq!(format!("{}", Bytes::from_usize(1024 * 1024)), "1 MiB");
    }

    #[test]
    fn test_pages() {
        assert_eq!(format!("{}", Pages::from_usize(1)), "1 pages (4 KiB)");
        assert_eq!(format!("{}", Pages::from_usize(512)), "512 pages (2 MiB)");
    }
}
