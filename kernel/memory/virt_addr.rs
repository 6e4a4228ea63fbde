// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::PAGE_SIZE;
use align::{align_down_usize, align_up_usize, is_aligned_usize};
use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A virtual memory address.
///
/// A `VirtAddr` can only store a canonical address: one whose
/// top 17 bits are all equal. Addresses in the lower half have
/// bit 47 clear, addresses in the higher half have it set and
/// the top bits sign-extended.
///
#[repr(transparent)]
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VirtAddr(usize);

/// An invalid (non-canonical) virtual memory address.
///
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InvalidVirtAddr(pub usize);

impl VirtAddr {
    /// Creates a new virtual memory address.
    ///
    /// # Panics
    ///
    /// `new` will panic if `addr` is not canonical.
    ///
    #[inline]
    #[track_caller]
    pub const fn new(addr: usize) -> Self {
        match Self::try_new(addr) {
            Ok(addr) => addr,
            Err(_) => panic!("invalid address passed to VirtAddr::new"),
        }
    }

    /// Tries to create a new virtual memory address, returning
    /// an error if the value is not canonical.
    ///
    #[inline]
    pub const fn try_new(addr: usize) -> Result<Self, InvalidVirtAddr> {
        let top_bits = addr >> 47;
        if top_bits == 0 || top_bits == 0x1ffff {
            Ok(VirtAddr(addr))
        } else {
            Err(InvalidVirtAddr(addr))
        }
    }

    /// Returns the null address.
    ///
    #[inline]
    pub const fn zero() -> Self {
        VirtAddr(0)
    }

    /// Returns the address as a `usize`.
    ///
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns whether this is the null address.
    ///
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Aligns the address downwards to the base of its page.
    ///
    #[inline]
    pub const fn page_base(self) -> Self {
        VirtAddr(align_down_usize(self.0, PAGE_SIZE))
    }

    /// Aligns the address upwards to the next page boundary.
    ///
    #[inline]
    pub const fn page_next(self) -> Self {
        VirtAddr(align_up_usize(self.0, PAGE_SIZE))
    }

    /// Returns whether the address is page-aligned.
    ///
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        is_aligned_usize(self.0, PAGE_SIZE)
    }

    /// Returns the index into each of the four page table
    /// levels that this address resolves through, from the
    /// root downwards.
    ///
    #[inline]
    pub const fn page_table_indices(self) -> [usize; 4] {
        [
            (self.0 >> 39) & 0x1ff,
            (self.0 >> 30) & 0x1ff,
            (self.0 >> 21) & 0x1ff,
            (self.0 >> 12) & 0x1ff,
        ]
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl Add<usize> for VirtAddr {
    type Output = VirtAddr;

    #[track_caller]
    fn add(self, offset: usize) -> VirtAddr {
        VirtAddr::new(self.0.wrapping_add(offset))
    }
}

impl AddAssign<usize> for VirtAddr {
    #[track_caller]
    fn add_assign(&mut self, offset: usize) {
        *self = *self + offset;
    }
}

impl Sub<usize> for VirtAddr {
    type Output = VirtAddr;

    #[track_caller]
    fn sub(self, offset: usize) -> VirtAddr {
        VirtAddr::new(self.0 - offset)
    }
}

impl SubAssign<usize> for VirtAddr {
    #[track_caller]
    fn sub_assign(&mut self, offset: usize) {
        *self = *self - offset;
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = usize;

    fn sub(self, other: VirtAddr) -> usize {
        self.0 - other.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virt_addr() {
        assert_eq!(VirtAddr::new(0x1000).as_usize(), 0x1000);
        assert!(VirtAddr::try_new(0xffff_8000_0000_0000).is_ok());
        assert!(VirtAddr::try_new(0x8000_0000_0000).is_err());
        assert_eq!(VirtAddr::new(0x1fff).page_base(), VirtAddr::new(0x1000));
        assert_eq!(VirtAddr::new(0x1001).page_next(), VirtAddr::new(0x2000));
    }

    #[test]
    fn test_page_table_indices() {
        let addr = VirtAddr::new((3 << 39) | (5 << 30) | (7 << 21) | (9 << 12) | 0x123);
        assert_eq!(addr.page_table_indices(), [3, 5, 7, 9]);
    }
}
