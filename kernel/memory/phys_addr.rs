// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::PAGE_SIZE;
use align::{align_down_usize, align_up_usize, is_aligned_usize};
use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A physical memory address.
///
/// A `PhysAddr` can only store an address that is valid on
/// x86-64: the top 12 bits are always zero (see Intel x86_64
/// manual, volume 1, section 3.2.1).
///
#[repr(transparent)]
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysAddr(usize);

/// An invalid physical memory address.
///
/// If an attempt is made to create a `PhysAddr` from a value
/// that is not valid on the target platform, then `InvalidPhysAddr`
/// is returned, containing the attempted value.
///
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InvalidPhysAddr(pub usize);

impl PhysAddr {
    /// Creates a new physical memory address.
    ///
    /// # Panics
    ///
    /// `new` will panic if `addr` is not valid for the
    /// target platform.
    ///
    #[inline]
    #[track_caller]
    pub const fn new(addr: usize) -> Self {
        match Self::try_new(addr) {
            Ok(addr) => addr,
            Err(_) => panic!("invalid address passed to PhysAddr::new"),
        }
    }

    /// Tries to create a new physical memory address.
    ///
    /// If the passed value is invalid for the target
    /// platform, then an error is returned.
    ///
    #[inline]
    pub const fn try_new(addr: usize) -> Result<Self, InvalidPhysAddr> {
        let top_bits = (addr & 0xfff0_0000_0000_0000_usize) >> 52;
        if top_bits == 0 {
            Ok(PhysAddr(addr))
        } else {
            Err(InvalidPhysAddr(addr))
        }
    }

    /// Returns the null physical address.
    ///
    #[inline]
    pub const fn zero() -> Self {
        PhysAddr(0)
    }

    /// Returns the address as a `usize`.
    ///
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Aligns the address downwards to the base of its page.
    ///
    #[inline]
    pub const fn page_base(self) -> Self {
        PhysAddr(align_down_usize(self.0, PAGE_SIZE))
    }

    /// Aligns the address upwards to the next page boundary.
    ///
    #[inline]
    pub const fn page_next(self) -> Self {
        PhysAddr(align_up_usize(self.0, PAGE_SIZE))
    }

    /// Returns whether the address is page-aligned.
    ///
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        is_aligned_usize(self.0, PAGE_SIZE)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl Add<usize> for PhysAddr {
    type Output = PhysAddr;

    #[track_caller]
    fn add(self, offset: usize) -> PhysAddr {
        PhysAddr::new(self.0 + offset)
    }
}

impl AddAssign<usize> for PhysAddr {
    #[track_caller]
    fn add_assign(&mut self, offset: usize) {
        *self = *self + offset;
    }
}

impl Sub<usize> for PhysAddr {
    type Output = PhysAddr;

    #[track_caller]
    fn sub(self, offset: usize) -> PhysAddr {
        PhysAddr::new(self.0 - offset)
    }
}

impl SubAssign<usize> for PhysAddr {
    #[track_caller]
    fn sub_assign(&mut self, offset: usize) {
        *self = *self - offset;
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = usize;

    fn sub(self, other: PhysAddr) -> usize {
        self.0 - other.0
    }
}
