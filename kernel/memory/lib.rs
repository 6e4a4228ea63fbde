// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains types and functionality to represent physical and virtual memory.
//!
//! This crate provides the core types shared by the memory subsystems:
//!
//! - [`PhysAddr`]: An address in the 52-bit physical address space.
//! - [`VirtAddr`]: A canonical address in the 48-bit virtual address space.
//! - [`Prot`]: The protection requested for a mapping.
//! - [`PageTableFlags`]: The x86-64 page table entry flags.
//! - [`AddrSpaceId`]: A stable handle naming an address space.
//!
//! The kernel's page tables map all physical memory contiguously at
//! a fixed offset in the higher half. [`phys_to_virt`] translates a
//! physical address to a virtual address inside that window; the
//! offset is recorded with [`set_physical_window`] once the boot
//! protocol has described it. Until then the window is an identity
//! mapping, which is also the arrangement the test suite relies on
//! when it stands physical memory up inside an ordinary allocation.
//!
//! The [`constants`] module contains the fixed points of the virtual
//! address space layout.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

pub mod constants;
mod phys_addr;
mod prot;
mod virt_addr;

pub use phys_addr::{InvalidPhysAddr, PhysAddr};
pub use prot::{PageTableFlags, Prot};
pub use virt_addr::{InvalidVirtAddr, VirtAddr};

use core::sync::atomic::{AtomicUsize, Ordering};

/// The size in bytes of a page of memory.
///
pub const PAGE_SIZE: usize = 4096;

/// The offset at which physical memory is mapped into the
/// kernel's virtual address space.
///
static PHYSICAL_WINDOW: AtomicUsize = AtomicUsize::new(0);

/// Records the offset of the physical memory window.
///
/// # Safety
///
/// The caller must guarantee that all of physical memory is
/// mapped at `offset`, and that no translated address produced
/// before the change is still in use.
///
pub unsafe fn set_physical_window(offset: usize) {
    PHYSICAL_WINDOW.store(offset, Ordering::Relaxed);
}

/// Returns a virtual address that is mapped to the given
/// physical address.
///
/// This uses the mapping of all physical memory at the offset
/// recorded by [`set_physical_window`].
///
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(PHYSICAL_WINDOW.load(Ordering::Relaxed) + phys.as_usize())
}

/// Uniquely identifies an address space.
///
/// The kernel's own address space is always [`AddrSpaceId::KERNEL`];
/// process address spaces receive ids as their physical maps are
/// created.
///
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AddrSpaceId(u32);

impl AddrSpaceId {
    /// The kernel's address space.
    ///
    pub const KERNEL: Self = AddrSpaceId(0);

    /// Wraps a raw address space number.
    ///
    pub const fn new(id: u32) -> Self {
        AddrSpaceId(id)
    }

    /// Returns the raw address space number.
    ///
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phys_to_virt_identity() {
        // The default window is an identity mapping.
        let phys = PhysAddr::new(0x1234);
        assert_eq!(phys_to_virt(phys).as_usize(), 0x1234);
    }
}
