// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The page fault resolver.
//!
//! [`fault`] walks map → object → amap → anon, materialising a
//! resident mapping for the faulting address. Anonymous memory is
//! zero-fill: the first touch of a page allocates a zeroed anon.
//! Shared anons (reference count above one) are mapped read-only
//! everywhere; a write fault on one resolves by copying the page
//! into a fresh private anon, which is the copy-on-write break.

use crate::object::{
    anon_copy, anon_new, anon_page, anon_refcnt, anon_release, with_object_mut, ObjectKind,
};
use crate::{Map, KERNEL_MAP};
use bitflags::bitflags;
use memory::constants::KERNEL_BASE;
use memory::{Prot, VirtAddr, PAGE_SIZE};
use spin::lock;

bitflags! {
    /// Why a fault was taken, matching the hardware error
    /// code.
    ///
    pub struct FaultFlags: u32 {
        /// The mapping was present; the fault is a
        /// protection violation.
        const PRESENT = 1 << 0;

        /// The access was a write.
        const WRITE = 1 << 1;

        /// The access came from user mode.
        const USER = 1 << 2;

        /// The access was an instruction fetch.
        const EXECUTE = 1 << 4;
    }
}

/// A fault the resolver cannot satisfy.
///
/// Every variant is fatal for a kernel-mode fault; for a
/// user-mode fault the caller terminates the process instead.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultError {
    /// No map entry covers the faulting address.
    NoMapping,

    /// The entry's object cannot materialise pages
    /// (direct-physical objects are mapped up front).
    NotFaultable,

    /// The anon is swapped out and there is no pager to
    /// bring it back.
    NotResident,

    /// The page would have to come from a parent object,
    /// which is not supported: objects materialise their own
    /// pages.
    ParentFetch,
}

/// Resolves a page fault at `vaddr` in `map`.
///
/// Kernel-space addresses always resolve against the kernel
/// map, whichever map the faulting thread was running with.
///
pub fn fault(map: &Map, vaddr: VirtAddr, flags: FaultFlags) -> Result<(), FaultError> {
    let map = if vaddr >= KERNEL_BASE { &*KERNEL_MAP } else { map };
    let vaddr = vaddr.page_base();

    // Find the covering entry and its object.
    let (object, entry_start, entry_offset) = {
        let inner = lock!(map.inner);
        let entry = inner
            .entries
            .iter()
            .find(|entry| entry.start <= vaddr && vaddr < entry.end)
            .ok_or(FaultError::NoMapping)?;
        (entry.object, entry.start, entry.offset)
    };

    let offset = (vaddr - entry_start) + entry_offset;
    let page_index = offset / PAGE_SIZE;
    let space = map.space;

    with_object_mut(object, |object| {
        let (amap, parent) = match &mut object.kind {
            ObjectKind::Anon { amap, parent } => (amap, *parent),
            _ => return Err(FaultError::NotFaultable),
        };

        match amap.get(page_index) {
            Some(anon) => {
                let page = anon_page(anon).ok_or(FaultError::NotResident)?;

                if anon_refcnt(anon) > 1 {
                    if flags.contains(FaultFlags::WRITE) {
                        // Copy-on-write break: drop this
                        // amap's share of the anon (never the
                        // last reference here) and replace it
                        // with a private copy of the page.
                        anon_release(anon);
                        let private = anon_copy(anon);
                        amap.set(page_index, Some(private));

                        if flags.contains(FaultFlags::PRESENT) {
                            pmap::unenter(space, Some(page), vaddr);
                        }

                        let new_page = anon_page(private).expect("fresh anon is resident");
                        pmap::enter(space, new_page, vaddr, Prot::ALL);
                    } else {
                        // A shared anon may only ever be
                        // mapped read-only.
                        pmap::enter(space, page, vaddr, Prot::READ | Prot::EXECUTE);
                    }
                } else if flags.contains(FaultFlags::PRESENT) {
                    // Sole owner, mapping present: a simple
                    // protection upgrade.
                    pmap::reenter(space, page, vaddr, Prot::ALL);
                } else {
                    pmap::enter(space, page, vaddr, Prot::ALL);
                }

                Ok(())
            }
            None => {
                if parent.is_some() {
                    return Err(FaultError::ParentFetch);
                }

                // First touch: a zeroed page, mapped
                // writable since nobody shares it.
                let anon = anon_new(page_index);
                let page = anon_page(anon).expect("fresh anon is resident");
                pmap::enter(space, page, vaddr, Prot::ALL);
                amap.set(page_index, Some(anon));
                Ok(())
            }
        }
    })
}
