// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Virtual memory management: address-space maps, VM objects,
//! and the page fault resolver.
//!
//! A [`Map`] describes one address space: an ordered list of
//! non-overlapping entries, each mapping a VM object at an
//! offset, plus an arena that places new mappings in the user
//! range and the physical map identified by the map's address
//! space id. The distinguished [`KERNEL_MAP`] covers the higher
//! half; its placement is fixed at boot (the kernel heap arena
//! lives with the wired allocator), so it carries entries only.
//!
//! [`allocate`] creates zero-fill anonymous memory;
//! [`map_object`] maps an existing object, optionally as a copy
//! (which shares anonymous pages copy-on-write);
//! [`deallocate`] removes mappings, splitting entries when a
//! release covers only part of one. [`map_fork`] duplicates an
//! address space for process creation, copying or sharing each
//! entry according to its inheritance. Faults resolve through
//! [`fault`].
//!
//! Nothing here persists: anonymous memory lives exactly as long
//! as a map references it.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

mod fault;
mod mdl;
mod object;

pub use fault::{fault, FaultError, FaultFlags};
pub use mdl::Mdl;
pub use object::{
    aobj_new, dobj_new, object_copy, object_refcnt, object_release, object_retain, AnonId,
    ObjectId, Residence, AMAP_CHUNK_SLOTS,
};

use alloc::sync::Arc;
use alloc::vec::Vec;
use arena::{AllocFlags, Arena};
use console::println;
use core::cmp::{max, min};
use lazy_static::lazy_static;
use memory::constants::{
    KERNEL_BINARY_BASE, KERNEL_BINARY_SIZE, PHYSICAL_MEMORY_OFFSET, PHYSICAL_MEMORY_SIZE,
    USER_BASE, USER_SIZE,
};
use memory::{AddrSpaceId, PhysAddr, VirtAddr, PAGE_SIZE};
use object::ObjectKind;
use spin::{lock, Mutex};

/// An address-space operation failure.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapError {
    /// No address range can satisfy the request.
    Exhausted,

    /// No mapping covers the given range.
    NoEntry,
}

/// How a mapping is treated when its map is forked.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Inheritance {
    /// Parent and child share the object.
    Shared,

    /// The child receives a copy-on-write copy.
    Copy,
}

/// One mapping within a map.
///
#[derive(Clone)]
pub(crate) struct MapEntry {
    pub(crate) start: VirtAddr,
    pub(crate) end: VirtAddr,

    /// Byte offset into the object at which this mapping
    /// begins.
    pub(crate) offset: usize,

    pub(crate) object: ObjectId,
    pub(crate) inheritance: Inheritance,
}

pub(crate) struct MapInner {
    pub(crate) entries: Vec<MapEntry>,

    /// Placement arena over the user range; `None` for the
    /// kernel map, whose placement is fixed at boot.
    pub(crate) arena: Option<Arena>,
}

/// A virtual address space.
///
pub struct Map {
    space: AddrSpaceId,
    pub(crate) inner: Mutex<MapInner>,
}

lazy_static! {
    /// The kernel's address space map, covering the higher
    /// half of every address space.
    ///
    pub static ref KERNEL_MAP: Map = Map {
        space: AddrSpaceId::KERNEL,
        inner: Mutex::new(MapInner {
            entries: Vec::new(),
            arena: None,
        }),
    };
}

impl Map {
    /// The address space this map drives.
    ///
    pub fn space(&self) -> AddrSpaceId {
        self.space
    }
}

/// Records the kernel map's fixed mappings: the physical
/// memory window and the kernel binary, both direct-physical.
///
/// `kernel_phys` is the physical load address of the kernel
/// binary, from the boot protocol.
///
pub fn init(kernel_phys: PhysAddr) {
    let window = dobj_new(PhysAddr::zero(), PHYSICAL_MEMORY_SIZE);
    let binary = dobj_new(kernel_phys, KERNEL_BINARY_SIZE);

    let mut inner = lock!(KERNEL_MAP.inner);
    inner.entries.push(MapEntry {
        start: VirtAddr::new(PHYSICAL_MEMORY_OFFSET),
        end: VirtAddr::new(PHYSICAL_MEMORY_OFFSET + PHYSICAL_MEMORY_SIZE),
        offset: 0,
        object: window,
        inheritance: Inheritance::Shared,
    });
    inner.entries.push(MapEntry {
        start: KERNEL_BINARY_BASE,
        end: KERNEL_BINARY_BASE + KERNEL_BINARY_SIZE,
        offset: 0,
        object: binary,
        inheritance: Inheritance::Shared,
    });
}

/// Creates a fresh, empty user address space.
///
pub fn map_new() -> Arc<Map> {
    let space = pmap::create();
    let mut arena = Arena::new("task-map", PAGE_SIZE);
    arena.add_span(USER_BASE.as_usize(), USER_SIZE, AllocFlags::NOSLEEP);

    Arc::new(Map {
        space,
        inner: Mutex::new(MapInner {
            entries: Vec::new(),
            arena: Some(arena),
        }),
    })
}

/// Duplicates an address space.
///
/// Each entry is recreated at the same address in the child;
/// its object is shared or copied according to the entry's
/// inheritance. Copied anonymous memory is shared
/// copy-on-write, so the fork itself moves no page contents.
///
pub fn map_fork(parent: &Map) -> Arc<Map> {
    let child = map_new();
    let entries: Vec<MapEntry> = lock!(parent.inner).entries.clone();

    for entry in entries {
        let object = match entry.inheritance {
            Inheritance::Shared => {
                object_retain(entry.object);
                entry.object
            }
            Inheritance::Copy => object_copy(entry.object),
        };

        let mut inner = lock!(child.inner);
        let MapInner { entries, arena } = &mut *inner;
        arena
            .as_mut()
            .expect("user maps always carry an arena")
            .xalloc(
                entry.end - entry.start,
                0,
                0,
                0,
                entry.start.as_usize(),
                0,
                AllocFlags::EXACT | AllocFlags::NOSLEEP,
            )
            .expect("placement in a fresh map cannot collide");

        entries.push(MapEntry {
            start: entry.start,
            end: entry.end,
            offset: entry.offset,
            object,
            inheritance: entry.inheritance,
        });
    }

    child
}

/// Allocates zero-fill anonymous memory in a map.
///
/// Returns the chosen address and the backing object. The
/// object is owned by the map entry; the returned id is a
/// borrowed reference for callers that want to map the same
/// memory elsewhere.
///
/// # Panics
///
/// `allocate` panics if `size` is not page-aligned.
///
pub fn allocate(map: &Map, size: usize) -> Result<(VirtAddr, ObjectId), MapError> {
    assert!(size > 0 && size % PAGE_SIZE == 0);

    let object = aobj_new(size);
    match map_object(map, object, None, size, 0, false) {
        Ok(addr) => {
            // The entry holds its own reference now.
            object_release(object);
            Ok((addr, object))
        }
        Err(error) => {
            object_release(object);
            Err(error)
        }
    }
}

/// Maps `size` bytes of `object`, starting `offset` bytes in,
/// into a map.
///
/// With no `hint` the map's arena chooses a place; with one,
/// the mapping goes exactly there or fails. With `copy` set
/// the entry maps a copy of the object instead
/// ([`object_copy`] semantics).
///
/// # Panics
///
/// `map_object` panics if `size` or `offset` is not
/// page-aligned, or if the map has no placement arena (the
/// kernel map's layout is fixed).
///
pub fn map_object(
    map: &Map,
    object: ObjectId,
    hint: Option<VirtAddr>,
    size: usize,
    offset: usize,
    copy: bool,
) -> Result<VirtAddr, MapError> {
    assert!(size > 0 && size % PAGE_SIZE == 0);
    assert!(offset % PAGE_SIZE == 0);

    let object = if copy {
        object_copy(object)
    } else {
        object_retain(object);
        object
    };

    let inheritance = object::with_object(object, |object| match object.kind {
        ObjectKind::Anon { .. } => Inheritance::Copy,
        ObjectKind::DirectPhys { .. } | ObjectKind::KernelHeap => Inheritance::Shared,
    });

    let mut inner = lock!(map.inner);
    let MapInner { entries, arena } = &mut *inner;
    let arena = arena.as_mut().expect("kernel map placement is fixed at boot");

    let placed = match hint {
        Some(addr) => arena.xalloc(
            size,
            0,
            0,
            0,
            addr.as_usize(),
            0,
            AllocFlags::EXACT | AllocFlags::NOSLEEP,
        ),
        None => arena.alloc(size, AllocFlags::NOSLEEP),
    };

    let start = match placed {
        Ok(addr) => VirtAddr::new(addr),
        Err(_) => {
            drop(inner);
            object_release(object);
            return Err(MapError::Exhausted);
        }
    };

    // Insert in address order; entries never overlap because
    // the arena owns placement.
    let position = entries
        .iter()
        .position(|entry| entry.start > start)
        .unwrap_or(entries.len());
    entries.insert(
        position,
        MapEntry {
            start,
            end: start + size,
            offset,
            object,
            inheritance,
        },
    );

    Ok(start)
}

/// Removes all mappings overlapping `[start, start + size)`.
///
/// Fully-covered entries are unmapped and their objects
/// released; partially-covered entries are split, with the
/// remainders keeping their object and offsets.
///
/// # Panics
///
/// `deallocate` panics if `start` or `size` is not
/// page-aligned.
///
pub fn deallocate(map: &Map, start: VirtAddr, size: usize) -> Result<(), MapError> {
    assert!(start.is_page_aligned());
    assert!(size > 0 && size % PAGE_SIZE == 0);
    let end = start + size;

    let mut inner = lock!(map.inner);
    let MapInner { entries, arena } = &mut *inner;
    let arena = arena.as_mut().expect("kernel map mappings are permanent");

    let mut any = false;
    let mut index = 0;
    while index < entries.len() {
        let (entry_start, entry_end) = (entries[index].start, entries[index].end);
        if entry_end <= start || entry_start >= end {
            index += 1;
            continue;
        }

        any = true;
        let overlap_start = max(entry_start, start);
        let overlap_end = min(entry_end, end);

        // Tear down the overlapped pages' mappings.
        let mut vaddr = overlap_start;
        while vaddr < overlap_end {
            pmap::unenter(map.space, None, vaddr);
            vaddr += PAGE_SIZE;
        }

        // The arena holds the entry as one interval: release
        // it whole, then re-reserve whatever survives.
        let entry = entries.remove(index);
        arena.xfree(entry_start.as_usize(), entry_end - entry_start);

        let mut remainders = 0;
        if entry_start < overlap_start {
            arena
                .xalloc(
                    overlap_start - entry_start,
                    0,
                    0,
                    0,
                    entry_start.as_usize(),
                    0,
                    AllocFlags::EXACT | AllocFlags::NOSLEEP,
                )
                .expect("remainder re-reservation cannot fail");
            entries.insert(
                index,
                MapEntry {
                    start: entry_start,
                    end: overlap_start,
                    offset: entry.offset,
                    object: entry.object,
                    inheritance: entry.inheritance,
                },
            );
            index += 1;
            remainders += 1;
        }

        if overlap_end < entry_end {
            arena
                .xalloc(
                    entry_end - overlap_end,
                    0,
                    0,
                    0,
                    overlap_end.as_usize(),
                    0,
                    AllocFlags::EXACT | AllocFlags::NOSLEEP,
                )
                .expect("remainder re-reservation cannot fail");
            entries.insert(
                index,
                MapEntry {
                    start: overlap_end,
                    end: entry_end,
                    offset: entry.offset + (overlap_end - entry_start),
                    object: entry.object,
                    inheritance: entry.inheritance,
                },
            );
            index += 1;
            remainders += 1;
        }

        // The object had one reference for the original
        // entry; true it up against the surviving entries.
        match remainders {
            0 => object_release(entry.object),
            1 => {}
            _ => object_retain(entry.object),
        }
    }

    if any {
        Ok(())
    } else {
        Err(MapError::NoEntry)
    }
}

/// Drops a reference to a map.
///
/// The last reference tears the address space down: every
/// entry is unmapped and released, the placement arena
/// returns its descriptors, and the page tables are freed.
///
pub fn map_release(map: Arc<Map>) {
    drop(map);
}

/// Loads a map's address space into the MMU.
///
pub fn activate(map: &Map) {
    pmap::activate(map.space);
}

/// Prints a map's entries.
///
pub fn debug(map: &Map) {
    let inner = lock!(map.inner);
    println!("map (space {}):", map.space.as_u32());
    for entry in inner.entries.iter() {
        println!(
            "  {:#x}-{:#x} object {:?} offset {:#x} {:?}",
            entry.start.as_usize(),
            entry.end.as_usize(),
            entry.object,
            entry.offset,
            entry.inheritance
        );
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        // Unmap and release everything, then drop the page
        // tables and the placement arena.
        let mut inner = lock!(self.inner);
        while let Some(entry) = inner.entries.pop() {
            let mut vaddr = entry.start;
            while vaddr < entry.end {
                pmap::unenter(self.space, None, vaddr);
                vaddr += PAGE_SIZE;
            }

            let MapInner { arena, .. } = &mut *inner;
            if let Some(arena) = arena {
                arena.xfree(entry.start.as_usize(), entry.end - entry.start);
            }

            object_release(entry.object);
        }

        if let Some(arena) = inner.arena.as_mut() {
            arena.destroy();
        }
        drop(inner);

        pmap::destroy(self.space);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use bootloader::bootinfo::{FrameRange, MemoryRegion, MemoryRegionType};
    use interrupts::{Ipl, SoftPlatform};
    use memory::{phys_to_virt, PageTableFlags};
    use physmem::PageQueueKind;
    use std::boxed::Box;
    use std::vec;
    use std::vec::Vec as StdVec;

    static MACHINE: std::sync::Mutex<()> = std::sync::Mutex::new(());
    static BOOTED: std::sync::Once = std::sync::Once::new();

    fn boot() {
        BOOTED.call_once(|| {
            let buffer: &'static mut [u8] = StdVec::leak(vec![0_u8; 4097 * PAGE_SIZE]);
            let base = (buffer.as_ptr() as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            let region = MemoryRegion {
                range: FrameRange::new(base as u64, (base + 4096 * PAGE_SIZE) as u64),
                region_type: MemoryRegionType::Usable,
            };
            unsafe { physmem::init([region].iter()) };

            let platform: &'static SoftPlatform = Box::leak(Box::new(SoftPlatform::new(2)));
            interrupts::set_platform(platform);
            interrupts::register_vector(
                interrupts::VECTOR_SHOOTDOWN,
                Ipl::High,
                pmap::shootdown_interrupt,
                0,
            );

            arena::bootstrap();
            let root = physmem::page_alloc(true, PageQueueKind::Pmap).unwrap();
            pmap::init(physmem::page_addr(root));
        });
    }

    /// Writes a marker byte through the physical window at
    /// the frame backing `vaddr` in `map`.
    ///
    fn write_marker(map: &Map, vaddr: VirtAddr, marker: u8) {
        let phys = pmap::translate(map.space(), vaddr).unwrap();
        unsafe { *(phys_to_virt(phys).as_usize() as *mut u8) = marker };
    }

    fn read_marker(map: &Map, vaddr: VirtAddr) -> u8 {
        let phys = pmap::translate(map.space(), vaddr).unwrap();
        unsafe { *(phys_to_virt(phys).as_usize() as *const u8) }
    }

    fn writable(map: &Map, vaddr: VirtAddr) -> bool {
        let (_, flags) = pmap::lookup(map.space(), vaddr).unwrap();
        flags.contains(PageTableFlags::WRITABLE)
    }

    #[test]
    fn test_copy_on_write() {
        let _machine = MACHINE.lock().unwrap();
        boot();
        let free_before = physmem::queue_len(PageQueueKind::Free);

        {
            let m1 = map_new();
            let m2 = map_new();

            // One page of anonymous memory, faulted in with a
            // write: private, mapped read-write.
            let (addr1, object) = allocate(&m1, PAGE_SIZE).unwrap();
            fault(&m1, addr1, FaultFlags::WRITE).unwrap();
            assert!(writable(&m1, addr1));
            write_marker(&m1, addr1, 0xab);

            // Copy the object into the second map. The copy
            // shares the anon, so the first map's mapping is
            // downgraded to read-only.
            let addr2 = map_object(&m2, object, None, PAGE_SIZE, 0, true).unwrap();
            assert!(!writable(&m1, addr1));

            // Reading through the copy maps the same frame,
            // read-only.
            fault(&m2, addr2, FaultFlags::empty()).unwrap();
            assert!(!writable(&m2, addr2));
            assert_eq!(
                pmap::translate(m1.space(), addr1),
                pmap::translate(m2.space(), addr2)
            );
            assert_eq!(read_marker(&m2, addr2), 0xab);

            // Writing through the first map breaks the
            // share: a fresh frame for m1, the original frame
            // (and contents) left with m2.
            let shared_phys = pmap::translate(m2.space(), addr2).unwrap();
            fault(&m1, addr1, FaultFlags::WRITE | FaultFlags::PRESENT).unwrap();
            assert!(writable(&m1, addr1));
            assert!(!writable(&m2, addr2));
            assert_ne!(pmap::translate(m1.space(), addr1).unwrap(), shared_phys);
            assert_eq!(pmap::translate(m2.space(), addr2).unwrap(), shared_phys);

            // The copy preserved the contents on both sides.
            assert_eq!(read_marker(&m1, addr1), 0xab);
            assert_eq!(read_marker(&m2, addr2), 0xab);

            // A second write through m2 now upgrades in place
            // (sole owner again after m1 took its copy).
            fault(&m2, addr2, FaultFlags::WRITE | FaultFlags::PRESENT).unwrap();
            assert!(writable(&m2, addr2));
            assert_eq!(pmap::translate(m2.space(), addr2).unwrap(), shared_phys);

            deallocate(&m1, addr1, PAGE_SIZE).unwrap();
            deallocate(&m2, addr2, PAGE_SIZE).unwrap();
        }

        // Both maps dropped: anons, page tables, and roots
        // all returned.
        assert_eq!(physmem::queue_len(PageQueueKind::Free), free_before);
        physmem::verify_queues();
    }

    #[test]
    fn test_allocate_deallocate_round_trip() {
        let _machine = MACHINE.lock().unwrap();
        boot();

        let map = map_new();
        let free_before = physmem::queue_len(PageQueueKind::Free);
        let entries_before = lock!(map.inner).entries.len();

        let (addr, object) = allocate(&map, 3 * PAGE_SIZE).unwrap();
        assert_eq!(object_refcnt(object), 1);

        // Touch every page.
        for page in 0..3 {
            fault(&map, addr + page * PAGE_SIZE, FaultFlags::WRITE).unwrap();
        }
        assert!(physmem::queue_len(PageQueueKind::Active) >= 3);

        deallocate(&map, addr, 3 * PAGE_SIZE).unwrap();
        assert_eq!(lock!(map.inner).entries.len(), entries_before);

        // The anons went with the object. The three page
        // table nodes the faults grew stay allocated until
        // the map itself is torn down.
        let free_after = physmem::queue_len(PageQueueKind::Free);
        assert_eq!(free_before - free_after, 3);

        // A repeated deallocate finds nothing.
        assert_eq!(
            deallocate(&map, addr, 3 * PAGE_SIZE),
            Err(MapError::NoEntry)
        );
    }

    #[test]
    fn test_partial_deallocate_splits() {
        let _machine = MACHINE.lock().unwrap();
        boot();

        let map = map_new();
        let (addr, object) = allocate(&map, 4 * PAGE_SIZE).unwrap();
        for page in 0..4 {
            fault(&map, addr + page * PAGE_SIZE, FaultFlags::WRITE).unwrap();
        }

        // Punch out the second page: the entry splits into
        // two, both referencing the object.
        deallocate(&map, addr + PAGE_SIZE, PAGE_SIZE).unwrap();
        {
            let inner = lock!(map.inner);
            assert_eq!(inner.entries.len(), 2);
            assert_eq!(inner.entries[0].start, addr);
            assert_eq!(inner.entries[0].end, addr + PAGE_SIZE);
            assert_eq!(inner.entries[1].start, addr + 2 * PAGE_SIZE);
            assert_eq!(inner.entries[1].end, addr + 4 * PAGE_SIZE);
            assert_eq!(inner.entries[1].offset, 2 * PAGE_SIZE);
        }
        assert_eq!(object_refcnt(object), 2);

        // The punched page no longer resolves; its
        // neighbours still do.
        assert_eq!(
            fault(&map, addr + PAGE_SIZE, FaultFlags::WRITE),
            Err(FaultError::NoMapping)
        );
        fault(&map, addr, FaultFlags::WRITE | FaultFlags::PRESENT).unwrap();
        fault(
            &map,
            addr + 3 * PAGE_SIZE,
            FaultFlags::WRITE | FaultFlags::PRESENT,
        )
        .unwrap();

        // Releasing the whole range removes both remainders
        // and the object with them.
        deallocate(&map, addr, 4 * PAGE_SIZE).unwrap();
        assert_eq!(lock!(map.inner).entries.len(), 0);
    }

    #[test]
    fn test_fork_shares_copy_on_write() {
        let _machine = MACHINE.lock().unwrap();
        boot();

        let parent = map_new();
        let (addr, _object) = allocate(&parent, PAGE_SIZE).unwrap();
        fault(&parent, addr, FaultFlags::WRITE).unwrap();
        write_marker(&parent, addr, 0x42);

        let child = map_fork(&parent);

        // The child sees the same layout, and its first read
        // lands on the shared frame.
        fault(&child, addr, FaultFlags::empty()).unwrap();
        assert_eq!(
            pmap::translate(parent.space(), addr),
            pmap::translate(child.space(), addr)
        );
        assert_eq!(read_marker(&child, addr), 0x42);

        // Writes diverge.
        fault(&parent, addr, FaultFlags::WRITE | FaultFlags::PRESENT).unwrap();
        write_marker(&parent, addr, 0x43);
        assert_ne!(
            pmap::translate(parent.space(), addr),
            pmap::translate(child.space(), addr)
        );
        assert_eq!(read_marker(&child, addr), 0x42);
        assert_eq!(read_marker(&parent, addr), 0x43);
    }

    #[test]
    fn test_object_copy_release_restores_share() {
        let _machine = MACHINE.lock().unwrap();
        boot();

        let m1 = map_new();
        let m2 = map_new();
        let (addr1, object) = allocate(&m1, 2 * PAGE_SIZE).unwrap();
        fault(&m1, addr1, FaultFlags::WRITE).unwrap();
        fault(&m1, addr1 + PAGE_SIZE, FaultFlags::WRITE).unwrap();
        let phys = pmap::translate(m1.space(), addr1).unwrap();

        // Copy into m2 (anons shared, m1 downgraded), then
        // release the copy again.
        let addr2 = map_object(&m2, object, None, 2 * PAGE_SIZE, 0, true).unwrap();
        assert!(!writable(&m1, addr1));
        deallocate(&m2, addr2, 2 * PAGE_SIZE).unwrap();

        // With the share gone, a write fault upgrades the
        // original mapping in place: no copy, same frame.
        fault(&m1, addr1, FaultFlags::WRITE | FaultFlags::PRESENT).unwrap();
        assert!(writable(&m1, addr1));
        assert_eq!(pmap::translate(m1.space(), addr1).unwrap(), phys);
    }

    #[test]
    fn test_fault_errors() {
        let _machine = MACHINE.lock().unwrap();
        boot();

        let map = map_new();

        // Nothing mapped here.
        assert_eq!(
            fault(&map, VirtAddr::new(0x7000_0000), FaultFlags::WRITE),
            Err(FaultError::NoMapping)
        );

        // Direct-physical objects are mapped up front, never
        // faulted.
        let window = dobj_new(PhysAddr::new(0), 4 * PAGE_SIZE);
        let addr = map_object(&map, window, None, 4 * PAGE_SIZE, 0, false).unwrap();
        assert_eq!(
            fault(&map, addr, FaultFlags::empty()),
            Err(FaultError::NotFaultable)
        );
        object_release(window);

        // Copying a direct-physical object yields an empty
        // anonymous child; faulting it would need a fetch
        // from the parent, which is unsupported.
        let copied = object_copy(window);
        let caddr = map_object(&map, copied, None, PAGE_SIZE, 0, false).unwrap();
        assert_eq!(
            fault(&map, caddr, FaultFlags::empty()),
            Err(FaultError::ParentFetch)
        );
        object_release(copied);
    }

    #[test]
    fn test_mapping_enters_user_flags() {
        let _machine = MACHINE.lock().unwrap();
        boot();

        let map = map_new();
        let (addr, _object) = allocate(&map, PAGE_SIZE).unwrap();
        fault(&map, addr, FaultFlags::WRITE | FaultFlags::USER).unwrap();

        let (_, flags) = pmap::lookup(map.space(), addr).unwrap();
        assert!(flags.contains(PageTableFlags::USER_ACCESSIBLE));
        assert!(flags.contains(PageTableFlags::PRESENT));

        // The backing page is pageable: it sits on the
        // active queue and carries its pv record.
        let phys = pmap::translate(map.space(), addr).unwrap();
        let page = physmem::page_for_addr(phys).unwrap();
        assert_eq!(physmem::page_queue(page), PageQueueKind::Active);
        assert_eq!(physmem::pv_entries(page).len(), 1);
    }

    #[test]
    fn test_mdl() {
        let _machine = MACHINE.lock().unwrap();
        boot();

        let wired_before = physmem::queue_len(PageQueueKind::Wired);
        {
            let mut mdl = Mdl::with_capacity(2 * PAGE_SIZE + 16);
            assert_eq!(mdl.capacity(), 3 * PAGE_SIZE);
            assert_eq!(
                physmem::queue_len(PageQueueKind::Wired),
                wired_before + 3
            );

            // A write/read round trip across a page boundary.
            let message = [0x11_u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
            mdl.copy_in(&message, PAGE_SIZE - 4);
            let mut out = [0_u8; 8];
            mdl.copy_out(&mut out, PAGE_SIZE - 4);
            assert_eq!(out, message);

            mdl.zero();
            mdl.copy_out(&mut out, PAGE_SIZE - 4);
            assert_eq!(out, [0_u8; 8]);

            mdl.expand(4 * PAGE_SIZE);
            assert_eq!(mdl.capacity(), 4 * PAGE_SIZE);
        }

        // Dropping the MDL unpins its pages.
        assert_eq!(physmem::queue_len(PageQueueKind::Wired), wired_before);
    }
}
