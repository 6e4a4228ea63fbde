// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Physical memory management: the resident page table.
//!
//! Every page of usable physical memory is described by exactly one
//! [`PageId`], which indexes into a per-region array of page records.
//! The arrays themselves are carved out of the head of each usable
//! region described by the boot memory map, so the cost of the
//! database scales with the memory it describes and the pages that
//! hold it are pinned for the life of the system (they sit on the
//! [page-table queue](PageQueueKind::Pmap)).
//!
//! Each page is always on exactly one queue:
//!
//! - [`Free`](PageQueueKind::Free): available for allocation;
//! - [`KMem`](PageQueueKind::KMem): wired into the kernel heap;
//! - [`Wired`](PageQueueKind::Wired): pinned, exempt from paging;
//! - [`Active`](PageQueueKind::Active): pageable and recently used;
//! - [`Inactive`](PageQueueKind::Inactive): pageable, candidate for
//!   eviction once a pager exists;
//! - [`Pmap`](PageQueueKind::Pmap): page tables and page metadata.
//!
//! [`page_alloc`] takes the head of the free queue, zeroes it, and
//! places it on the destination queue; [`page_free`] is the inverse
//! from any queue. The queue discriminator stored in the page record
//! never disagrees with the list the page is linked into, and the sum
//! of the queue populations is constant from boot; [`verify_queues`]
//! checks both properties and is used by the test suite.
//!
//! A page record also carries the identity of its owner (an anon or
//! a VM object) and the `pv` list of `(address space, virtual
//! address)` pairs at which the page is currently mapped. The `pv`
//! list is maintained by the physical map and walked during
//! copy-on-write downgrades and TLB shootdown.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

use alloc::vec::Vec;
use bootloader::bootinfo::{MemoryRegion, MemoryRegionType};
use console::println;
use core::mem;
use core::ptr;
use memory::{phys_to_virt, AddrSpaceId, PhysAddr, VirtAddr, PAGE_SIZE};
use pretty::Pages;
use spin::{lock, Mutex};

/// The maximum number of usable physical memory regions.
///
const MAX_REGIONS: usize = 32;

/// The lowest physical address the database will manage.
///
/// Usable regions below 1 MiB are left untouched; legacy
/// firmware structures live there.
///
const LOW_MEMORY_LIMIT: usize = 0x10_0000;

/// The queues a physical page can be a member of.
///
/// A page is on exactly one queue at any time.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PageQueueKind {
    /// Available for allocation.
    Free = 0,

    /// Wired into the kernel heap.
    KMem = 1,

    /// Pinned; exempt from paging.
    Wired = 2,

    /// Pageable and recently used.
    Active = 3,

    /// Pageable; eviction candidate.
    Inactive = 4,

    /// Page tables and page metadata; never released.
    Pmap = 5,
}

/// The number of page queues.
///
pub const NUM_QUEUES: usize = 6;

impl PageQueueKind {
    /// All queue kinds, in discriminator order.
    ///
    pub const ALL: [PageQueueKind; NUM_QUEUES] = [
        PageQueueKind::Free,
        PageQueueKind::KMem,
        PageQueueKind::Wired,
        PageQueueKind::Active,
        PageQueueKind::Inactive,
        PageQueueKind::Pmap,
    ];
}

/// Identifies a physical page: a region number and the
/// page's index within that region.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PageId {
    region: u32,
    index: u32,
}

/// The owner of a pageable page, recorded so that paging
/// and copy-on-write can find the page's logical identity.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageOwner {
    /// No owner; the page is free or internally managed.
    None,

    /// Owned by the anon with this number.
    Anon(u32),

    /// Owned by the VM object with this number.
    Object(u32),
}

/// One virtual mapping of a physical page.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PvEntry {
    /// The address space holding the mapping.
    pub space: AddrSpaceId,

    /// The virtual address mapped to the page.
    pub vaddr: VirtAddr,
}

/// The record kept for each page of usable physical memory.
///
struct PageInfo {
    paddr: PhysAddr,
    queue: PageQueueKind,
    owner: PageOwner,
    pv: Vec<PvEntry>,
    next: Option<PageId>,
    prev: Option<PageId>,
}

/// A contiguous run of usable physical memory and its
/// page records.
///
struct Region {
    base: PhysAddr,
    npages: usize,
    pages: *mut PageInfo,
}

// The page records are only reached through the database
// lock.
unsafe impl Send for Region {}

/// One page queue: an intrusive doubly-linked list threaded
/// through the page records, plus its population.
///
struct Queue {
    head: Option<PageId>,
    tail: Option<PageId>,
    npages: usize,
}

impl Queue {
    const EMPTY: Queue = Queue {
        head: None,
        tail: None,
        npages: 0,
    };
}

/// The page frame database.
///
struct PfnDatabase {
    regions: [Option<Region>; MAX_REGIONS],
    nregions: usize,
    queues: [Queue; NUM_QUEUES],
}

const NO_REGION: Option<Region> = None;

static DATABASE: Mutex<PfnDatabase> = Mutex::new(PfnDatabase {
    regions: [NO_REGION; MAX_REGIONS],
    nregions: 0,
    queues: [Queue::EMPTY; NUM_QUEUES],
});

impl PfnDatabase {
    fn page(&self, id: PageId) -> &PageInfo {
        let region = self.regions[id.region as usize]
            .as_ref()
            .expect("page id names a missing region");
        assert!((id.index as usize) < region.npages);
        unsafe { &*region.pages.add(id.index as usize) }
    }

    fn page_mut(&mut self, id: PageId) -> &mut PageInfo {
        let region = self.regions[id.region as usize]
            .as_ref()
            .expect("page id names a missing region");
        assert!((id.index as usize) < region.npages);
        unsafe { &mut *region.pages.add(id.index as usize) }
    }

    /// Links a page at the head of the given queue and
    /// stamps its discriminator.
    ///
    fn push_head(&mut self, kind: PageQueueKind, id: PageId) {
        let old_head = self.queues[kind as usize].head;
        {
            let page = self.page_mut(id);
            page.queue = kind;
            page.prev = None;
            page.next = old_head;
        }

        if let Some(old_head) = old_head {
            self.page_mut(old_head).prev = Some(id);
        }

        let queue = &mut self.queues[kind as usize];
        queue.head = Some(id);
        if queue.tail.is_none() {
            queue.tail = Some(id);
        }

        queue.npages += 1;
    }

    /// Unlinks a page from the queue its discriminator
    /// names.
    ///
    fn unlink(&mut self, id: PageId) -> PageQueueKind {
        let (kind, prev, next) = {
            let page = self.page(id);
            (page.queue, page.prev, page.next)
        };

        match prev {
            Some(prev_id) => self.page_mut(prev_id).next = next,
            None => self.queues[kind as usize].head = next,
        }

        match next {
            Some(next_id) => self.page_mut(next_id).prev = prev,
            None => self.queues[kind as usize].tail = prev,
        }

        let page = self.page_mut(id);
        page.next = None;
        page.prev = None;

        self.queues[kind as usize].npages -= 1;

        kind
    }
}

/// Initialises the page frame database from the boot memory
/// map.
///
/// Each usable region at or above 1 MiB contributes its pages
/// to the database. The page record array for a region is
/// written into the head of the region itself; the pages
/// holding it join the page-table queue and the remainder join
/// the free queue.
///
/// # Panics
///
/// `init` panics if called more than once, or if the memory
/// map describes more than [`MAX_REGIONS`] usable regions.
///
/// # Safety
///
/// The caller must guarantee that the regions described as
/// usable really are unused, and that the physical memory
/// window ([`memory::phys_to_virt`]) covers them.
///
pub unsafe fn init<'region, I>(regions: I)
where
    I: Iterator<Item = &'region MemoryRegion>,
{
    let mut db = lock!(DATABASE);
    assert!(db.nregions == 0, "physmem::init called twice");

    for region in regions {
        if region.region_type != MemoryRegionType::Usable {
            continue;
        }

        let base = region.range.start_frame_number as usize * PAGE_SIZE;
        let end = region.range.end_frame_number as usize * PAGE_SIZE;
        if base < LOW_MEMORY_LIMIT {
            continue;
        }

        let npages = (end - base) / PAGE_SIZE;
        let meta_bytes = npages * mem::size_of::<PageInfo>();
        let meta_pages = (meta_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        if npages == 0 || meta_pages >= npages {
            continue;
        }

        assert!(db.nregions < MAX_REGIONS, "too many usable memory regions");
        let region_id = db.nregions as u32;
        let base = PhysAddr::new(base);

        // Carve the page record array out of the head of
        // the region.
        let pages = phys_to_virt(base).as_usize() as *mut PageInfo;
        for index in 0..npages {
            let queue = if index < meta_pages {
                PageQueueKind::Pmap
            } else {
                PageQueueKind::Free
            };

            pages.add(index).write(PageInfo {
                paddr: base + index * PAGE_SIZE,
                queue,
                owner: PageOwner::None,
                pv: Vec::new(),
                next: None,
                prev: None,
            });
        }

        let nregions = db.nregions;
        db.regions[nregions] = Some(Region {
            base,
            npages,
            pages,
        });
        db.nregions += 1;

        // Thread the pages onto their queues.
        for index in 0..npages {
            let id = PageId {
                region: region_id,
                index: index as u32,
            };
            let kind = if index < meta_pages {
                PageQueueKind::Pmap
            } else {
                PageQueueKind::Free
            };
            db.push_head(kind, id);
        }
    }
}

/// Allocates a physical page, placing it on `destination`.
///
/// The returned page has been zeroed. If no pages are free and
/// `sleep` is clear, `None` is returned.
///
/// # Panics
///
/// With `sleep` set, exhaustion is fatal: there is no pager to
/// wait on yet.
///
pub fn page_alloc(sleep: bool, destination: PageQueueKind) -> Option<PageId> {
    let mut db = lock!(DATABASE);
    let id = match db.queues[PageQueueKind::Free as usize].head {
        Some(id) => id,
        None if sleep => {
            panic!("page_alloc: out of physical memory, and there is no pager to await")
        }
        None => return None,
    };

    db.unlink(id);
    db.push_head(destination, id);
    let page = db.page_mut(id);
    page.owner = PageOwner::None;
    let paddr = page.paddr;
    drop(db);

    // Zero the page outside the database lock; it is
    // already ours.
    unsafe {
        ptr::write_bytes(phys_to_virt(paddr).as_usize() as *mut u8, 0, PAGE_SIZE);
    }

    Some(id)
}

/// Returns a page to the free queue, regardless of which
/// queue it is currently on.
///
/// # Panics
///
/// `page_free` panics if the page still has virtual mappings
/// recorded in its `pv` list.
///
pub fn page_free(id: PageId) {
    let mut db = lock!(DATABASE);
    assert!(
        db.page(id).pv.is_empty(),
        "page_free: page still has virtual mappings"
    );
    db.unlink(id);
    db.push_head(PageQueueKind::Free, id);
    db.page_mut(id).owner = PageOwner::None;
}

/// Moves a page from its current queue to `to`.
///
/// The current queue is discovered from the page's queue
/// discriminator.
///
pub fn change_queue(id: PageId, to: PageQueueKind) {
    let mut db = lock!(DATABASE);
    db.unlink(id);
    db.push_head(to, id);
}

/// Returns the page record covering the given physical
/// address, if the database manages it.
///
pub fn page_for_addr(paddr: PhysAddr) -> Option<PageId> {
    let db = lock!(DATABASE);
    for (number, slot) in db.regions.iter().enumerate() {
        let region = match slot {
            Some(region) => region,
            None => continue,
        };

        if region.base <= paddr && paddr < region.base + region.npages * PAGE_SIZE {
            return Some(PageId {
                region: number as u32,
                index: ((paddr - region.base) / PAGE_SIZE) as u32,
            });
        }
    }

    None
}

/// Returns the physical address of a page.
///
pub fn page_addr(id: PageId) -> PhysAddr {
    lock!(DATABASE).page(id).paddr
}

/// Returns the queue a page is currently on.
///
pub fn page_queue(id: PageId) -> PageQueueKind {
    lock!(DATABASE).page(id).queue
}

/// Returns the owner recorded for a page.
///
pub fn page_owner(id: PageId) -> PageOwner {
    lock!(DATABASE).page(id).owner
}

/// Records the owner of a page.
///
pub fn set_page_owner(id: PageId, owner: PageOwner) {
    lock!(DATABASE).page_mut(id).owner = owner;
}

/// Records a virtual mapping of a page.
///
pub fn pv_insert(id: PageId, space: AddrSpaceId, vaddr: VirtAddr) {
    lock!(DATABASE).page_mut(id).pv.push(PvEntry { space, vaddr });
}

/// Removes a recorded virtual mapping of a page, returning
/// whether it was present.
///
pub fn pv_remove(id: PageId, space: AddrSpaceId, vaddr: VirtAddr) -> bool {
    let mut db = lock!(DATABASE);
    let pv = &mut db.page_mut(id).pv;
    match pv.iter().position(|entry| entry.space == space && entry.vaddr == vaddr) {
        Some(position) => {
            pv.remove(position);
            true
        }
        None => false,
    }
}

/// Returns a copy of a page's virtual mappings.
///
pub fn pv_entries(id: PageId) -> Vec<PvEntry> {
    lock!(DATABASE).page(id).pv.clone()
}

/// Returns the population of the given queue.
///
pub fn queue_len(kind: PageQueueKind) -> usize {
    lock!(DATABASE).queues[kind as usize].npages
}

/// Returns the total number of pages under management.
///
pub fn total_pages() -> usize {
    let db = lock!(DATABASE);
    db.queues.iter().map(|queue| queue.npages).sum()
}

/// Checks that every page is linked into exactly the queue
/// its discriminator names, and that the queue populations
/// match their lists.
///
/// # Panics
///
/// `verify_queues` panics if the database is inconsistent.
///
pub fn verify_queues() {
    let db = lock!(DATABASE);
    let mut seen = [0_usize; NUM_QUEUES];
    for kind in PageQueueKind::ALL.iter() {
        let mut walked = 0;
        let mut cursor = db.queues[*kind as usize].head;
        let mut prev = None;
        while let Some(id) = cursor {
            let page = db.page(id);
            assert!(
                page.queue == *kind,
                "page {:?} is linked on {:?} but stamped {:?}",
                id,
                kind,
                page.queue
            );
            assert!(page.prev == prev, "page {:?} has a broken back link", id);
            walked += 1;
            prev = Some(id);
            cursor = page.next;
        }

        assert!(
            walked == db.queues[*kind as usize].npages,
            "{:?} queue count {} does not match its list ({})",
            kind,
            db.queues[*kind as usize].npages,
            walked
        );
        seen[*kind as usize] = walked;
    }

    let total: usize = (0..db.nregions)
        .map(|number| db.regions[number].as_ref().unwrap().npages)
        .sum();
    let on_queues: usize = seen.iter().sum();
    assert!(
        total == on_queues,
        "{} pages exist but {} are on queues",
        total,
        on_queues
    );
}

/// Prints the population of each page queue.
///
pub fn debug() {
    let db = lock!(DATABASE);
    println!(
        "physmem: free {}, kmem {}, wired {}, active {}, inactive {}, pmap {}",
        Pages::from_usize(db.queues[0].npages),
        Pages::from_usize(db.queues[1].npages),
        Pages::from_usize(db.queues[2].npages),
        Pages::from_usize(db.queues[3].npages),
        Pages::from_usize(db.queues[4].npages),
        Pages::from_usize(db.queues[5].npages),
    );
}
