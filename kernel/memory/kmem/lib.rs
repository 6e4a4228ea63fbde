// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel's dynamic memory: wired pages and the slab
//! allocator.
//!
//! ## Wired pages
//!
//! Two arenas stack up to produce usable kernel memory. The
//! kernel virtual-address arena hands out ranges of the kernel
//! heap's address space; the wired arena imports spans from it,
//! backing every page of an imported span with a freshly
//! allocated physical page entered into the kernel's physical
//! map. [`kalloc`] and [`kfree`] allocate and release whole wired
//! pages from the wired arena.
//!
//! ## Slabs
//!
//! On top of the wired layer sits a slab allocator after Bonwick,
//! "The Slab Allocator: An Object-Caching Kernel Memory
//! Allocator" (1994). A [`Zone`] caches objects of one size.
//! Zones come in two shapes:
//!
//! - *Small* zones (objects up to 256 bytes) use one wired page
//!   per slab, with the slab header occupying the top of the page
//!   and the freelist threaded through the free slots themselves.
//! - *Large* zones keep the slab header and one bufctl per slot
//!   out of line (in two small meta-zones), so the data area is
//!   packed densely. Freeing by pointer finds the bufctl on the
//!   zone's allocated list.
//!
//! A slab whose freelist empties rotates to the tail of the
//! zone's slab list, so the head slab always has space or the
//! list is empty.
//!
//! ## The ladder
//!
//! [`kmem_alloc`] routes a byte size to a fixed ladder of zones:
//! 8-byte granularity up to 64 bytes, then doubling granularity
//! per half-power band up to 4096 bytes. Anything larger goes
//! straight to the wired allocator, rounded up to whole pages.
//! [`kmem_free`] must be given the same size and routes the same
//! way.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use align::align_up_usize;
use arena::{AllocFlags, Arena, ArenaError, Import};
use console::println;
use core::mem;
use core::ptr;
use memory::{AddrSpaceId, Prot, VirtAddr, PAGE_SIZE};
use physmem::{page_alloc, page_free, PageQueueKind};
use spin::{lock, Mutex};

/// The kernel virtual-address arena.
///
/// This arena carries the kernel heap's address range; the
/// address-space map for the kernel delegates placement here.
///
static KERNEL_VA: Mutex<Arena> = Mutex::new(Arena::new("kernel-va", PAGE_SIZE));

/// The wired-memory arena, importing backed spans from
/// [`KERNEL_VA`].
///
static WIRED: Mutex<Arena> = Mutex::new(Arena::with_source(
    "kernel-wired",
    PAGE_SIZE,
    Import {
        alloc: wired_import,
        free: wired_release,
    },
));

/// Imports a span for the wired arena: reserves kernel
/// address space and wires a physical page behind every page
/// of it.
///
fn wired_import(size: usize, flags: AllocFlags) -> Result<usize, ArenaError> {
    let base = lock!(KERNEL_VA).alloc(size, flags)?;
    let sleep = !flags.contains(AllocFlags::NOSLEEP);

    let mut offset = 0;
    while offset < size {
        let virt = VirtAddr::new(base + offset);
        match page_alloc(sleep, PageQueueKind::KMem) {
            Some(page) => {
                pmap::enter_kern(AddrSpaceId::KERNEL, physmem::page_addr(page), virt, Prot::ALL);
            }
            None => {
                // Unwind the partially-wired span.
                let mut undo = 0;
                while undo < offset {
                    let page = pmap::unenter_kern(AddrSpaceId::KERNEL, VirtAddr::new(base + undo));
                    page_free(page);
                    undo += PAGE_SIZE;
                }

                lock!(KERNEL_VA).xfree(base, size);
                return Err(ArenaError::Exhausted);
            }
        }

        offset += PAGE_SIZE;
    }

    Ok(base)
}

/// Returns a wired span: unmaps and frees its pages, then
/// releases the address range.
///
fn wired_release(base: usize, size: usize) {
    let mut offset = 0;
    while offset < size {
        let page = pmap::unenter_kern(AddrSpaceId::KERNEL, VirtAddr::new(base + offset));
        page_free(page);
        offset += PAGE_SIZE;
    }

    lock!(KERNEL_VA).xfree(base, size);
}

/// Sets up the kernel's dynamic memory over the given heap
/// address range.
///
/// The wired arena starts empty and imports as needed. The
/// slab ladder's zones are registered for [`debug`].
///
pub fn init(heap_base: VirtAddr, heap_size: usize) {
    arena::bootstrap();
    lock!(KERNEL_VA).add_span(heap_base.as_usize(), heap_size, AllocFlags::BOOTSTRAP);

    register_zone(&SLAB_META);
    register_zone(&BUFCTL_META);
    for zone in LADDER.iter() {
        register_zone(zone);
    }
}

/// Allocates `npages` pages of wired kernel memory.
///
/// With `sleep` clear the allocation fails with `None` when
/// memory is exhausted; with it set, physical exhaustion is
/// fatal until a pager exists.
///
pub fn kalloc(npages: usize, sleep: bool) -> Option<VirtAddr> {
    assert!(npages > 0);
    let flags = if sleep {
        AllocFlags::SLEEP
    } else {
        AllocFlags::NOSLEEP
    };

    match lock!(WIRED).alloc(npages * PAGE_SIZE, flags) {
        Ok(addr) => Some(VirtAddr::new(addr)),
        Err(ArenaError::Exhausted) => None,
    }
}

/// Frees `npages` pages of wired kernel memory.
///
/// # Safety
///
/// The range must have come from [`kalloc`] with the same
/// page count, and must no longer be in use.
///
pub unsafe fn kfree(addr: VirtAddr, npages: usize) {
    lock!(WIRED).xfree(addr.as_usize(), npages * PAGE_SIZE);
}

/// The largest object a small slab holds.
///
const SMALL_SLAB_MAX: usize = 256;

/// A slab's bookkeeping.
///
/// For a small slab this lives at the top of the slab's one
/// page; for a large slab it is allocated from
/// [`SLAB_META`].
///
#[repr(C)]
struct SlabHeader {
    /// Next slab in the zone's list.
    next: *mut SlabHeader,

    /// The zone this slab belongs to.
    zone: *const Zone,

    /// Remaining free slots.
    nfree: u32,

    /// Total slots.
    capacity: u32,

    /// Head of the freelist: a slot pointer for small
    /// slabs, a bufctl pointer for large ones.
    first_free: *mut u8,

    /// Base of the data area. For a small slab this is the
    /// base of the page the header sits on.
    data: *mut u8,
}

/// An out-of-line slot descriptor for large slabs.
///
/// While free, it is linked into its slab's freelist; while
/// allocated, into the zone's allocated list so that a free
/// by pointer can find it.
///
#[repr(C)]
struct BufCtl {
    next: *mut BufCtl,
    slab: *mut SlabHeader,
    base: *mut u8,
}

/// A cache of equal-sized objects carved out of slabs.
///
pub struct Zone {
    name: &'static str,
    size: usize,
    inner: Mutex<ZoneInner>,
}

struct ZoneInner {
    slabs_head: *mut SlabHeader,
    slabs_tail: *mut SlabHeader,

    /// Allocated bufctls (large zones only).
    bufctls: *mut BufCtl,
}

unsafe impl Send for ZoneInner {}

impl Zone {
    /// Creates a zone serving objects of `size` bytes.
    ///
    pub const fn new(name: &'static str, size: usize) -> Zone {
        Zone {
            name,
            size,
            inner: Mutex::new(ZoneInner {
                slabs_head: ptr::null_mut(),
                slabs_tail: ptr::null_mut(),
                bufctls: ptr::null_mut(),
            }),
        }
    }

    /// The zone's object size in bytes.
    ///
    pub const fn object_size(&self) -> usize {
        self.size
    }

    fn is_small(&self) -> bool {
        self.size <= SMALL_SLAB_MAX
    }

    /// The bytes of data area in one slab of this zone.
    ///
    fn slab_bytes(&self) -> usize {
        if self.is_small() {
            PAGE_SIZE
        } else {
            // Aim for at least 16 objects per slab.
            align_up_usize(self.size * 16, PAGE_SIZE)
        }
    }

    /// The number of objects one slab holds.
    ///
    fn slab_capacity(&self) -> usize {
        if self.is_small() {
            (self.slab_bytes() - mem::size_of::<SlabHeader>()) / self.size
        } else {
            self.slab_bytes() / self.size
        }
    }
}

/// Meta-zone holding large slabs' headers.
///
static SLAB_META: Zone = Zone::new("kmem-slab", mem::size_of::<SlabHeader>());

/// Meta-zone holding large slabs' bufctls.
///
static BUFCTL_META: Zone = Zone::new("kmem-bufctl", mem::size_of::<BufCtl>());

/// Births a small slab: one wired page with the header at
/// the top and the freelist threaded through the slots.
///
unsafe fn small_slab_new(zone: &Zone) -> *mut SlabHeader {
    let base = kalloc(1, true).expect("sleeping allocation cannot fail").as_usize() as *mut u8;
    let slab = base.add(PAGE_SIZE - mem::size_of::<SlabHeader>()) as *mut SlabHeader;

    let capacity = zone.slab_capacity();
    for index in 0..capacity {
        let slot = base.add(index * zone.size) as *mut usize;
        let next = if index + 1 < capacity {
            base.add((index + 1) * zone.size) as usize
        } else {
            0
        };
        slot.write(next);
    }

    slab.write(SlabHeader {
        next: ptr::null_mut(),
        zone,
        nfree: capacity as u32,
        capacity: capacity as u32,
        first_free: base,
        data: base,
    });

    slab
}

/// Births a large slab: an out-of-line header, a wired data
/// area, and one bufctl per slot.
///
unsafe fn large_slab_new(zone: &Zone) -> *mut SlabHeader {
    let slab = zone_alloc(&SLAB_META) as *mut SlabHeader;
    let data = kalloc(zone.slab_bytes() / PAGE_SIZE, true)
        .expect("sleeping allocation cannot fail")
        .as_usize() as *mut u8;

    let capacity = zone.slab_capacity();
    let mut first: *mut BufCtl = ptr::null_mut();
    for index in (0..capacity).rev() {
        let ctl = zone_alloc(&BUFCTL_META) as *mut BufCtl;
        ctl.write(BufCtl {
            next: first,
            slab,
            base: data.add(index * zone.size),
        });
        first = ctl;
    }

    slab.write(SlabHeader {
        next: ptr::null_mut(),
        zone,
        nfree: capacity as u32,
        capacity: capacity as u32,
        first_free: first as *mut u8,
        data,
    });

    slab
}

/// Allocates one object from a zone.
///
/// # Panics
///
/// Allocation of the backing pages sleeps; exhaustion there
/// is fatal until a pager exists.
///
pub fn zone_alloc(zone: &'static Zone) -> *mut u8 {
    let mut inner = lock!(zone.inner);

    let mut slab = inner.slabs_head;
    if slab.is_null() || unsafe { (*slab).nfree } == 0 {
        // No slabs, or every slab is full (full slabs sit at
        // the tail): birth a new one at the head.
        slab = unsafe {
            if zone.is_small() {
                small_slab_new(zone)
            } else {
                large_slab_new(zone)
            }
        };

        unsafe { (*slab).next = inner.slabs_head };
        inner.slabs_head = slab;
        if inner.slabs_tail.is_null() {
            inner.slabs_tail = slab;
        }
    }

    unsafe {
        (*slab).nfree -= 1;
        let entry = (*slab).first_free;

        let next = if zone.is_small() {
            *(entry as *const usize) as *mut u8
        } else {
            (*(entry as *mut BufCtl)).next as *mut u8
        };

        if next.is_null() {
            // The slab is now empty; rotate it to the tail so
            // the head of the list stays allocatable.
            (*slab).first_free = ptr::null_mut();
            if inner.slabs_head == slab && !(*slab).next.is_null() {
                inner.slabs_head = (*slab).next;
                (*slab).next = ptr::null_mut();
                (*inner.slabs_tail).next = slab;
                inner.slabs_tail = slab;
            }
        } else {
            (*slab).first_free = next;
        }

        if zone.is_small() {
            entry
        } else {
            let ctl = entry as *mut BufCtl;
            (*ctl).next = inner.bufctls;
            inner.bufctls = ctl;
            (*ctl).base
        }
    }
}

/// Returns one object to a zone.
///
/// # Safety
///
/// `object` must have been returned by [`zone_alloc`] on the
/// same zone and must not be used again.
///
/// # Panics
///
/// Freeing a pointer the zone does not own is fatal.
///
pub unsafe fn zone_free(zone: &'static Zone, object: *mut u8) {
    let mut inner = lock!(zone.inner);

    if zone.is_small() {
        let base = (object as usize & !(PAGE_SIZE - 1)) as *mut u8;
        let slab = base.add(PAGE_SIZE - mem::size_of::<SlabHeader>()) as *mut SlabHeader;

        (object as *mut usize).write((*slab).first_free as usize);
        (*slab).first_free = object;
        (*slab).nfree += 1;
    } else {
        // Find the allocated bufctl whose base matches.
        let mut prev: *mut BufCtl = ptr::null_mut();
        let mut cursor = inner.bufctls;
        while !cursor.is_null() && (*cursor).base != object {
            prev = cursor;
            cursor = (*cursor).next;
        }

        if cursor.is_null() {
            panic!("kmem: zone {}: free of invalid pointer {:p}", zone.name, object);
        }

        match prev.is_null() {
            true => inner.bufctls = (*cursor).next,
            false => (*prev).next = (*cursor).next,
        }

        let slab = (*cursor).slab;
        (*cursor).next = (*slab).first_free as *mut BufCtl;
        (*slab).first_free = cursor as *mut u8;
        (*slab).nfree += 1;
    }
}

/// The general-purpose allocation ladder.
///
/// 8-byte granularity to 64 bytes, 16 to 128, 32 to 256,
/// 64 to 512, 128 to 1024, 256 to 2048, and 512 to 4096.
///
macro_rules! ladder {
    ($(($size:expr, $name:ident, $label:expr)),+ $(,)?) => {
        $(static $name: Zone = Zone::new($label, $size);)+

        /// The ladder zones, in ascending size order.
        ///
        static LADDER: [&Zone; 32] = [$(&$name),+];
    };
}

ladder![
    (8, KMEM_8, "kmem-8"),
    (16, KMEM_16, "kmem-16"),
    (24, KMEM_24, "kmem-24"),
    (32, KMEM_32, "kmem-32"),
    (40, KMEM_40, "kmem-40"),
    (48, KMEM_48, "kmem-48"),
    (56, KMEM_56, "kmem-56"),
    (64, KMEM_64, "kmem-64"),
    (80, KMEM_80, "kmem-80"),
    (96, KMEM_96, "kmem-96"),
    (112, KMEM_112, "kmem-112"),
    (128, KMEM_128, "kmem-128"),
    (160, KMEM_160, "kmem-160"),
    (192, KMEM_192, "kmem-192"),
    (224, KMEM_224, "kmem-224"),
    (256, KMEM_256, "kmem-256"),
    (320, KMEM_320, "kmem-320"),
    (384, KMEM_384, "kmem-384"),
    (448, KMEM_448, "kmem-448"),
    (512, KMEM_512, "kmem-512"),
    (640, KMEM_640, "kmem-640"),
    (768, KMEM_768, "kmem-768"),
    (896, KMEM_896, "kmem-896"),
    (1024, KMEM_1024, "kmem-1024"),
    (1280, KMEM_1280, "kmem-1280"),
    (1536, KMEM_1536, "kmem-1536"),
    (1792, KMEM_1792, "kmem-1792"),
    (2048, KMEM_2048, "kmem-2048"),
    (2560, KMEM_2560, "kmem-2560"),
    (3072, KMEM_3072, "kmem-3072"),
    (3584, KMEM_3584, "kmem-3584"),
    (4096, KMEM_4096, "kmem-4096"),
];

/// Maps a size to its ladder zone index, or `None` for
/// sizes the wired allocator serves directly.
///
fn zone_number(size: usize) -> Option<usize> {
    let round = |value: usize, granule: usize| (value + granule - 1) / granule;
    if size <= 64 {
        Some(round(size, 8) - 1)
    } else if size <= 128 {
        Some(round(size - 64, 16) + 7)
    } else if size <= 256 {
        Some(round(size - 128, 32) + 11)
    } else if size <= 512 {
        Some(round(size - 256, 64) + 15)
    } else if size <= 1024 {
        Some(round(size - 512, 128) + 19)
    } else if size <= 2048 {
        Some(round(size - 1024, 256) + 23)
    } else if size <= 4096 {
        Some(round(size - 2048, 512) + 27)
    } else {
        None
    }
}

/// Allocates `size` bytes of kernel memory.
///
/// # Panics
///
/// `kmem_alloc` panics on a zero-size request, and on
/// physical exhaustion (there is no pager to wait on yet).
///
pub fn kmem_alloc(size: usize) -> *mut u8 {
    assert!(size > 0);
    match zone_number(size) {
        Some(index) => zone_alloc(LADDER[index]),
        None => {
            let pages = align_up_usize(size, PAGE_SIZE) / PAGE_SIZE;
            kalloc(pages, true)
                .expect("sleeping allocation cannot fail")
                .as_usize() as *mut u8
        }
    }
}

/// Allocates `size` bytes of zeroed kernel memory.
///
/// # Panics
///
/// As [`kmem_alloc`].
///
pub fn kmem_zalloc(size: usize) -> *mut u8 {
    let object = kmem_alloc(size);
    unsafe { ptr::write_bytes(object, 0, size) };
    object
}

/// Frees memory from [`kmem_alloc`].
///
/// # Safety
///
/// `object` must have come from [`kmem_alloc`] with exactly
/// this `size`, and must not be used again.
///
pub unsafe fn kmem_free(object: *mut u8, size: usize) {
    assert!(size > 0);
    match zone_number(size) {
        Some(index) => zone_free(LADDER[index], object),
        None => {
            let pages = align_up_usize(size, PAGE_SIZE) / PAGE_SIZE;
            kfree(VirtAddr::new(object as usize), pages);
        }
    }
}

/// The registry of zones, for the occupancy dump.
///
static ZONES: Mutex<ZoneList> = Mutex::new(ZoneList {
    zones: [None; 48],
    count: 0,
});

struct ZoneList {
    zones: [Option<&'static Zone>; 48],
    count: usize,
}

fn register_zone(zone: &'static Zone) {
    let mut registry = lock!(ZONES);
    let count = registry.count;
    assert!(count < registry.zones.len(), "too many slab zones");
    registry.zones[count] = Some(zone);
    registry.count += 1;
}

/// Prints each registered zone's occupancy.
///
pub fn debug() {
    let registry = lock!(ZONES);
    println!("{:<16}{:>8}{:>8}{:>8}", "zone", "size", "slabs", "live");
    for slot in registry.zones.iter().take(registry.count) {
        let zone = slot.unwrap();
        let inner = lock!(zone.inner);
        let mut slabs = 0;
        let mut free = 0;
        let mut capacity = 0;
        let mut cursor = inner.slabs_head;
        while !cursor.is_null() {
            unsafe {
                slabs += 1;
                free += (*cursor).nfree as usize;
                capacity += (*cursor).capacity as usize;
                cursor = (*cursor).next;
            }
        }

        println!(
            "{:<16}{:>8}{:>8}{:>8}",
            zone.name,
            zone.size,
            slabs,
            capacity - free
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use bootloader::bootinfo::{FrameRange, MemoryRegion, MemoryRegionType};
    use std::vec;
    use std::vec::Vec;

    static MACHINE: std::sync::Mutex<()> = std::sync::Mutex::new(());
    static BOOTED: std::sync::Once = std::sync::Once::new();

    /// Brings up fake physical memory, the kernel pmap, and
    /// the heap arenas over a leaked address window.
    ///
    fn boot() {
        BOOTED.call_once(|| {
            let buffer: &'static mut [u8] = Vec::leak(vec![0_u8; 4097 * PAGE_SIZE]);
            let base = (buffer.as_ptr() as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            let region = MemoryRegion {
                range: FrameRange::new(base as u64, (base + 4096 * PAGE_SIZE) as u64),
                region_type: MemoryRegionType::Usable,
            };
            unsafe { physmem::init([region].iter()) };

            let root = page_alloc(true, PageQueueKind::Pmap).unwrap();
            pmap::init(physmem::page_addr(root));

            // The heap's addresses must be dereferenceable on
            // the host, so the "kernel heap" range is another
            // leaked buffer.
            let heap: &'static mut [u8] = Vec::leak(vec![0_u8; 1025 * PAGE_SIZE]);
            let heap_base = (heap.as_ptr() as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            init(VirtAddr::new(heap_base), 1024 * PAGE_SIZE);
        });
    }

    #[test]
    fn test_wired_pages() {
        let _machine = MACHINE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        boot();

        let kmem_before = physmem::queue_len(PageQueueKind::KMem);
        let addr = kalloc(4, true).unwrap();

        // The pages are mapped in the kernel pmap and on the
        // kmem queue.
        assert!(physmem::queue_len(PageQueueKind::KMem) >= kmem_before + 4);
        for page in 0..4 {
            let virt = addr + page * PAGE_SIZE;
            assert!(pmap::translate(AddrSpaceId::KERNEL, virt).is_some());
        }

        // The memory is usable.
        unsafe {
            let bytes = addr.as_usize() as *mut u8;
            ptr::write_bytes(bytes, 0xa5, 4 * PAGE_SIZE);
            assert_eq!(*bytes.add(4 * PAGE_SIZE - 1), 0xa5);
        }

        unsafe { kfree(addr, 4) };
        physmem::verify_queues();
    }

    #[test]
    fn test_small_zone_reuse() {
        let _machine = MACHINE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        boot();

        static ZONE: Zone = Zone::new("test-8", 8);

        let first = zone_alloc(&ZONE);
        let second = zone_alloc(&ZONE);
        let third = zone_alloc(&ZONE);
        assert_ne!(first, second);
        assert_ne!(second, third);

        // Objects are packed with the zone's stride within
        // one page.
        assert_eq!(second as usize - first as usize, 8);

        // Freeing and reallocating returns the same slot
        // (the freelist is LIFO).
        unsafe { zone_free(&ZONE, second) };
        let again = zone_alloc(&ZONE);
        assert_eq!(again, second);

        unsafe {
            zone_free(&ZONE, first);
            zone_free(&ZONE, again);
            zone_free(&ZONE, third);
        }
    }

    #[test]
    fn test_large_zone() {
        let _machine = MACHINE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        boot();

        static ZONE: Zone = Zone::new("test-1024", 1024);
        assert!(!ZONE.is_small());
        assert_eq!(ZONE.slab_capacity(), 16);

        let mut objects = Vec::new();
        for _ in 0..20 {
            let object = zone_alloc(&ZONE);
            unsafe { ptr::write_bytes(object, 0x5a, 1024) };
            objects.push(object);
        }

        // Two slabs were needed for 20 objects of 16 per
        // slab; all distinct.
        for (i, a) in objects.iter().enumerate() {
            for b in objects.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }

        // Free an object from the head slab and get it back:
        // the freelist is LIFO.
        let last = objects[19];
        unsafe { zone_free(&ZONE, last) };
        assert_eq!(zone_alloc(&ZONE), last);

        for object in objects {
            unsafe { zone_free(&ZONE, object) };
        }
    }

    #[test]
    #[should_panic(expected = "invalid pointer")]
    fn test_large_zone_invalid_free() {
        let _machine = MACHINE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        boot();

        static ZONE: Zone = Zone::new("test-bad-free", 512);
        let object = zone_alloc(&ZONE);
        unsafe { zone_free(&ZONE, object.add(1)) };
    }

    #[test]
    fn test_ladder() {
        let _machine = MACHINE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        boot();

        // Boundary sizes land in the expected zones.
        assert_eq!(zone_number(1), Some(0));
        assert_eq!(zone_number(8), Some(0));
        assert_eq!(zone_number(9), Some(1));
        assert_eq!(zone_number(64), Some(7));
        assert_eq!(zone_number(65), Some(8));
        assert_eq!(zone_number(128), Some(11));
        assert_eq!(zone_number(129), Some(12));
        assert_eq!(zone_number(256), Some(15));
        assert_eq!(zone_number(512), Some(19));
        assert_eq!(zone_number(1024), Some(23));
        assert_eq!(zone_number(2048), Some(27));
        assert_eq!(zone_number(4096), Some(31));
        assert_eq!(zone_number(4097), None);

        // A round trip through each band.
        for size in [1_usize, 8, 24, 100, 300, 1000, 3000, 4096, 8192].iter() {
            let object = kmem_alloc(*size);
            assert!(!object.is_null());
            unsafe {
                ptr::write_bytes(object, 0xee, *size);
                kmem_free(object, *size);
            }
        }

        // Oversize allocations are page-backed and aligned.
        let big = kmem_alloc(3 * PAGE_SIZE + 5);
        assert_eq!(big as usize % PAGE_SIZE, 0);
        unsafe { kmem_free(big, 3 * PAGE_SIZE + 5) };

        // Zeroed allocation really is zeroed.
        let zeroed = kmem_zalloc(128);
        unsafe {
            for offset in 0..128 {
                assert_eq!(*zeroed.add(offset), 0);
            }
            kmem_free(zeroed, 128);
        }
    }
}
