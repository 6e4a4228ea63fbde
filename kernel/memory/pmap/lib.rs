// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The physical map: the machine-dependent half of the virtual
//! memory system.
//!
//! Each address space is a four-level x86-64 page table tree,
//! reached through the physical memory window. The upper 256
//! entries of every root are shared by reference with the kernel's
//! root, which [`init`] pre-allocates, so kernel mappings appear in
//! every address space without further work.
//!
//! Two mapping paths exist:
//!
//! - [`enter`] installs a *pageable* mapping: alongside the page
//!   table entry, a `pv` record is linked onto the physical page so
//!   that every mapping of the page can later be found (for
//!   copy-on-write downgrades and, one day, swap-out).
//!   [`unenter`] is its inverse.
//! - [`enter_kern`] installs an untracked mapping, which is what
//!   the wired kernel allocator and early bring-up use.
//!   [`unenter_kern`] is its inverse.
//!
//! Intermediate page table nodes are allocated from the page-table
//! queue on demand and freed when an address space is destroyed.
//!
//! ## TLB shootdown
//!
//! [`global_invlpg`] invalidates one virtual address on every CPU.
//! The initiator raises the priority level to the top, takes the
//! global shootdown lock, publishes the address and an
//! acknowledgement count, and sends [`VECTOR_SHOOTDOWN`] to every
//! other CPU. Each remote CPU invalidates the published address,
//! increments the count, and signals end-of-interrupt; the
//! initiator invalidates locally and spins until the count reaches
//! the CPU count.
//!
//! [`VECTOR_SHOOTDOWN`]: interrupts::VECTOR_SHOOTDOWN

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use console::println;
use core::hint;
use core::sync::atomic::{AtomicUsize, Ordering};
use interrupts::{Frame, Ipl};
use memory::constants::KERNEL_BASE;
use memory::{phys_to_virt, AddrSpaceId, PageTableFlags, PhysAddr, Prot, VirtAddr, PAGE_SIZE};
use physmem::{page_alloc, page_free, PageId, PageQueueKind};
use spin::{lock, Mutex};

/// The number of address spaces that can exist at once.
///
const MAX_SPACES: usize = 256;

/// The mask selecting the frame address from a page table
/// entry.
///
const FRAME_MASK: u64 = 0x000f_ffff_ffff_f000;

/// The flags given to intermediate page table nodes.
///
/// Leaf entries narrow the effective permissions, so the
/// intermediate levels stay permissive.
///
const TABLE_FLAGS: u64 = PageTableFlags::PRESENT.bits()
    | PageTableFlags::WRITABLE.bits()
    | PageTableFlags::USER_ACCESSIBLE.bits();

/// The registry of page table roots, indexed by address
/// space id.
///
struct PmapTable {
    roots: [Option<PhysAddr>; MAX_SPACES],
    next: u32,
}

const NO_ROOT: Option<PhysAddr> = None;

static PMAPS: Mutex<PmapTable> = Mutex::new(PmapTable {
    roots: [NO_ROOT; MAX_SPACES],
    next: 1,
});

/// Machine hook that loads an address space root into the
/// MMU.
///
static ACTIVATE_HOOK: Mutex<Option<fn(PhysAddr)>> = Mutex::new(None);

/// Machine hook that invalidates one address in the local
/// TLB.
///
static INVLPG_HOOK: Mutex<Option<fn(VirtAddr)>> = Mutex::new(None);

/// The published address of an in-progress shootdown.
///
static SHOOTDOWN_ADDR: AtomicUsize = AtomicUsize::new(0);

/// CPUs that have acknowledged the in-progress shootdown,
/// including the initiator.
///
static SHOOTDOWN_ACKS: AtomicUsize = AtomicUsize::new(0);

/// Serialises shootdown initiators.
///
static SHOOTDOWN_LOCK: Mutex<()> = Mutex::new(());

/// Installs the hooks that reach the MMU: the address space
/// activation (CR3 load) and the local TLB invalidation.
///
pub fn set_machine_hooks(activate: fn(PhysAddr), invlpg: fn(VirtAddr)) {
    *lock!(ACTIVATE_HOOK) = Some(activate);
    *lock!(INVLPG_HOOK) = Some(invlpg);
}

fn root_of(space: AddrSpaceId) -> PhysAddr {
    lock!(PMAPS).roots[space.as_u32() as usize].expect("address space has no page table root")
}

/// Returns a mutable view of the page table node at `table`,
/// through the physical memory window.
///
fn node(table: PhysAddr) -> &'static mut [u64; 512] {
    unsafe { &mut *(phys_to_virt(table).as_usize() as *mut [u64; 512]) }
}

/// Translates a protection request into leaf entry flags.
///
fn leaf_flags(prot: Prot, user: bool) -> u64 {
    let mut flags = 0;
    if prot.contains(Prot::READ) {
        flags |= PageTableFlags::PRESENT.bits();
    }

    if prot.contains(Prot::WRITE) {
        flags |= PageTableFlags::WRITABLE.bits();
    }

    if !prot.contains(Prot::EXECUTE) {
        flags |= PageTableFlags::NO_EXECUTE.bits();
    }

    if user {
        flags |= PageTableFlags::USER_ACCESSIBLE.bits();
    }

    flags
}

/// Walks one level down from `table`, optionally allocating
/// the next node.
///
fn descend(table: PhysAddr, index: usize, alloc: bool) -> Option<PhysAddr> {
    let entry = &mut node(table)[index];
    if *entry & PageTableFlags::PRESENT.bits() != 0 {
        Some(PhysAddr::new((*entry & FRAME_MASK) as usize))
    } else if alloc {
        let page = page_alloc(true, PageQueueKind::Pmap)
            .expect("sleeping page allocation cannot fail");
        let addr = physmem::page_addr(page);
        *entry = addr.as_usize() as u64 | TABLE_FLAGS;
        Some(addr)
    } else {
        None
    }
}

/// Walks all four levels to the leaf entry for `virt`,
/// optionally allocating intermediate nodes.
///
fn walk(root: PhysAddr, virt: VirtAddr, alloc: bool) -> Option<&'static mut u64> {
    let [l4, l3, l2, l1] = virt.page_table_indices();
    let pdpt = descend(root, l4, alloc)?;
    let pd = descend(pdpt, l3, alloc)?;
    let pt = descend(pd, l2, alloc)?;
    Some(&mut node(pt)[l1])
}

/// Captures the kernel's page table root and pre-allocates
/// the higher-half entries that every address space shares.
///
/// # Panics
///
/// `init` panics if called twice.
///
pub fn init(kernel_root: PhysAddr) {
    let mut pmaps = lock!(PMAPS);
    assert!(
        pmaps.roots[AddrSpaceId::KERNEL.as_u32() as usize].is_none(),
        "pmap::init called twice"
    );
    pmaps.roots[AddrSpaceId::KERNEL.as_u32() as usize] = Some(kernel_root);
    drop(pmaps);

    // The upper half of the root is shared by reference into
    // every address space created later, so all of its
    // top-level nodes must exist now.
    let root = node(kernel_root);
    for index in 256..512 {
        if root[index] & PageTableFlags::PRESENT.bits() == 0 {
            let page = page_alloc(true, PageQueueKind::Pmap)
                .expect("sleeping page allocation cannot fail");
            root[index] = physmem::page_addr(page).as_usize() as u64 | TABLE_FLAGS;
        }
    }
}

/// Creates a new address space whose higher half is shared
/// with the kernel.
///
/// # Panics
///
/// `create` panics if [`MAX_SPACES`] address spaces already
/// exist.
///
pub fn create() -> AddrSpaceId {
    let root_page = page_alloc(true, PageQueueKind::Pmap)
        .expect("sleeping page allocation cannot fail");
    let root = physmem::page_addr(root_page);

    let kernel_root = root_of(AddrSpaceId::KERNEL);
    let new = node(root);
    let kernel = node(kernel_root);
    for index in 256..512 {
        new[index] = kernel[index];
    }

    let mut pmaps = lock!(PMAPS);
    let start = pmaps.next as usize;
    for offset in 0..MAX_SPACES {
        let candidate = (start + offset) % MAX_SPACES;
        if candidate != 0 && pmaps.roots[candidate].is_none() {
            pmaps.roots[candidate] = Some(root);
            pmaps.next = ((candidate + 1) % MAX_SPACES) as u32;
            return AddrSpaceId::new(candidate as u32);
        }
    }

    panic!("pmap::create: out of address space slots");
}

/// Frees the page table nodes beneath `table` from the given
/// level, then the node itself.
///
/// Leaf mappings are not touched: they are expected to have
/// been removed by address space teardown already.
///
fn free_level(table: PhysAddr, level: usize, low_half_only: bool) {
    let entries = node(table);
    let limit = if low_half_only { 256 } else { 512 };
    if level > 1 {
        for index in 0..limit {
            let entry = entries[index];
            if entry & PageTableFlags::PRESENT.bits() != 0 {
                free_level(
                    PhysAddr::new((entry & FRAME_MASK) as usize),
                    level - 1,
                    false,
                );
            }
        }
    }

    let page = physmem::page_for_addr(table).expect("page table node outside the page database");
    page_free(page);
}

/// Destroys an address space, freeing its lower-half page
/// table nodes and its root.
///
/// The shared higher-half nodes belong to the kernel and are
/// left alone.
///
/// # Panics
///
/// `destroy` panics if asked to destroy the kernel's address
/// space.
///
pub fn destroy(space: AddrSpaceId) {
    assert!(space != AddrSpaceId::KERNEL, "cannot destroy the kernel pmap");
    let root = root_of(space);
    free_level(root, 4, true);
    lock!(PMAPS).roots[space.as_u32() as usize] = None;
}

/// Installs a pageable mapping of `page` at `virt`, and links
/// the mapping into the page's `pv` list.
///
pub fn enter(space: AddrSpaceId, page: PageId, virt: VirtAddr, prot: Prot) {
    enter_kern(space, physmem::page_addr(page), virt, prot);
    physmem::pv_insert(page, space, virt);
}

/// Changes the protection of an existing pageable mapping.
///
/// The `pv` list is untouched and no TLB shootdown is
/// carried out.
///
pub fn reenter(space: AddrSpaceId, page: PageId, virt: VirtAddr, prot: Prot) {
    enter_kern(space, physmem::page_addr(page), virt, prot);
}

/// Installs a low-level mapping of `phys` at `virt`.
///
/// Mappings made this way are not tracked: the physical page
/// gains no `pv` record.
///
pub fn enter_kern(space: AddrSpaceId, phys: PhysAddr, virt: VirtAddr, prot: Prot) {
    let root = root_of(space);
    let entry = walk(root, virt, true).expect("allocating page table walk cannot fail");
    let user = virt < KERNEL_BASE;
    *entry = phys.as_usize() as u64 | leaf_flags(prot, user);
}

/// Downgrades every mapping of `page` to read-only and
/// invalidates each mapped address on every CPU.
///
/// This is the enforcement half of copy-on-write: after an
/// anon becomes shared, no address space may retain a
/// writable view of its page.
///
pub fn reenter_all_readonly(page: PageId) {
    for mapping in physmem::pv_entries(page) {
        reenter(mapping.space, page, mapping.vaddr, Prot::READ | Prot::EXECUTE);
        global_invlpg(mapping.vaddr);
    }
}

/// Removes a pageable mapping, invalidating the local TLB
/// and unlinking the page's `pv` record.
///
/// If `page` is not supplied it is recovered from the page
/// table entry. Returns the unmapped page, or `None` if no
/// mapping existed.
///
/// # Panics
///
/// `unenter` panics if the mapping exists but was never
/// recorded in the page's `pv` list.
///
pub fn unenter(space: AddrSpaceId, page: Option<PageId>, virt: VirtAddr) -> Option<PageId> {
    let root = root_of(space);
    let entry = walk(root, virt, false)?;
    if *entry == 0 {
        return None;
    }

    let paddr = PhysAddr::new((*entry & FRAME_MASK) as usize);
    *entry = 0;
    invlpg(virt);

    let page = page.or_else(|| physmem::page_for_addr(paddr))?;
    assert!(
        physmem::pv_remove(page, space, virt),
        "unenter: no pv record of frame {:?} at {:?}",
        paddr,
        virt
    );

    Some(page)
}

/// Removes a low-level mapping, invalidating the local TLB.
///
/// Returns the page that was mapped.
///
/// # Panics
///
/// `unenter_kern` panics if no mapping exists at `virt`; the
/// untracked paths always know what they mapped.
///
pub fn unenter_kern(space: AddrSpaceId, virt: VirtAddr) -> PageId {
    let root = root_of(space);
    let entry = walk(root, virt, false).expect("unenter_kern: no page table for address");
    assert!(*entry != 0, "unenter_kern: address not mapped");
    let paddr = PhysAddr::new((*entry & FRAME_MASK) as usize);
    *entry = 0;
    invlpg(virt);

    physmem::page_for_addr(paddr).expect("unenter_kern: unmapped frame has no page record")
}

/// Translates a virtual address through an address space,
/// returning the physical address it maps to.
///
pub fn translate(space: AddrSpaceId, virt: VirtAddr) -> Option<PhysAddr> {
    let (frame, _flags) = lookup(space, virt)?;
    Some(frame + (virt.as_usize() & (PAGE_SIZE - 1)))
}

/// Returns the frame and flags of the leaf entry mapping
/// `virt`, if one is present.
///
pub fn lookup(space: AddrSpaceId, virt: VirtAddr) -> Option<(PhysAddr, PageTableFlags)> {
    let root = root_of(space);
    let entry = walk(root, virt, false)?;
    if *entry & PageTableFlags::PRESENT.bits() == 0 {
        return None;
    }

    let frame = PhysAddr::new((*entry & FRAME_MASK) as usize);
    let flags = PageTableFlags::from_bits_truncate(*entry & !FRAME_MASK);
    Some((frame, flags))
}

/// Loads the given address space into the MMU.
///
pub fn activate(space: AddrSpaceId) {
    let root = root_of(space);
    let hook = *lock!(ACTIVATE_HOOK);
    if let Some(hook) = hook {
        hook(root);
    }
}

/// Invalidates one address in the executing CPU's TLB.
///
pub fn invlpg(virt: VirtAddr) {
    let hook = *lock!(INVLPG_HOOK);
    if let Some(hook) = hook {
        hook(virt);
    }
}

/// Invalidates one address in every CPU's TLB.
///
/// Returns only once every other CPU has acknowledged the
/// invalidation.
///
pub fn global_invlpg(virt: VirtAddr) {
    let platform = interrupts::platform();
    let ncpus = cpu::count();

    let ipl = interrupts::raise(Ipl::High);
    let guard = lock!(SHOOTDOWN_LOCK);

    SHOOTDOWN_ADDR.store(virt.as_usize(), Ordering::SeqCst);
    SHOOTDOWN_ACKS.store(1, Ordering::SeqCst);

    let this = cpu::id();
    for other in 0..ncpus {
        if other != this {
            platform.send_ipi(other, interrupts::VECTOR_SHOOTDOWN);
        }
    }

    invlpg(virt);
    while SHOOTDOWN_ACKS.load(Ordering::SeqCst) < ncpus {
        hint::spin_loop();
    }

    drop(guard);
    interrupts::restore(ipl);
}

/// The remote half of the shootdown protocol.
///
/// Registered on [`interrupts::VECTOR_SHOOTDOWN`]; runs on
/// each CPU named by the initiator.
///
pub fn shootdown_interrupt(_frame: &mut Frame, _arg: usize) {
    let addr = VirtAddr::new(SHOOTDOWN_ADDR.load(Ordering::SeqCst));
    invlpg(addr);
    SHOOTDOWN_ACKS.fetch_add(1, Ordering::SeqCst);
    interrupts::platform().end_of_interrupt();
}

/// Prints the registered address spaces.
///
pub fn debug() {
    let pmaps = lock!(PMAPS);
    for (space, root) in pmaps.roots.iter().enumerate() {
        if let Some(root) = root {
            println!("pmap {}: root {:?}", space, root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use bootloader::bootinfo::{FrameRange, MemoryRegion, MemoryRegionType};
    use interrupts::SoftPlatform;
    use std::boxed::Box;
    use std::vec;
    use std::vec::Vec;

    /// Serialises the tests in this module: they share one
    /// simulated machine.
    ///
    static MACHINE: std::sync::Mutex<()> = std::sync::Mutex::new(());

    static BOOTED: std::sync::Once = std::sync::Once::new();
    static PLATFORM: spin::Once<&'static SoftPlatform> = spin::Once::new();

    /// Brings up a small machine: fake RAM under an identity
    /// physical window, a four-CPU software platform, and the
    /// kernel pmap.
    ///
    fn boot() -> &'static SoftPlatform {
        BOOTED.call_once(|| {
            let buffer: &'static mut [u8] = Vec::leak(vec![0_u8; 2049 * PAGE_SIZE]);
            let base = (buffer.as_ptr() as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            let region = MemoryRegion {
                range: FrameRange::new(base as u64, (base + 2048 * PAGE_SIZE) as u64),
                region_type: MemoryRegionType::Usable,
            };
            unsafe { physmem::init([region].iter()) };

            let platform: &'static SoftPlatform = Box::leak(Box::new(SoftPlatform::new(4)));
            interrupts::set_platform(platform);
            interrupts::register_vector(
                interrupts::VECTOR_SHOOTDOWN,
                Ipl::High,
                shootdown_interrupt,
                0,
            );

            let root = page_alloc(true, PageQueueKind::Pmap).unwrap();
            init(physmem::page_addr(root));
            PLATFORM.init(platform);
        });

        PLATFORM.get().unwrap()
    }

    #[test]
    fn test_pmap() {
        let _machine = MACHINE.lock().unwrap();
        let platform = boot();

        // The kernel root's upper half is fully populated.
        let kernel_root = root_of(AddrSpaceId::KERNEL);
        for index in 256..512 {
            assert!(node(kernel_root)[index] & PageTableFlags::PRESENT.bits() != 0);
        }

        // An untracked kernel mapping.
        let kpage = page_alloc(true, PageQueueKind::KMem).unwrap();
        let frame = physmem::page_addr(kpage);
        let virt = VirtAddr::new(0xffff_e000_0000_3000);
        enter_kern(AddrSpaceId::KERNEL, frame, virt, Prot::READ | Prot::WRITE);
        assert_eq!(translate(AddrSpaceId::KERNEL, virt + 0x10), Some(frame + 0x10));
        let (_, flags) = lookup(AddrSpaceId::KERNEL, virt).unwrap();
        assert!(flags.contains(PageTableFlags::WRITABLE));
        assert!(flags.contains(PageTableFlags::NO_EXECUTE));
        assert!(!flags.contains(PageTableFlags::USER_ACCESSIBLE));
        assert_eq!(unenter_kern(AddrSpaceId::KERNEL, virt), kpage);
        assert_eq!(lookup(AddrSpaceId::KERNEL, virt), None);
        physmem::page_free(kpage);

        // A fresh address space shares the kernel's upper
        // half by reference.
        let space = create();
        assert!(space != AddrSpaceId::KERNEL);
        let user_root = root_of(space);
        for index in 256..512 {
            assert_eq!(node(user_root)[index], node(kernel_root)[index]);
        }

        // A pageable mapping records a pv entry; downgrading
        // it strips the writable bit everywhere and performs
        // a shootdown per mapping.
        let page = page_alloc(true, PageQueueKind::Active).unwrap();
        let uvirt = VirtAddr::new(0x40_0000);
        enter(space, page, uvirt, Prot::ALL);
        let (_, flags) = lookup(space, uvirt).unwrap();
        assert!(flags.contains(PageTableFlags::WRITABLE));
        assert!(flags.contains(PageTableFlags::USER_ACCESSIBLE));
        assert_eq!(physmem::pv_entries(page).len(), 1);

        let ipis_before = platform.ipis();
        let eois_before = platform.eois();
        reenter_all_readonly(page);
        let (_, flags) = lookup(space, uvirt).unwrap();
        assert!(!flags.contains(PageTableFlags::WRITABLE));

        // One mapping: one shootdown round of ncpus-1 IPIs,
        // each acknowledged with an end-of-interrupt.
        assert_eq!(platform.ipis() - ipis_before, 3);
        assert_eq!(platform.eois() - eois_before, 3);

        // The pv record survives a downgrade and is consumed
        // by unenter.
        assert_eq!(unenter(space, None, uvirt), Some(page));
        assert!(physmem::pv_entries(page).is_empty());
        assert_eq!(unenter(space, None, uvirt), None);
        physmem::page_free(page);

        // Tear the space down; its lower-half table nodes
        // return to the free queue.
        let pmap_pages_before = physmem::queue_len(PageQueueKind::Pmap);
        destroy(space);
        assert!(physmem::queue_len(PageQueueKind::Pmap) < pmap_pages_before);
        physmem::verify_queues();
    }

    #[test]
    fn test_global_shootdown_acks() {
        let _machine = MACHINE.lock().unwrap();
        let platform = boot();

        let addr = VirtAddr::new(0x7000_0000);
        let ipis_before = platform.ipis();
        global_invlpg(addr);

        // The initiator counts itself; every other CPU must
        // have acknowledged exactly once before global_invlpg
        // returned.
        assert_eq!(SHOOTDOWN_ACKS.load(Ordering::SeqCst), cpu::count());
        assert_eq!(SHOOTDOWN_ADDR.load(Ordering::SeqCst), addr.as_usize());
        assert_eq!(platform.ipis() - ipis_before, cpu::count() - 1);
    }
}
