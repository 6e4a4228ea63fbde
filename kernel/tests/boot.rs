// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Boots the core on a simulated machine and drives it end to
//! end: physical memory, the kernel heap, address spaces,
//! copy-on-write faults with their TLB shootdowns, and the
//! scheduler.

use bootloader::bootinfo::{FrameRange, MemoryRegion, MemoryRegionType};
use interrupts::{Ipl, SoftPlatform};
use memory::{phys_to_virt, PageTableFlags, PhysAddr, VirtAddr, PAGE_SIZE};
use physmem::PageQueueKind;

/// Leaks a buffer and returns a page-aligned region of
/// `pages` pages within it.
///
fn leak_pages(pages: usize) -> usize {
    let buffer: &'static mut [u8] = Vec::leak(vec![0_u8; (pages + 1) * PAGE_SIZE]);
    (buffer.as_ptr() as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn refill_from_test_heap() -> Option<&'static mut [arena::Segment]> {
    Some(Vec::leak(vec![arena::Segment::EMPTY; 64]))
}

#[test]
fn boot_and_exercise_core() {
    // A machine with 16 MiB of RAM, four CPUs, and an
    // identity physical window.
    let ram = leak_pages(4096);
    let region = MemoryRegion {
        range: FrameRange::new(ram as u64, (ram + 4096 * PAGE_SIZE) as u64),
        region_type: MemoryRegionType::Usable,
    };
    unsafe { physmem::init([region].iter()) };

    let platform: &'static SoftPlatform = Box::leak(Box::new(SoftPlatform::new(4)));
    interrupts::set_platform(platform);
    interrupts::register_vector(
        interrupts::VECTOR_SHOOTDOWN,
        Ipl::High,
        pmap::shootdown_interrupt,
        0,
    );

    arena::bootstrap();
    arena::set_refill(refill_from_test_heap);

    let root = physmem::page_alloc(true, PageQueueKind::Pmap).unwrap();
    pmap::init(physmem::page_addr(root));

    let heap = leak_pages(1024);
    kmem::init(VirtAddr::new(heap), 1024 * PAGE_SIZE);

    virtmem::init(PhysAddr::new(0x10_0000));
    multitasking::scheduler::init();

    let total = physmem::total_pages();
    assert_eq!(total, 4096);
    physmem::verify_queues();

    // The kernel heap works end to end: wired pages are
    // mapped and usable through the ladder.
    let object = kmem::kmem_zalloc(777);
    unsafe {
        assert_eq!(*object, 0);
        *object = 0x5a;
        kmem::kmem_free(object, 777);
    }

    // The global allocator routes through the same ladder,
    // meeting alignments the zones do not express directly.
    {
        use core::alloc::{GlobalAlloc, Layout};
        let heap = kernel::allocator::KernelHeap;
        let layout = Layout::from_size_align(24, 16).unwrap();
        let block = unsafe { heap.alloc(layout) };
        assert!(!block.is_null());
        assert_eq!(block as usize % 16, 0);
        unsafe { heap.dealloc(block, layout) };
    }

    // Kernel-space faults resolve against the kernel map;
    // its entries are direct-physical and refuse to fault.
    assert_eq!(
        virtmem::fault(
            &virtmem::KERNEL_MAP,
            memory::constants::KERNEL_BINARY_BASE + 0x1000,
            virtmem::FaultFlags::empty(),
        ),
        Err(virtmem::FaultError::NotFaultable)
    );

    // An address space with a page of anonymous memory,
    // faulted in and written.
    let free_before_vm = physmem::queue_len(PageQueueKind::Free);
    {
        let parent = virtmem::map_new();
        let (addr, _object) = virtmem::allocate(&parent, PAGE_SIZE).unwrap();
        virtmem::fault(&parent, addr, virtmem::FaultFlags::WRITE).unwrap();

        let parent_phys = pmap::translate(parent.space(), addr).unwrap();
        unsafe { *(phys_to_virt(parent_phys).as_usize() as *mut u8) = 0xab };

        // Forking shares the page copy-on-write; the
        // downgrade shoots the stale writable mapping out of
        // every other CPU's TLB.
        let ipis_before = platform.ipis();
        let child = virtmem::map_fork(&parent);
        assert_eq!(platform.ipis() - ipis_before, 3);

        let (_, flags) = pmap::lookup(parent.space(), addr).unwrap();
        assert!(!flags.contains(PageTableFlags::WRITABLE));

        // The child reads the shared frame; the parent's
        // next write breaks the share.
        virtmem::fault(&child, addr, virtmem::FaultFlags::empty()).unwrap();
        assert_eq!(
            pmap::translate(child.space(), addr).unwrap(),
            parent_phys
        );

        virtmem::fault(
            &parent,
            addr,
            virtmem::FaultFlags::WRITE | virtmem::FaultFlags::PRESENT,
        )
        .unwrap();
        let diverged = pmap::translate(parent.space(), addr).unwrap();
        assert_ne!(diverged, parent_phys);
        unsafe {
            assert_eq!(*(phys_to_virt(diverged).as_usize() as *const u8), 0xab);
            assert_eq!(*(phys_to_virt(parent_phys).as_usize() as *const u8), 0xab);
        }

        virtmem::deallocate(&parent, addr, PAGE_SIZE).unwrap();
        virtmem::deallocate(&child, addr, PAGE_SIZE).unwrap();
    }

    // Both maps dropped: every page they pulled comes back.
    assert_eq!(physmem::queue_len(PageQueueKind::Free), free_before_vm);
    physmem::verify_queues();

    // A pinned buffer round-trips data and unpins on drop.
    let wired_before = physmem::queue_len(PageQueueKind::Wired);
    {
        let mut mdl = virtmem::Mdl::with_capacity(2 * PAGE_SIZE);
        mdl.copy_in(&[1, 2, 3, 4], PAGE_SIZE - 2);
        let mut out = [0_u8; 4];
        mdl.copy_out(&mut out, PAGE_SIZE - 2);
        assert_eq!(out, [1, 2, 3, 4]);
    }
    assert_eq!(physmem::queue_len(PageQueueKind::Wired), wired_before);

    // A task, a thread, and a trip through the scheduler.
    let task = multitasking::Task::new(String::from("init"), Some(virtmem::map_new()));
    let tid = multitasking::thread_new(
        Some(task.clone()),
        String::from("worker"),
        worker_body,
        7,
    );
    multitasking::thread_resume(tid);

    // The idle CPU picks the worker up.
    multitasking::reschedule();
    assert_eq!(multitasking::current_thread().name(), "worker");

    // The worker parks itself on a queue with a timeout; the
    // timeout fires and makes it runnable again.
    let wq = multitasking::WaitQueue::new();
    multitasking::waitq_await(&wq, 5 * time::NANOS_PER_MILLI);
    assert_eq!(multitasking::current_thread().name(), "idle");
    platform.advance(6 * time::NANOS_PER_MILLI);
    assert_eq!(
        multitasking::current_thread().name(),
        "idle",
    );
    multitasking::reschedule();
    assert_eq!(multitasking::current_thread().id(), tid);

    // Nothing leaked across the whole run.
    assert_eq!(physmem::total_pages(), total);
    physmem::verify_queues();
    physmem::debug();
}

fn worker_body(_arg: usize) {}
