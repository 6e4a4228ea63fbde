// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel's core: bring-up and the glue between the memory
//! and scheduling subsystems and the machine.
//!
//! The heavy lifting lives in the subsystem crates; this crate
//! owns the order in which they come up and the hardware behind
//! the seams they define:
//!
//! 1. The serial console sink, so everything after can log.
//! 2. The physical memory window and the page frame database,
//!    from the boot protocol's memory map.
//! 3. The kernel physical map, adopting the page tables the
//!    machine booted with.
//! 4. The arenas and the slab allocator, which together become
//!    the global allocator.
//! 5. The kernel address-space map's fixed entries.
//! 6. The machine's descriptor tables: segments, per-CPU task
//!    state with the double fault stack, and the interrupt
//!    gates that route every trap into the dispatcher.
//! 7. The interrupt platform (local APIC), the vector wiring,
//!    and the scheduler.
//!
//! The [`boot`] module defines what the boot shim must hand
//! over; the [`machine`] module implements the hardware half of
//! the platform seams, descriptor tables included.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

pub mod allocator;
pub mod boot;
pub mod machine;

use boot::BootDescription;
use console::println;
use interrupts::{Frame, Ipl};
use memory::constants::{KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE};

/// Brings the core up on the bootstrap processor.
///
/// The boot shim calls this exactly once, with interrupts
/// disabled, before any other kernel facility is used.
///
/// # Safety
///
/// The boot description must be accurate: usable memory really
/// unused, the physical window really mapped, and the CPU list
/// matching the machine.
///
pub unsafe fn init(description: &BootDescription) {
    machine::serial::init();
    println!("kernel: console up");

    memory::set_physical_window(description.physical_window);
    physmem::init(description.memory_map.iter());
    physmem::debug();

    pmap::init(machine::current_page_table());
    pmap::set_machine_hooks(machine::activate_address_space, machine::invlpg);

    arena::bootstrap();
    kmem::init(KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE);
    arena::set_refill(refill_segment_descriptors);

    virtmem::init(description.kernel_phys);

    cpu::set_count(description.cpus.len().max(1));
    machine::init_platform(description.cpus);

    interrupts::register_vector(
        interrupts::VECTOR_PAGE_FAULT,
        Ipl::VM,
        page_fault_interrupt,
        0,
    );
    interrupts::register_vector(
        interrupts::VECTOR_SHOOTDOWN,
        Ipl::High,
        pmap::shootdown_interrupt,
        0,
    );

    multitasking::scheduler::init();
    multitasking::scheduler::enable_switching();

    println!("kernel: core up ({} CPUs)", cpu::count());
}

/// Brings an application processor into the core.
///
/// The boot shim runs this on each AP after [`init`] has
/// completed on the bootstrap processor.
///
pub fn init_ap(cpu_id: usize) {
    cpu::set_current(cpu_id);
    machine::init_platform_ap();
    println!("kernel: CPU {} up", cpu_id);
}

/// The page fault handler.
///
/// Kernel faults that the resolver rejects are fatal. A
/// rejected user fault would terminate the faulting process;
/// process teardown lives above the core, so it is fatal here
/// too, with the distinction recorded in the panic.
///
fn page_fault_interrupt(frame: &mut Frame, _arg: usize) {
    let addr = machine::faulting_address();
    let flags = virtmem::FaultFlags::from_bits_truncate(frame.code as u32);

    let map = multitasking::current_thread()
        .task()
        .and_then(|task| task.map());
    let result = match map {
        Some(map) => virtmem::fault(&map, addr, flags),
        None => virtmem::fault(&virtmem::KERNEL_MAP, addr, flags),
    };

    if let Err(error) = result {
        println!(
            "unhandled {} page fault at {:?}: {:?}",
            if flags.contains(virtmem::FaultFlags::USER) {
                "user"
            } else {
                "kernel"
            },
            addr,
            error
        );
        frame.dump();
        panic!("unhandled page fault at {:?}", addr);
    }
}

/// Donates a block of arena segment descriptors from the
/// heap when the static pool runs low.
///
fn refill_segment_descriptors() -> Option<&'static mut [arena::Segment]> {
    let mut block = alloc::vec::Vec::with_capacity(64);
    block.resize(64, arena::Segment::EMPTY);
    Some(alloc::vec::Vec::leak(block))
}
