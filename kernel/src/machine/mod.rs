// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The hardware half of the platform seams.
//!
//! Everything the subsystem crates reach through a hook or the
//! [`interrupts::Platform`] trait is implemented here for
//! x86-64: the interrupt priority level lives in CR8 (so the
//! hardware masks vectors whose class sits below it), address
//! spaces are switched through CR3, TLB entries die by
//! `invlpg`, and IPIs, end-of-interrupt, and the one-shot timer
//! are local-APIC registers reached through the physical
//! memory window.
//!
//! The machine also owns its descriptor tables: the [`gdt`]
//! module builds the segments and per-CPU task state (with the
//! double fault stack), and the [`idt`] module installs the
//! gate per vector whose entry thunk funnels every trap and
//! interrupt into [`interrupts::dispatch`]. Both are loaded in
//! [`init_platform`], before any handler is registered, so the
//! first exception the machine takes already lands in the
//! dispatcher.

pub mod gdt;
pub mod idt;
pub mod lapic;
pub mod serial;

use crate::boot::SmpCpu;
use core::arch::asm;
use interrupts::{Ipl, Platform};
use memory::{PhysAddr, VirtAddr};
use x86_64::registers::control::{Cr2, Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;

/// Returns the physical address of the live page table root.
///
pub fn current_page_table() -> PhysAddr {
    let (frame, _flags) = Cr3::read();
    PhysAddr::new(frame.start_address().as_u64() as usize)
}

/// Loads an address space root into CR3.
///
pub fn activate_address_space(root: PhysAddr) {
    let frame = PhysFrame::from_start_address(x86_64::PhysAddr::new(root.as_usize() as u64))
        .expect("page table root is page aligned");
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

/// Invalidates one address in the executing CPU's TLB.
///
pub fn invlpg(addr: VirtAddr) {
    unsafe {
        asm!("invlpg [{}]", in(reg) addr.as_usize(), options(nostack, preserves_flags));
    }
}

/// Returns the address whose access raised the in-service
/// page fault.
///
pub fn faulting_address() -> VirtAddr {
    VirtAddr::new(Cr2::read().as_u64() as usize)
}

fn read_cr8() -> u64 {
    let value: u64;
    unsafe {
        asm!("mov {}, cr8", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

fn write_cr8(value: u64) {
    unsafe {
        asm!("mov cr8, {}", in(reg) value, options(nomem, nostack, preserves_flags));
    }
}

/// The hardware implementation of the interrupt platform.
///
pub struct MachinePlatform;

static PLATFORM: MachinePlatform = MachinePlatform;

impl Platform for MachinePlatform {
    fn ipl(&self) -> Ipl {
        Ipl::from_raw(read_cr8() as u8)
    }

    fn set_ipl(&self, ipl: Ipl) {
        write_cr8(ipl as u64);
    }

    fn send_ipi(&self, cpu: usize, vector: u8) {
        lapic::send_ipi(lapic::lapic_id_of(cpu), vector);
    }

    fn end_of_interrupt(&self) {
        lapic::eoi();
    }

    fn timer_set(&self, nanos: u64) {
        lapic::timer_set_nanos(nanos);
    }

    fn timer_remaining(&self) -> u64 {
        lapic::timer_remaining_nanos()
    }
}

/// Brings the bootstrap processor's interrupt hardware up and
/// installs the machine platform.
///
/// The descriptor tables come first: segments, the task state
/// with its double fault stack, and the interrupt gates, so
/// that hardware traps route into the dispatcher before any
/// handler is registered on a vector.
///
pub fn init_platform(cpus: &[SmpCpu]) {
    gdt::load();
    idt::init();
    idt::load();

    lapic::record_topology(cpus);
    lapic::enable();
    lapic::calibrate_timer();
    cpu::set_id_source(lapic::current_cpu);
    interrupts::set_platform(&PLATFORM);
}

/// Brings an application processor's interrupt hardware up.
///
/// The gate table is shared; the AP loads its own descriptor
/// table copy (for its task state) and points its IDT register
/// at the table the bootstrap processor filled.
///
pub fn init_platform_ap() {
    gdt::load();
    idt::load();
    lapic::enable();
}
