// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The global descriptor table and task state segments.
//!
//! Long mode still demands a GDT for the code and data segment
//! selectors the interrupt gates name, and a task state segment
//! per CPU to hold the interrupt stack table. The one IST entry
//! in use gives the double fault handler a known-good stack, so
//! a fault taken on a corrupted stack is reported instead of
//! escalating to a triple fault.
//!
//! Each CPU loads its own copy of the table (the only
//! difference between them is the TSS descriptor) and then its
//! task register.

use core::cell::UnsafeCell;
use cpu::MAX_CPUS;
use lazy_static::lazy_static;
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// The interrupt-stack-table slot used by the double fault
/// gate.
///
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// The size of each CPU's double fault stack.
///
const DOUBLE_FAULT_STACK_SIZE: usize = 2 * 4096;

/// The double fault stacks, one per CPU.
///
/// The cell keeps the backing storage mutable from the CPU's
/// point of view without a `static mut`; only the faulting
/// CPU ever touches its own stack.
///
struct IstStacks(UnsafeCell<[[u8; DOUBLE_FAULT_STACK_SIZE]; MAX_CPUS]>);

unsafe impl Sync for IstStacks {}

static DOUBLE_FAULT_STACKS: IstStacks =
    IstStacks(UnsafeCell::new([[0; DOUBLE_FAULT_STACK_SIZE]; MAX_CPUS]));

/// The selectors a loaded table hands back.
///
struct Selectors {
    code: SegmentSelector,
    data: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static! {
    /// One task state segment per CPU, each pointing its
    /// double-fault IST entry at that CPU's private stack.
    ///
    static ref TSS: alloc::vec::Vec<TaskStateSegment> = (0..MAX_CPUS)
        .map(|id| {
            let mut tss = TaskStateSegment::new();
            let start = unsafe { (*DOUBLE_FAULT_STACKS.0.get())[id].as_ptr() as u64 };
            tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
                VirtAddr::new(start + DOUBLE_FAULT_STACK_SIZE as u64);
            tss
        })
        .collect();

    /// One descriptor table per CPU: the fixed kernel and
    /// user segments, plus that CPU's TSS.
    ///
    static ref GDT: alloc::vec::Vec<(GlobalDescriptorTable, Selectors)> = (0..MAX_CPUS)
        .map(|id| {
            let mut gdt = GlobalDescriptorTable::new();
            let code = gdt.add_entry(Descriptor::kernel_code_segment());
            let data = gdt.add_entry(Descriptor::kernel_data_segment());
            gdt.add_entry(Descriptor::user_data_segment());
            gdt.add_entry(Descriptor::user_code_segment());
            let tss = gdt.add_entry(Descriptor::tss_segment(&TSS[id]));
            (gdt, Selectors { code, data, tss })
        })
        .collect();
}

/// The selector the interrupt gates dispatch through.
///
pub fn kernel_code_selector() -> SegmentSelector {
    GDT[cpu::id()].1.code
}

/// Loads the executing CPU's descriptor table, reloads the
/// segment registers from it, and loads the task register.
///
pub fn load() {
    let (gdt, selectors) = &GDT[cpu::id()];
    gdt.load();
    unsafe {
        CS::set_reg(selectors.code);
        SS::set_reg(selectors.data);
        DS::set_reg(selectors.data);
        ES::set_reg(selectors.data);
        load_tss(selectors.tss);
    }
}
