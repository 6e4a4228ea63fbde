// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The interrupt descriptor table and the entry thunks.
//!
//! Every one of the 256 vectors gets a 16-byte thunk in one
//! contiguous, stride-addressed block: it normalises the error
//! code (the CPU pushes one only for a handful of exceptions),
//! records the vector number, and falls into a common stub that
//! saves the general-purpose registers. The saved block plus
//! the hardware frame is exactly [`interrupts::Frame`], which
//! the stub hands to [`interrupts::dispatch`] along with the
//! vector; the return path restores the registers and `iretq`s.
//!
//! The gate entries themselves are built by hand rather than
//! through typed handler signatures, so the table works with
//! the one frame layout every interrupt path here shares. The
//! double fault gate runs on its IST stack (see
//! [`gdt::DOUBLE_FAULT_IST_INDEX`](super::gdt::DOUBLE_FAULT_IST_INDEX)),
//! which keeps a fault on a bad stack diagnosable.
//!
//! [`init`] fills the table once on the bootstrap processor;
//! [`load`] points the executing CPU at it.

use super::gdt;
use core::arch::global_asm;
use core::cell::UnsafeCell;
use core::mem;
use interrupts::Frame;
use x86_64::instructions::tables::lidt;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

/// Entry thunks are laid out at this fixed stride, so the
/// thunk for vector `n` sits at `interrupt_thunks + n * 16`.
///
const THUNK_STRIDE: usize = 16;

/// An interrupt gate: present, DPL 0.
///
const INTERRUPT_GATE: u8 = 0x8e;

/// The double fault exception vector.
///
const DOUBLE_FAULT_VECTOR: usize = 8;

// The entry thunks. Vectors 8, 10-14, 17, 21, 29, and 30
// arrive with a CPU-pushed error code; every other thunk
// pushes a zero in its place so the frame layout is uniform.
// The common stub completes the frame and calls in.
global_asm!(
    ".p2align 4",
    ".global interrupt_thunks",
    "interrupt_thunks:",
    ".irp vec, 0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31,32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47,48,49,50,51,52,53,54,55,56,57,58,59,60,61,62,63",
    ".p2align 4",
    ".if (\\vec == 8) || (\\vec == 10) || (\\vec == 11) || (\\vec == 12) || (\\vec == 13) || (\\vec == 14) || (\\vec == 17) || (\\vec == 21) || (\\vec == 29) || (\\vec == 30)",
    ".else",
    "push 0",
    ".endif",
    "push \\vec",
    "jmp interrupt_common",
    ".endr",
    // No vector above 63 carries an error code.
    ".irp vec, 64,65,66,67,68,69,70,71,72,73,74,75,76,77,78,79,80,81,82,83,84,85,86,87,88,89,90,91,92,93,94,95,96,97,98,99,100,101,102,103,104,105,106,107,108,109,110,111,112,113,114,115,116,117,118,119,120,121,122,123,124,125,126,127",
    ".p2align 4",
    "push 0",
    "push \\vec",
    "jmp interrupt_common",
    ".endr",
    ".irp vec, 128,129,130,131,132,133,134,135,136,137,138,139,140,141,142,143,144,145,146,147,148,149,150,151,152,153,154,155,156,157,158,159,160,161,162,163,164,165,166,167,168,169,170,171,172,173,174,175,176,177,178,179,180,181,182,183,184,185,186,187,188,189,190,191",
    ".p2align 4",
    "push 0",
    "push \\vec",
    "jmp interrupt_common",
    ".endr",
    ".irp vec, 192,193,194,195,196,197,198,199,200,201,202,203,204,205,206,207,208,209,210,211,212,213,214,215,216,217,218,219,220,221,222,223,224,225,226,227,228,229,230,231,232,233,234,235,236,237,238,239,240,241,242,243,244,245,246,247,248,249,250,251,252,253,254,255",
    ".p2align 4",
    "push 0",
    "push \\vec",
    "jmp interrupt_common",
    ".endr",
    // The common entry path: complete the frame and call the
    // dispatcher with (frame, vector). Interrupt gates enter
    // with interrupts masked; iretq restores the interrupted
    // context's flags.
    ".p2align 4",
    "interrupt_common:",
    "push rax",
    "push rbx",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push rbp",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov rdi, rsp",
    "mov rsi, [rsp + 120]",
    "cld",
    "call interrupt_entry",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rbp",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rbx",
    "pop rax",
    "add rsp, 16",
    "iretq",
);

extern "C" {
    /// The base of the thunk block defined above.
    ///
    #[link_name = "interrupt_thunks"]
    static INTERRUPT_THUNKS: u8;
}

/// The landing point the common stub calls: hand the saved
/// frame to the dispatcher.
///
#[no_mangle]
extern "C" fn interrupt_entry(frame: *mut Frame, vector: usize) {
    unsafe { interrupts::dispatch(&mut *frame, vector) };
}

/// One gate of the interrupt descriptor table.
///
#[repr(C)]
#[derive(Clone, Copy)]
struct IdtEntry {
    isr_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    isr_mid: u16,
    isr_high: u32,
    zero: u32,
}

impl IdtEntry {
    const MISSING: IdtEntry = IdtEntry {
        isr_low: 0,
        selector: 0,
        ist: 0,
        type_attr: 0,
        isr_mid: 0,
        isr_high: 0,
        zero: 0,
    };
}

/// The table itself. Written once by [`init`] on the
/// bootstrap processor, then read-only.
///
struct IdtTable(UnsafeCell<[IdtEntry; 256]>);

unsafe impl Sync for IdtTable {}

static IDT: IdtTable = IdtTable(UnsafeCell::new([IdtEntry::MISSING; 256]));

/// Fills every gate with its thunk.
///
/// Runs once, on the bootstrap processor, after the GDT is
/// loaded (the gates name its kernel code selector).
///
pub fn init() {
    let selector = gdt::kernel_code_selector().0;
    let base = unsafe { &INTERRUPT_THUNKS as *const u8 as usize };

    for vector in 0..256 {
        let thunk = (base + vector * THUNK_STRIDE) as u64;
        let ist = if vector == DOUBLE_FAULT_VECTOR {
            gdt::DOUBLE_FAULT_IST_INDEX as u8 + 1
        } else {
            0
        };

        unsafe {
            (*IDT.0.get())[vector] = IdtEntry {
                isr_low: thunk as u16,
                selector,
                ist,
                type_attr: INTERRUPT_GATE,
                isr_mid: (thunk >> 16) as u16,
                isr_high: (thunk >> 32) as u32,
                zero: 0,
            };
        }
    }
}

/// Points the executing CPU's IDT register at the table.
///
pub fn load() {
    let pointer = DescriptorTablePointer {
        limit: (mem::size_of::<[IdtEntry; 256]>() - 1) as u16,
        base: VirtAddr::new(IDT.0.get() as usize as u64),
    };

    unsafe { lidt(&pointer) };
}
