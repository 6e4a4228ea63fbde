// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use console::println;

/// The registers saved on interrupt entry.
///
/// Every vector's entry thunk records its vector number,
/// normalises the error code (pushing a zero on vectors the
/// CPU gives none), and pushes the general-purpose registers
/// on top of the hardware frame, producing this layout. The
/// same layout carries a thread's registers across a context
/// switch, so on-CPU yields, cross-CPU preemptions, and
/// first runs all restore through one format.
///
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Frame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    /// The vector number, recorded by the entry thunk.
    pub vector: u64,

    /// The error code pushed by the CPU, or zero for
    /// vectors without one.
    pub code: u64,

    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Frame {
    /// A frame with every register zeroed.
    ///
    pub const ZERO: Frame = Frame {
        r15: 0,
        r14: 0,
        r13: 0,
        r12: 0,
        r11: 0,
        r10: 0,
        r9: 0,
        r8: 0,
        rbp: 0,
        rdi: 0,
        rsi: 0,
        rdx: 0,
        rcx: 0,
        rbx: 0,
        rax: 0,
        vector: 0,
        code: 0,
        rip: 0,
        cs: 0,
        rflags: 0,
        rsp: 0,
        ss: 0,
    };

    /// Prints the saved registers.
    ///
    /// Symbolisation of the return address belongs to the
    /// module loader, so only raw addresses are printed.
    ///
    pub fn dump(&self) {
        println!(
            "vector={} rip={:#018x} rsp={:#018x} rflags={:#010x} code={:#x}",
            self.vector, self.rip, self.rsp, self.rflags, self.code
        );
        println!(
            "rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
            self.rax, self.rbx, self.rcx, self.rdx
        );
        println!(
            "rsi={:#018x} rdi={:#018x} rbp={:#018x} r8 ={:#018x}",
            self.rsi, self.rdi, self.rbp, self.r8
        );
        println!(
            "r9 ={:#018x} r10={:#018x} r11={:#018x} r12={:#018x}",
            self.r9, self.r10, self.r11, self.r12
        );
        println!(
            "r13={:#018x} r14={:#018x} r15={:#018x}",
            self.r13, self.r14, self.r15
        );
    }
}
