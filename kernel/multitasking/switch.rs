// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The context switch: saving one thread's registers and
//! restoring another's.
//!
//! The exchange itself is a stack switch: callee-saved
//! registers and flags go onto the outgoing thread's stack,
//! the stack pointers swap, and the incoming thread's are
//! popped back off. A thread's first run restores a frame
//! synthesised at creation whose return address is
//! `start_thread`, so first runs and re-runs share one path.
//!
//! Switching starts disabled: until the kernel's bring-up
//! calls [`enable_switching`], the scheduler moves all of its
//! state but stays on the caller's stack. That is also how the
//! test suite drives the scheduler from an ordinary process.

use core::arch::global_asm;
use core::sync::atomic::{AtomicBool, Ordering};

global_asm!(
    ".global switch_stack",
    "switch_stack:",
    "pushfq",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "popfq",
    "ret",
    ".global start_thread",
    "start_thread:",
    "pop rax",
    "pop rdi",
    "sti",
    "call rax",
    "call thread_exit_landing",
);

extern "sysv64" {
    /// Implemented above: saves the current register state
    /// through `prev` and resumes from `next`.
    ///
    fn switch_stack(prev: *mut usize, next: *const usize);

    /// Implemented above: the landing point for a thread's
    /// first run. Pops the entry point and argument from the
    /// synthesised frame, enables interrupts, and calls in.
    ///
    fn start_thread() -> !;
}

/// A thread entry function returned; the thread is done.
///
#[no_mangle]
extern "C" fn thread_exit_landing() -> ! {
    crate::scheduler::exit();
}

/// Whether the register exchange is live.
///
static ENABLED: AtomicBool = AtomicBool::new(false);

/// Arms the real context switch.
///
/// Called once by kernel bring-up, after the first thread
/// stacks exist.
///
pub fn enable_switching() {
    ENABLED.store(true, Ordering::SeqCst);
}

/// The address new threads return into on their first run.
///
pub(crate) fn start_thread_address() -> u64 {
    start_thread as usize as u64
}

/// Performs the register exchange, if switching is live.
///
/// `prev` may be null when the outgoing thread is exiting and
/// its stack is already gone; the outgoing state is then
/// discarded.
///
pub(crate) fn switch_to(prev: *mut usize, next: *const usize) {
    if !ENABLED.load(Ordering::SeqCst) {
        return;
    }

    let mut discard: usize = 0;
    let prev = if prev.is_null() {
        &mut discard as *mut usize
    } else {
        prev
    };
    unsafe { switch_stack(prev, next) };
}
