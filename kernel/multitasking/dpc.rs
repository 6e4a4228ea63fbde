// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Deferred procedure calls.
//!
//! A DPC is a function call postponed until the interrupt
//! priority level falls below soft: interrupt handlers enqueue
//! them to get work out of the masked window. Each CPU has its
//! own FIFO of pending calls; a DPC's `bound` flag keeps it from
//! being queued twice.

use crate::{Cpu, CPUS};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use interrupts::Ipl;
use spin::lock;

/// Identifies a DPC within its CPU's table.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct DpcId(u32);

/// A registered deferred procedure.
///
struct Dpc {
    func: fn(usize),
    arg: usize,

    /// Whether the DPC is currently enqueued.
    bound: bool,
}

/// One CPU's DPC table and pending queue.
///
pub(crate) struct DpcQueue {
    slots: Vec<Dpc>,
    queue: VecDeque<DpcId>,
}

impl DpcQueue {
    pub(crate) fn new() -> DpcQueue {
        DpcQueue {
            slots: Vec::new(),
            queue: VecDeque::new(),
        }
    }
}

/// Registers a deferred procedure on a CPU.
///
pub(crate) fn dpc_new_locked(cpu: &mut Cpu, func: fn(usize), arg: usize) -> DpcId {
    cpu.dpcs.slots.push(Dpc {
        func,
        arg,
        bound: false,
    });

    DpcId((cpu.dpcs.slots.len() - 1) as u32)
}

/// Enqueues a deferred procedure, unless it is already
/// pending.
///
pub(crate) fn dpc_enqueue_locked(cpu: &mut Cpu, id: DpcId) {
    let dpc = &mut cpu.dpcs.slots[id.0 as usize];
    if dpc.bound {
        return;
    }

    dpc.bound = true;
    cpu.dpcs.queue.push_back(id);
}

/// Drains the executing CPU's DPC queue.
///
/// Each call is popped at the highest priority level and then
/// invoked at the caller's level, so a long queue never
/// extends the masked window.
///
pub fn dpcs_run() {
    loop {
        let next = {
            let ipl = interrupts::raise(Ipl::High);
            let mut cpus = lock!(CPUS);
            let id = cpu::id();
            let next = match cpus[id].dpcs.queue.pop_front() {
                Some(dpc_id) => {
                    let dpc = &mut cpus[id].dpcs.slots[dpc_id.0 as usize];
                    dpc.bound = false;
                    Some((dpc.func, dpc.arg))
                }
                None => None,
            };

            drop(cpus);
            interrupts::restore(ipl);
            next
        };

        match next {
            Some((func, arg)) => func(arg),
            None => break,
        }
    }
}
