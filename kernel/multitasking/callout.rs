// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Per-CPU timer callouts.
//!
//! Pending callouts form a *delta list*: each entry's
//! `nanosecs` field is the interval after its predecessor, so
//! the head's field is the interval until the hardware timer
//! next fires, and the absolute deadline of the k-th entry is
//! the sum of the first k fields. Arming, re-arming, and head
//! removal therefore touch only the neighbours of the affected
//! entry, and the one-shot timer is reprogrammed exactly when
//! the head changes.
//!
//! When the timer fires, [`callout_interrupt`] pops the head
//! and enqueues its deferred procedure; the DPC machinery runs
//! it once the priority level allows.

use crate::dpc::{dpc_enqueue_locked, dpc_new_locked, DpcId};
use crate::{Cpu, CPUS};
use alloc::vec::Vec;
use core::cmp::min;
use interrupts::{Frame, Ipl};
use spin::lock;

/// Identifies a callout within its CPU's wheel.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct CalloutId(u32);

/// Identifies a callout across CPUs.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct CalloutKey {
    pub(crate) cpu: usize,
    pub(crate) id: CalloutId,
}

impl CalloutKey {
    /// A key referring to no callout (idle threads carry
    /// this).
    ///
    pub(crate) const NONE: CalloutKey = CalloutKey {
        cpu: usize::MAX,
        id: CalloutId(u32::MAX),
    };
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CalloutState {
    Disabled,
    Pending,
}

/// One registered callout.
///
struct Callout {
    /// While pending: nanoseconds after the predecessor in
    /// the list (or after now, at the head).
    nanosecs: u64,

    /// The deferred procedure fired on expiry.
    dpc: DpcId,

    state: CalloutState,
}

/// One CPU's callouts and its pending delta list.
///
pub(crate) struct CalloutWheel {
    slots: Vec<Callout>,
    pending: Vec<CalloutId>,
}

impl CalloutWheel {
    pub(crate) fn new() -> CalloutWheel {
        CalloutWheel {
            slots: Vec::new(),
            pending: Vec::new(),
        }
    }

    fn callout(&self, id: CalloutId) -> &Callout {
        &self.slots[id.0 as usize]
    }

    fn callout_mut(&mut self, id: CalloutId) -> &mut Callout {
        &mut self.slots[id.0 as usize]
    }

    /// The pending deltas in list order; the test suite
    /// checks the delta-sum property through this.
    ///
    #[cfg(test)]
    pub(crate) fn pending_deltas(&self) -> Vec<u64> {
        self.pending
            .iter()
            .map(|id| self.callout(*id).nanosecs)
            .collect()
    }

    /// The pending callout ids, for test teardown.
    ///
    #[cfg(test)]
    pub(crate) fn pending_ids(&self) -> Vec<CalloutId> {
        self.pending.clone()
    }
}

/// Registers a callout on a CPU, firing `func(arg)` as a DPC
/// on expiry.
///
pub(crate) fn callout_new_locked(
    cpus: &mut Vec<Cpu>,
    cpu: usize,
    func: fn(usize),
    arg: usize,
) -> CalloutKey {
    let dpc = dpc_new_locked(&mut cpus[cpu], func, arg);
    let wheel = &mut cpus[cpu].callouts;
    wheel.slots.push(Callout {
        nanosecs: 0,
        dpc,
        state: CalloutState::Disabled,
    });

    CalloutKey {
        cpu,
        id: CalloutId((wheel.slots.len() - 1) as u32),
    }
}

/// Returns whether a callout is pending.
///
pub(crate) fn callout_pending_locked(cpus: &Vec<Cpu>, key: CalloutKey) -> bool {
    if key.cpu == usize::MAX {
        return false;
    }

    cpus[key.cpu].callouts.callout(key.id).state == CalloutState::Pending
}

/// Enqueues a callout to fire after `nanos` nanoseconds.
///
/// Must be called with the scheduler lock held and is only
/// meaningful for the executing CPU's wheel, whose hardware
/// timer can be read and reprogrammed.
///
/// # Panics
///
/// Enqueueing an already-pending callout is fatal.
///
pub(crate) fn callout_enqueue_locked(cpus: &mut Vec<Cpu>, key: CalloutKey, nanos: u64) {
    assert!(nanos > 0);
    let platform = interrupts::platform();
    let local = key.cpu == cpu::id();
    let wheel = &mut cpus[key.cpu].callouts;
    assert!(
        wheel.callout(key.id).state == CalloutState::Disabled,
        "callout enqueued twice"
    );

    if wheel.pending.is_empty() {
        let callout = wheel.callout_mut(key.id);
        callout.nanosecs = nanos;
        callout.state = CalloutState::Pending;
        wheel.pending.push(key.id);
        if local {
            platform.timer_set(nanos);
        }

        return;
    }

    // The hardware may have counted part of the head's
    // interval down already (and on some machines reads can
    // overshoot); clamp the head to what actually remains.
    if local {
        let head = wheel.pending[0];
        let remaining = platform.timer_remaining();
        let head = wheel.callout_mut(head);
        head.nanosecs = min(head.nanosecs, remaining);
    }

    // Walk forward, discounting each predecessor's interval,
    // until the newcomer sorts before the next entry.
    let mut residual = nanos;
    let mut index = 0;
    while index < wheel.pending.len() {
        let delta = wheel.callout(wheel.pending[index]).nanosecs;
        if delta > residual {
            break;
        }

        residual -= delta;
        index += 1;
    }

    {
        let callout = wheel.callout_mut(key.id);
        callout.nanosecs = residual;
        callout.state = CalloutState::Pending;
    }
    wheel.pending.insert(index, key.id);

    // The successor is now that much closer to its
    // predecessor.
    if index + 1 < wheel.pending.len() {
        let successor = wheel.pending[index + 1];
        wheel.callout_mut(successor).nanosecs -= residual;
    }

    if index == 0 && local {
        platform.timer_set(residual);
    }
}

/// Removes a pending callout; a no-op if it is not pending.
///
pub(crate) fn callout_dequeue_locked(cpus: &mut Vec<Cpu>, key: CalloutKey) {
    if key.cpu == usize::MAX {
        return;
    }

    let platform = interrupts::platform();
    let local = key.cpu == cpu::id();
    let wheel = &mut cpus[key.cpu].callouts;
    if wheel.callout(key.id).state != CalloutState::Pending {
        return;
    }

    let position = wheel
        .pending
        .iter()
        .position(|id| *id == key.id)
        .expect("pending callout missing from its list");

    wheel.pending.remove(position);
    let residual = if position == 0 && local {
        // The timer has been counting the head down; what
        // remains is the removed entry's true residual.
        platform.timer_remaining()
    } else {
        wheel.callout(key.id).nanosecs
    };

    wheel.callout_mut(key.id).state = CalloutState::Disabled;

    if let Some(successor) = wheel.pending.get(position).copied() {
        wheel.callout_mut(successor).nanosecs += residual;
        if position == 0 && local {
            let head = wheel.callout(successor).nanosecs;
            platform.timer_set(head);
        }
    } else if position == 0 && local {
        platform.timer_set(0);
    }
}

/// The timer vector's handler: fires the head callout.
///
/// The head is popped, its deferred procedure queued, and the
/// timer re-armed for the new head. A fire with nothing
/// pending (possible after a cross-CPU dequeue raced the
/// hardware) is ignored.
///
pub fn callout_interrupt(_frame: &mut Frame, _arg: usize) {
    let platform = interrupts::platform();
    let ipl = interrupts::raise(Ipl::SCHED);
    {
        let mut cpus = lock!(CPUS);
        let id = cpu::id();
        let cpu = &mut cpus[id];
        if let Some(head) = cpu.callouts.pending.first().copied() {
            cpu.callouts.pending.remove(0);
            cpu.callouts.callout_mut(head).state = CalloutState::Disabled;
            let dpc = cpu.callouts.callout(head).dpc;
            dpc_enqueue_locked(cpu, dpc);

            if let Some(next) = cpu.callouts.pending.first().copied() {
                let nanos = cpu.callouts.callout(next).nanosecs;
                platform.timer_set(nanos);
            }
        }
    }

    interrupts::restore(ipl);
    platform.end_of_interrupt();
}
