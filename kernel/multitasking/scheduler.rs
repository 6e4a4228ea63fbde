// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The per-CPU round-robin scheduler.
//!
//! Each CPU runs the head of its own run queue, falling back to
//! its idle thread. Whenever a CPU has further runnable threads,
//! its timeslice callout is armed: on expiry it marks the CPU
//! preempted, and the interrupt-return path notices and
//! reschedules. Cross-CPU preemption works the same way through
//! the reschedule vector.
//!
//! [`reschedule`] is the single scheduling decision point: it
//! files the outgoing thread according to its state (requeue,
//! leave waiting with its timeout armed, or reap an exiting
//! thread), picks the next thread, switches address space, and
//! performs the register exchange.

use crate::callout::{callout_enqueue_locked, callout_new_locked, callout_pending_locked};
use crate::thread::{Thread, ThreadState};
use crate::waitq::arm_wait_timeout_locked;
use crate::{dpc, switch, thread_get, Cpu, CPUS, THREADS};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::ptr;
use interrupts::{Frame, Ipl};
use memory::AddrSpaceId;
use spin::lock;
use time::{Duration, NANOS_PER_MILLI};

/// Each thread runs for this long before the CPU looks for
/// another runnable thread.
///
const TIME_SLICE_NANOS: u64 = 50 * NANOS_PER_MILLI;

/// Re-exported so bring-up can arm the real register
/// exchange once thread stacks exist.
///
pub use crate::switch::enable_switching;

/// Sets up the scheduler for every CPU the platform
/// reported: idle threads, DPC queues, callout wheels, and
/// the timer and reschedule vectors.
///
/// # Panics
///
/// `init` panics if called twice.
///
pub fn init() {
    let ncpus = cpu::count();
    let mut cpus = lock!(CPUS);
    assert!(cpus.is_empty(), "scheduler initialised twice");

    for id in 0..ncpus {
        let idle = Thread::new_idle(id);
        lock!(THREADS).insert(idle.id(), idle.clone());

        cpus.push(Cpu {
            runqueue: VecDeque::new(),
            curthread: idle.id(),
            idle: idle.id(),
            dpcs: dpc::DpcQueue::new(),
            callouts: crate::callout::CalloutWheel::new(),
            resched: crate::callout::CalloutKey::NONE,
            preempted: false,
        });

        let resched = callout_new_locked(&mut cpus, id, timeslice_dpc, id);
        cpus[id].resched = resched;
    }

    drop(cpus);

    interrupts::set_dpc_drain(dpc::dpcs_run);
    interrupts::set_preempt_check(preempt_check);
    interrupts::register_vector(
        interrupts::VECTOR_TIMER,
        Ipl::Hard,
        crate::callout::callout_interrupt,
        0,
    );
    interrupts::register_vector(interrupts::VECTOR_RESCHED, Ipl::SCHED, resched_interrupt, 0);
}

/// Returns the thread executing on this CPU.
///
/// # Panics
///
/// `current_thread` panics before [`init`] has run.
///
pub fn current_thread() -> Arc<Thread> {
    let cpus = lock!(CPUS);
    assert!(!cpus.is_empty(), "scheduler not initialised");
    let id = cpus[cpu::id()].curthread;
    drop(cpus);
    thread_get(id)
}

/// The timeslice callout's deferred procedure: ask the CPU
/// to reschedule on its way out of the interrupt.
///
fn timeslice_dpc(cpu: usize) {
    let ipl = interrupts::raise(Ipl::SCHED);
    let mut cpus = lock!(CPUS);
    cpus[cpu].preempted = true;
    drop(cpus);
    interrupts::restore(ipl);
}

/// The reschedule vector's handler: set on this CPU by a
/// peer that queued work here.
///
fn resched_interrupt(_frame: &mut Frame, _arg: usize) {
    let ipl = interrupts::raise(Ipl::SCHED);
    let mut cpus = lock!(CPUS);
    let id = cpu::id();
    cpus[id].preempted = true;
    drop(cpus);
    interrupts::restore(ipl);
    interrupts::platform().end_of_interrupt();
}

/// The wait-timeout callout's deferred procedure: the wait
/// has outlasted its deadline.
///
/// Whichever of the timeout and an explicit wake runs first
/// under the scheduler lock dequeues the thread and decides
/// the wait's result; the loser finds the wait already
/// settled and does nothing.
///
pub(crate) fn wait_timeout_dpc(arg: usize) {
    let id = crate::ThreadId::from_raw(arg as u64);
    let ipl = interrupts::raise(Ipl::SCHED);
    let mut cpus = lock!(CPUS);

    let thread = {
        let threads = lock!(THREADS);
        match threads.get(&id) {
            Some(thread) => thread.clone(),
            None => {
                // The thread exited before its timeout was
                // cancelled.
                drop(threads);
                drop(cpus);
                interrupts::restore(ipl);
                return;
            }
        }
    };

    {
        let mut wait = lock!(thread.wait);
        if wait.result != crate::WaitResult::Waiting || thread.state() != ThreadState::Waiting {
            // A wake won the race.
            drop(wait);
            drop(cpus);
            interrupts::restore(ipl);
            return;
        }

        if let Some(queue) = wait.queue.take() {
            lock!(queue).waiters.retain(|waiter| *waiter != id);
        }

        wait.result = crate::WaitResult::Timeout;
    }

    thread.set_state(ThreadState::Runnable);
    let target = thread.cpu();
    if !cpus[target].runqueue.contains(&id) {
        cpus[target].runqueue.push_back(id);
    }

    drop(cpus);
    interrupts::restore(ipl);
}

/// Honours a pending preemption; the interrupt dispatch path
/// calls this once the priority level is back to passive.
///
pub fn preempt_check() {
    let ipl = interrupts::raise(Ipl::SCHED);
    let mut cpus = lock!(CPUS);
    if cpus.is_empty() {
        drop(cpus);
        interrupts::restore(ipl);
        return;
    }

    let id = cpu::id();
    let pending = cpus[id].preempted;
    cpus[id].preempted = false;
    drop(cpus);
    interrupts::restore(ipl);

    if pending {
        reschedule();
    }
}

/// Picks and switches to the next thread on this CPU.
///
/// The outgoing thread is filed by state: a running (or
/// yielding) thread goes to the tail of the run queue, a
/// waiting thread stays on its wait queue with its timeout
/// armed, and an exiting thread is reaped: dropped from the
/// thread table and its task, whose map is released with its
/// last thread.
///
pub fn reschedule() {
    let ipl = interrupts::raise(Ipl::SCHED);
    let mut cpus = lock!(CPUS);
    assert!(!cpus.is_empty(), "scheduler not initialised");
    let id = cpu::id();

    let cur_id = cpus[id].curthread;
    let cur = thread_get(cur_id);

    match cur.state() {
        ThreadState::Running | ThreadState::Runnable => {
            cur.set_state(ThreadState::Runnable);
            if cur_id != cpus[id].idle && !cpus[id].runqueue.contains(&cur_id) {
                cpus[id].runqueue.push_back(cur_id);
            }
        }
        ThreadState::Waiting => {
            // Already linked on its wait queue; just arm the
            // timeout, if one was requested.
            arm_wait_timeout_locked(&mut cpus, cur_id);
        }
        ThreadState::Exiting => {
            lock!(THREADS).remove(&cur_id);
            if let Some(task) = cur.task() {
                task.reap_thread(cur_id);
            }
        }
    }

    let next_id = cpus[id].runqueue.pop_front().unwrap_or(cpus[id].idle);
    if next_id == cur_id {
        cur.set_state(ThreadState::Running);
        drop(cpus);
        interrupts::restore(ipl);
        return;
    }

    let next = thread_get(next_id);
    cpus[id].curthread = next_id;
    next.set_state(ThreadState::Running);

    // More runnable threads behind this one: slice its time.
    let resched = cpus[id].resched;
    if !cpus[id].runqueue.is_empty() && !callout_pending_locked(&cpus, resched) {
        callout_enqueue_locked(&mut cpus, resched, TIME_SLICE_NANOS);
    }

    // Switch address space: the incoming thread's task map,
    // or the kernel's for kernel threads.
    match next.task().and_then(|task| task.map()) {
        Some(map) => virtmem::activate(&map),
        None => pmap::activate(AddrSpaceId::KERNEL),
    }

    let exiting = cur.state() == ThreadState::Exiting;
    let prev = if exiting {
        // The outgoing thread is gone; its saved state has
        // nowhere to live.
        ptr::null_mut()
    } else {
        cur.stack_pointer()
    };
    let next_sp = next.stack_pointer() as *const usize;

    drop(next);
    drop(cur);
    drop(cpus);
    interrupts::restore(ipl);

    switch::switch_to(prev, next_sp);
}

/// Voluntarily yields the CPU for one round.
///
pub fn yield_now() {
    reschedule();
}

/// Sleeps the current thread for at least `duration`.
///
/// The sleep is a timed wait on a private queue nobody ever
/// signals, so it rides the same timeout machinery as any
/// other wait.
///
pub fn sleep(duration: Duration) {
    let nanos = time::nanos(duration);
    if nanos == 0 {
        return;
    }

    let wq = crate::waitq::WaitQueue::new();
    let _ = crate::waitq::waitq_await(&wq, nanos);
}

/// Terminates the current thread.
///
/// The thread is reaped by the reschedule it never returns
/// from.
///
/// # Panics
///
/// `exit` panics if called by an idle thread.
///
pub fn exit() -> ! {
    let current = current_thread();
    {
        let cpus = lock!(CPUS);
        assert!(
            current.id() != cpus[cpu::id()].idle,
            "idle thread tried to exit"
        );
    }

    current.set_state(ThreadState::Exiting);
    drop(current);
    reschedule();
    unreachable!("exited thread was rescheduled");
}

/// Used by the test suite to pretend a thread is running on
/// this CPU without performing a register exchange.
///
#[cfg(test)]
pub(crate) fn test_set_current(id: crate::ThreadId) {
    let mut cpus = lock!(CPUS);
    let cpu = cpu::id();
    cpus[cpu].runqueue.retain(|tid| *tid != id);
    cpus[cpu].curthread = id;
    drop(cpus);
    thread_get(id).set_state(ThreadState::Running);
}
