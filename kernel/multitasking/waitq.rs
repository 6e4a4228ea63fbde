// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Wait queues: the one place a thread suspends.
//!
//! A thread that must wait links itself onto a queue, marks
//! itself waiting, and reschedules away; it resumes when
//! [`waitq_wake_one`] pops it or its timeout callout fires,
//! whichever wins. Both paths run under the scheduler lock, so
//! the loser of the race finds the thread already gone and does
//! nothing.

use crate::callout::{callout_dequeue_locked, callout_enqueue_locked};
use crate::thread::ThreadState;
use crate::{scheduler, thread_get, ThreadId, CPUS};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use interrupts::Ipl;
use spin::lock;

/// The outcome of a wait.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitResult {
    /// Still waiting (the initial state; also what a wait
    /// returns on a machine that cannot suspend, such as the
    /// software platform the tests run on).
    Waiting,

    /// Woken by [`waitq_wake_one`].
    Success,

    /// The timeout elapsed first.
    Timeout,

    /// Unblocked without the queue being signalled (an
    /// explicit resume of the waiting thread).
    Interrupted,
}

pub(crate) struct WaitqInner {
    pub(crate) waiters: VecDeque<ThreadId>,
}

pub(crate) type WaitqShared = Arc<spin::Mutex<WaitqInner>>;

/// A queue of threads awaiting an event.
///
pub struct WaitQueue {
    pub(crate) inner: WaitqShared,
}

impl WaitQueue {
    /// Creates an empty wait queue.
    ///
    pub fn new() -> WaitQueue {
        WaitQueue {
            inner: Arc::new(spin::Mutex::new(WaitqInner {
                waiters: VecDeque::new(),
            })),
        }
    }

    /// The number of threads currently waiting.
    ///
    pub fn waiters(&self) -> usize {
        lock!(self.inner).waiters.len()
    }
}

impl Default for WaitQueue {
    fn default() -> WaitQueue {
        WaitQueue::new()
    }
}

/// Suspends the current thread on a queue.
///
/// With `nanos` nonzero, the wait gives up after that long;
/// the timeout rides the same per-CPU callout wheel as every
/// other timer, armed when the thread reschedules away.
///
/// # Panics
///
/// `waitq_await` panics if called above the passive
/// interrupt priority level: a raised level means the caller
/// cannot tolerate suspension.
///
pub fn waitq_await(wq: &WaitQueue, nanos: u64) -> WaitResult {
    interrupts::assert_ipl_at_most(Ipl::Passive);
    let current = scheduler::current_thread();

    let ipl = interrupts::raise(Ipl::High);
    {
        let cpus = lock!(CPUS);
        lock!(wq.inner).waiters.push_back(current.id());
        let mut wait = lock!(current.wait);
        wait.queue = Some(wq.inner.clone());
        wait.result = WaitResult::Waiting;
        wait.timeout_nanos = nanos;
        current.set_state(ThreadState::Waiting);
        drop(cpus);
    }
    interrupts::restore(ipl);

    // The reschedule arms the timeout and switches away; we
    // resume here once woken.
    scheduler::reschedule();

    let result = lock!(current.wait).result;
    result
}

/// Wakes the longest-waiting thread on a queue.
///
/// The woken thread's timeout callout is cancelled, its wait
/// result set to success, and it is placed on its CPU's run
/// queue. Returns how many threads were woken (zero or one).
///
pub fn waitq_wake_one(wq: &WaitQueue) -> usize {
    let ipl = interrupts::raise(Ipl::High);
    let mut cpus = lock!(CPUS);

    let id = match lock!(wq.inner).waiters.pop_front() {
        Some(id) => id,
        None => {
            drop(cpus);
            interrupts::restore(ipl);
            return 0;
        }
    };

    let thread = thread_get(id);
    {
        let mut wait = lock!(thread.wait);
        wait.queue = None;
        wait.result = WaitResult::Success;
    }

    let timeout = thread.timeout_key();
    callout_dequeue_locked(&mut cpus, timeout);
    thread.set_state(ThreadState::Runnable);
    let target = thread.cpu();
    if !cpus[target].runqueue.contains(&id) {
        cpus[target].runqueue.push_back(id);
    }

    drop(cpus);
    interrupts::restore(ipl);
    1
}

/// Arms the waiting thread's timeout, if it asked for one.
///
/// Called by the scheduler, under its lock, as the thread is
/// switched away.
///
pub(crate) fn arm_wait_timeout_locked(cpus: &mut alloc::vec::Vec<crate::Cpu>, id: ThreadId) {
    let thread = thread_get(id);
    let nanos = lock!(thread.wait).timeout_nanos;
    let timeout = thread.timeout_key();
    if nanos > 0 && !crate::callout::callout_pending_locked(cpus, timeout) {
        callout_enqueue_locked(cpus, timeout, nanos);
    }
}
