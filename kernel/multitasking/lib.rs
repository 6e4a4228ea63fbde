// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Preemptive multitasking: threads, the per-CPU scheduler, and
//! the timer and deferred-procedure machinery it rides on.
//!
//! ## Structure
//!
//! Each CPU owns a run queue, a queue of pending deferred
//! procedure calls, and a delta-list of pending timer callouts.
//! All of that per-CPU state lives under one scheduler lock, held
//! across every state change below.
//!
//! - [`callout`]: timers, expressed as nanosecond offsets from
//!   their predecessor in the per-CPU list. The head's offset is
//!   what the one-shot hardware timer is armed with.
//! - [`dpc`]: deferred procedure calls, run when the interrupt
//!   priority level drops below soft. A callout fires by
//!   enqueueing its DPC.
//! - [`scheduler`]: round-robin run queues, a 50 ms timeslice
//!   armed whenever a CPU has more than one runnable thread, and
//!   preemption driven through the reschedule interrupt vector.
//! - [`waitq`] and [`sync`]: wait queues with optional nanosecond
//!   timeouts, and the sleeping mutex built on top of them.
//!
//! ## Suspension
//!
//! The only place a thread suspends is [`waitq::waitq_await`];
//! timed sleep ([`scheduler::sleep`]) and mutex contention route
//! through it. Everything else, including interrupt handlers and
//! DPCs, runs to completion.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

pub mod callout;
pub mod dpc;
pub mod scheduler;
mod switch;
pub mod sync;
mod thread;
pub mod waitq;

pub use scheduler::{current_thread, exit, preempt_check, reschedule, sleep};
pub use sync::Mutex;
pub use thread::{thread_new, thread_resume, Task, Thread, ThreadId, ThreadState};
pub use waitq::{waitq_await, waitq_wake_one, WaitQueue, WaitResult};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::lock;

/// The per-CPU scheduler state.
///
pub(crate) struct Cpu {
    /// Runnable threads, scheduled round-robin.
    pub(crate) runqueue: alloc::collections::VecDeque<ThreadId>,

    /// The running thread.
    pub(crate) curthread: ThreadId,

    /// The thread run when nothing else is runnable.
    pub(crate) idle: ThreadId,

    /// Pending deferred procedure calls.
    pub(crate) dpcs: dpc::DpcQueue,

    /// Pending timer callouts, as a delta list.
    pub(crate) callouts: callout::CalloutWheel,

    /// The timeslice callout, firing the reschedule DPC.
    pub(crate) resched: callout::CalloutKey,

    /// Set when this CPU must reschedule on its way out of
    /// an interrupt.
    pub(crate) preempted: bool,
}

lazy_static! {
    /// The scheduler lock and the per-CPU state it guards.
    ///
    pub(crate) static ref CPUS: spin::Mutex<Vec<Cpu>> = spin::Mutex::new(Vec::new());

    /// Every live thread, including each CPU's idle thread.
    ///
    pub(crate) static ref THREADS: spin::Mutex<BTreeMap<ThreadId, Arc<Thread>>> =
        spin::Mutex::new(BTreeMap::new());
}

/// Looks a thread up by id.
///
/// # Panics
///
/// Panics if the thread does not exist; callers hold ids of
/// live threads.
///
pub(crate) fn thread_get(id: ThreadId) -> Arc<Thread> {
    lock!(THREADS).get(&id).expect("stale thread id").clone()
}

/// Prints every thread and its scheduling state.
///
pub fn debug() {
    let threads = lock!(THREADS);
    for thread in threads.values() {
        console::println!(
            "thread {} ({}): {:?}",
            thread.id().as_u64(),
            thread.name(),
            thread.state()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use crate::thread::ThreadState;
    use bootloader::bootinfo::{FrameRange, MemoryRegion, MemoryRegionType};
    use interrupts::{Platform, SoftPlatform};
    use memory::{VirtAddr, PAGE_SIZE};
    use physmem::PageQueueKind;
    use std::boxed::Box;
    use std::string::String;
    use std::vec;
    use std::vec::Vec as StdVec;
    use time::NANOS_PER_MILLI;

    static MACHINE: std::sync::Mutex<()> = std::sync::Mutex::new(());
    static BOOTED: std::sync::Once = std::sync::Once::new();
    static PLATFORM: spin::Once<&'static SoftPlatform> = spin::Once::new();

    fn boot() -> &'static SoftPlatform {
        BOOTED.call_once(|| {
            let buffer: &'static mut [u8] = StdVec::leak(vec![0_u8; 4097 * PAGE_SIZE]);
            let base = (buffer.as_ptr() as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            let region = MemoryRegion {
                range: FrameRange::new(base as u64, (base + 4096 * PAGE_SIZE) as u64),
                region_type: MemoryRegionType::Usable,
            };
            unsafe { physmem::init([region].iter()) };

            let platform: &'static SoftPlatform = Box::leak(Box::new(SoftPlatform::new(2)));
            interrupts::set_platform(platform);

            arena::bootstrap();
            let root = physmem::page_alloc(true, PageQueueKind::Pmap).unwrap();
            pmap::init(physmem::page_addr(root));

            let heap: &'static mut [u8] = StdVec::leak(vec![0_u8; 1025 * PAGE_SIZE]);
            let heap_base = (heap.as_ptr() as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            kmem::init(VirtAddr::new(heap_base), 1024 * PAGE_SIZE);

            scheduler::init();
            PLATFORM.init(platform);
        });

        PLATFORM.get().unwrap()
    }

    /// A do-nothing thread body for test threads, which are
    /// never actually switched to.
    ///
    fn thread_body(_arg: usize) {}

    /// Returns the scheduler to a quiet state: empty run
    /// queues, no pending callouts, idle threads current.
    ///
    fn quiesce(platform: &SoftPlatform) {
        let mut stale = StdVec::new();
        {
            let mut cpus = lock!(CPUS);
            for id in 0..cpus.len() {
                stale.extend(cpus[id].runqueue.drain(..));
                cpus[id].preempted = false;
                cpus[id].curthread = cpus[id].idle;
            }
        }

        // Retire any threads the test left behind, then
        // disarm the timers.
        {
            let mut threads = lock!(THREADS);
            for id in stale {
                threads.remove(&id);
            }
        }

        let home = cpu::id();
        for id in 0..cpu::count() {
            cpu::set_current(id);
            let mut cpus = lock!(CPUS);
            let pending: StdVec<callout::CalloutKey> = cpus[id]
                .callouts
                .pending_ids()
                .into_iter()
                .map(|slot| callout::CalloutKey { cpu: id, id: slot })
                .collect();
            for key in pending {
                callout::callout_dequeue_locked(&mut cpus, key);
            }

            let idle = cpus[id].idle;
            cpus[id].curthread = idle;
            drop(cpus);
            platform.timer_set(0);
            thread_get(idle).set_state(ThreadState::Runnable);
        }
        cpu::set_current(home);
    }

    #[test]
    fn test_callout_delta_list() {
        let _machine = MACHINE.lock().unwrap();
        let platform = boot();
        quiesce(platform);

        static FIRED: spin::Mutex<StdVec<usize>> = spin::Mutex::new(StdVec::new());
        fn record(arg: usize) {
            lock!(FIRED).push(arg);
        }
        lock!(FIRED).clear();

        // Three timers, enqueued longest-first.
        let (a, b, _c) = {
            let mut cpus = lock!(CPUS);
            let a = callout::callout_new_locked(&mut cpus, 0, record, 30);
            let b = callout::callout_new_locked(&mut cpus, 0, record, 20);
            let c = callout::callout_new_locked(&mut cpus, 0, record, 10);
            callout::callout_enqueue_locked(&mut cpus, a, 30 * NANOS_PER_MILLI);
            callout::callout_enqueue_locked(&mut cpus, b, 20 * NANOS_PER_MILLI);
            callout::callout_enqueue_locked(&mut cpus, c, 10 * NANOS_PER_MILLI);
            (a, b, c)
        };

        // The deltas encode distance-from-predecessor, so
        // three absolute deadlines 10 ms apart become three
        // equal intervals, and the timer is armed for the
        // head.
        {
            let cpus = lock!(CPUS);
            assert_eq!(
                cpus[0].callouts.pending_deltas(),
                std::vec![10 * NANOS_PER_MILLI, 10 * NANOS_PER_MILLI, 10 * NANOS_PER_MILLI]
            );
        }
        assert_eq!(platform.timer_remaining(), 10 * NANOS_PER_MILLI);

        // Run the clock forward; the callouts fire in
        // deadline order, not arrival order.
        platform.advance(50 * NANOS_PER_MILLI);
        assert_eq!(lock!(FIRED).clone(), std::vec![10, 20, 30]);

        // Dequeueing the head restores its residual to the
        // successor.
        {
            let mut cpus = lock!(CPUS);
            callout::callout_enqueue_locked(&mut cpus, a, 30 * NANOS_PER_MILLI);
            callout::callout_enqueue_locked(&mut cpus, b, 20 * NANOS_PER_MILLI);
            assert_eq!(
                cpus[0].callouts.pending_deltas(),
                std::vec![20 * NANOS_PER_MILLI, 10 * NANOS_PER_MILLI]
            );

            callout::callout_dequeue_locked(&mut cpus, b);
            assert_eq!(
                cpus[0].callouts.pending_deltas(),
                std::vec![30 * NANOS_PER_MILLI]
            );

            callout::callout_dequeue_locked(&mut cpus, a);
            assert!(cpus[0].callouts.pending_deltas().is_empty());
        }
        assert_eq!(platform.timer_remaining(), 0);

        quiesce(platform);
    }

    #[test]
    fn test_wait_then_wake() {
        let _machine = MACHINE.lock().unwrap();
        let platform = boot();
        quiesce(platform);

        let tid = thread_new(None, String::from("waiter"), thread_body, 0);
        {
            // Bind to CPU 0 regardless of round-robin.
            let thread = thread_get(tid);
            thread.set_cpu_for_test(0);
        }
        scheduler::test_set_current(tid);

        let wq = WaitQueue::new();
        let result = waitq_await(&wq, 5 * NANOS_PER_MILLI);
        assert_eq!(result, WaitResult::Waiting);

        // The thread is parked with its timeout armed: the
        // callout is pending exactly while the thread waits
        // with a nonzero timeout.
        let thread = thread_get(tid);
        assert_eq!(thread.state(), ThreadState::Waiting);
        assert_eq!(wq.waiters(), 1);
        {
            let cpus = lock!(CPUS);
            assert!(callout::callout_pending_locked(&cpus, thread.timeout_key()));
        }

        // Waking cancels the timeout and requeues the
        // thread.
        assert_eq!(waitq_wake_one(&wq), 1);
        assert_eq!(thread.state(), ThreadState::Runnable);
        assert_eq!(wq.waiters(), 0);
        assert_eq!(lock!(thread.wait).result, WaitResult::Success);
        {
            let cpus = lock!(CPUS);
            assert!(!callout::callout_pending_locked(&cpus, thread.timeout_key()));
            assert!(cpus[0].runqueue.contains(&tid));
        }

        // Waking an empty queue is a no-op.
        assert_eq!(waitq_wake_one(&wq), 0);

        // Time passing must not fire the cancelled timeout.
        platform.advance(10 * NANOS_PER_MILLI);
        assert_eq!(lock!(thread.wait).result, WaitResult::Success);

        quiesce(platform);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let _machine = MACHINE.lock().unwrap();
        let platform = boot();
        quiesce(platform);

        let tid = thread_new(None, String::from("sleeper"), thread_body, 0);
        thread_get(tid).set_cpu_for_test(0);
        scheduler::test_set_current(tid);

        let wq = WaitQueue::new();
        waitq_await(&wq, 5 * NANOS_PER_MILLI);

        platform.advance(6 * NANOS_PER_MILLI);

        // The timeout won: dequeued from the wait queue,
        // result recorded, runnable again.
        let thread = thread_get(tid);
        assert_eq!(lock!(thread.wait).result, WaitResult::Timeout);
        assert_eq!(thread.state(), ThreadState::Runnable);
        assert_eq!(wq.waiters(), 0);
        {
            let cpus = lock!(CPUS);
            assert!(cpus[0].runqueue.contains(&tid));
        }

        quiesce(platform);
    }

    #[test]
    fn test_resume_interrupts_wait() {
        let _machine = MACHINE.lock().unwrap();
        let platform = boot();
        quiesce(platform);

        let tid = thread_new(None, String::from("interrupted"), thread_body, 0);
        thread_get(tid).set_cpu_for_test(0);
        scheduler::test_set_current(tid);

        let wq = WaitQueue::new();
        waitq_await(&wq, 5 * NANOS_PER_MILLI);

        // An explicit resume unblocks the waiter without the
        // queue being signalled.
        thread_resume(tid);
        let thread = thread_get(tid);
        assert_eq!(lock!(thread.wait).result, WaitResult::Interrupted);
        assert_eq!(thread.state(), ThreadState::Runnable);
        assert_eq!(wq.waiters(), 0);
        {
            let cpus = lock!(CPUS);
            assert!(!callout::callout_pending_locked(&cpus, thread.timeout_key()));
        }

        quiesce(platform);
    }

    #[test]
    fn test_round_robin_and_timeslice() {
        let _machine = MACHINE.lock().unwrap();
        let platform = boot();
        quiesce(platform);

        let t1 = thread_new(None, String::from("rr-1"), thread_body, 0);
        let t2 = thread_new(None, String::from("rr-2"), thread_body, 0);
        thread_get(t1).set_cpu_for_test(0);
        thread_get(t2).set_cpu_for_test(0);
        thread_resume(t1);
        thread_resume(t2);

        // First pick: FIFO order, and with another thread
        // still queued the timeslice callout is armed.
        reschedule();
        {
            let cpus = lock!(CPUS);
            assert_eq!(cpus[0].curthread, t1);
            assert!(callout::callout_pending_locked(&cpus, cpus[0].resched));
        }
        assert_eq!(thread_get(t1).state(), ThreadState::Running);

        // A voluntary yield rotates the queue.
        reschedule();
        {
            let cpus = lock!(CPUS);
            assert_eq!(cpus[0].curthread, t2);
            assert!(cpus[0].runqueue.contains(&t1));
        }
        assert_eq!(thread_get(t1).state(), ThreadState::Runnable);
        assert_eq!(thread_get(t2).state(), ThreadState::Running);

        // Timeslice expiry: the timer fires the reschedule
        // DPC, which marks the CPU preempted; the interrupt
        // return path then rotates to the next thread.
        platform.advance(50 * NANOS_PER_MILLI);
        {
            let cpus = lock!(CPUS);
            assert_eq!(cpus[0].curthread, t1);
            assert!(!cpus[0].preempted);
        }

        // A cross-CPU reschedule IPI does the same.
        platform.send_ipi(0, interrupts::VECTOR_RESCHED);
        {
            let cpus = lock!(CPUS);
            assert_eq!(cpus[0].curthread, t2);
        }

        quiesce(platform);
    }

    #[test]
    fn test_mutex_fifo_handoff() {
        let _machine = MACHINE.lock().unwrap();
        let platform = boot();
        quiesce(platform);

        let a = thread_new(None, String::from("mutex-a"), thread_body, 0);
        let b = thread_new(None, String::from("mutex-b"), thread_body, 0);
        let c = thread_new(None, String::from("mutex-c"), thread_body, 0);
        for tid in [a, b, c].iter() {
            thread_get(*tid).set_cpu_for_test(0);
        }

        let mutex = Mutex::new();

        // A takes the mutex uncontended.
        scheduler::test_set_current(a);
        mutex.lock();
        assert_eq!(mutex.owner(), Some(a));
        assert_eq!(mutex.count(), 1);

        // B and C pile up behind it, in order.
        scheduler::test_set_current(b);
        mutex.lock();
        scheduler::test_set_current(c);
        mutex.lock();
        assert_eq!(mutex.owner(), Some(a));
        assert_eq!(mutex.count(), 3);
        assert_eq!(mutex.waiters(), 2);
        assert_eq!(thread_get(b).state(), ThreadState::Waiting);
        assert_eq!(thread_get(c).state(), ThreadState::Waiting);

        // The owner releases: the head of the queue (B, not
        // C) is woken and handed the mutex. The count never
        // drops to zero, so ownership transfers without a
        // race.
        scheduler::test_set_current(a);
        mutex.unlock();
        assert_eq!(mutex.count(), 2);
        assert_eq!(mutex.waiters(), 1);
        assert_eq!(lock!(thread_get(b).wait).result, WaitResult::Success);
        assert_eq!(thread_get(b).state(), ThreadState::Runnable);
        assert_eq!(thread_get(c).state(), ThreadState::Waiting);

        // Unblock C and tidy up.
        waitq_wake_one(&mutex.wq);
        quiesce(platform);
    }

    #[test]
    fn test_exit_reaps_thread_and_map() {
        let _machine = MACHINE.lock().unwrap();
        let platform = boot();
        quiesce(platform);

        let map = virtmem::map_new();
        let task = Task::new(String::from("dying"), Some(map));
        let tid = thread_new(Some(task.clone()), String::from("doomed"), thread_body, 0);
        thread_get(tid).set_cpu_for_test(0);
        scheduler::test_set_current(tid);

        // The thread announces its exit; the reschedule
        // reaps it, and the task's last thread takes the
        // task's map with it.
        thread_get(tid).set_state(ThreadState::Exiting);
        reschedule();

        assert!(lock!(THREADS).get(&tid).is_none());
        assert!(task.map().is_none());
        {
            let cpus = lock!(CPUS);
            assert_eq!(cpus[0].curthread, cpus[0].idle);
        }

        quiesce(platform);
    }
}
