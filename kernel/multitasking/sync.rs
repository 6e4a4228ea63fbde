// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The sleeping mutex.
//!
//! This is the blocking counterpart of the spinlock: a
//! contended acquire suspends on the mutex's wait queue
//! instead of spinning. Ownership passes directly from the
//! releasing thread to the queue head, so a woken thread never
//! races for the count it already holds a share of.

use crate::scheduler::current_thread;
use crate::waitq::{waitq_await, waitq_wake_one, WaitQueue, WaitResult};
use crate::ThreadId;
use core::sync::atomic::{AtomicI32, Ordering};
use spin::lock;

/// A mutual-exclusion lock whose waiters sleep.
///
/// The count tracks the owner plus every queued waiter: it
/// is zero exactly when the mutex is free.
///
pub struct Mutex {
    pub(crate) wq: WaitQueue,
    count: AtomicI32,
    owner: spin::Mutex<Option<ThreadId>>,
}

impl Mutex {
    /// Creates an unowned mutex.
    ///
    pub fn new() -> Mutex {
        Mutex {
            wq: WaitQueue::new(),
            count: AtomicI32::new(0),
            owner: spin::Mutex::new(None),
        }
    }

    /// Acquires the mutex, sleeping while another thread
    /// holds it.
    ///
    pub fn lock(&self) {
        let tid = current_thread().id();

        if self.count.fetch_add(1, Ordering::SeqCst) == 0 {
            // Uncontended: we are the owner.
            *lock!(self.owner) = Some(tid);
            return;
        }

        // Contended: join the queue. The unlock that wakes us
        // has already transferred ownership (the count never
        // dropped to zero), so there is nothing to race for.
        if waitq_await(&self.wq, 0) == WaitResult::Success {
            *lock!(self.owner) = Some(tid);
        }
    }

    /// Releases the mutex.
    ///
    /// If anyone is queued, the head waiter is woken and owns
    /// the mutex from that moment.
    ///
    /// # Panics
    ///
    /// `unlock` panics if the calling thread is not the
    /// owner.
    ///
    pub fn unlock(&self) {
        let tid = current_thread().id();
        {
            let mut owner = lock!(self.owner);
            assert!(
                *owner == Some(tid),
                "mutex unlocked by thread {} which does not own it",
                tid.as_u64()
            );
            *owner = None;
        }

        if self.count.fetch_sub(1, Ordering::SeqCst) > 1 {
            waitq_wake_one(&self.wq);
        }
    }

    /// The owner plus queued waiters; zero when free.
    ///
    pub fn count(&self) -> i32 {
        self.count.load(Ordering::SeqCst)
    }

    /// The owning thread, if any.
    ///
    pub fn owner(&self) -> Option<ThreadId> {
        *lock!(self.owner)
    }

    /// The number of threads asleep on the mutex.
    ///
    pub fn waiters(&self) -> usize {
        self.wq.waiters()
    }
}

impl Default for Mutex {
    fn default() -> Mutex {
        Mutex::new()
    }
}
