// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Threads and the tasks that own them.

use crate::callout::CalloutKey;
use crate::waitq::{WaitResult, WaitqShared};
use crate::{scheduler, thread_get, CPUS, THREADS};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use interrupts::Ipl;
use memory::{VirtAddr, PAGE_SIZE};
use spin::lock;

/// The number of pages in a thread's kernel stack.
///
pub(crate) const KERNEL_STACK_PAGES: usize = 8;

/// The reserved bits of RFLAGS, used when building a new
/// thread's initial frame. Bit 1 is always set (Intel 64
/// manual, volume 1, section 3.4.3); interrupts stay
/// disabled until the entry trampoline re-enables them.
///
const DEFAULT_RFLAGS: u64 = 0x2;

/// Uniquely identifies a thread.
///
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Allocates the next thread id. Id 0 is reserved for
    /// idle threads.
    ///
    pub(crate) fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ThreadId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) const fn idle(cpu: usize) -> Self {
        // Idle threads get distinct, stable ids above any
        // we will ever hand out.
        ThreadId(u64::MAX - cpu as u64)
    }

    pub(crate) const fn from_raw(raw: u64) -> Self {
        ThreadId(raw)
    }

    /// Returns a numeric form of the id.
    ///
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// The scheduling state of a thread.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// Ready to run; on a run queue (or newly created and
    /// not yet resumed).
    Runnable,

    /// Executing on a CPU.
    Running,

    /// Suspended on a wait queue.
    Waiting,

    /// Finished; reaped at the next reschedule.
    Exiting,
}

/// A task: the owner of an address space and some threads.
///
/// A task with no map is a kernel task; its threads run on
/// whatever address space is live.
///
pub struct Task {
    name: String,
    map: spin::Mutex<Option<Arc<virtmem::Map>>>,
    threads: spin::Mutex<Vec<ThreadId>>,
}

impl Task {
    /// Creates a task owning the given map.
    ///
    pub fn new(name: String, map: Option<Arc<virtmem::Map>>) -> Arc<Task> {
        Arc::new(Task {
            name,
            map: spin::Mutex::new(map),
            threads: spin::Mutex::new(Vec::new()),
        })
    }

    /// The task's name.
    ///
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The task's address space map, if it still holds one.
    ///
    pub fn map(&self) -> Option<Arc<virtmem::Map>> {
        lock!(self.map).clone()
    }

    /// Removes a finished thread; the last thread's exit
    /// releases the task's map.
    ///
    pub(crate) fn reap_thread(&self, id: ThreadId) {
        let mut threads = lock!(self.threads);
        threads.retain(|thread| *thread != id);
        if threads.is_empty() {
            drop(threads);
            *lock!(self.map) = None;
        }
    }
}

/// Per-thread wait bookkeeping, mutated under the scheduler
/// lock.
///
pub(crate) struct WaitState {
    /// The queue the thread is currently linked into.
    pub(crate) queue: Option<WaitqShared>,

    /// The outcome of the current (or last) wait.
    pub(crate) result: WaitResult,

    /// The timeout requested for the current wait; zero
    /// means none.
    pub(crate) timeout_nanos: u64,
}

/// A thread of execution.
///
pub struct Thread {
    id: ThreadId,
    name: String,
    task: Option<Arc<Task>>,

    /// The CPU the thread is bound to.
    cpu: AtomicUsize,

    /// Base of the thread's kernel stack, or `None` for
    /// idle threads, which inherit the boot stack.
    kstack: Option<VirtAddr>,

    /// The saved stack pointer while the thread is switched
    /// out. Stale while it runs.
    stack_pointer: UnsafeCell<usize>,

    state: UnsafeCell<ThreadState>,

    pub(crate) wait: spin::Mutex<WaitState>,

    /// The thread's wait-timeout callout, registered on the
    /// CPU the thread is bound to.
    timeout: spin::Mutex<CalloutKey>,
}

// The unsafe cells are only touched while the thread is
// current on exactly one CPU, or under the scheduler lock.
unsafe impl Sync for Thread {}
unsafe impl Send for Thread {}

impl Thread {
    /// The thread's id.
    ///
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// The thread's name.
    ///
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The task that owns the thread, if any.
    ///
    pub fn task(&self) -> Option<&Arc<Task>> {
        self.task.as_ref()
    }

    /// The CPU the thread is bound to.
    ///
    pub fn cpu(&self) -> usize {
        self.cpu.load(Ordering::Relaxed)
    }

    /// The thread's scheduling state.
    ///
    pub fn state(&self) -> ThreadState {
        unsafe { self.state.get().read() }
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        unsafe { self.state.get().write(state) };
    }

    pub(crate) fn stack_pointer(&self) -> *mut usize {
        self.stack_pointer.get()
    }

    /// The thread's wait-timeout callout.
    ///
    pub(crate) fn timeout_key(&self) -> CalloutKey {
        *lock!(self.timeout)
    }

    /// Rebinds the thread to a CPU, overriding round-robin
    /// placement so the tests stay on one CPU. The timeout
    /// callout moves with it.
    ///
    #[cfg(test)]
    pub(crate) fn set_cpu_for_test(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Relaxed);
        let mut cpus = lock!(crate::CPUS);
        let key = crate::callout::callout_new_locked(
            &mut cpus,
            cpu,
            crate::scheduler::wait_timeout_dpc,
            self.id.as_u64() as usize,
        );
        *lock!(self.timeout) = key;
    }

    /// Builds the idle thread for a CPU. It inherits the
    /// stack it is first switched away from.
    ///
    pub(crate) fn new_idle(cpu: usize) -> Arc<Thread> {
        Arc::new(Thread {
            id: ThreadId::idle(cpu),
            name: String::from("idle"),
            task: None,
            cpu: AtomicUsize::new(cpu),
            kstack: None,
            stack_pointer: UnsafeCell::new(0),
            state: UnsafeCell::new(ThreadState::Runnable),
            wait: spin::Mutex::new(WaitState {
                queue: None,
                result: WaitResult::Success,
                timeout_nanos: 0,
            }),
            timeout: spin::Mutex::new(CalloutKey::NONE),
        })
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Some(kstack) = self.kstack {
            unsafe { kmem::kfree(kstack, KERNEL_STACK_PAGES) };
        }
    }
}

/// Creates a thread that will run `entry(arg)` on a fresh
/// kernel stack.
///
/// The thread is bound to a CPU round-robin and left
/// runnable but unqueued; [`thread_resume`] places it on its
/// CPU's run queue.
///
/// # Panics
///
/// `thread_new` panics if kernel stack allocation fails.
///
pub fn thread_new(task: Option<Arc<Task>>, name: String, entry: fn(usize), arg: usize) -> ThreadId {
    static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

    let kstack = kmem::kalloc(KERNEL_STACK_PAGES, true).expect("sleeping allocation cannot fail");

    // Build the initial frame the stack switch will restore:
    // callee-saved registers, flags, and the entry trampoline
    // with the thread's entry point and argument above it.
    let top = kstack.as_usize() + KERNEL_STACK_PAGES * PAGE_SIZE;
    let frame: [u64; 10] = [
        0, // r15
        0, // r14
        0, // r13
        0, // r12
        0, // rbx
        0, // rbp
        DEFAULT_RFLAGS,
        crate::switch::start_thread_address(),
        entry as usize as u64,
        arg as u64,
    ];
    let rsp = top - frame.len() * 8;
    unsafe {
        let mut slot = rsp as *mut u64;
        for word in frame.iter() {
            slot.write(*word);
            slot = slot.add(1);
        }
    }

    let id = ThreadId::new();
    let cpu = NEXT_CPU.fetch_add(1, Ordering::Relaxed) % cpu::count();

    let ipl = interrupts::raise(Ipl::SCHED);
    let mut cpus = lock!(CPUS);
    let timeout = crate::callout::callout_new_locked(
        &mut cpus,
        cpu,
        scheduler::wait_timeout_dpc,
        id.as_u64() as usize,
    );

    let thread = Arc::new(Thread {
        id,
        name,
        task: task.clone(),
        cpu: AtomicUsize::new(cpu),
        kstack: Some(kstack),
        stack_pointer: UnsafeCell::new(rsp),
        state: UnsafeCell::new(ThreadState::Runnable),
        wait: spin::Mutex::new(WaitState {
            queue: None,
            result: WaitResult::Success,
            timeout_nanos: 0,
        }),
        timeout: spin::Mutex::new(timeout),
    });

    lock!(THREADS).insert(id, thread);
    drop(cpus);
    interrupts::restore(ipl);

    if let Some(task) = task {
        lock!(task.threads).push(id);
    }

    id
}

/// Places a thread on its CPU's run queue.
///
/// A thread on another CPU's queue earns that CPU a
/// reschedule interrupt so the new arrival is noticed
/// promptly.
///
pub fn thread_resume(id: ThreadId) {
    let thread = thread_get(id);
    let ipl = interrupts::raise(Ipl::SCHED);
    let mut cpus = lock!(CPUS);

    match thread.state() {
        ThreadState::Running | ThreadState::Exiting => {
            drop(cpus);
            interrupts::restore(ipl);
            return;
        }
        ThreadState::Runnable => {}
        ThreadState::Waiting => {
            // Unblock without a signal: take the thread off
            // its wait queue and cancel any timeout.
            let mut wait = lock!(thread.wait);
            if let Some(queue) = wait.queue.take() {
                lock!(queue).waiters.retain(|waiter| *waiter != id);
            }
            wait.result = WaitResult::Interrupted;
            drop(wait);
            let timeout = thread.timeout_key();
            crate::callout::callout_dequeue_locked(&mut cpus, timeout);
        }
    }

    thread.set_state(ThreadState::Runnable);
    let target = thread.cpu();
    if !cpus[target].runqueue.contains(&id) {
        cpus[target].runqueue.push_back(id);
    }

    drop(cpus);
    interrupts::restore(ipl);

    if target != cpu::id() {
        interrupts::platform().send_ipi(target, interrupts::VECTOR_RESCHED);
    }
}
