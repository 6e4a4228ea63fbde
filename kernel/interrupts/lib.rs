// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The interrupt priority core: priority levels, the vector
//! table, and the common dispatch path.
//!
//! ## Interrupt priority levels
//!
//! The [`Ipl`] is a per-CPU floor: vectors whose priority class
//! falls below the current level are masked by hardware until the
//! level drops. A vector's class is encoded in its high nibble, so
//! the hardware task-priority register enforces the masking
//! directly. [`raise`] lifts the level (never lowers it) and
//! returns the previous level for a matching [`restore`].
//!
//! ## Dispatch
//!
//! Every vector funnels through [`dispatch`], which looks the
//! vector up in the handler table and invokes its handler with the
//! saved [`Frame`]. On the way out, if the level is below
//! [`Ipl::Soft`], the deferred procedure queue is drained, and if
//! the level has dropped all the way to passive, a pending
//! preemption is honoured. Both behaviours are hooks installed by
//! the scheduler so that this crate stays below it in the
//! dependency order.
//!
//! ## The platform
//!
//! Hardware access is collected behind the [`Platform`] trait:
//! end-of-interrupt, directed IPIs, the per-CPU one-shot timer,
//! and the priority register itself. The kernel installs the
//! local-APIC implementation during bring-up. [`SoftPlatform`] is
//! a complete software implementation which models several CPUs on
//! one thread, delivering IPIs synchronously; it serves before the
//! hardware platform is ready and throughout the test suite.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

mod frame;
mod soft;

pub use frame::Frame;
pub use soft::SoftPlatform;

use console::println;
use spin::{lock, Mutex};

/// The page fault exception vector.
///
pub const VECTOR_PAGE_FAULT: u8 = 14;

/// The per-CPU timer vector.
///
/// Deliberately kept below the highest class so that the
/// scheduler class can still mask it.
///
pub const VECTOR_TIMER: u8 = 223;

/// The local reschedule vector, raised on the local CPU to
/// yield and sent cross-CPU to preempt.
///
pub const VECTOR_RESCHED: u8 = 254;

/// The TLB shootdown vector.
///
pub const VECTOR_SHOOTDOWN: u8 = 255;

/// A system interrupt priority level.
///
/// Levels are totally ordered; a CPU at a given level takes
/// only interrupts of a strictly higher class.
///
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum Ipl {
    /// Nothing masked.
    Passive = 0,

    /// Deferred procedures masked.
    Soft = 2,

    /// All hardware device interrupts masked.
    Hard = 3,

    /// Everything masked, including the scheduler clock.
    High = 15,
}

impl Ipl {
    /// The level at which the virtual memory system runs.
    ///
    pub const VM: Ipl = Ipl::Hard;

    /// The level at which the scheduler runs.
    ///
    pub const SCHED: Ipl = Ipl::High;

    /// Recovers a level from its raw register value.
    ///
    /// # Panics
    ///
    /// `from_raw` panics if the value is not a level the
    /// kernel uses.
    ///
    pub fn from_raw(raw: u8) -> Ipl {
        match raw {
            0 => Ipl::Passive,
            2 => Ipl::Soft,
            3 => Ipl::Hard,
            15 => Ipl::High,
            _ => panic!("invalid interrupt priority level {}", raw),
        }
    }
}

/// The machine interface the interrupt core rests on.
///
/// One implementation drives the local APIC; the other,
/// [`SoftPlatform`], models the machine in software.
///
pub trait Platform: Send + Sync {
    /// Reads the executing CPU's priority level.
    ///
    fn ipl(&self) -> Ipl;

    /// Writes the executing CPU's priority level.
    ///
    fn set_ipl(&self, ipl: Ipl);

    /// Sends the given vector to another CPU.
    ///
    fn send_ipi(&self, cpu: usize, vector: u8);

    /// Signals completion of the in-service interrupt.
    ///
    fn end_of_interrupt(&self);

    /// Arms the executing CPU's one-shot timer to fire
    /// [`VECTOR_TIMER`] after `nanos` nanoseconds. Zero
    /// disarms the timer.
    ///
    fn timer_set(&self, nanos: u64);

    /// Returns the nanoseconds remaining until the armed
    /// timer fires, or zero if it is disarmed.
    ///
    fn timer_remaining(&self) -> u64;
}

/// The installed platform.
///
static PLATFORM: Mutex<Option<&'static dyn Platform>> = Mutex::new(None);

/// Installs the machine platform.
///
pub fn set_platform(platform: &'static dyn Platform) {
    *lock!(PLATFORM) = Some(platform);
}

/// Returns the installed platform.
///
/// # Panics
///
/// `platform` panics if no platform has been installed.
///
pub fn platform() -> &'static dyn Platform {
    (*lock!(PLATFORM)).expect("no machine platform installed")
}

/// Returns the executing CPU's current priority level.
///
pub fn current() -> Ipl {
    platform().ipl()
}

/// Raises the priority level to `to` if it is above the
/// current level, returning the level to restore later.
///
pub fn raise(to: Ipl) -> Ipl {
    let platform = platform();
    let old = platform.ipl();
    if to > old {
        platform.set_ipl(to);
    }

    old
}

/// Restores a priority level previously returned by
/// [`raise`].
///
pub fn restore(to: Ipl) {
    platform().set_ipl(to);
}

/// Panics unless the current priority level is at or below
/// `max`.
///
/// # Panics
///
/// See above; this is a cross-cutting precondition check.
///
pub fn assert_ipl_at_most(max: Ipl) {
    let found = current();
    assert!(
        found <= max,
        "interrupt priority too high: at {:?}, needed at most {:?}",
        found,
        max
    );
}

/// A registered interrupt handler.
///
type Handler = fn(&mut Frame, usize);

/// One vector table entry.
///
#[derive(Clone, Copy)]
struct VectorEntry {
    ipl: Ipl,
    handler: Option<Handler>,
    arg: usize,
}

const UNREGISTERED: VectorEntry = VectorEntry {
    ipl: Ipl::Passive,
    handler: None,
    arg: 0,
};

/// The vector table.
///
static VECTORS: Mutex<[VectorEntry; 256]> = Mutex::new([UNREGISTERED; 256]);

/// Hook to drain the deferred procedure queue, installed by
/// the scheduler.
///
static DPC_DRAIN: Mutex<Option<fn()>> = Mutex::new(None);

/// Hook to honour a pending preemption, installed by the
/// scheduler.
///
static PREEMPT_CHECK: Mutex<Option<fn()>> = Mutex::new(None);

/// Installs the deferred procedure drain hook.
///
pub fn set_dpc_drain(drain: fn()) {
    *lock!(DPC_DRAIN) = Some(drain);
}

/// Installs the preemption hook.
///
pub fn set_preempt_check(check: fn()) {
    *lock!(PREEMPT_CHECK) = Some(check);
}

/// Registers a handler for the given vector.
///
pub fn register_vector(vector: u8, ipl: Ipl, handler: Handler, arg: usize) {
    let mut vectors = lock!(VECTORS);
    vectors[vector as usize] = VectorEntry {
        ipl,
        handler: Some(handler),
        arg,
    };
}

/// Allocates the lowest free vector whose priority class is
/// at least `ipl` and registers the handler on it.
///
/// Returns `None` if every eligible vector is taken.
///
pub fn alloc_vector(ipl: Ipl, handler: Handler, arg: usize) -> Option<u8> {
    let mut vectors = lock!(VECTORS);
    let first = core::cmp::max((ipl as usize) << 4, 32);
    for vector in first..256 {
        if vectors[vector].handler.is_none() {
            vectors[vector] = VectorEntry {
                ipl,
                handler: Some(handler),
                arg,
            };
            return Some(vector as u8);
        }
    }

    None
}

/// The common interrupt path: every vector's thunk lands
/// here with the saved frame.
///
/// After the handler returns, the deferred procedure queue is
/// drained if the priority level permits, and a pending
/// preemption is honoured once the level is passive.
///
/// # Panics
///
/// An interrupt with no registered handler is fatal.
///
pub fn dispatch(frame: &mut Frame, vector: usize) {
    let entry = lock!(VECTORS)[vector];
    match entry.handler {
        Some(handler) => handler(frame, entry.arg),
        None => {
            println!("unhandled interrupt {}", vector);
            frame.dump();
            panic!("unhandled interrupt {}", vector);
        }
    }

    if current() < Ipl::Soft {
        let drain = *lock!(DPC_DRAIN);
        if let Some(drain) = drain {
            drain();
        }
    }

    if current() == Ipl::Passive {
        let check = *lock!(PREEMPT_CHECK);
        if let Some(check) = check {
            check();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn count_handler(_frame: &mut Frame, arg: usize) {
        FIRED.fetch_add(arg, Ordering::Relaxed);
    }

    #[test]
    fn test_interrupt_core() {
        let platform: &'static SoftPlatform =
            std::boxed::Box::leak(std::boxed::Box::new(SoftPlatform::new(2)));
        set_platform(platform);

        // Priority levels.
        assert_eq!(current(), Ipl::Passive);
        let old = raise(Ipl::VM);
        assert_eq!(old, Ipl::Passive);
        assert_eq!(current(), Ipl::Hard);

        // Raising to a lower level leaves the level alone.
        let old2 = raise(Ipl::Soft);
        assert_eq!(old2, Ipl::Hard);
        assert_eq!(current(), Ipl::Hard);
        restore(old2);
        restore(old);
        assert_eq!(current(), Ipl::Passive);

        // Vector allocation: the high nibble of the vector
        // encodes its class, so a handler needing Ipl::High
        // must get a vector of 0xf0 or above.
        let vec = alloc_vector(Ipl::High, count_handler, 3).unwrap();
        assert!(vec >= 0xf0);

        // Low-priority allocations skip the exception range.
        let low = alloc_vector(Ipl::Passive, count_handler, 1).unwrap();
        assert!(low >= 32);

        // Dispatch invokes the handler with its argument.
        let mut frame = Frame::ZERO;
        dispatch(&mut frame, vec as usize);
        dispatch(&mut frame, low as usize);
        assert_eq!(FIRED.load(Ordering::Relaxed), 4);

        // Cross-CPU delivery through the software platform
        // runs the handler on the target CPU.
        platform.send_ipi(1, vec);
        assert_eq!(FIRED.load(Ordering::Relaxed), 7);
        assert_eq!(cpu::id(), 0);
    }
}
