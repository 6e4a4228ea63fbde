// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use crate::{dispatch, Frame, Ipl, Platform, VECTOR_TIMER};
use core::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use cpu::MAX_CPUS;

/// A software model of the machine.
///
/// `SoftPlatform` implements [`Platform`] without touching
/// hardware: the priority level is a per-CPU byte, the
/// one-shot timer is a counter decremented by [`advance`],
/// and a directed IPI runs the target vector's handler
/// immediately, on the caller's thread, with the CPU
/// identity temporarily switched to the target.
///
/// It stands in for the local APIC before the hardware
/// platform is installed, and it is the machine the test
/// suite runs the interrupt, timer, and shootdown paths
/// against.
///
/// [`advance`]: SoftPlatform::advance
pub struct SoftPlatform {
    ncpus: usize,
    ipl: [AtomicU8; MAX_CPUS],
    timer: [AtomicU64; MAX_CPUS],
    eois: AtomicUsize,
    ipis: AtomicUsize,
}

const IPL_ZERO: AtomicU8 = AtomicU8::new(0);
const TIMER_ZERO: AtomicU64 = AtomicU64::new(0);

impl SoftPlatform {
    /// Creates a software machine with the given number of
    /// CPUs, and records that count with the [`cpu`] crate.
    ///
    /// # Panics
    ///
    /// `new` panics if `ncpus` exceeds [`MAX_CPUS`].
    ///
    pub fn new(ncpus: usize) -> Self {
        assert!(ncpus > 0 && ncpus <= MAX_CPUS);
        cpu::set_count(ncpus);
        SoftPlatform {
            ncpus,
            ipl: [IPL_ZERO; MAX_CPUS],
            timer: [TIMER_ZERO; MAX_CPUS],
            eois: AtomicUsize::new(0),
            ipis: AtomicUsize::new(0),
        }
    }

    /// Returns how many end-of-interrupt signals have been
    /// raised.
    ///
    pub fn eois(&self) -> usize {
        self.eois.load(Ordering::Relaxed)
    }

    /// Returns how many directed IPIs have been sent.
    ///
    pub fn ipis(&self) -> usize {
        self.ipis.load(Ordering::Relaxed)
    }

    /// Passes `nanos` nanoseconds of simulated time on the
    /// executing CPU, delivering the timer vector each time
    /// the one-shot timer expires.
    ///
    pub fn advance(&self, nanos: u64) {
        let id = cpu::id();
        let mut left = nanos;
        loop {
            let remaining = self.timer[id].load(Ordering::Relaxed);
            if remaining == 0 {
                // Timer disarmed; the rest of the interval
                // passes silently.
                return;
            }

            if remaining > left {
                self.timer[id].store(remaining - left, Ordering::Relaxed);
                return;
            }

            left -= remaining;
            self.timer[id].store(0, Ordering::Relaxed);

            // The handler may re-arm the timer for the next
            // expiry.
            let mut frame = Frame::ZERO;
            frame.vector = VECTOR_TIMER as u64;
            dispatch(&mut frame, VECTOR_TIMER as usize);
        }
    }
}

impl Platform for SoftPlatform {
    fn ipl(&self) -> Ipl {
        Ipl::from_raw(self.ipl[cpu::id()].load(Ordering::Relaxed))
    }

    fn set_ipl(&self, ipl: Ipl) {
        self.ipl[cpu::id()].store(ipl as u8, Ordering::Relaxed);
    }

    fn send_ipi(&self, target: usize, vector: u8) {
        assert!(target < self.ncpus);
        self.ipis.fetch_add(1, Ordering::Relaxed);

        // Deliver synchronously on the caller's thread,
        // impersonating the target CPU for the duration.
        let sender = cpu::id();
        cpu::set_current(target);
        let mut frame = Frame::ZERO;
        frame.vector = vector as u64;
        dispatch(&mut frame, vector as usize);
        cpu::set_current(sender);
    }

    fn end_of_interrupt(&self) {
        self.eois.fetch_add(1, Ordering::Relaxed);
    }

    fn timer_set(&self, nanos: u64) {
        self.timer[cpu::id()].store(nanos, Ordering::Relaxed);
    }

    fn timer_remaining(&self) -> u64 {
        self.timer[cpu::id()].load(Ordering::Relaxed)
    }
}
