// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The local APIC: end-of-interrupt, directed IPIs, and the
//! per-CPU one-shot timer.
//!
//! Registers are reached through the physical memory window at
//! the base the `IA32_APIC_BASE` MSR reports. The timer is
//! calibrated once against the PIT, then driven in one-shot
//! mode: the timer subsystem arms it with the head callout's
//! interval and reads back what remains.

use crate::boot::SmpCpu;
use core::sync::atomic::{AtomicU64, Ordering};
use cpu::MAX_CPUS;
use memory::{phys_to_virt, PhysAddr};
use spin::{lock, Mutex};
use time::NANOS_PER_SECOND;
use x86_64::instructions::port::Port;
use x86_64::registers::model_specific::Msr;

const MSR_APIC_BASE: u32 = 0x1b;

const REG_ID: usize = 0x20;
const REG_EOI: usize = 0xb0;
const REG_SPURIOUS: usize = 0xf0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_INITIAL: usize = 0x380;
const REG_TIMER_CURRENT: usize = 0x390;
const REG_TIMER_DIVIDER: usize = 0x3e0;

/// The spurious-interrupt vector, parked at the top of the
/// highest priority class.
///
const SPURIOUS_VECTOR: u32 = 0xff;

/// Calibrated timer rate, shared by all CPUs.
///
static TICKS_PER_SECOND: AtomicU64 = AtomicU64::new(0);

/// Dense CPU number to local APIC id.
///
static LAPIC_IDS: Mutex<[u32; MAX_CPUS]> = Mutex::new([0; MAX_CPUS]);

fn register(reg: usize) -> *mut u32 {
    let base = unsafe { Msr::new(MSR_APIC_BASE).read() } & 0xffff_f000;
    (phys_to_virt(PhysAddr::new(base as usize)).as_usize() + reg) as *mut u32
}

fn read(reg: usize) -> u32 {
    unsafe { register(reg).read_volatile() }
}

fn write(reg: usize, value: u32) {
    unsafe { register(reg).write_volatile(value) };
}

/// Records the boot protocol's CPU topology for directed
/// IPIs.
///
pub fn record_topology(cpus: &[SmpCpu]) {
    let mut ids = lock!(LAPIC_IDS);
    for cpu in cpus {
        ids[cpu.id] = cpu.lapic_id;
    }
}

/// The local APIC id of a dense CPU number.
///
pub fn lapic_id_of(cpu: usize) -> u32 {
    lock!(LAPIC_IDS)[cpu]
}

/// The executing CPU's dense number, recovered from its
/// local APIC id.
///
pub fn current_cpu() -> usize {
    let lapic_id = read(REG_ID) >> 24;
    let ids = lock!(LAPIC_IDS);
    for (number, id) in ids.iter().enumerate().take(cpu::count()) {
        if *id == lapic_id {
            return number;
        }
    }

    0
}

/// Enables the executing CPU's local APIC.
///
pub fn enable() {
    write(REG_SPURIOUS, read(REG_SPURIOUS) | (1 << 8) | SPURIOUS_VECTOR);
}

/// Signals end-of-interrupt.
///
pub fn eoi() {
    write(REG_EOI, 0);
}

/// Sends `vector` to the CPU with the given local APIC id.
///
pub fn send_ipi(lapic_id: u32, vector: u8) {
    write(REG_ICR_HIGH, lapic_id << 24);
    write(REG_ICR_LOW, vector as u32);
}

/// Calibrates the timer against the PIT.
///
/// The PIT is programmed for a 20 ms one-shot; the APIC timer
/// free-runs over the same window and the tick rate falls out
/// of the difference.
///
pub fn calibrate_timer() {
    const INITIAL: u32 = 0xffff_ffff;
    const HZ: u32 = 50;

    write(REG_TIMER_DIVIDER, 0x2); // divide by 8
    write(REG_LVT_TIMER, interrupts::VECTOR_TIMER as u32);

    let mut command: Port<u8> = Port::new(0x43);
    let mut channel0: Port<u8> = Port::new(0x40);

    unsafe {
        // One-shot, lo/hi byte order, channel 0.
        let divisor = 1_193_180 / HZ;
        command.write(0x30);
        channel0.write((divisor & 0xff) as u8);
        channel0.write((divisor >> 8) as u8);
    }

    write(REG_TIMER_INITIAL, INITIAL);

    // Wait for the PIT to count down.
    unsafe {
        loop {
            command.write((1 << 7) | (1 << 6) | (1 << 5) | (1 << 1));
            if channel0.read() & (1 << 7) != 0 {
                break;
            }
        }
    }

    let after = read(REG_TIMER_CURRENT);
    let ticks = (INITIAL - after) as u64 * HZ as u64;
    TICKS_PER_SECOND.store(ticks, Ordering::Relaxed);
}

/// Arms the one-shot timer for `nanos` nanoseconds; zero
/// disarms it.
///
pub fn timer_set_nanos(nanos: u64) {
    let tps = TICKS_PER_SECOND.load(Ordering::Relaxed);
    let ticks = (tps as u128 * nanos as u128 / NANOS_PER_SECOND as u128) as u64;
    write(REG_TIMER_INITIAL, ticks as u32);
}

/// Reads the nanoseconds remaining on the one-shot timer.
///
pub fn timer_remaining_nanos() -> u64 {
    let tps = TICKS_PER_SECOND.load(Ordering::Relaxed);
    if tps == 0 {
        return 0;
    }

    let current = read(REG_TIMER_CURRENT) as u128;
    (current * NANOS_PER_SECOND as u128 / tps as u128) as u64
}
