// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Tracks the identity of the executing CPU and the number of
//! active CPUs.
//!
//! On hardware, [`id`] reads the local APIC through a source
//! installed with [`set_id_source`]. Before a source is installed
//! (and on the software platform used by the test suite), the
//! current CPU is whatever was last stored with [`set_current`],
//! which is CPU 0 at boot.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use core::sync::atomic::{AtomicUsize, Ordering};
use spin::{lock, Mutex};

/// The maximum number of CPUs the kernel supports.
///
/// Per-CPU tables are statically bounded by this value.
///
pub const MAX_CPUS: usize = 32;

/// The number of CPUs that have been brought online.
///
static COUNT: AtomicUsize = AtomicUsize::new(1);

/// Fallback CPU identity, used when no id source is
/// installed.
///
static CURRENT: AtomicUsize = AtomicUsize::new(0);

/// Hardware source for the executing CPU's id.
///
static ID_SOURCE: Mutex<Option<fn() -> usize>> = Mutex::new(None);

/// Records the number of active CPUs.
///
/// # Panics
///
/// `set_count` panics if `count` exceeds [`MAX_CPUS`].
///
pub fn set_count(count: usize) {
    assert!(count > 0 && count <= MAX_CPUS);
    COUNT.store(count, Ordering::Relaxed);
}

/// Returns the number of active CPUs.
///
pub fn count() -> usize {
    COUNT.load(Ordering::Relaxed)
}

/// Installs a hardware source for the executing CPU's id.
///
pub fn set_id_source(source: fn() -> usize) {
    *lock!(ID_SOURCE) = Some(source);
}

/// Overrides the fallback CPU identity.
///
/// This is used during application-processor bring-up before
/// the hardware id source is installed, and by software
/// platforms that simulate several CPUs on one thread.
///
pub fn set_current(id: usize) {
    CURRENT.store(id, Ordering::Relaxed);
}

/// Returns the id of the executing CPU.
///
pub fn id() -> usize {
    let source = *lock!(ID_SOURCE);
    match source {
        Some(source) => source(),
        None => CURRENT.load(Ordering::Relaxed),
    }
}
