// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Time units used by the timer subsystem.
//!
//! All kernel timers are expressed in nanoseconds. The [`Duration`]
//! type is re-exported for callers that prefer to build intervals
//! from larger units; [`nanos`] collapses a `Duration` into the
//! nanosecond count the timer wheel works in.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]
#![deny(unused_crate_dependencies)]

pub use core::time::Duration;

/// The number of nanoseconds in a microsecond.
///
pub const NANOS_PER_MICRO: u64 = 1_000;

/// The number of nanoseconds in a millisecond.
///
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// The number of nanoseconds in a second.
///
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Collapses a [`Duration`] into whole nanoseconds.
///
/// Durations beyond `u64::MAX` nanoseconds (around 584
/// years) saturate.
///
pub const fn nanos(duration: Duration) -> u64 {
    let nanos = duration.as_nanos();
    if nanos > u64::MAX as u128 {
        u64::MAX
    } else {
        nanos as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nanos() {
        assert_eq!(nanos(Duration::from_millis(50)), 50 * NANOS_PER_MILLI);
        assert_eq!(nanos(Duration::from_secs(2)), 2 * NANOS_PER_SECOND);
        assert_eq!(nanos(Duration::from_nanos(7)), 7);
    }
}
