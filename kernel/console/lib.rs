// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides the kernel's diagnostic output macros.
//!
//! The [`print!`] and [`println!`] macros format into whichever
//! [`Sink`] has been installed with [`set_sink`]. At boot this is
//! the serial port; until a sink is installed, output is simply
//! discarded, so code on any path may log unconditionally without
//! checking whether the console is ready.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use core::fmt;
use core::fmt::Write;
use spin::{lock, Mutex};

/// A destination for console output.
///
/// Sinks must tolerate being called from any context,
/// including interrupt handlers, so implementations
/// should not suspend.
///
pub trait Sink: Send + Sync {
    /// Writes the given text to the sink.
    ///
    fn write(&self, text: &str);
}

/// The installed output sink, if any.
///
static SINK: Mutex<Option<&'static dyn Sink>> = Mutex::new(None);

/// Installs the console output sink.
///
/// Any previously-installed sink is replaced. Output
/// printed before the first call to `set_sink` is lost.
///
pub fn set_sink(sink: &'static dyn Sink) {
    *lock!(SINK) = Some(sink);
}

/// Adapter that feeds `core::fmt` output into a sink.
///
struct SinkWriter(&'static dyn Sink);

impl fmt::Write for SinkWriter {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        self.0.write(text);
        Ok(())
    }
}

/// Formats and writes the arguments to the installed
/// sink.
///
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let sink = *lock!(SINK);
    if let Some(sink) = sink {
        // A sink write cannot fail.
        let _ = SinkWriter(sink).write_fmt(args);
    }
}

/// Prints to the console sink.
///
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::_print(format_args!($($arg)*))
    };
}

/// Prints to the console sink, with a trailing newline.
///
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::string::String;

    struct Capture(Mutex<String>);

    impl Sink for Capture {
        fn write(&self, text: &str) {
            lock!(self.0).push_str(text);
        }
    }

    #[test]
    fn test_print_capture() {
        // Nothing installed; must not panic.
        print!("dropped on the floor");

        let capture: &'static Capture =
            std::boxed::Box::leak(std::boxed::Box::new(Capture(Mutex::new(String::new()))));
        set_sink(capture);
        print!("{} + {} = ", 1, 2);
        println!("{}", 3);
        assert_eq!(lock!(capture.0).as_str(), "1 + 2 = 3\n");
    }
}
