// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The serial console sink.
//!
//! The first UART (COM1) carries all kernel console output.
//! This is the one "driver" the core keeps for itself: without
//! it a panic would be silent.

use lazy_static::lazy_static;
use spin::{lock, Mutex};
use uart_16550::SerialPort;

/// The base I/O port of COM1.
///
const COM1: u16 = 0x3f8;

/// The UART behind the console sink.
///
struct Serial(Mutex<SerialPort>);

impl console::Sink for Serial {
    fn write(&self, text: &str) {
        let mut port = lock!(self.0);
        for byte in text.bytes() {
            port.send(byte);
        }
    }
}

lazy_static! {
    static ref SERIAL: Serial = Serial(Mutex::new(unsafe { SerialPort::new(COM1) }));
}

/// Initialises the UART and installs it as the console sink.
///
pub fn init() {
    lock!(SERIAL.0).init();
    let sink: &'static Serial = &SERIAL;
    console::set_sink(sink);
}
