// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides access to the board's UART and implements the `print` and
//! `println` macros.
//!
//! The QEMU `virt` board exposes a 16550-compatible UART at a fixed
//! physical address. It is wrapped in a spin lock and driven through
//! the `uart_16550` crate's memory-mapped interface.
//!
//! # Safety
//!
//! The [`print`] and [`println`] macros disable interrupts while
//! holding the UART lock, so diagnostics printed from an interrupt
//! service routine cannot deadlock against a half-finished line.
//!
//! On targets other than `riscv64` there is no UART to write to and
//! console output is discarded; the macros remain usable so code under
//! host test can print unconditionally.

#![no_std]

use core::fmt;
use core::fmt::Write;
use interrupts::without_interrupts;

/// The physical address of the first UART on the QEMU `virt` board.
///
#[cfg(target_arch = "riscv64")]
const UART0: usize = 0x1000_0000;

#[cfg(target_arch = "riscv64")]
mod device {
    use super::UART0;
    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::MmioSerialPort;

    lazy_static! {
        /// COM1 is the board's first serial port device.
        ///
        pub static ref COM1: Mutex<MmioSerialPort> =
            Mutex::new(unsafe { MmioSerialPort::new(UART0) });
    }

    /// Completes the UART's line and interrupt setup.
    ///
    pub fn init() {
        COM1.lock().init();
    }
}

#[cfg(not(target_arch = "riscv64"))]
mod device {
    use core::fmt;
    use spin::Mutex;

    /// A sink standing in for the UART on foreign targets.
    ///
    pub struct Discard;

    impl fmt::Write for Discard {
        fn write_str(&mut self, _s: &str) -> fmt::Result {
            Ok(())
        }
    }

    pub static COM1: Mutex<Discard> = Mutex::new(Discard);

    pub fn init() {}
}

/// Initialises the serial device backing the `print` macros.
///
pub fn init() {
    device::init();
}

/// Writes a string to the serial port.
///
pub fn write_str(s: &str) -> fmt::Result {
    without_interrupts(|| device::COM1.lock().write_str(s))
}

/// _print writes the formatted text to the serial port. It is used by
/// the `print` and `println` macros and not intended to be called
/// directly.
///
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    without_interrupts(|| {
        device::COM1
            .lock()
            .write_fmt(args)
            .expect("write to serial port failed");
    });
}

/// Prints to the serial port.
///
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::_print(format_args!($($arg)*))
    };
}

/// Prints to the serial port, with a newline.
///
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
