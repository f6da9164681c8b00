// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Controlled shutdown of the machine.
//!
//! The QEMU `virt` board provides a test device: a single write to its
//! register stops the emulator with a chosen exit status. The kernel
//! uses it to report success when the initial thread exits and failure
//! when it panics.
//!
//! If the write has no effect (for example on real hardware without
//! the device) the hart parks itself in a `wfi` loop instead.

#![no_std]

/// The physical address of the test device on the QEMU `virt` board.
///
#[cfg(target_arch = "riscv64")]
const TEST_DEVICE: *mut u32 = 0x10_0000 as *mut u32;

/// The command that stops the machine with a zero exit status.
///
#[cfg(target_arch = "riscv64")]
const EXIT_SUCCESS: u32 = 0x5555;

/// The command that stops the machine with a failure status. The high
/// half carries the code reported to the host.
///
#[cfg(target_arch = "riscv64")]
const EXIT_FAILURE: u32 = (1 << 16) | 0x3333;

#[cfg(target_arch = "riscv64")]
fn exit(command: u32) -> ! {
    unsafe { core::ptr::write_volatile(TEST_DEVICE, command) };

    // The device stops the machine before the write returns. If we
    // are still running there is no emulator to talk to, so park.
    loop {
        cpu::wait_for_interrupt();
    }
}

/// Stops the machine, reporting success.
///
#[cfg(target_arch = "riscv64")]
pub fn halt_success() -> ! {
    exit(EXIT_SUCCESS)
}

/// Stops the machine, reporting failure.
///
#[cfg(target_arch = "riscv64")]
pub fn halt_failure() -> ! {
    exit(EXIT_FAILURE)
}

/// On foreign targets there is no machine to stop; a request to halt
/// inside a host test is always a bug in the test.
///
#[cfg(not(target_arch = "riscv64"))]
pub fn halt_success() -> ! {
    panic!("halt_success() called on a hosted target");
}

#[cfg(not(target_arch = "riscv64"))]
pub fn halt_failure() -> ! {
    panic!("halt_failure() called on a hosted target");
}
