// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Hart-level primitives used by the rest of the kernel.
//!
//! This module provides access to the pieces of per-hart CPU state the
//! kernel cares about: the thread-pointer register (which holds the
//! address of the currently executing thread's record), the `wfi`
//! instruction, and the layout of the register snapshot captured when
//! the hart traps out of user mode.
//!
//! On targets other than `riscv64` the register-backed state is
//! emulated with atomics so that the scheduler's bookkeeping can be
//! exercised by host unit tests. The emulation covers state only; it
//! cannot switch stacks.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;

bitflags! {
    /// The `sstatus` bits the kernel manipulates directly.
    ///
    /// Only the fields involved in returning to user mode are named
    /// here; everything else is left to the interrupt-masking layer.
    ///
    pub struct Sstatus: usize {
        /// Supervisor interrupt enable.
        const SIE = 1 << 1;

        /// Supervisor previous interrupt enable. `sret` copies this
        /// bit into SIE.
        const SPIE = 1 << 5;

        /// Supervisor previous privilege. Clear means `sret` returns
        /// to user mode.
        const SPP = 1 << 8;
    }
}

/// The register snapshot captured on entry from user mode.
///
/// The layout is shared with the trap entry and exit assembly: the 31
/// general-purpose registers are stored at their register number times
/// eight (slot zero, the hardwired zero register, is kept so the
/// indexes line up), followed by `sstatus` and `sepc`.
///
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TrapFrame {
    /// x0 through x31, indexed by register number.
    pub x: [usize; 32],

    /// The `sstatus` value at the time of the trap.
    pub sstatus: usize,

    /// The user program counter to return to.
    pub sepc: usize,
}

impl TrapFrame {
    /// Returns an all-zero trap frame.
    ///
    pub const fn zeroed() -> Self {
        TrapFrame {
            x: [0; 32],
            sstatus: 0,
            sepc: 0,
        }
    }

    /// Sets the value the trapped code will observe in `a0`, which
    /// carries system call and fork return values.
    ///
    pub fn set_return_value(&mut self, value: usize) {
        self.x[10] = value;
    }

    /// Rewrites the saved `sstatus` so that an `sret` through this
    /// frame lands in user mode with interrupts enabled.
    ///
    pub fn prepare_user_return(&mut self) {
        let mut bits = Sstatus::from_bits_truncate(self.sstatus);
        bits.remove(Sstatus::SPP);
        bits.insert(Sstatus::SPIE);
        self.sstatus = bits.bits();
    }
}

/// Returns the raw value of the thread-pointer register.
///
/// The scheduler stores the address of the currently executing
/// thread's record here, so this is zero only before the thread
/// manager has been initialised.
///
#[cfg(target_arch = "riscv64")]
pub fn thread_pointer() -> usize {
    let tp: usize;
    unsafe {
        core::arch::asm!("mv {}, tp", out(reg) tp, options(nomem, nostack, preserves_flags));
    }
    tp
}

/// Installs a new value in the thread-pointer register.
///
/// # Safety
///
/// The value must be the address of a live thread record; the rest of
/// the kernel dereferences it without further checks. This is normally
/// only done by the context switch and by thread manager
/// initialisation.
///
#[cfg(target_arch = "riscv64")]
pub unsafe fn set_thread_pointer(ptr: usize) {
    core::arch::asm!("mv tp, {}", in(reg) ptr, options(nomem, nostack, preserves_flags));
}

/// Halts the hart until the next interrupt arrives.
///
#[cfg(target_arch = "riscv64")]
pub fn wait_for_interrupt() {
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "riscv64"))]
mod emulated {
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// The emulated thread-pointer register.
    ///
    static THREAD_POINTER: AtomicUsize = AtomicUsize::new(0);

    pub fn thread_pointer() -> usize {
        THREAD_POINTER.load(Ordering::SeqCst)
    }

    pub unsafe fn set_thread_pointer(ptr: usize) {
        THREAD_POINTER.store(ptr, Ordering::SeqCst);
    }

    pub fn wait_for_interrupt() {
        core::hint::spin_loop();
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub use emulated::{set_thread_pointer, thread_pointer, wait_for_interrupt};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_pointer_round_trip() {
        unsafe { set_thread_pointer(0xdead_0000) };
        assert_eq!(thread_pointer(), 0xdead_0000);
        unsafe { set_thread_pointer(0) };
    }

    #[test]
    fn trap_frame_user_return_bits() {
        let mut frame = TrapFrame::zeroed();
        frame.sstatus = (Sstatus::SPP | Sstatus::SIE).bits();
        frame.prepare_user_return();

        let bits = Sstatus::from_bits_truncate(frame.sstatus);
        assert!(!bits.contains(Sstatus::SPP));
        assert!(bits.contains(Sstatus::SPIE));
        assert!(bits.contains(Sstatus::SIE));
    }

    #[test]
    fn trap_frame_return_value_lands_in_a0() {
        let mut frame = TrapFrame::zeroed();
        frame.set_return_value(42);
        assert_eq!(frame.x[10], 42);
    }
}
