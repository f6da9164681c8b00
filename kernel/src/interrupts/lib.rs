// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Interrupt masking for the single hart the kernel runs on.
//!
//! Interrupt service routines share thread lists with ordinary kernel
//! code, so every mutation of those lists happens with interrupts
//! masked. This module provides the mask itself: the supervisor
//! interrupt-enable bit in `sstatus`.
//!
//! Most callers should use [`without_interrupts`], which masks for the
//! duration of a closure and restores the previous state on every exit
//! path. The scheduler needs the asymmetric [`disable`]/[`enable`]/
//! [`restore`] primitives because it changes the mask on one side of a
//! context switch and restores it on the other.
//!
//! On targets other than `riscv64` the enable bit is emulated with an
//! atomic, so host unit tests can observe masking discipline.

#![cfg_attr(not(test), no_std)]

/// Returns whether interrupts are currently enabled.
///
#[cfg(target_arch = "riscv64")]
pub fn enabled() -> bool {
    riscv::register::sstatus::read().sie()
}

/// Enables interrupts unconditionally.
///
#[cfg(target_arch = "riscv64")]
pub fn enable() {
    unsafe { riscv::register::sstatus::set_sie() };
}

/// Disables interrupts, returning whether they were enabled before.
///
/// The returned value is passed to [`restore`] to reinstate the
/// caller's mask state, which makes nested critical sections safe.
///
#[cfg(target_arch = "riscv64")]
pub fn disable() -> bool {
    let was_enabled = enabled();
    unsafe { riscv::register::sstatus::clear_sie() };
    was_enabled
}

#[cfg(not(target_arch = "riscv64"))]
mod emulated {
    use core::sync::atomic::{AtomicBool, Ordering};

    /// The emulated supervisor interrupt-enable bit. Host tests begin
    /// with interrupts enabled, as the kernel does once it is up.
    ///
    static ENABLED: AtomicBool = AtomicBool::new(true);

    pub fn enabled() -> bool {
        ENABLED.load(Ordering::SeqCst)
    }

    pub fn enable() {
        ENABLED.store(true, Ordering::SeqCst);
    }

    pub fn disable() -> bool {
        ENABLED.swap(false, Ordering::SeqCst)
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub use emulated::{disable, enable, enabled};

/// Restores the mask state previously returned by [`disable`].
///
pub fn restore(was_enabled: bool) {
    if was_enabled {
        enable();
    }
}

/// Runs the given closure with interrupts masked, restoring the
/// previous mask state afterwards.
///
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let saved = disable();
    let result = f();
    restore(saved);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    // The emulated enable bit is process-global state, so the whole
    // discipline is exercised in a single test.
    #[test]
    fn mask_discipline() {
        enable();
        assert!(enabled());

        // disable reports the previous state, and nested critical
        // sections restore correctly.
        let saved = disable();
        assert!(saved);
        assert!(!enabled());

        let nested = disable();
        assert!(!nested);
        restore(nested);
        assert!(!enabled());

        restore(saved);
        assert!(enabled());

        // The scoped form restores on return and nests.
        let result = without_interrupts(|| {
            assert!(!enabled());
            without_interrupts(|| assert!(!enabled()));
            assert!(!enabled());
            7
        });
        assert_eq!(result, 7);
        assert!(enabled());
    }
}
