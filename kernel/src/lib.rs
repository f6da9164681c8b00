// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The Mayfly kernel.
//!
//! Mayfly is a small cooperative kernel for one RISC-V hart. This
//! crate ties the subsystem crates together: it owns the kernel heap
//! and the initialisation order, and the binary half carries the boot
//! path and the demonstration workload.
//!
//! The interesting machinery lives in the subsystem crates, above all
//! in `thread`, which implements the thread manager, the scheduler,
//! and condition variables.

#![no_std]

pub mod allocator;

/// init sets up the core kernel services, in dependency order: the
/// console first so later failures are visible, then the heap, then
/// the thread manager (which allocates its two permanent threads from
/// that heap).
///
pub fn init() {
    serial::init();
    allocator::init();
    thread::init();

    serial::println!(
        "Mayfly is up: {} thread slots, {} free pages.",
        thread::NTHR,
        physmem::available_pages()
    );
}
