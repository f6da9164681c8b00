// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! allocator provides the kernel's heap.
//!
//! The heap backs `alloc`: thread records, fork argument packets, and
//! whatever else the kernel boxes. It is a linked-list allocator over
//! a fixed arena reserved in the kernel image, which keeps the heap
//! independent of the page pool used for thread stacks.

use linked_list_allocator::LockedHeap;

/// The size of the kernel heap.
///
pub const KERNEL_HEAP_SIZE: usize = 256 * 1024;

#[repr(C, align(16))]
struct HeapArena([u8; KERNEL_HEAP_SIZE]);

static mut HEAP_ARENA: HeapArena = HeapArena([0; KERNEL_HEAP_SIZE]);

#[cfg_attr(target_os = "none", global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// init hands the heap arena to the allocator. Must be called once,
/// before the first allocation.
///
pub fn init() {
    unsafe {
        ALLOCATOR
            .lock()
            .init(core::ptr::addr_of_mut!(HEAP_ARENA) as *mut u8, KERNEL_HEAP_SIZE);
    }
}
