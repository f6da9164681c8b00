// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Physical page allocation.
//!
//! The kernel hands out memory in whole pages of [`PAGE_SIZE`] bytes:
//! one page per kernel thread stack, plus the root tables of cloned
//! address spaces. Pages come from a fixed, page-aligned pool reserved
//! in the kernel image, tracked by a bitmap behind a spin lock.
//!
//! Page allocation happens only in thread context (interrupt service
//! routines never allocate), so the lock alone is enough.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use spin::Mutex;

/// The size in bytes of a physical page.
///
pub const PAGE_SIZE: usize = 4096;

/// The number of pages in the allocation pool.
///
/// This bounds the number of simultaneous kernel thread stacks and
/// cloned address spaces. It matches the width of the allocation
/// bitmap word below.
///
const POOL_PAGES: usize = 64;

#[repr(C, align(4096))]
struct Pool([[u8; PAGE_SIZE]; POOL_PAGES]);

struct PoolStorage(UnsafeCell<Pool>);

// The pool is only ever reached through pointers handed out by the
// allocator, which guarantees no two owners share a page.
unsafe impl Sync for PoolStorage {}

static POOL: PoolStorage = PoolStorage(UnsafeCell::new(Pool([[0; PAGE_SIZE]; POOL_PAGES])));

/// One bit per pool page; a set bit means the page is allocated.
///
static ALLOCATED: Mutex<u64> = Mutex::new(0);

fn pool_base() -> usize {
    POOL.0.get() as usize
}

/// Allocates one page, returning a pointer to its lowest address.
///
/// Returns `None` when the pool is exhausted. The page contents are
/// whatever the previous owner left behind.
///
pub fn allocate_page() -> Option<NonNull<u8>> {
    let mut allocated = ALLOCATED.lock();
    let free = !*allocated;
    if free == 0 {
        return None;
    }

    let index = free.trailing_zeros() as usize;
    *allocated |= 1 << index;

    let addr = pool_base() + index * PAGE_SIZE;
    NonNull::new(addr as *mut u8)
}

/// Returns a previously allocated page to the pool.
///
/// # Safety
///
/// `page` must have come from [`allocate_page`] and must not be used
/// again after this call.
///
/// # Panics
///
/// Panics if `page` is not a live, page-aligned member of the pool, as
/// that means a stack or table pointer has been corrupted.
///
pub unsafe fn free_page(page: NonNull<u8>) {
    let addr = page.as_ptr() as usize;
    let base = pool_base();

    assert!(addr % PAGE_SIZE == 0, "freed pointer is not page aligned");
    assert!(
        addr >= base && addr < base + POOL_PAGES * PAGE_SIZE,
        "freed pointer is outside the page pool"
    );

    let index = (addr - base) / PAGE_SIZE;
    let mut allocated = ALLOCATED.lock();
    assert!(*allocated & (1 << index) != 0, "page freed twice");
    *allocated &= !(1 << index);
}

/// Returns the number of pages currently available.
///
pub fn available_pages() -> usize {
    POOL_PAGES - ALLOCATED.lock().count_ones() as usize
}
