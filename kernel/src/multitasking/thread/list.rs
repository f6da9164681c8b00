// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A FIFO list of threads, linked through the threads themselves.
//!
//! The ready list and every condition variable's wait list are
//! instances of this type. Threads are chained through their
//! `list_next` field, so a thread can be a member of at most one list
//! at a time and membership costs no allocation.
//!
//! The operations here are *not* interrupt safe. Both kinds of list
//! are also touched by interrupt service routines (a broadcast from an
//! ISR moves waiters to the ready list), so callers mask interrupts
//! around any use of a list an ISR can reach.

use crate::Thread;
use core::ptr;
use core::ptr::NonNull;

/// A FIFO list of threads, linked intrusively.
///
/// Insertion is at the tail and removal at the head, which is what
/// gives the scheduler its round-robin order.
///
pub(crate) struct ThreadList {
    head: *mut Thread,
    tail: *mut Thread,
}

// The raw pointers chain thread records, which stay alive for as long
// as they are on any list. Lists live behind spin locks.
unsafe impl Send for ThreadList {}

impl ThreadList {
    /// Returns an empty list.
    ///
    pub(crate) const fn new() -> Self {
        ThreadList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    /// Empties the list without touching the threads on it.
    ///
    pub(crate) fn clear(&mut self) {
        self.head = ptr::null_mut();
        self.tail = ptr::null_mut();
    }

    /// Returns whether the list holds no threads.
    ///
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Returns the first thread on the list without removing it.
    ///
    pub(crate) fn head(&self) -> *mut Thread {
        self.head
    }

    /// Inserts a thread at the tail of the list.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the list and to the
    /// thread's `list_next` field, and the thread must not currently
    /// be a member of any list.
    ///
    pub(crate) unsafe fn push(&mut self, thr: NonNull<Thread>) {
        let thr = thr.as_ptr();
        (*thr).list_next = ptr::null_mut();

        if self.tail.is_null() {
            debug_assert!(self.head.is_null());
            self.head = thr;
        } else {
            debug_assert!(!self.head.is_null());
            (*self.tail).list_next = thr;
        }

        self.tail = thr;
    }

    /// Removes and returns the thread at the head of the list, or
    /// `None` if the list is empty.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the list and to the
    /// `list_next` fields of the threads on it.
    ///
    pub(crate) unsafe fn pop(&mut self) -> Option<NonNull<Thread>> {
        let thr = NonNull::new(self.head)?;

        self.head = (*thr.as_ptr()).list_next;
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }

        (*thr.as_ptr()).list_next = ptr::null_mut();
        Some(thr)
    }

    /// Moves every thread from `other` to the tail of this list,
    /// leaving `other` empty.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to both lists.
    ///
    pub(crate) unsafe fn append(&mut self, other: &mut ThreadList) {
        if other.head.is_null() {
            return;
        }

        if self.head.is_null() {
            debug_assert!(self.tail.is_null());
            self.head = other.head;
        } else {
            debug_assert!(!self.tail.is_null());
            (*self.tail).list_next = other.head;
        }

        self.tail = other.tail;
        other.clear();
    }

    /// Collects the threads on the list, in order, for inspection.
    ///
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> std::vec::Vec<*mut Thread> {
        let mut threads = std::vec::Vec::new();
        let mut cursor = self.head;
        while !cursor.is_null() {
            threads.push(cursor);
            cursor = unsafe { (*cursor).list_next };
        }
        threads
    }
}
