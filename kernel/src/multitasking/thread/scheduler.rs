// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The round-robin scheduler core.
//!
//! A single ready list orders every runnable thread, first in first
//! out. [`suspend_self`] is the only place the kernel actually gives
//! up the CPU: `yield`, condition waits, and thread exit all funnel
//! through it. It pops the next ready thread, re-queues the caller if
//! it is still runnable, and crosses the context switch.
//!
//! The ready list is shared with interrupt service routines (a
//! broadcast may run in one), so it is only ever touched with
//! interrupts masked.

use crate::list::ThreadList;
use crate::switch;
use crate::{Thread, ThreadState};
use core::ptr;
use core::ptr::NonNull;
use interrupts::without_interrupts;
use spin::Mutex;

/// The threads that are ready to run, in the order they will run.
///
/// Lock only with interrupts masked; broadcasts from interrupt
/// service routines append to this list.
///
static READY_LIST: Mutex<ThreadList> = Mutex::new(ThreadList::new());

/// Returns whether no thread is waiting to run.
///
pub(crate) fn ready_is_empty() -> bool {
    without_interrupts(|| READY_LIST.lock().is_empty())
}

/// Appends a thread to the ready list.
///
/// # Safety
///
/// The thread must be in the ready state and on no other list. The
/// caller must have interrupts masked.
///
pub(crate) unsafe fn ready_insert(thr: NonNull<Thread>) {
    debug_assert_eq!(thr.as_ref().state, ThreadState::Ready);
    READY_LIST.lock().push(thr);
}

/// Moves an entire list of newly readied threads onto the tail of the
/// ready list, preserving their order.
///
/// # Safety
///
/// Every thread on `list` must be in the ready state. The caller must
/// have interrupts masked.
///
pub(crate) unsafe fn ready_append(list: &mut ThreadList) {
    READY_LIST.lock().append(list);
}

/// Calls `f` with the ready list, for tests that stage or inspect the
/// schedule directly.
///
#[cfg(test)]
pub(crate) fn ready_with<R>(f: impl FnOnce(&mut ThreadList) -> R) -> R {
    without_interrupts(|| f(&mut READY_LIST.lock()))
}

/// Suspends the calling thread and resumes the next ready one.
///
/// With interrupts masked, the head of the ready list becomes the
/// running thread; if the caller is still marked running it is moved
/// to the tail, which is what makes yielding round-robin fair. A
/// caller that has already marked itself waiting or exited stays off
/// the list.
///
/// Interrupts are unmasked again before the switch, so a thread's
/// first instructions run with interrupts in the same state its
/// predecessor had. The call returns when the scheduler next selects
/// the caller, on whatever interrupt-mask state it saved.
///
/// Must be called with interrupts enabled.
///
pub(crate) fn suspend_self() {
    // The idle thread is always either running or ready, and it only
    // suspends itself when some other thread is ready to run.
    assert!(
        !ready_is_empty(),
        "suspend_self() with an empty ready list"
    );

    let suspending = crate::current().as_ptr();
    let saved = interrupts::disable();

    let next = unsafe { READY_LIST.lock().pop() }
        .expect("ready list emptied with interrupts masked")
        .as_ptr();

    unsafe {
        assert_eq!((*next).state, ThreadState::Ready);
        (*next).state = ThreadState::Running;

        // A still-running caller goes to the back of the queue. A
        // waiting or exited caller is parked elsewhere or nowhere.
        if (*suspending).state == ThreadState::Running {
            (*suspending).state = ThreadState::Ready;
            READY_LIST.lock().push(NonNull::new_unchecked(suspending));
        }
    }

    interrupts::enable();

    unsafe {
        let process = (*next).proc;
        if !process.is_null() {
            let _ = virtmem::switch((*process).mtag);
        }

        // From here we run on the resumed thread's stack. The thread
        // we switched away from may have exited; its stack can only
        // be reclaimed now that nothing is standing on it.
        let previous = switch::switch_to(next);
        reap(previous);
    }

    interrupts::restore(saved);
}

/// Reclaims the kernel stack of a thread that has exited.
///
/// Called on the far side of every context switch with the thread
/// that was just switched away from. Exited threads cannot free
/// their own stack, so the reclamation is deferred to the next
/// thread to run.
///
/// # Safety
///
/// `previous` must be the thread returned by the context switch, and
/// the current thread must not be standing on its stack.
///
pub(crate) unsafe fn reap(previous: *mut Thread) {
    if (*previous).state != ThreadState::Exited {
        return;
    }

    let anchor = (*previous).stack_base;
    if anchor.is_null() {
        return;
    }

    let bottom = anchor as usize - (*previous).stack_size;
    physmem::free_page(NonNull::new_unchecked(bottom as *mut u8));

    (*previous).stack_base = ptr::null_mut();
    (*previous).stack_size = 0;
}

/// The Rust half of the first-entry trampoline.
///
/// A brand-new thread's first context switch lands here instead of
/// returning into `suspend_self`, so the deferred stack reclamation
/// for the previous thread still happens before the entry function
/// runs. The entry function and argument arrive in registers, staged
/// by the context setup.
///
#[no_mangle]
extern "C" fn thread_startup(previous: *mut Thread, entry: crate::ThreadEntry, arg: usize) -> ! {
    unsafe { reap(previous) };

    entry(arg);

    // The entry function returned; the thread is done.
    crate::exit();
}

/// The idle thread's entry function.
///
/// The idle thread soaks up CPU time when nothing else is runnable.
/// While other threads are ready it just yields; once the ready list
/// is empty it halts the hart until an interrupt arrives.
///
pub(crate) extern "C" fn idle_entry(_arg: usize) {
    loop {
        // Yield while there is work. This runs with interrupts
        // enabled, so an interrupt service routine that readies a
        // thread is seen by the next iteration.
        while !ready_is_empty() {
            crate::yield_now();
        }

        // Nothing is runnable. Re-check under the mask before
        // sleeping: an interrupt could have readied a thread after
        // the check above, and sleeping past it would strand that
        // thread until the next interrupt.
        interrupts::disable();
        if READY_LIST.lock().is_empty() {
            cpu::wait_for_interrupt();
        }
        interrupts::enable();
    }
}
