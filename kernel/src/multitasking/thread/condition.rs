// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Condition variables.
//!
//! A [`Condition`] is a named wait list. A running thread parks itself
//! on one with [`wait`](Condition::wait); any context, including an
//! interrupt service routine, can make every parked thread runnable
//! again with [`broadcast`](Condition::broadcast).
//!
//! `wait` is deliberately bare: it carries no predicate and there is
//! no single-thread wakeup. Because a broadcast wakes every waiter and
//! any of them may win the race for whatever was being waited for,
//! callers re-test their predicate in a loop around `wait`, as
//! [`join`](crate::join) does.

use crate::list::ThreadList;
use crate::scheduler;
use crate::ThreadState;
use core::ptr;
use core::ptr::NonNull;
use interrupts::without_interrupts;
use spin::Mutex;

/// A condition variable: a name and the threads waiting on it.
///
pub struct Condition {
    name: &'static str,

    // Every access is made with interrupts masked: a broadcast from
    // an interrupt service routine takes this lock too, and on a
    // single hart a spin lock taken with interrupts unmasked can
    // deadlock against the routine that interrupts it.
    wait_list: Mutex<ThreadList>,
}

impl Condition {
    /// Returns a new condition with no waiting threads.
    ///
    pub const fn new(name: &'static str) -> Condition {
        Condition {
            name,
            wait_list: Mutex::new(ThreadList::new()),
        }
    }

    /// Returns the condition's name.
    ///
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Blocks the current thread until the condition is broadcast.
    ///
    /// The thread is marked waiting, appended to the wait list, and
    /// the next ready thread runs. The call returns once a broadcast
    /// has made this thread runnable again and the scheduler has
    /// selected it.
    ///
    /// # Panics
    ///
    /// Panics if the current thread is not in the running state.
    ///
    pub fn wait(&self) {
        let current = crate::current().as_ptr();

        unsafe {
            assert_eq!(
                (*current).state,
                ThreadState::Running,
                "wait() by a thread that is not running"
            );

            (*current).state = ThreadState::Waiting;
            (*current).wait_cond = self as *const Condition;

            without_interrupts(|| {
                self.wait_list.lock().push(NonNull::new_unchecked(current));
            });
        }

        scheduler::suspend_self();

        // A broadcast put us back on the ready list and cleared the
        // condition backlink before we could be scheduled again.
        unsafe {
            debug_assert_eq!((*current).state, ThreadState::Running);
            debug_assert!((*current).wait_cond.is_null());
        }
    }

    /// Makes every thread waiting on the condition runnable.
    ///
    /// Waiters are appended to the ready list in the order they
    /// arrived, behind every thread already there. Safe to call from
    /// interrupt service routines.
    ///
    pub fn broadcast(&self) {
        // Fast path: nobody is waiting. The caller's interrupt mask
        // state is left exactly as it was.
        let nobody_waiting = without_interrupts(|| self.wait_list.lock().is_empty());
        if nobody_waiting {
            return;
        }

        without_interrupts(|| {
            let mut waiters = self.wait_list.lock();

            // Mark every waiter runnable. This walk is linear, but it
            // keeps each thread's state field accurate, which the
            // scheduler's assertions rely on.
            unsafe {
                let mut thr = waiters.head();
                while !thr.is_null() {
                    assert_eq!((*thr).state, ThreadState::Waiting);
                    assert!(ptr::eq((*thr).wait_cond, self));

                    (*thr).state = ThreadState::Ready;
                    (*thr).wait_cond = ptr::null();
                    thr = (*thr).list_next;
                }

                scheduler::ready_append(&mut waiters);
            }
        });
    }

    /// Calls `f` with the wait list, for tests that stage or inspect
    /// waiters directly.
    ///
    #[cfg(test)]
    pub(crate) fn with_wait_list<R>(&self, f: impl FnOnce(&mut ThreadList) -> R) -> R {
        without_interrupts(|| f(&mut self.wait_list.lock()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use crate::Thread;

    // Stages a spawned thread as a waiter on `cond`, the way wait()
    // leaves it, without suspending the test itself.
    fn stage_waiter(cond: &Condition, thr: *mut Thread) {
        unsafe {
            scheduler::ready_with(|ready| {
                let waiting: std::vec::Vec<*mut Thread> = ready
                    .snapshot()
                    .into_iter()
                    .filter(|&t| t != thr)
                    .collect();
                ready.clear();
                for t in waiting {
                    ready.push(NonNull::new_unchecked(t));
                }
            });

            (*thr).state = ThreadState::Waiting;
            (*thr).wait_cond = cond as *const Condition;
            cond.with_wait_list(|list| list.push(NonNull::new_unchecked(thr)));
        }
    }

    #[test]
    fn broadcast_on_empty_list_is_a_no_op() {
        let _world = test_support::world();

        let cond = Condition::new("empty");

        interrupts::enable();
        cond.broadcast();
        assert!(interrupts::enabled());

        // The mask state of a masked caller is preserved too.
        let saved = interrupts::disable();
        cond.broadcast();
        assert!(!interrupts::enabled());
        interrupts::restore(saved);
    }

    #[test]
    fn broadcast_moves_waiters_in_wait_order() {
        let _world = test_support::world();

        static COND: Condition = Condition::new("ordered");

        let first = crate::spawn("first", test_support::nop_entry, 0);
        let second = crate::spawn("second", test_support::nop_entry, 0);
        let first = crate::test_support::record(first);
        let second = crate::test_support::record(second);

        stage_waiter(&COND, first);
        stage_waiter(&COND, second);

        COND.broadcast();

        unsafe {
            assert_eq!((*first).state, ThreadState::Ready);
            assert_eq!((*second).state, ThreadState::Ready);
            assert!((*first).wait_cond.is_null());
            assert!((*second).wait_cond.is_null());
        }

        COND.with_wait_list(|list| assert!(list.is_empty()));

        // Waiters queue behind the idle thread, which was already
        // ready, and in their original wait order.
        let order = scheduler::ready_with(|ready| ready.snapshot());
        let idle = crate::test_support::record(crate::ThreadId::IDLE);
        assert_eq!(order, std::vec![idle, first, second]);
    }

    #[test]
    fn waiting_threads_point_at_their_condition() {
        let _world = test_support::world();

        static COND: Condition = Condition::new("backlink");

        let tid = crate::spawn("waiter", test_support::nop_entry, 0);
        let thr = crate::test_support::record(tid);
        stage_waiter(&COND, thr);

        // state == WAITING exactly when the thread is on a wait list,
        // and the backlink names that condition.
        unsafe {
            assert_eq!((*thr).state, ThreadState::Waiting);
            assert!(ptr::eq((*thr).wait_cond, &COND));
        }
        COND.with_wait_list(|list| assert_eq!(list.snapshot(), std::vec![thr]));

        COND.broadcast();
        unsafe {
            assert!((*thr).wait_cond.is_null());
        }
    }
}
