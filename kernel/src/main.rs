// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel binary: boot path and demonstration workload.
//!
//! The SBI firmware enters at `_start` in supervisor mode. The boot
//! stub moves onto the main thread's static stack, zeroes `.bss`, and
//! calls [`kmain`], which brings the kernel up and then drives the
//! thread manager through its paces: round-robin yielding, condition
//! wakeup, reparenting of orphaned threads, and the idle handoff.
//! When every exercise has passed, the main thread exits and the
//! machine halts with success.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
mod boot {
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use serial::println;
    use spin::Mutex;
    use thread::{Condition, ThreadId};

    // The boot stub. The main thread's stack lives in the thread
    // manager's assembly, anchor at the top; .bss must be zeroed
    // before any Rust runs.
    core::arch::global_asm!(
        r#"
        .section .text.boot
        .global _start
_start:
        la      sp, _main_stack_anchor

        la      t0, __bss_start
        la      t1, __bss_end
1:
        bgeu    t0, t1, 2f
        sd      zero, 0(t0)
        addi    t0, t0, 8
        j       1b
2:
        call    kmain
3:
        wfi
        j       3b
"#
    );

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        println!("kernel panic: {}", info);
        power::halt_failure();
    }

    /// Each producer appends its thread id to the log once per turn,
    /// so the log records the scheduler's round-robin order.
    ///
    static RUN_LOG: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    extern "C" fn producer(turns: usize) {
        for _ in 0..turns {
            RUN_LOG.lock().push(thread::current_id().as_usize());
            thread::yield_now();
        }
        // Returning exits the thread.
    }

    /// Two threads that yield three times each must alternate
    /// strictly, and joining must collect both slots.
    ///
    fn exercise_round_robin() {
        let first = thread::spawn("producer-1", producer, 3);
        let second = thread::spawn("producer-2", producer, 3);

        let mut collected = [thread::join_any(), thread::join_any()];
        collected.sort();
        assert_eq!(collected, [first, second]);

        let log = RUN_LOG.lock();
        let a = first.as_usize();
        let b = second.as_usize();
        assert_eq!(*log, [a, b, a, b, a, b]);

        println!("round robin: {:?} ok", *log);
    }

    static WAKEUP: Condition = Condition::new("demo.wakeup");
    static SIGNALED: AtomicBool = AtomicBool::new(false);
    static OBSERVED: AtomicBool = AtomicBool::new(false);

    extern "C" fn sleeper(_arg: usize) {
        // The bare wait needs a predicate loop: a broadcast wakes
        // every waiter, and this thread may lose the race.
        while !SIGNALED.load(Ordering::Acquire) {
            WAKEUP.wait();
        }
        OBSERVED.store(true, Ordering::Release);
    }

    /// A waiter parked on a condition runs again after broadcast, and
    /// its slot is reclaimed by join.
    ///
    fn exercise_condition_wakeup() {
        let tid = thread::spawn("sleeper", sleeper, 0);

        // One yield walks the ready list (idle, then the sleeper), so
        // by the time this thread runs again the sleeper is parked.
        thread::yield_now();

        SIGNALED.store(true, Ordering::Release);
        WAKEUP.broadcast();

        assert_eq!(thread::join(tid), Ok(tid));
        assert!(OBSERVED.load(Ordering::Acquire));

        println!("condition wakeup: ok");
    }

    static GRANDCHILD: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn grandchild(_arg: usize) {
        thread::yield_now();
        thread::yield_now();
    }

    extern "C" fn short_lived_parent(_arg: usize) {
        let tid = thread::spawn("grandchild", grandchild, 0);
        GRANDCHILD.store(tid.as_usize(), Ordering::Release);
        // Exit immediately, orphaning the grandchild.
    }

    /// A thread that dies before its child is collected hands the
    /// child to its own parent.
    ///
    fn exercise_reparenting() {
        let middle = thread::spawn("mid-parent", short_lived_parent, 0);
        assert_eq!(thread::join(middle), Ok(middle));

        // The grandchild was orphaned and now answers to us.
        let tid = ThreadId::new(GRANDCHILD.load(Ordering::Acquire));
        assert_eq!(thread::join_any(), tid);

        println!("reparenting: ok");
    }

    /// With nothing else runnable, a yield hands control to the idle
    /// thread and comes straight back.
    ///
    fn exercise_idle_handoff() {
        thread::yield_now();
        println!("idle handoff: ok");
    }

    #[no_mangle]
    extern "C" fn kmain() -> ! {
        kernel::init();

        exercise_round_robin();
        exercise_condition_wakeup();
        exercise_reparenting();
        exercise_idle_handoff();

        thread::debug();
        println!("all exercises passed");

        // Exiting the main thread halts the machine with success.
        thread::exit();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
