// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! switch contains the functionality to switch between threads.
//!
//! The mechanical half lives in `switch.s`: saving and restoring the
//! callee-saved register set, the first-entry trampoline, and the two
//! routines that leave the kernel for user mode. This module wraps
//! those entry points and owns the one piece of layout they depend
//! on: a thread's saved [`Context`] sits at offset zero of the thread
//! record, addressed directly through the thread-pointer register.
//!
//! On targets other than `riscv64` the entry points are unreachable
//! stand-ins. Everything that merely records state (context setup,
//! the static stacks for the main and idle threads) works on any
//! target, which is what lets the rest of the crate be tested on the
//! host.

use crate::{Context, StackAnchor, Thread, ThreadEntry};
use cpu::TrapFrame;

/// The bounds of a statically allocated thread stack: the anchor at
/// the top and the lowest valid address.
///
pub(crate) struct StackRegion {
    pub anchor: *mut StackAnchor,
    pub bottom: usize,
}

#[cfg(target_arch = "riscv64")]
mod imp {
    use super::*;
    use core::arch::global_asm;

    global_asm!(include_str!("switch.s"));

    // The following symbols are implemented in switch.s.
    //
    extern "C" {
        /// Saves the calling thread's callee-saved registers into its
        /// context, installs `next`'s context and makes it the
        /// current thread, and returns the thread that was running
        /// before.
        ///
        pub fn switch_thread(next: *mut Thread) -> *mut Thread;

        /// The first-entry trampoline. Never called from Rust; its
        /// address is planted in a new thread's saved `ra` so the
        /// first switch into the thread lands here.
        ///
        pub fn start_thread();

        /// Leaves the kernel for user mode at `user_pc` with the user
        /// stack pointer `user_stack`. The stack anchor is parked in
        /// `sscratch` so the trap entry can find the thread again.
        ///
        pub fn enter_user(anchor: *mut StackAnchor, user_stack: usize, user_pc: usize) -> !;

        /// Completes a fork on the child side: restores the copied
        /// trap frame and returns to user mode.
        ///
        pub fn resume_fork_child(anchor: *mut StackAnchor, frame: *const TrapFrame) -> !;

        static mut _main_stack_bottom: u8;
        static mut _main_stack_anchor: StackAnchor;
        static mut _idle_stack_bottom: u8;
        static mut _idle_stack_anchor: StackAnchor;
    }

    pub fn main_stack() -> StackRegion {
        unsafe {
            StackRegion {
                anchor: core::ptr::addr_of_mut!(_main_stack_anchor),
                bottom: core::ptr::addr_of!(_main_stack_bottom) as usize,
            }
        }
    }

    pub fn idle_stack() -> StackRegion {
        unsafe {
            StackRegion {
                anchor: core::ptr::addr_of_mut!(_idle_stack_anchor),
                bottom: core::ptr::addr_of!(_idle_stack_bottom) as usize,
            }
        }
    }
}

#[cfg(not(target_arch = "riscv64"))]
mod imp {
    use super::*;
    use physmem::PAGE_SIZE;

    pub unsafe fn switch_thread(_next: *mut Thread) -> *mut Thread {
        unreachable!("context switch attempted on a hosted target");
    }

    /// Stands in for the first-entry trampoline so context setup has
    /// an address to plant.
    ///
    pub extern "C" fn start_thread() {
        unreachable!("thread started on a hosted target");
    }

    pub unsafe fn enter_user(
        _anchor: *mut StackAnchor,
        _user_stack: usize,
        _user_pc: usize,
    ) -> ! {
        unreachable!("user-mode entry attempted on a hosted target");
    }

    pub unsafe fn resume_fork_child(_anchor: *mut StackAnchor, _frame: *const TrapFrame) -> ! {
        unreachable!("fork resume attempted on a hosted target");
    }

    #[repr(C, align(4096))]
    struct HostStack([u8; PAGE_SIZE]);

    static mut MAIN_STACK: HostStack = HostStack([0; PAGE_SIZE]);
    static mut IDLE_STACK: HostStack = HostStack([0; PAGE_SIZE]);

    fn region_of(stack: *mut HostStack) -> StackRegion {
        let bottom = stack as usize;
        StackRegion {
            anchor: (bottom + PAGE_SIZE - core::mem::size_of::<StackAnchor>())
                as *mut StackAnchor,
            bottom,
        }
    }

    pub fn main_stack() -> StackRegion {
        region_of(unsafe { core::ptr::addr_of_mut!(MAIN_STACK) })
    }

    pub fn idle_stack() -> StackRegion {
        region_of(unsafe { core::ptr::addr_of_mut!(IDLE_STACK) })
    }
}

/// Returns the static stack reserved for the main thread.
///
pub(crate) fn main_stack() -> StackRegion {
    imp::main_stack()
}

/// Returns the static stack reserved for the idle thread.
///
pub(crate) fn idle_stack() -> StackRegion {
    imp::idle_stack()
}

/// Switches to `next`, returning the thread that was running before.
///
/// When this returns, the caller has been rescheduled; the value it
/// sees came out of a different thread's call to `switch_to` (or out
/// of the first-entry trampoline).
///
/// # Safety
///
/// `next` must be a live thread in the running state whose context
/// was either saved by a previous switch or prepared by [`setup`].
///
pub(crate) unsafe fn switch_to(next: *mut Thread) -> *mut Thread {
    imp::switch_thread(next)
}

/// Prepares a new thread's context so that the first switch into it
/// calls `entry(arg)` on its own stack.
///
/// The entry function and argument travel in the first two saved
/// s-registers; the saved return address points at the first-entry
/// trampoline, and the saved stack pointer starts at the stack
/// anchor.
///
/// # Safety
///
/// The thread must have a valid stack anchor and must not have run
/// yet.
///
pub(crate) unsafe fn setup(thr: *mut Thread, entry: ThreadEntry, arg: usize) {
    let context = &mut (*thr).context;
    *context = Context::zeroed();
    context.s[0] = entry as usize;
    context.s[1] = arg;
    context.ra = imp::start_thread as usize;
    context.sp = (*thr).stack_base as usize;
}

/// Jumps to user mode; see [`imp::enter_user`].
///
/// # Safety
///
/// `user_pc` and `user_stack` must be mapped in the active address
/// space. Does not return.
///
pub(crate) unsafe fn enter_user(
    anchor: *mut StackAnchor,
    user_stack: usize,
    user_pc: usize,
) -> ! {
    imp::enter_user(anchor, user_stack, user_pc)
}

/// Restores a forked child's trap frame in user mode; see
/// [`imp::resume_fork_child`].
///
/// # Safety
///
/// The frame must already be adjusted for a user-mode return and the
/// child's address space must be active.
///
pub(crate) unsafe fn resume_fork_child(anchor: *mut StackAnchor, frame: *const TrapFrame) -> ! {
    imp::resume_fork_child(anchor, frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn setup_stages_the_first_entry() {
        // Serialised: this test borrows a page from the shared pool.
        let _world = test_support::world();

        let mut thr = test_support::boxed_thread("fresh");
        let thr = &mut *thr as *mut Thread;

        let page = physmem::allocate_page().unwrap();
        unsafe {
            (*thr).stack_base = (page.as_ptr() as usize + physmem::PAGE_SIZE
                - core::mem::size_of::<StackAnchor>())
                as *mut StackAnchor;

            setup(thr, test_support::nop_entry, 0x1234);

            let context = &(*thr).context;
            assert_eq!(context.s[0], test_support::nop_entry as usize);
            assert_eq!(context.s[1], 0x1234);
            assert_eq!(context.ra, imp::start_thread as usize);
            assert_eq!(context.sp, (*thr).stack_base as usize);
            // The anchor address keeps the initial stack pointer
            // 16-byte aligned, as the ABI requires.
            assert_eq!(context.sp % 16, 0);

            physmem::free_page(page);
        }
    }

    #[test]
    fn static_stacks_end_in_an_anchor() {
        let main = main_stack();
        let idle = idle_stack();

        let size = physmem::PAGE_SIZE - core::mem::size_of::<StackAnchor>();
        assert_eq!(main.anchor as usize - main.bottom, size);
        assert_eq!(idle.anchor as usize - idle.bottom, size);
        assert_eq!(main.anchor as usize % 16, 0);
        assert_eq!(idle.anchor as usize % 16, 0);
    }
}
