// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Forking a kernel thread into a user-mode process.
//!
//! [`fork_to_user`] runs on the parent side, in the middle of the
//! parent's fork system call: it clones the parent's address space
//! under the child's ASID, spawns a kernel thread for the child, and
//! hands that thread a copy of the parent's trap frame. When the
//! scheduler first runs the child, the child-side half restores the
//! copied frame and returns to user mode at the same program counter
//! as the parent, with `a0` zeroed so the child sees fork return 0.

use crate::process::Process;
use crate::switch;
use crate::Thread;
use alloc::boxed::Box;
use core::ptr;
use cpu::TrapFrame;

/// The ways a fork can fail. The discriminants are the error codes
/// returned across the raw system-call boundary.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ForkError {
    /// A null process or trap-frame pointer reached the raw boundary.
    /// The typed interface makes this unrepresentable; the code is
    /// reserved for the system-call layer's argument checks.
    InvalidArgs = -1,

    /// The parent's address space could not be cloned.
    CloneFailed = -2,

    /// No kernel thread could be created for the child.
    SpawnFailed = -3,

    /// The spawned thread is missing from the thread table.
    MissingThread = -4,

    /// The switch into the child's address space failed.
    SpaceSwitchFailed = -5,
}

impl ForkError {
    /// Returns the numeric error code.
    ///
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// The argument packet handed to the child thread.
///
/// The thread field can only be filled in once the spawn has
/// allocated the child's record; the entry function tolerates running
/// before or after that write, since it recovers its own identity
/// from the current-thread register and merely cross-checks this.
///
struct ForkArgs {
    thread: *mut Thread,
    frame: TrapFrame,
}

/// Forks the calling thread into `child_proc`.
///
/// On success the child thread is ready to run; the first time it is
/// scheduled it returns to user mode as a copy of the parent, with
/// fork returning 0. The caller's address space is switched to the
/// child's as a side effect, so the child's user stack can be
/// adjusted before the parent returns to user mode.
///
/// The descriptor must be owned by the process table; the child
/// thread keeps a pointer to it for its lifetime.
///
pub fn fork_to_user(
    child_proc: &mut Process,
    parent_frame: &TrapFrame,
) -> Result<(), ForkError> {
    // Clone the parent's address space, tagged with the child's ASID.
    let provisional_tag = child_proc.mtag;
    let child_tag =
        virtmem::clone_space(provisional_tag.asid()).ok_or(ForkError::CloneFailed)?;
    child_proc.mtag = child_tag;

    // Copy the parent's trap frame into the argument packet and
    // adjust it for the child: fork returns 0, and the return lands
    // in user mode.
    let mut args = Box::new(ForkArgs {
        thread: ptr::null_mut(),
        frame: *parent_frame,
    });
    args.frame.set_return_value(0);
    args.frame.prepare_user_return();
    let args = Box::into_raw(args);

    let tid = match crate::try_spawn("fork-child", resume_child, args as usize) {
        Ok(tid) => tid,
        Err(_) => {
            // Nothing refers to the clone or the packet yet.
            child_proc.mtag = provisional_tag;
            unsafe {
                drop(Box::from_raw(args));
                virtmem::release_space(child_tag);
            }
            return Err(ForkError::SpawnFailed);
        }
    };

    let child = crate::thread_record(tid).ok_or(ForkError::MissingThread)?;
    let child = child.as_ptr();

    unsafe {
        // Complete the argument packet now that the record exists.
        (*args).thread = child;

        // Reassert the stack anchor's back-reference. The first trap
        // the child takes out of user mode recovers its thread
        // pointer through the anchor.
        (*(*child).stack_base).set_thread(child);

        crate::set_process(tid, ptr::NonNull::from(&mut *child_proc));
    }

    // Work in the child's space from here on, so the fork path can
    // touch the child's user stack before returning to user mode.
    virtmem::switch(child_tag).ok_or(ForkError::SpaceSwitchFailed)?;

    // The descriptor now names its thread.
    child_proc.tid = tid;

    Ok(())
}

/// The child thread's entry function.
///
/// Runs once, on the child's own kernel stack, when the scheduler
/// first selects the child. Moves the copied trap frame onto this
/// stack, releases the packet, and drops to user mode.
///
extern "C" fn resume_child(arg: usize) {
    let args = unsafe { Box::from_raw(arg as *mut ForkArgs) };

    debug_assert!(ptr::eq(args.thread, crate::current().as_ptr()));

    // The frame must outlive the packet; it lives on this stack until
    // the sret.
    let frame = args.frame;
    drop(args);

    let anchor = crate::current_stack_base();
    unsafe { switch::resume_fork_child(anchor.as_ptr(), &frame) }
}
