// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements cooperative multitasking with kernel threads.
//!
//! This module owns the fixed pool of kernel threads and everything
//! that moves them between states: creation, yielding, blocking on
//! condition variables, exit, and the join protocol between parents
//! and children. Scheduling is round-robin over a single ready list
//! and strictly cooperative: a thread gives up the CPU only at
//! [`yield_now`], [`Condition::wait`], [`exit`], or by forking.
//! Interrupt service routines never switch threads directly; they may
//! only broadcast a condition, which feeds the ready list.
//!
//! ## Initialisation
//!
//! [`init`] builds the two permanent threads: MAIN, the thread the
//! boot path is already running on, and IDLE, which soaks up CPU time
//! when nothing else is runnable. It must be called once, with the
//! kernel heap available, before any other operation here.
//!
//! ## Lifecycle
//!
//! [`spawn`] creates a thread in the ready state; the scheduler first
//! runs it at some later suspension point. A thread ends by calling
//! [`exit`] (or by returning from its entry function, which is the
//! same thing). Its record survives in the EXITED state until the
//! parent collects it with [`join`] or [`join_any`], at which point
//! the slot is recycled and any orphaned children are handed to the
//! grandparent.
//!
//! The thread-pointer register always holds the address of the
//! running thread's record, so "current thread" is a register read.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod condition;
mod fork;
mod list;
mod process;
mod scheduler;
mod switch;

pub use crate::condition::Condition;
pub use crate::fork::{fork_to_user, ForkError};
pub use crate::process::Process;

use alloc::boxed::Box;
use core::mem;
use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use interrupts::without_interrupts;
use spin::Mutex;

/// The maximum number of threads, including MAIN and IDLE.
///
pub const NTHR: usize = 16;

/// The type of a thread entry function.
///
/// The C calling convention keeps the function callable from the
/// first-entry trampoline, which materialises the call out of saved
/// registers.
///
pub type ThreadEntry = extern "C" fn(arg: usize);

/// Uniquely identifies a thread: its slot in the thread table.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadId(usize);

impl ThreadId {
    /// MAIN is the thread id of the kernel's initial thread.
    ///
    pub const MAIN: Self = ThreadId(0);

    /// IDLE is the thread id of the idle thread, which occupies the
    /// last slot.
    ///
    pub const IDLE: Self = ThreadId(NTHR - 1);

    /// Returns the thread id for a raw slot number, as received over
    /// a system-call boundary. The id is not checked here; operations
    /// that take ids reject the dead and out-of-range ones.
    ///
    pub const fn new(id: usize) -> Self {
        ThreadId(id)
    }

    /// Returns a numerical representation for the thread ID.
    ///
    pub const fn as_usize(&self) -> usize {
        self.0
    }
}

/// Describes the scheduling state of a thread.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// The zero value: the record has not been initialised.
    Uninitialized,

    /// Reserved for suspension by debuggers; currently unused.
    Stopped,

    /// The thread is parked on a condition variable's wait list.
    Waiting,

    /// The thread is executing on the hart. Exactly one thread is in
    /// this state: the one the thread-pointer register names.
    Running,

    /// The thread is on the ready list, waiting its turn.
    Ready,

    /// The thread has exited and awaits collection by its parent.
    Exited,
}

impl ThreadState {
    /// Returns the state's name, for diagnostics.
    ///
    pub fn name(self) -> &'static str {
        match self {
            ThreadState::Uninitialized => "uninitialized",
            ThreadState::Stopped => "stopped",
            ThreadState::Waiting => "waiting",
            ThreadState::Running => "running",
            ThreadState::Ready => "ready",
            ThreadState::Exited => "exited",
        }
    }
}

/// The callee-saved register bank the context switch preserves:
/// s0..s11, the return address, and the stack pointer.
///
/// The switch assembly addresses these fields at fixed offsets from
/// the thread-pointer register, so the layout is a contract. The
/// constants below enforce it.
///
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct Context {
    s: [usize; 12],
    ra: usize,
    sp: usize,
}

impl Context {
    pub(crate) const fn zeroed() -> Context {
        Context {
            s: [0; 12],
            ra: 0,
            sp: 0,
        }
    }
}

/// The footer at the top of every kernel thread stack.
///
/// The anchor's address doubles as the thread's initial stack
/// pointer. While a thread runs in user mode, `sscratch` holds its
/// anchor address, and the trap entry recovers the owning thread
/// through the back-reference here.
///
#[repr(C)]
pub struct StackAnchor {
    thread: *mut Thread,
    reserved: usize,
}

impl StackAnchor {
    pub(crate) const fn new(thread: *mut Thread) -> StackAnchor {
        StackAnchor {
            thread,
            reserved: 0,
        }
    }

    /// Returns the thread that owns the stack this anchor tops.
    ///
    pub fn thread(&self) -> *mut Thread {
        self.thread
    }

    pub(crate) fn set_thread(&mut self, thread: *mut Thread) {
        self.thread = thread;
    }
}

/// Contains the metadata for a thread of execution.
///
/// Records are owned by their slot in the thread table. Other threads
/// refer to them with plain pointers (the parent back-reference, list
/// links, the thread-pointer register); those are weak in spirit, and
/// the recycle step rewrites them before the record is freed.
///
#[repr(C)]
pub struct Thread {
    // The context must remain the first field: the context switch
    // saves and restores it at offset zero of the thread-pointer
    // register.
    context: Context,

    // The thread's name, for diagnostics.
    name: &'static str,

    // The stack anchor at the top of the thread's kernel stack, or
    // null once the stack has been reclaimed.
    stack_base: *mut StackAnchor,

    // Bytes between the lowest valid stack address and the anchor.
    stack_size: usize,

    // The thread's current scheduling state.
    state: ThreadState,

    // The thread's slot in the thread table.
    id: ThreadId,

    // The process this thread executes, or null for kernel-only
    // threads. The scheduler installs the process's address space
    // when it switches to the thread.
    proc: *mut Process,

    // The thread that spawned this one. Rewritten to the grandparent
    // when the parent is recycled.
    parent: *mut Thread,

    // Linkage for the one list (ready or wait) the thread may be on.
    list_next: *mut Thread,

    // The condition this thread is waiting on; non-null exactly when
    // the state is WAITING.
    wait_cond: *const Condition,

    // Broadcast by this thread's children as they exit.
    child_exit: Condition,
}

// The layout contract with the context-switch assembly.
const _: () = assert!(mem::offset_of!(Thread, context) == 0);
const _: () = assert!(mem::size_of::<Context>() == 14 * 8);
const _: () = assert!(mem::size_of::<StackAnchor>() == 16);

/// The thread table: at most one owning reference per slot.
///
/// Slot 0 is MAIN and slot NTHR-1 is IDLE; neither is ever recycled.
/// A null slot is free. The table is only mutated from thread context
/// (spawn and recycle), never from interrupt service routines, so its
/// lock is taken without masking.
///
struct ThreadTable {
    slots: [*mut Thread; NTHR],
}

// Slots point at heap records that live until their slot is cleared.
unsafe impl Send for ThreadTable {}

static THREADS: Mutex<ThreadTable> = Mutex::new(ThreadTable {
    slots: [ptr::null_mut(); NTHR],
});

/// Whether [`init`] has completed. Diagnostic only.
///
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Returns whether the thread manager has been initialised.
///
pub fn initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Returns the currently executing thread.
///
/// The thread-pointer register holds the record's address; the
/// context switch keeps it up to date.
///
pub(crate) fn current() -> NonNull<Thread> {
    let tp = cpu::thread_pointer();
    debug_assert!(tp != 0, "no current thread before init()");
    unsafe { NonNull::new_unchecked(tp as *mut Thread) }
}

/// Returns the record in the given thread-table slot, if the slot is
/// live.
///
pub(crate) fn thread_record(tid: ThreadId) -> Option<NonNull<Thread>> {
    let index = tid.as_usize();
    if index >= NTHR {
        return None;
    }
    NonNull::new(THREADS.lock().slots[index])
}

/// Initialises the thread manager.
///
/// Builds the records for MAIN (the thread the caller is running on,
/// which keeps running) and IDLE (ready, waiting for its first turn),
/// and installs MAIN in the thread-pointer register. Requires the
/// kernel heap.
///
/// # Panics
///
/// `init` will panic if called more than once.
///
pub fn init() {
    assert!(!initialized(), "thread::init() called twice");

    let main_region = switch::main_stack();
    let main = Box::into_raw(Box::new(Thread {
        context: Context::zeroed(),
        name: "main",
        stack_base: main_region.anchor,
        stack_size: main_region.anchor as usize - main_region.bottom,
        state: ThreadState::Running,
        id: ThreadId::MAIN,
        proc: ptr::null_mut(),
        parent: ptr::null_mut(),
        list_next: ptr::null_mut(),
        wait_cond: ptr::null(),
        child_exit: Condition::new("main.child_exit"),
    }));

    let idle_region = switch::idle_stack();
    let idle = Box::into_raw(Box::new(Thread {
        context: Context::zeroed(),
        name: "idle",
        stack_base: idle_region.anchor,
        stack_size: idle_region.anchor as usize - idle_region.bottom,
        state: ThreadState::Ready,
        id: ThreadId::IDLE,
        proc: ptr::null_mut(),
        parent: main,
        list_next: ptr::null_mut(),
        wait_cond: ptr::null(),
        child_exit: Condition::new("idle.child_exit"),
    }));

    unsafe {
        main_region.anchor.write(StackAnchor::new(main));
        idle_region.anchor.write(StackAnchor::new(idle));
        switch::setup(idle, scheduler::idle_entry, 0);
    }

    {
        let mut table = THREADS.lock();
        table.slots[ThreadId::MAIN.as_usize()] = main;
        table.slots[ThreadId::IDLE.as_usize()] = idle;
    }

    without_interrupts(|| unsafe {
        scheduler::ready_insert(NonNull::new_unchecked(idle));
    });

    unsafe { cpu::set_thread_pointer(main as usize) };
    INITIALIZED.store(true, Ordering::Release);
}

/// The reasons a spawn can fail. The public [`spawn`] treats both as
/// fatal; the fork path degrades to an error code instead.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SpawnError {
    NoFreeSlot,
    OutOfMemory,
}

/// Creates a new thread running `entry(arg)` and returns its id.
///
/// The thread takes the lowest free table slot, one freshly allocated
/// page as its kernel stack, and a place at the tail of the ready
/// list. Its parent is the calling thread and it inherits the
/// caller's process.
///
/// # Panics
///
/// `spawn` panics if every slot is taken or no stack page is
/// available; running out of threads is a kernel bug.
///
pub fn spawn(name: &'static str, entry: ThreadEntry, arg: usize) -> ThreadId {
    match try_spawn(name, entry, arg) {
        Ok(tid) => tid,
        Err(SpawnError::NoFreeSlot) => panic!("too many threads"),
        Err(SpawnError::OutOfMemory) => panic!("no page for thread stack"),
    }
}

pub(crate) fn try_spawn(
    name: &'static str,
    entry: ThreadEntry,
    arg: usize,
) -> Result<ThreadId, SpawnError> {
    debug_assert!(initialized());

    let parent = current().as_ptr();

    // The slot scan and the insertion happen under one table lock, so
    // two spawns cannot claim the same slot. Slot NTHR-1 is IDLE's
    // and never considered.
    let mut table = THREADS.lock();
    let index = (1..NTHR - 1)
        .find(|&index| table.slots[index].is_null())
        .ok_or(SpawnError::NoFreeSlot)?;

    let page = physmem::allocate_page().ok_or(SpawnError::OutOfMemory)?;
    let anchor = (page.as_ptr() as usize + physmem::PAGE_SIZE - mem::size_of::<StackAnchor>())
        as *mut StackAnchor;

    let child = Box::into_raw(Box::new(Thread {
        context: Context::zeroed(),
        name,
        stack_base: anchor,
        stack_size: anchor as usize - page.as_ptr() as usize,
        state: ThreadState::Ready,
        id: ThreadId(index),
        proc: unsafe { (*parent).proc },
        parent,
        list_next: ptr::null_mut(),
        wait_cond: ptr::null(),
        child_exit: Condition::new("child_exit"),
    }));

    unsafe {
        anchor.write(StackAnchor::new(child));
        table.slots[index] = child;
        drop(table);

        without_interrupts(|| scheduler::ready_insert(NonNull::new_unchecked(child)));

        // Arrange for the first switch into the thread to land at
        // entry(arg) with the stack pointer at the anchor.
        switch::setup(child, entry, arg);
    }

    Ok(ThreadId(index))
}

/// Gives up the CPU to the next ready thread.
///
/// Returns when the scheduler selects this thread again; with only
/// yielding threads that is after every thread ready at the time of
/// the call has run once.
///
/// # Panics
///
/// Panics if the calling thread is not in the running state.
///
pub fn yield_now() {
    let cur = current().as_ptr();
    unsafe {
        assert_eq!(
            (*cur).state,
            ThreadState::Running,
            "yield by a thread that is not running"
        );
    }

    scheduler::suspend_self();
}

/// Terminates the calling thread.
///
/// The thread's parent is signalled so a pending [`join`] or
/// [`join_any`] can collect the slot. The kernel stack is reclaimed
/// by the next thread to run; the record survives until the parent
/// joins it.
///
/// If the main thread exits the kernel's work is done and the machine
/// halts with success.
///
pub fn exit() -> ! {
    let cur = current().as_ptr();

    unsafe {
        if (*cur).id == ThreadId::MAIN {
            power::halt_success();
        }

        (*cur).state = ThreadState::Exited;

        // Signal the parent in case it is waiting for us to exit.
        let parent = (*cur).parent;
        assert!(!parent.is_null(), "exiting thread has no parent");
        (*parent).child_exit.broadcast();
    }

    scheduler::suspend_self();
    unreachable!("exited thread was scheduled again");
}

/// The ways a join can fail. Both collapse to a single error code at
/// the system-call boundary.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinError {
    /// The id is out of range or its slot is empty.
    NoSuchThread,

    /// The thread exists but was not spawned by the caller.
    NotAChild,
}

/// Waits for the given child thread to exit, then recycles it.
///
/// Returns the child's id once its slot has been freed. Only the
/// parent may join a thread.
///
/// Exiting children broadcast on the *parent's* `child_exit`
/// condition, shared by all of the parent's joins, so the wait
/// re-tests the child's state in a loop.
///
pub fn join(tid: ThreadId) -> Result<ThreadId, JoinError> {
    let index = tid.as_usize();
    if index == 0 || index >= NTHR {
        return Err(JoinError::NoSuchThread);
    }

    let cur = current().as_ptr();
    let child = match thread_record(tid) {
        Some(child) => child.as_ptr(),
        None => return Err(JoinError::NoSuchThread),
    };

    unsafe {
        if (*child).parent != cur {
            return Err(JoinError::NotAChild);
        }

        // Any exiting child wakes every joiner; keep waiting until it
        // was ours. The record cannot be recycled under us, because
        // only the parent recycles and the parent is here.
        while (*child).state != ThreadState::Exited {
            (*cur).child_exit.wait();
        }
    }

    recycle(tid);
    Ok(tid)
}

/// Waits for any child thread to exit, then recycles it and returns
/// its id.
///
/// # Panics
///
/// Panics if the calling thread has no children (a kernel bug), or if
/// the wait ends with no exited child to collect.
///
pub fn join_any() -> ThreadId {
    let cur = current().as_ptr();

    // Fast path: a child has already exited.
    let (have_children, exited) = scan_children(cur);
    if let Some(tid) = exited {
        return join(tid).expect("exited child failed to join");
    }
    if !have_children {
        panic!("join_any() called by a childless thread");
    }

    // Wait for some child to exit. An exiting thread broadcasts its
    // parent's child_exit condition.
    unsafe { (*cur).child_exit.wait() };

    let (_, exited) = scan_children(cur);
    match exited {
        Some(tid) => {
            recycle(tid);
            tid
        }
        None => panic!("spurious child_exit signal"),
    }
}

/// Scans the table for children of `parent`, reporting whether any
/// exist and the first one already exited.
///
fn scan_children(parent: *mut Thread) -> (bool, Option<ThreadId>) {
    let table = THREADS.lock();
    let mut have_children = false;

    for index in 1..NTHR {
        let thr = table.slots[index];
        if thr.is_null() || unsafe { (*thr).parent } != parent {
            continue;
        }

        have_children = true;
        if unsafe { (*thr).state } == ThreadState::Exited {
            return (true, Some(ThreadId(index)));
        }
    }

    (have_children, None)
}

/// Frees an exited thread's slot and record.
///
/// The exiting thread's children are handed to its parent first, so
/// every surviving thread keeps a live parent. The kernel stack was
/// already reclaimed by the scheduler.
///
fn recycle(tid: ThreadId) {
    let index = tid.as_usize();
    assert!(index != 0 && index < NTHR);

    let thr = {
        let mut table = THREADS.lock();
        let thr = table.slots[index];
        assert!(!thr.is_null());

        unsafe {
            assert_eq!((*thr).state, ThreadState::Exited);
            debug_assert!(
                (*thr).stack_base.is_null(),
                "recycling a thread that still owns its stack"
            );

            // Make our parent the parent of our children.
            for other in 1..NTHR {
                let other = table.slots[other];
                if !other.is_null() && (*other).parent == thr {
                    (*other).parent = (*thr).parent;
                }
            }
        }

        table.slots[index] = ptr::null_mut();
        thr
    };

    drop(unsafe { Box::from_raw(thr) });
}

/// Returns the id of the calling thread.
///
pub fn current_id() -> ThreadId {
    unsafe { (*current().as_ptr()).id }
}

/// Returns the stack anchor of the calling thread.
///
pub fn current_stack_base() -> NonNull<StackAnchor> {
    let anchor = unsafe { (*current().as_ptr()).stack_base };
    debug_assert!(!anchor.is_null());
    unsafe { NonNull::new_unchecked(anchor) }
}

/// Returns the process the given thread executes, or `None` for a
/// kernel-only thread.
///
/// # Panics
///
/// Panics if the slot is dead; callers name threads they know to be
/// alive.
///
pub fn process_of(tid: ThreadId) -> Option<NonNull<Process>> {
    let thr = thread_record(tid).expect("process_of() on a dead thread");
    NonNull::new(unsafe { (*thr.as_ptr()).proc })
}

/// Attaches a process to the given thread. The descriptor must
/// outlive the thread; process descriptors are table-owned and are
/// not reclaimed.
///
/// # Panics
///
/// Panics if the slot is dead.
///
pub fn set_process(tid: ThreadId, process: NonNull<Process>) {
    let thr = thread_record(tid).expect("set_process() on a dead thread");
    unsafe { (*thr.as_ptr()).proc = process.as_ptr() };
}

/// Returns the given thread's name.
///
/// # Panics
///
/// Panics if the slot is dead.
///
pub fn name(tid: ThreadId) -> &'static str {
    let thr = thread_record(tid).expect("name() on a dead thread");
    unsafe { (*thr.as_ptr()).name }
}

/// Leaves the kernel and continues in user mode at `user_pc` on the
/// user stack `user_sp`.
///
/// The calling thread keeps running, in user mode; its stack anchor
/// is parked where the trap entry can recover the thread on the next
/// trap.
///
/// # Safety
///
/// `user_pc` and `user_sp` must be mapped in the active address
/// space.
///
pub unsafe fn jump_to_user(user_sp: usize, user_pc: usize) -> ! {
    switch::enter_user(current_stack_base().as_ptr(), user_sp, user_pc)
}

/// Prints the thread table and each thread's scheduling state.
///
pub fn debug() {
    let table = THREADS.lock();

    serial::println!("threads:");
    for index in 0..NTHR {
        let thr = table.slots[index];
        if thr.is_null() {
            continue;
        }

        unsafe {
            let parent = (*thr).parent;
            if parent.is_null() {
                serial::println!("  {:2} {:<12} {}", index, (*thr).name, (*thr).state.name());
            } else {
                serial::println!(
                    "  {:2} {:<12} {:<9} parent {}",
                    index,
                    (*thr).name,
                    (*thr).state.name(),
                    (*parent).id.as_usize()
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::boxed::Box as StdBox;
    use std::sync::{Mutex as StdMutex, MutexGuard, Once, PoisonError};
    use std::vec::Vec;

    static WORLD: StdMutex<()> = StdMutex::new(());
    static INIT: Once = Once::new();

    /// A do-nothing entry function for threads that are never run.
    ///
    pub(crate) extern "C" fn nop_entry(_arg: usize) {}

    /// Serialises tests that touch the scheduler's global state, and
    /// returns that state to its just-initialised shape.
    ///
    pub(crate) fn world() -> MutexGuard<'static, ()> {
        let guard = WORLD.lock().unwrap_or_else(PoisonError::into_inner);
        INIT.call_once(crate::init);
        reset();
        guard
    }

    fn reset() {
        unsafe {
            let (main, idle) = {
                let table = THREADS.lock();
                (
                    table.slots[ThreadId::MAIN.as_usize()],
                    table.slots[ThreadId::IDLE.as_usize()],
                )
            };

            cpu::set_thread_pointer(main as usize);
            interrupts::enable();

            (*main).state = ThreadState::Running;
            (*main).proc = ptr::null_mut();
            (*main).list_next = ptr::null_mut();
            (*main).wait_cond = ptr::null();
            (*main).child_exit = Condition::new("main.child_exit");

            // Drop every dynamically created thread, stack first.
            for index in 1..NTHR - 1 {
                let thr = {
                    let mut table = THREADS.lock();
                    let thr = table.slots[index];
                    table.slots[index] = ptr::null_mut();
                    thr
                };
                if thr.is_null() {
                    continue;
                }

                if !(*thr).stack_base.is_null() {
                    let bottom = (*thr).stack_base as usize - (*thr).stack_size;
                    physmem::free_page(NonNull::new_unchecked(bottom as *mut u8));
                }
                drop(StdBox::from_raw(thr));
            }

            // Only the idle thread is ready.
            (*idle).state = ThreadState::Ready;
            (*idle).parent = main;
            (*idle).list_next = ptr::null_mut();
            (*idle).wait_cond = ptr::null();
            scheduler::ready_with(|ready| {
                ready.clear();
                ready.push(NonNull::new_unchecked(idle));
            });
        }
    }

    /// Returns the record behind a thread id, which must be live.
    ///
    pub(crate) fn record(tid: ThreadId) -> *mut Thread {
        thread_record(tid).expect("no record for thread id").as_ptr()
    }

    /// Returns the entry argument staged for a thread that has never
    /// run.
    ///
    pub(crate) unsafe fn staged_entry_arg(thr: *mut Thread) -> usize {
        (*thr).context.s[1]
    }

    /// Builds a detached record for list-level tests: no stack, no
    /// table slot.
    ///
    pub(crate) fn boxed_thread(name: &'static str) -> StdBox<Thread> {
        StdBox::new(Thread {
            context: Context::zeroed(),
            name,
            stack_base: ptr::null_mut(),
            stack_size: 0,
            state: ThreadState::Ready,
            id: ThreadId::new(0),
            proc: ptr::null_mut(),
            parent: ptr::null_mut(),
            list_next: ptr::null_mut(),
            wait_cond: ptr::null(),
            child_exit: Condition::new("child_exit"),
        })
    }

    /// Leaves a spawned thread the way the scheduler leaves one that
    /// exited and was reaped: EXITED, off every list, stack returned,
    /// parent signalled.
    ///
    pub(crate) fn simulate_exit(tid: ThreadId) {
        let thr = record(tid);

        unsafe {
            scheduler::ready_with(|ready| {
                let rest: Vec<*mut Thread> = ready
                    .snapshot()
                    .into_iter()
                    .filter(|&t| t != thr)
                    .collect();
                ready.clear();
                for t in rest {
                    ready.push(NonNull::new_unchecked(t));
                }
            });

            (*thr).state = ThreadState::Exited;

            if !(*thr).stack_base.is_null() {
                let bottom = (*thr).stack_base as usize - (*thr).stack_size;
                physmem::free_page(NonNull::new_unchecked(bottom as *mut u8));
                (*thr).stack_base = ptr::null_mut();
                (*thr).stack_size = 0;
            }

            let parent = (*thr).parent;
            if !parent.is_null() {
                (*parent).child_exit.broadcast();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, nop_entry, record, simulate_exit};

    #[test]
    fn init_reports_initialized() {
        let _world = test_support::world();
        assert!(initialized());
    }

    #[test]
    fn the_register_names_the_running_thread() {
        let _world = test_support::world();

        // Exactly one thread is RUNNING: the one the thread-pointer
        // register holds.
        let main = record(ThreadId::MAIN);
        assert_eq!(current().as_ptr(), main);
        assert_eq!(current_id(), ThreadId::MAIN);

        let table = THREADS.lock();
        for index in 0..NTHR {
            let thr = table.slots[index];
            if thr.is_null() {
                continue;
            }
            let state = unsafe { (*thr).state };
            assert_eq!(state == ThreadState::Running, thr == main);
        }
    }

    #[test]
    fn table_slots_match_thread_ids() {
        let _world = test_support::world();

        spawn("a", nop_entry, 0);
        spawn("b", nop_entry, 0);

        let table = THREADS.lock();
        for index in 0..NTHR {
            let thr = table.slots[index];
            if !thr.is_null() {
                assert_eq!(unsafe { (*thr).id }, ThreadId::new(index));
            }
        }
    }

    #[test]
    fn spawn_populates_the_record() {
        let _world = test_support::world();

        let pages = physmem::available_pages();
        let tid = spawn("worker", nop_entry, 7);
        assert_eq!(tid, ThreadId::new(1));

        let thr = record(tid);
        let main = record(ThreadId::MAIN);
        unsafe {
            assert_eq!((*thr).state, ThreadState::Ready);
            assert_eq!((*thr).id, tid);
            assert_eq!((*thr).parent, main);
            assert_eq!((*thr).proc, (*main).proc);
            assert_eq!((*thr).name, "worker");
            assert_eq!(name(tid), "worker");

            // One page became the stack; the anchor tops it and
            // points back at the record.
            assert_eq!(physmem::available_pages(), pages - 1);
            assert_eq!((*(*thr).stack_base).thread(), thr);
            assert_eq!(
                (*thr).stack_size,
                physmem::PAGE_SIZE - mem::size_of::<StackAnchor>()
            );
            assert_eq!(test_support::staged_entry_arg(thr), 7);
        }

        // The new thread queues at the tail, behind the idle thread.
        let order = scheduler::ready_with(|ready| ready.snapshot());
        assert_eq!(order, std::vec![record(ThreadId::IDLE), thr]);
    }

    #[test]
    fn spawn_takes_the_lowest_free_slot() {
        let _world = test_support::world();

        let first = spawn("first", nop_entry, 0);
        let second = spawn("second", nop_entry, 0);
        assert_eq!(first, ThreadId::new(1));
        assert_eq!(second, ThreadId::new(2));

        // A recycled slot is reused in preference to higher ones.
        simulate_exit(first);
        join(first).unwrap();
        assert_eq!(spawn("third", nop_entry, 0), ThreadId::new(1));
    }

    #[test]
    #[should_panic(expected = "too many threads")]
    fn spawn_exhaustion_is_fatal() {
        let _world = test_support::world();

        // Slots 1 through NTHR-2 are spawnable; one more is fatal.
        for _ in 0..NTHR - 1 {
            spawn("filler", nop_entry, 0);
        }
    }

    #[test]
    fn join_rejects_bad_ids() {
        let _world = test_support::world();

        assert_eq!(join(ThreadId::MAIN), Err(JoinError::NoSuchThread));
        assert_eq!(
            join(ThreadId::new(NTHR + 3)),
            Err(JoinError::NoSuchThread)
        );
        assert_eq!(join(ThreadId::new(5)), Err(JoinError::NoSuchThread));

        // A live thread someone else spawned cannot be joined.
        let tid = spawn("stranger", nop_entry, 0);
        unsafe { (*record(tid)).parent = record(ThreadId::IDLE) };
        assert_eq!(join(tid), Err(JoinError::NotAChild));
    }

    #[test]
    fn join_recycles_the_slot() {
        let _world = test_support::world();

        let pages = physmem::available_pages();
        let tid = spawn("short-lived", nop_entry, 0);

        simulate_exit(tid);
        assert_eq!(join(tid), Ok(tid));

        // The slot is free, the record gone, and the stack page back
        // in the pool.
        assert!(thread_record(tid).is_none());
        assert_eq!(physmem::available_pages(), pages);

        // The freed slot can be taken by a later spawn.
        assert_eq!(spawn("successor", nop_entry, 0), tid);
    }

    #[test]
    fn exiting_thread_reparents_its_children() {
        let _world = test_support::world();

        let parent = spawn("parent", nop_entry, 0);
        let child = spawn("child", nop_entry, 0);
        let parent_rec = record(parent);
        let child_rec = record(child);
        let main = record(ThreadId::MAIN);

        // The child was really spawned by `parent`.
        unsafe { (*child_rec).parent = parent_rec };

        simulate_exit(parent);
        assert_eq!(join(parent), Ok(parent));

        // The grandchild now answers to main...
        unsafe { assert_eq!((*child_rec).parent, main) };

        // ...so main can collect it once it exits.
        simulate_exit(child);
        assert_eq!(join_any(), child);
        assert!(thread_record(child).is_none());
    }

    #[test]
    fn join_any_prefers_an_already_exited_child() {
        let _world = test_support::world();

        let a = spawn("a", nop_entry, 0);
        let b = spawn("b", nop_entry, 0);

        simulate_exit(a);
        assert_eq!(join_any(), a);

        simulate_exit(b);
        assert_eq!(join_any(), b);
    }

    #[test]
    #[should_panic(expected = "childless")]
    fn join_any_without_children_is_fatal() {
        let _world = test_support::world();

        // The idle thread counts as main's child; detach it to make
        // main genuinely childless.
        unsafe { (*record(ThreadId::IDLE)).parent = ptr::null_mut() };
        join_any();
    }

    #[test]
    fn accessors_describe_the_current_thread() {
        let _world = test_support::world();

        assert_eq!(current_id(), ThreadId::MAIN);
        assert_eq!(name(ThreadId::MAIN), "main");
        assert_eq!(name(ThreadId::IDLE), "idle");
        assert!(process_of(ThreadId::MAIN).is_none());

        let main = record(ThreadId::MAIN);
        unsafe {
            assert_eq!(
                current_stack_base().as_ptr(),
                (*main).stack_base
            );
        }
    }

    #[test]
    fn processes_attach_to_threads() {
        let _world = test_support::world();

        let tid = spawn("proc-thread", nop_entry, 0);
        let mut process = Process::new(9, virtmem::MemoryTag::new(9, 0x8040_0000));

        set_process(tid, NonNull::from(&mut process));
        let attached = process_of(tid).unwrap();
        assert_eq!(attached.as_ptr(), &mut process as *mut Process);
        assert_eq!(unsafe { attached.as_ref().id }, 9);
    }

    #[test]
    fn context_layout_matches_the_switch_contract() {
        // The switch assembly addresses the context through the
        // thread pointer at these offsets.
        assert_eq!(mem::offset_of!(Thread, context), 0);
        assert_eq!(mem::offset_of!(Context, s), 0);
        assert_eq!(mem::offset_of!(Context, ra), 96);
        assert_eq!(mem::offset_of!(Context, sp), 104);
        assert_eq!(mem::size_of::<StackAnchor>(), 16);

        // The trap frame offsets used by the fork resume path.
        assert_eq!(mem::offset_of!(cpu::TrapFrame, sstatus), 256);
        assert_eq!(mem::offset_of!(cpu::TrapFrame, sepc), 264);
    }
}
