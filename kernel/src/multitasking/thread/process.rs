// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The process descriptor the scheduler consumes.
//!
//! A process couples an address space with the thread that runs it.
//! Threads carry a back-reference to their process; the scheduler
//! follows it to install the right address space when it switches
//! threads, and fork records the child's identity here. Everything
//! else about processes (their table, their files, their images)
//! belongs to the process-management layer, not to the scheduler.
//!
//! Descriptors are owned by the process table and live for the life
//! of the kernel, which is why threads can hold plain pointers to
//! them.

use crate::ThreadId;
use virtmem::MemoryTag;

/// A process: an address space and the identity of its main thread.
///
#[derive(Debug)]
pub struct Process {
    /// The process identifier.
    pub id: usize,

    /// The thread executing this process.
    pub tid: ThreadId,

    /// The tag of the process's address space, installed whenever one
    /// of its threads is switched to.
    pub mtag: MemoryTag,
}

impl Process {
    /// Returns a descriptor for a process that will run in the given
    /// address space. The thread identity is filled in when a thread
    /// is attached.
    ///
    pub const fn new(id: usize, mtag: MemoryTag) -> Process {
        Process {
            id,
            tid: ThreadId::MAIN,
            mtag,
        }
    }
}
