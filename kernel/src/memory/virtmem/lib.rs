// Copyright 2024 The Mayfly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Address space identity and switching.
//!
//! An address space is identified by a [`MemoryTag`]: the exact value
//! written to the `satp` register, combining the Sv39 mode bits, the
//! address-space identifier (ASID), and the physical page number of
//! the root page table. The scheduler treats tags as opaque tokens: it
//! records one per process and installs it when it switches to one of
//! the process's threads.
//!
//! [`clone_space`] produces a new space that shares the current
//! space's mappings by copying the root table page. The kernel's own
//! mappings live in the upper half of the root table, so a clone sees
//! the same kernel and, initially, the same user pages. Deep copying
//! of user pages is the page-fault path's concern, not ours.
//!
//! On targets other than `riscv64` the active tag is emulated with an
//! atomic, so the fork bookkeeping is testable on the host.

#![cfg_attr(not(test), no_std)]

use core::ptr::NonNull;
use physmem::PAGE_SIZE;

/// The Sv39 translation mode field in `satp`.
///
const MODE_SV39: usize = 8 << 60;

const MODE_MASK: usize = 0xf << 60;
const ASID_SHIFT: usize = 44;
const ASID_MASK: usize = 0xffff << ASID_SHIFT;
const PPN_MASK: usize = (1 << ASID_SHIFT) - 1;

/// Identifies an address space: a `satp` image carrying the
/// translation mode, the ASID, and the root table's page number.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryTag(usize);

impl MemoryTag {
    /// The tag of the bare (translation disabled) boot space.
    ///
    pub const BARE: MemoryTag = MemoryTag(0);

    /// Builds a tag from an ASID and the physical address of a root
    /// page table.
    ///
    pub const fn new(asid: u16, root: usize) -> Self {
        MemoryTag(MODE_SV39 | ((asid as usize) << ASID_SHIFT) | (root >> 12))
    }

    /// Reconstructs a tag from a raw `satp` image.
    ///
    pub const fn from_bits(bits: usize) -> Self {
        MemoryTag(bits)
    }

    /// Returns the raw `satp` image.
    ///
    pub const fn bits(self) -> usize {
        self.0
    }

    /// Returns the address-space identifier encoded in the tag.
    ///
    pub const fn asid(self) -> u16 {
        ((self.0 & ASID_MASK) >> ASID_SHIFT) as u16
    }

    /// Returns the physical address of the root page table.
    ///
    pub const fn root_address(self) -> usize {
        (self.0 & PPN_MASK) << 12
    }

    /// Returns whether the tag names a translated address space, as
    /// opposed to the bare boot space or a zeroed field.
    ///
    pub const fn is_translated(self) -> bool {
        self.0 & MODE_MASK == MODE_SV39
    }
}

#[cfg(target_arch = "riscv64")]
mod active_space {
    use super::MemoryTag;

    pub fn active() -> MemoryTag {
        MemoryTag::from_bits(riscv::register::satp::read().bits())
    }

    pub unsafe fn install(tag: MemoryTag) {
        riscv::register::satp::write(tag.bits());
        core::arch::asm!("sfence.vma", options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "riscv64"))]
mod active_space {
    use super::MemoryTag;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static ACTIVE: AtomicUsize = AtomicUsize::new(0);

    pub fn active() -> MemoryTag {
        MemoryTag::from_bits(ACTIVE.load(Ordering::SeqCst))
    }

    pub unsafe fn install(tag: MemoryTag) {
        ACTIVE.store(tag.bits(), Ordering::SeqCst);
    }
}

/// Returns the tag of the currently active address space.
///
pub fn active() -> MemoryTag {
    active_space::active()
}

/// Switches to the given address space.
///
/// Returns the previously active tag on success, or `None` if the tag
/// does not name a translated space.
///
pub fn switch(tag: MemoryTag) -> Option<MemoryTag> {
    if !tag.is_translated() {
        return None;
    }

    let previous = active();
    unsafe { active_space::install(tag) };
    Some(previous)
}

/// Clones the active address space under a new ASID.
///
/// A fresh root table page is allocated and filled with the active
/// root's entries, so the clone shares every mapping with its parent.
/// If there is no active translated space the new root starts empty.
///
/// Returns `None` if no page is available for the root table.
///
pub fn clone_space(asid: u16) -> Option<MemoryTag> {
    let root: NonNull<u8> = physmem::allocate_page()?;

    let source = active();
    unsafe {
        if source.is_translated() {
            // The kernel region is identity mapped, so the root table
            // is reachable at its physical address.
            core::ptr::copy_nonoverlapping(
                source.root_address() as *const u8,
                root.as_ptr(),
                PAGE_SIZE,
            );
        } else {
            core::ptr::write_bytes(root.as_ptr(), 0, PAGE_SIZE);
        }
    }

    Some(MemoryTag::new(asid, root.as_ptr() as usize))
}

/// Releases the root table page of a cloned space.
///
/// # Safety
///
/// The space must not be active on the hart and no thread may be about
/// to switch to it.
///
pub unsafe fn release_space(tag: MemoryTag) {
    if let Some(root) = NonNull::new(tag.root_address() as *mut u8) {
        physmem::free_page(root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};

    // The active tag and the page pool are process-global.
    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    fn serial() -> MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[test]
    fn tag_fields_round_trip() {
        let tag = MemoryTag::new(7, 0x8020_3000);
        assert!(tag.is_translated());
        assert_eq!(tag.asid(), 7);
        assert_eq!(tag.root_address(), 0x8020_3000);

        assert!(!MemoryTag::BARE.is_translated());
        assert_eq!(MemoryTag::from_bits(tag.bits()), tag);
    }

    #[test]
    fn switch_rejects_untranslated_tags() {
        let _guard = serial();

        assert_eq!(switch(MemoryTag::BARE), None);
        assert_eq!(switch(MemoryTag::from_bits(0x1234)), None);
    }

    #[test]
    fn clone_then_switch() {
        let _guard = serial();

        let pages_before = physmem::available_pages();
        let tag = clone_space(3).unwrap();
        assert!(tag.is_translated());
        assert_eq!(tag.asid(), 3);
        assert_eq!(physmem::available_pages(), pages_before - 1);

        let previous = switch(tag).unwrap();
        assert_eq!(active(), tag);

        // A clone of a translated space copies its root table.
        let child = clone_space(4).unwrap();
        assert_ne!(child.root_address(), tag.root_address());
        assert_eq!(child.asid(), 4);

        // Restore and clean up.
        unsafe { active_space::install(previous) };
        unsafe {
            release_space(child);
            release_space(tag);
        }
        assert_eq!(physmem::available_pages(), pages_before);
    }
}
