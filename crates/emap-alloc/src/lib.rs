//! # Base Node Storage
//!
//! A minimal bump allocator over one reserved region, serving as the
//! [`NodeAlloc`] behind the radix tree. Tree nodes are permanent, so there
//! is no free path at all: a cursor only ever moves forward, and the whole
//! region is released in one piece when the allocator is dropped (when it
//! owns the region).
//!
//! The cursor sits behind a ranked spin lock at the bottom of the lock
//! order, so node materialization may call in here while holding the tree's
//! init lock.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

use alloc::alloc::{alloc as raw_alloc, dealloc};
use core::alloc::Layout;
use core::ptr::NonNull;
use emap_addresses::{PAGE_SIZE, align_up};
use emap_rtree::NodeAlloc;
use emap_sync::{SpinLock, WitnessRank};
use log::warn;

/// Bump allocator over a page-aligned region.
///
/// Hands out aligned, never-freed blocks until the region runs dry, then
/// returns `None` forever. Exhaustion is not an error at this level; the
/// tree reports it to its caller, which backs the whole operation out.
///
/// # Examples
///
/// ```
/// use core::alloc::Layout;
/// use emap_alloc::BumpAlloc;
/// use emap_rtree::NodeAlloc;
///
/// let base = BumpAlloc::with_capacity(64 * 1024).unwrap();
/// let node = base.alloc_node(Layout::from_size_align(4096, 64).unwrap());
/// assert!(node.is_some());
/// ```
pub struct BumpAlloc {
    region: NonNull<u8>,
    len: usize,
    /// Offset of the first free byte.
    cursor: SpinLock<usize>,
    /// Layout to release on drop; `None` for borrowed regions.
    owned: Option<Layout>,
}

// Safety: the region is exclusively owned and the cursor is lock-protected;
// handed-out blocks are disjoint.
unsafe impl Send for BumpAlloc {}
unsafe impl Sync for BumpAlloc {}

impl BumpAlloc {
    /// Reserve a fresh page-aligned region of `len` bytes from the global
    /// allocator.
    ///
    /// Returns `None` when `len` is zero, absurd, or the reservation fails.
    #[must_use]
    pub fn with_capacity(len: usize) -> Option<Self> {
        let layout = Layout::from_size_align(len, PAGE_SIZE as usize).ok()?;
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: the layout has non-zero size.
        let region = NonNull::new(unsafe { raw_alloc(layout) })?;
        // SAFETY: `region` satisfies `layout` and is exclusively ours.
        Some(unsafe { Self::from_raw(region, len) }.own(layout))
    }

    /// Bump over a caller-reserved region.
    ///
    /// The region is never released by this type.
    ///
    /// # Safety
    /// - `region` must be valid for reads and writes of `len` bytes for the
    ///   life of the allocator and everything allocated from it.
    /// - Nothing else may use the region.
    #[must_use]
    pub const unsafe fn from_raw(region: NonNull<u8>, len: usize) -> Self {
        Self {
            region,
            len,
            cursor: SpinLock::new("base_bump", WitnessRank::Base, 0),
            owned: None,
        }
    }

    fn own(mut self, layout: Layout) -> Self {
        self.owned = Some(layout);
        self
    }

    /// Bytes not yet handed out.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.len - self.cursor.with_lock(|cursor| *cursor)
    }

    /// Total region size in bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.len
    }
}

impl NodeAlloc for BumpAlloc {
    fn alloc_node(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.cursor.with_lock(|cursor| {
            let base = self.region.as_ptr() as usize;
            let aligned = align_up((base + *cursor) as u64, layout.align() as u64) as usize;
            let end = (aligned - base).checked_add(layout.size())?;
            if end > self.len {
                warn!(
                    "base region exhausted: {} of {} bytes used, {} requested",
                    *cursor,
                    self.len,
                    layout.size()
                );
                return None;
            }
            *cursor = end;
            NonNull::new(aligned as *mut u8)
        })
    }
}

impl Drop for BumpAlloc {
    fn drop(&mut self) {
        if let Some(layout) = self.owned {
            // SAFETY: `region` came from `raw_alloc` with this exact layout.
            unsafe { dealloc(self.region.as_ptr(), layout) };
        }
    }
}
