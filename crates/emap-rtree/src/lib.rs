//! # Address Radix Tree
//!
//! A fixed-height radix tree over the whole 64-bit address space, mapping
//! every page-aligned address to the descriptor of the extent registered
//! there. This is the structure behind every size lookup the allocator does
//! on a free path, so reads take no locks and at most one atomic fence.
//!
//! ## Shape
//!
//! Keys are virtual addresses; the low page-offset bits are never consumed.
//! The remaining 52 bits are split across six levels (7 bits at the top,
//! then 9 per level, fanout 512). Interior nodes are arrays of child
//! pointers, the deepest level is an array of [`LeafElm`]s:
//!
//! ```text
//! key = [ 7 | 9 | 9 | 9 | 9 | 9 | 12 (page offset, ignored) ]
//!         L0  L1  L2  L3  L4  L5
//! ```
//!
//! Every level keeps its own lazily created subtree root, so a key whose
//! upper bits are zero (every user-space address, in practice) starts its
//! descent several levels down and touches only three or four nodes.
//!
//! ## Concurrency
//!
//! - **Interior pointers** are install-once: published with release under
//!   the tree's init lock, read with acquire. They are never reassigned and
//!   never freed.
//! - **Leaf elements** hold the descriptor pointer in an atomic word whose
//!   low bit is a per-element spin lock; see [`LeafElm`].
//! - **Dependent reads**: a caller that holds proof the mapping exists (for
//!   example a pointer handed out by a prior allocation) passes
//!   `dependent = true` and gets relaxed loads; the write that installed
//!   the mapping happened before the proof came into existence. Speculative
//!   callers pass `false` and pay the acquire.
//!
//! ## Storage
//!
//! Node memory comes from a [`NodeAlloc`] supplied by the embedder and is
//! permanent: the tree zeroes each node before publication and never
//! returns one. Materialization failures surface as [`RtreeError`] from the
//! writing entry points; the tree is left exactly as it was.
//!
//! Hot-path entry points take a per-thread [`RtreeCtx`] lookup cache owned
//! by the caller.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod ctx;
mod leaf;
mod tree;

pub use ctx::{CACHE_SLOTS, RtreeCtx};
pub use leaf::{LeafElm, LeafGuard, RtreeContents};
pub use tree::Rtree;

use core::alloc::Layout;
use core::ptr::NonNull;

/// Permanent storage provider for tree nodes.
///
/// The base allocator of the surrounding allocator implements this; tests
/// substitute budgeted doubles. Implementations hand out blocks that satisfy
/// `layout` and stay valid for the life of the process. Returned memory does
/// not need to be zeroed; the tree zeroes nodes before publishing them.
///
/// Returns `None` when the backing region is exhausted.
pub trait NodeAlloc {
    fn alloc_node(&self, layout: Layout) -> Option<NonNull<u8>>;
}

impl<A: NodeAlloc> NodeAlloc for &A {
    fn alloc_node(&self, layout: Layout) -> Option<NonNull<u8>> {
        A::alloc_node(self, layout)
    }
}

/// Failure of a tree operation that may materialize nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RtreeError {
    /// The [`NodeAlloc`] could not provide another node.
    #[error("out of memory while materializing a tree node")]
    OutOfMemory,
}
