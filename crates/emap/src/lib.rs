//! # Extent Map
//!
//! The transactional façade over the address radix tree: given any address
//! inside a registered extent, recover (and optionally pin) its descriptor;
//! keep the address space's bookkeeping coherent while extents are
//! registered, split, merged, and released.
//!
//! ## Data flow
//!
//! A free path hands an address to [`ExtentMap::alloc_info_lookup`] or
//! [`ExtentMap::lookup`]; a dependent radix-tree read recovers the
//! descriptor with no locks taken. Structural paths (coalescing, purging)
//! use [`ExtentMap::lock_extent_from_addr`] to pin a neighbour, then drive
//! the two-phase [`split`](ExtentMap::split_prepare) and
//! [`merge`](ExtentMap::merge_prepare) transactions.
//!
//! ## Two-phase transactions
//!
//! Everything that can fail (node materialization) happens in *prepare*;
//! *commit* performs only stores and cannot fail. This is what keeps a
//! half-installed mapping from ever existing: when prepare fails the tree
//! is exactly as it was.
//!
//! ## Locking
//!
//! Descriptors are pinned through a [`MutexPool`](emap_sync::MutexPool)
//! shard selected by hashing the descriptor address; the RAII guards
//! ([`ExtentLock`], [`ExtentPairLock`]) release on drop. Field mutation of
//! a registered descriptor is only legal while holding its shard, and the
//! split/merge commits write descriptor fields *before* publishing new
//! mappings, so a reader that observes a mapping observes initialized
//! fields.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod lock;
mod map;

pub use lock::{ExtentLock, ExtentPairLock};
pub use map::{AllocInfo, ExtentMap, MergePrepare, SplitPiece, SplitPrepare};

/// Re-exported per-thread lookup cache; one per thread, passed into every
/// hot-path call.
pub use emap_rtree::{RtreeContents, RtreeCtx};

use emap_rtree::RtreeError;

/// Failure of a map operation that may materialize tree nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// The base allocator ran out of node storage; nothing was changed.
    #[error("radix tree node allocation failed")]
    OutOfNodes(#[from] RtreeError),
}
