//! # Synchronization primitives for the extent map
//!
//! The extent map serializes descriptor mutation without storing a lock in
//! every descriptor: a fixed pool of spin mutexes is sharded by hashing the
//! descriptor's address. This crate provides that pool, the raw spin lock it
//! is built from, a closure-scoped [`SpinLock`] for small owned state, and a
//! debug-only lock-rank validator (the *witness*).
//!
//! ## Lock ranks
//!
//! All locks in the map carry a [`WitnessRank`]. Ranks must strictly increase
//! along any acquisition chain:
//!
//! | Rank | Holder |
//! |-------|--------|
//! | [`Pool`](WitnessRank::Pool) | Mutex-pool shards pinning extent descriptors. |
//! | [`RtreeInit`](WitnessRank::RtreeInit) | Radix-tree node materialization. |
//! | [`Base`](WitnessRank::Base) | The node storage allocator. |
//!
//! Rank tracking only exists with the `witness` feature enabled (hosted
//! targets); without it every check compiles to nothing.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod pool;
mod raw_spin;
mod spin_lock;
pub mod witness;

pub use pool::{MutexPool, POOL_SHARDS};
pub use raw_spin::RawSpin;
pub use spin_lock::SpinLock;
pub use witness::{Witness, WitnessRank};
