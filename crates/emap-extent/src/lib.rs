//! # Extent Descriptors
//!
//! An *extent* is one contiguous, page-aligned range of virtual memory owned
//! by the allocator. The [`Extent`] descriptor records everything the
//! allocator needs to know about the range: its base and size, the arena it
//! belongs to, its size class, whether it is a slab, its lifecycle
//! [`state`](ExtentState), and a handful of single-bit properties.
//!
//! Most of those fields are packed into a single `u64` so a descriptor stays
//! small; the accessors unpack on demand and are free in release builds.
//!
//! ## Ownership
//!
//! A descriptor is owned by exactly one collector at a time: an arena bin, an
//! extent cache, or the operation currently transforming it. The address map
//! only ever holds *references* (`NonNull<Extent>`) to descriptors; it never
//! allocates, frees, or owns them. The intrusive [`ExtentLinks`] block exists
//! for the owning collector and is never touched by the map.
//!
//! ## Alignment
//!
//! Descriptor pointers are stored in radix-tree leaves with the low bit
//! repurposed as a lock, so `Extent` must have alignment of at least 2. This
//! is statically asserted below.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod extent;
mod size_class;
mod state;

pub use extent::{Extent, ExtentLinks};
pub use size_class::{NBINS, NSIZES, SizeClass};
pub use state::ExtentState;

use static_assertions::const_assert;

// The low bit of a descriptor pointer doubles as a leaf lock.
const_assert!(align_of::<Extent>() >= 2);
// Keys, descriptor words and hashes all assume 64-bit pointers.
const_assert!(size_of::<usize>() == 8);
