//! Debug-only lock-rank validation.
//!
//! Every lock in the extent map is associated with a [`Witness`] carrying a
//! [`WitnessRank`]. A thread may only acquire a lock whose rank is strictly
//! above the highest rank it already holds; witnesses created with
//! [`Witness::new_reentrant`] may additionally repeat their own rank, which
//! is what permits the mutex pool to take two shards for a pair operation.
//!
//! The bookkeeping lives in a thread-local stack and is only compiled in
//! with the `witness` feature (hosted targets). Without the feature every
//! function here is a no-op and the types are zero-cost tags.

/// Lock acquisition ranks, lowest first.
///
/// Ranks encode the only legal acquisition order in the map: a pool shard
/// may be held while materializing tree nodes, and node materialization may
/// call into the storage allocator, but never the other way around.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u32)]
pub enum WitnessRank {
    /// Mutex-pool shards pinning extent descriptors.
    Pool = 10,
    /// The radix tree's node materialization lock.
    RtreeInit = 20,
    /// Locks internal to the node storage allocator.
    Base = 30,
}

/// A named, ranked lock identity for order checking.
///
/// The witness does not provide any mutual exclusion itself; it merely
/// records acquisitions and releases of the lock it is attached to.
pub struct Witness {
    name: &'static str,
    rank: WitnessRank,
    reentrant: bool,
}

impl Witness {
    /// A witness whose rank must be strictly above every held rank.
    #[must_use]
    pub const fn new(name: &'static str, rank: WitnessRank) -> Self {
        Self {
            name,
            rank,
            reentrant: false,
        }
    }

    /// A witness that may also be re-acquired at its own rank.
    #[must_use]
    pub const fn new_reentrant(name: &'static str, rank: WitnessRank) -> Self {
        Self {
            name,
            rank,
            reentrant: true,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn rank(&self) -> WitnessRank {
        self.rank
    }

    /// Whether this witness may repeat its own rank.
    #[must_use]
    pub const fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    /// Record an acquisition, panicking on a rank-order violation.
    #[inline]
    pub fn lock(&self) {
        imp::lock(self);
    }

    /// Record a release.
    #[inline]
    pub fn unlock(&self) {
        imp::unlock(self);
    }
}

/// Assert that the current thread holds exactly `expected` locks at or above
/// `rank`.
///
/// Used at the entry of operations that would self-deadlock if a pool shard
/// were already held.
#[inline]
pub fn assert_depth_to_rank(rank: WitnessRank, expected: usize) {
    imp::assert_depth_to_rank(rank, expected);
}

#[cfg(feature = "witness")]
mod imp {
    extern crate std;

    use super::{Witness, WitnessRank};
    use core::cell::RefCell;
    use std::vec::Vec;

    std::thread_local! {
        static HELD: RefCell<Vec<(WitnessRank, &'static str)>> =
            const { RefCell::new(Vec::new()) };
    }

    pub(super) fn lock(w: &Witness) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            // The stack is nondecreasing by construction, so the top entry
            // is the maximum held rank.
            if let Some(&(max, against)) = held.last() {
                let ok = w.rank > max || (w.rank == max && w.reentrant);
                assert!(
                    ok,
                    "lock rank violation: acquiring {:?} ({}) while holding {:?} ({})",
                    w.rank, w.name, max, against
                );
            }
            held.push((w.rank, w.name));
        });
    }

    pub(super) fn unlock(w: &Witness) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            let pos = held
                .iter()
                .rposition(|&(rank, _)| rank == w.rank)
                .unwrap_or_else(|| {
                    panic!("releasing {:?} ({}) which is not held", w.rank, w.name)
                });
            held.remove(pos);
        });
    }

    pub(super) fn assert_depth_to_rank(rank: WitnessRank, expected: usize) {
        HELD.with(|held| {
            let held = held.borrow();
            let depth = held.iter().filter(|&&(r, _)| r >= rank).count();
            assert!(
                depth == expected,
                "expected {expected} locks held at or above {rank:?}, found {depth}"
            );
        });
    }
}

#[cfg(not(feature = "witness"))]
mod imp {
    use super::{Witness, WitnessRank};

    #[inline(always)]
    pub(super) fn lock(_w: &Witness) {}

    #[inline(always)]
    pub(super) fn unlock(_w: &Witness) {}

    #[inline(always)]
    pub(super) fn assert_depth_to_rank(_rank: WitnessRank, _expected: usize) {}
}
