use crate::map::ExtentMap;
use core::ops::Deref;
use core::ptr::NonNull;
use emap_addresses::VirtualAddress;
use emap_extent::Extent;
use emap_rtree::RtreeCtx;
use emap_sync::WitnessRank;
use emap_sync::witness;

/// The pool key for a descriptor is its address.
#[inline]
fn pool_key(extent: NonNull<Extent>) -> usize {
    extent.as_ptr() as usize
}

/// A pool-shard hold on one descriptor.
///
/// While the guard lives, no other structural operation can mutate the
/// descriptor or swing the mappings under it out from under the holder;
/// `Deref` gives a read view. Dropping the guard releases the shard.
pub struct ExtentLock<'m> {
    map: &'m ExtentMap,
    extent: NonNull<Extent>,
}

impl ExtentLock<'_> {
    /// The pinned descriptor.
    #[must_use]
    pub const fn extent(&self) -> NonNull<Extent> {
        self.extent
    }
}

impl Deref for ExtentLock<'_> {
    type Target = Extent;

    fn deref(&self) -> &Extent {
        // SAFETY: registration vouched for the descriptor's validity, and
        // the held shard keeps mutators out.
        unsafe { self.extent.as_ref() }
    }
}

impl Drop for ExtentLock<'_> {
    fn drop(&mut self) {
        // SAFETY: we hold the shard for this key.
        unsafe { self.map.pool.unlock(pool_key(self.extent)) };
    }
}

/// A pool hold on two descriptors at once (for merges).
///
/// Acquisition is ordered by shard index, collapsing to a single shard when
/// both descriptors hash together, so concurrent pair locks cannot
/// deadlock.
pub struct ExtentPairLock<'m> {
    map: &'m ExtentMap,
    keys: (usize, usize),
}

impl Drop for ExtentPairLock<'_> {
    fn drop(&mut self) {
        // SAFETY: we hold both shards.
        unsafe { self.map.pool.unlock_pair(self.keys.0, self.keys.1) };
    }
}

impl ExtentMap {
    /// Pin `extent` through its pool shard.
    ///
    /// The calling thread must not already hold a pool shard (checked by
    /// the witness in debug builds); two shards are only ever taken through
    /// [`lock_extent_pair`](Self::lock_extent_pair).
    pub fn lock_extent(&self, extent: NonNull<Extent>) -> ExtentLock<'_> {
        witness::assert_depth_to_rank(WitnessRank::Pool, 0);
        self.pool.lock(pool_key(extent));
        ExtentLock { map: self, extent }
    }

    /// Pin two descriptors, deadlock-free.
    pub fn lock_extent_pair(
        &self,
        a: NonNull<Extent>,
        b: NonNull<Extent>,
    ) -> ExtentPairLock<'_> {
        witness::assert_depth_to_rank(WitnessRank::Pool, 0);
        self.pool.lock_pair(pool_key(a), pool_key(b));
        ExtentPairLock {
            map: self,
            keys: (pool_key(a), pool_key(b)),
        }
    }

    /// Find and pin the descriptor covering `addr`.
    ///
    /// Returns `None` when nothing is mapped there, or when `inactive_only`
    /// and the mapping is a slab (slabs are always active). On success the
    /// returned guard's descriptor covered `addr` at the moment the shard
    /// was taken.
    ///
    /// The implementation races registration and structural changes: the
    /// descriptor read from the leaf may be replaced before its shard is
    /// acquired, so it is re-read under the shard and the acquisition
    /// retried on mismatch. That re-read is the linearization point.
    pub fn lock_extent_from_addr(
        &self,
        ctx: &mut RtreeCtx,
        addr: VirtualAddress,
        inactive_only: bool,
    ) -> Option<ExtentLock<'_>> {
        witness::assert_depth_to_rank(WitnessRank::Pool, 0);
        let elm = self.rtree.lookup(ctx, addr, false)?;
        loop {
            let extent = elm.extent(true)?;
            // Slabs are always active and never interesting to coalescing.
            if inactive_only && elm.slab() {
                return None;
            }
            let guard = self.lock_extent(extent);
            if elm.extent(true) == Some(extent) {
                return Some(guard);
            }
            // The mapping changed before we got the shard; try again.
            drop(guard);
        }
    }
}
