//! Lock-order enforcement across the map's collaborators. These tests rely
//! on the `witness` feature, which the dev-dependency on `emap-sync` turns
//! on for every test build.

mod common;

use common::leak_extent;
use emap::{ExtentMap, RtreeCtx};
use emap_alloc::BumpAlloc;
use emap_extent::SizeClass;
use emap_sync::witness;
use emap_sync::{Witness, WitnessRank};

#[test]
fn increasing_ranks_are_accepted() {
    let pool = Witness::new_reentrant("pool", WitnessRank::Pool);
    let init = Witness::new("rtree_init", WitnessRank::RtreeInit);
    let base = Witness::new("base", WitnessRank::Base);

    pool.lock();
    pool.lock();
    init.lock();
    base.lock();
    witness::assert_depth_to_rank(WitnessRank::Pool, 4);
    witness::assert_depth_to_rank(WitnessRank::RtreeInit, 2);
    witness::assert_depth_to_rank(WitnessRank::Base, 1);

    base.unlock();
    init.unlock();
    pool.unlock();
    pool.unlock();
    witness::assert_depth_to_rank(WitnessRank::Pool, 0);
}

#[test]
#[should_panic(expected = "lock rank violation")]
fn lower_rank_under_a_higher_one_is_rejected() {
    let high = Witness::new("base", WitnessRank::Base);
    let low = Witness::new("pool", WitnessRank::Pool);
    high.lock();
    low.lock();
}

#[test]
#[should_panic(expected = "lock rank violation")]
fn equal_rank_requires_a_reentrant_witness() {
    let one = Witness::new("one", WitnessRank::RtreeInit);
    let two = Witness::new("two", WitnessRank::RtreeInit);
    one.lock();
    two.lock();
}

/// Registering (which may take the init and base locks) is legal while a
/// descriptor shard is held; this is the shape of every coalescing path.
#[test]
fn materializing_under_a_held_shard_is_in_order() {
    let base = BumpAlloc::with_capacity(4 << 20).unwrap();
    let map = ExtentMap::new();
    let mut ctx = RtreeCtx::new();

    let pinned = leak_extent(0, 0x1000_0000_0000, 8 * 1024, 2, false);
    let fresh = leak_extent(0, 0x5555_0000_0000, 8 * 1024, 2, false);
    unsafe {
        map.register_boundary(&base, &mut ctx, pinned, SizeClass::new(2), false).unwrap();
    }

    let guard = map.lock_extent(pinned);
    // A whole new subtree materializes here: init lock, then base lock.
    unsafe {
        map.register_boundary(&base, &mut ctx, fresh, SizeClass::new(2), false).unwrap();
    }
    drop(guard);
}

#[test]
#[should_panic(expected = "locks held at or above")]
fn pinning_twice_from_one_thread_is_rejected() {
    let base = BumpAlloc::with_capacity(4 << 20).unwrap();
    let map = ExtentMap::new();
    let mut ctx = RtreeCtx::new();

    let a = leak_extent(0, 0x1000_0000_0000, 4 * 1024, 1, false);
    let b = leak_extent(0, 0x2000_0000_0000, 4 * 1024, 1, false);
    unsafe {
        map.register_boundary(&base, &mut ctx, a, SizeClass::new(1), false).unwrap();
        map.register_boundary(&base, &mut ctx, b, SizeClass::new(1), false).unwrap();
    }

    let _first = map.lock_extent(a);
    // Single shards do not nest; pairs go through lock_extent_pair.
    let _second = map.lock_extent(b);
}
