mod common;

use common::{BudgetAlloc, PAGE, leak_extent, va};
use emap::{ExtentMap, MapError, RtreeCtx, SplitPiece};
use emap_alloc::BumpAlloc;
use emap_extent::{SizeClass, NSIZES};

fn arena() -> BumpAlloc {
    BumpAlloc::with_capacity(4 << 20).unwrap()
}

#[test]
fn single_extent_boundary_lifecycle() {
    let base = arena();
    let map = ExtentMap::new();
    let mut ctx = RtreeCtx::new();

    // 16 KiB large extent at 0x1000_0000_0000, class 42.
    let e = leak_extent(0, 0x1000_0000_0000, 16 * 1024, 42, false);
    unsafe {
        map.register_boundary(&base, &mut ctx, e, SizeClass::new(42), false).unwrap();
    }

    // First and last page resolve with the registered tags.
    let info = map.alloc_info_lookup(&mut ctx, va(0x1000_0000_0000), true).unwrap();
    assert_eq!(info.szind, SizeClass::new(42));
    assert!(!info.slab);
    assert_eq!(map.lookup(&mut ctx, va(0x1000_0000_0000), true), Some(e));
    assert_eq!(map.lookup(&mut ctx, va(0x1000_0000_3000), true), Some(e));

    // Interior pages of a non-slab extent stay unmapped.
    assert_eq!(map.lookup(&mut ctx, va(0x1000_0000_1000), false), None);
    assert_eq!(map.lookup(&mut ctx, va(0x1000_0000_2000), false), None);
    // So does everything outside the range.
    assert_eq!(map.lookup(&mut ctx, va(0x1000_0000_4000), false), None);
    assert_eq!(map.lookup(&mut ctx, va(0x0FFF_FFFF_F000), false), None);

    unsafe { map.deregister_boundary(&mut ctx, e) };
    assert_eq!(map.lookup(&mut ctx, va(0x1000_0000_0000), false), None);
    assert_eq!(map.lookup(&mut ctx, va(0x1000_0000_3000), false), None);
    assert!(map.alloc_info_lookup(&mut ctx, va(0x1000_0000_0000), false).is_none());
}

#[test]
fn slab_interior_lifecycle() {
    let base = arena();
    let map = ExtentMap::new();
    let mut ctx = RtreeCtx::new();

    // 16 KiB slab at 0x2000_0000_0000, class 3.
    let s = leak_extent(0, 0x2000_0000_0000, 16 * 1024, 3, true);
    unsafe {
        map.register_boundary(&base, &mut ctx, s, SizeClass::new(3), true).unwrap();
        map.register_interior(&base, &mut ctx, s, SizeClass::new(3)).unwrap();
    }

    // Every page of the slab resolves, interior included.
    for offset in [0x0000, 0x1000, 0x2000, 0x3000] {
        let addr = va(0x2000_0000_0000 + offset);
        assert_eq!(map.lookup(&mut ctx, addr, true), Some(s), "{addr}");
        let info = map.alloc_info_lookup(&mut ctx, addr, true).unwrap();
        assert_eq!(info.szind, SizeClass::new(3));
        assert!(info.slab);
    }

    unsafe {
        map.deregister_interior(&mut ctx, s);
        map.deregister_boundary(&mut ctx, s);
    }
    for offset in [0x0000, 0x1000, 0x2000, 0x3000] {
        assert_eq!(map.lookup(&mut ctx, va(0x2000_0000_0000 + offset), false), None);
    }
}

#[test]
fn split_remaps_both_halves() {
    let base = arena();
    let map = ExtentMap::new();
    let mut ctx = RtreeCtx::new();

    let e = leak_extent(0, 0x1000_0000_0000, 16 * 1024, 42, false);
    unsafe {
        map.register_boundary(&base, &mut ctx, e, SizeClass::new(42), false).unwrap();
    }

    // Carve 4 KiB off the front; the trail keeps its own arena index.
    let trail = leak_extent(1, 0x7777_7777_7000, PAGE, NSIZES, false);
    let lead_piece = SplitPiece { size: 4 * 1024, szind: SizeClass::new(42), slab: false };
    let trail_piece = SplitPiece { size: 12 * 1024, szind: SizeClass::NONE, slab: false };

    unsafe {
        let prep = map
            .split_prepare(&base, &mut ctx, e, trail, lead_piece, trail_piece)
            .unwrap();
        map.split_commit(prep, e, trail);
    }

    assert_eq!(map.lookup(&mut ctx, va(0x1000_0000_0000), true), Some(e));
    assert_eq!(map.lookup(&mut ctx, va(0x1000_0000_1000), true), Some(trail));
    assert_eq!(map.lookup(&mut ctx, va(0x1000_0000_3000), true), Some(trail));

    let (e_ref, t_ref) = unsafe { (e.as_ref(), trail.as_ref()) };
    assert_eq!(e_ref.size(), 4 * 1024);
    assert_eq!(e_ref.szind(), SizeClass::new(42));
    assert_eq!(t_ref.base().base().as_u64(), 0x1000_0000_1000);
    assert_eq!(t_ref.size(), 12 * 1024);
    assert_eq!(t_ref.szind(), SizeClass::NONE);
    // The trail inherited flags and serial, but kept its arena.
    assert_eq!(t_ref.arena_ind(), 1);
    assert_eq!(t_ref.sn(), e_ref.sn());
    assert_eq!(t_ref.state(), e_ref.state());
    assert!(!t_ref.head());
}

#[test]
fn merge_restores_original_range() {
    let base = arena();
    let map = ExtentMap::new();
    let mut ctx = RtreeCtx::new();

    let e = leak_extent(0, 0x1000_0000_0000, 16 * 1024, 42, false);
    let trail = leak_extent(0, 0x7777_7777_7000, PAGE, NSIZES, false);
    unsafe {
        map.register_boundary(&base, &mut ctx, e, SizeClass::new(42), false).unwrap();
        let prep = map
            .split_prepare(
                &base,
                &mut ctx,
                e,
                trail,
                SplitPiece { size: 4 * 1024, szind: SizeClass::new(42), slab: false },
                SplitPiece { size: 12 * 1024, szind: SizeClass::NONE, slab: false },
            )
            .unwrap();
        map.split_commit(prep, e, trail);

        let prep = map.merge_prepare(&mut ctx, e, trail);
        map.merge_commit(prep, e, trail);
    }

    // The whole original range resolves to the merged lead again.
    assert_eq!(map.lookup(&mut ctx, va(0x1000_0000_0000), true), Some(e));
    assert_eq!(map.lookup(&mut ctx, va(0x1000_0000_3000), true), Some(e));
    // The split point went back to unmapped (interior of a large extent).
    assert_eq!(map.lookup(&mut ctx, va(0x1000_0000_1000), false), None);

    let e_ref = unsafe { e.as_ref() };
    assert_eq!(e_ref.size(), 16 * 1024);
    assert_eq!(e_ref.szind(), SizeClass::NONE);
}

#[test]
fn merge_folds_serial_and_zeroed() {
    let base = arena();
    let map = ExtentMap::new();
    let mut ctx = RtreeCtx::new();

    let lead = leak_extent(0, 0x3000_0000_0000, 8 * 1024, NSIZES, false);
    let trail = leak_extent(0, 0x3000_0000_2000, 8 * 1024, NSIZES, false);
    unsafe {
        (*lead.as_ptr()).set_sn(9);
        (*lead.as_ptr()).set_zeroed(true);
        (*trail.as_ptr()).set_sn(4);
        (*trail.as_ptr()).set_zeroed(false);

        map.register_boundary(&base, &mut ctx, lead, SizeClass::NONE, false).unwrap();
        map.register_boundary(&base, &mut ctx, trail, SizeClass::NONE, false).unwrap();

        let prep = map.merge_prepare(&mut ctx, lead, trail);
        map.merge_commit(prep, lead, trail);
    }

    let l = unsafe { lead.as_ref() };
    assert_eq!(l.size(), 16 * 1024);
    assert_eq!(l.sn(), 4, "merge keeps the older serial");
    assert!(!l.zeroed(), "zeroed only survives when both halves were");
    assert_eq!(map.lookup(&mut ctx, va(0x3000_0000_3000), true), Some(lead));
}

#[test]
fn split_and_merge_with_single_page_pieces() {
    let base = arena();
    let map = ExtentMap::new();
    let mut ctx = RtreeCtx::new();

    // Two pages; both halves of the split are single-page extents.
    let e = leak_extent(0, 0x4000_0000_0000, 2 * PAGE, NSIZES, false);
    let trail = leak_extent(0, 0x7777_7777_7000, PAGE, NSIZES, false);
    unsafe {
        map.register_boundary(&base, &mut ctx, e, SizeClass::NONE, false).unwrap();
        let prep = map
            .split_prepare(
                &base,
                &mut ctx,
                e,
                trail,
                SplitPiece { size: PAGE, szind: SizeClass::NONE, slab: false },
                SplitPiece { size: PAGE, szind: SizeClass::NONE, slab: false },
            )
            .unwrap();
        map.split_commit(prep, e, trail);
    }

    assert_eq!(map.lookup(&mut ctx, va(0x4000_0000_0000), true), Some(e));
    assert_eq!(map.lookup(&mut ctx, va(0x4000_0000_1000), true), Some(trail));
    assert_eq!(unsafe { e.as_ref() }.size(), PAGE);

    unsafe {
        let prep = map.merge_prepare(&mut ctx, e, trail);
        map.merge_commit(prep, e, trail);
    }
    assert_eq!(map.lookup(&mut ctx, va(0x4000_0000_0000), true), Some(e));
    assert_eq!(map.lookup(&mut ctx, va(0x4000_0000_1000), true), Some(e));
    assert_eq!(unsafe { e.as_ref() }.size(), 2 * PAGE);
}

#[test]
fn registration_failure_leaves_no_trace() {
    let base = arena();
    let budget = BudgetAlloc::new(&base, 0);
    let map = ExtentMap::new();
    let mut ctx = RtreeCtx::new();

    let e = leak_extent(0, 0x5000_0000_0000, 16 * 1024, 7, false);
    let err = unsafe { map.register_boundary(&budget, &mut ctx, e, SizeClass::new(7), false) };
    assert!(matches!(err, Err(MapError::OutOfNodes(_))));

    // The failed registration left nothing behind.
    assert_eq!(map.lookup(&mut ctx, va(0x5000_0000_0000), false), None);
    assert_eq!(map.lookup(&mut ctx, va(0x5000_0000_3000), false), None);

    // With storage available the same registration succeeds.
    budget.refill(usize::MAX);
    unsafe {
        map.register_boundary(&budget, &mut ctx, e, SizeClass::new(7), false).unwrap();
    }
    assert_eq!(map.lookup(&mut ctx, va(0x5000_0000_0000), true), Some(e));
    assert_eq!(map.lookup(&mut ctx, va(0x5000_0000_3000), true), Some(e));
}

#[test]
fn interior_registration_failure_unwinds_its_prefix() {
    let base = arena();
    let map = ExtentMap::new();
    let mut ctx = RtreeCtx::new();

    // A slab spanning three leaf nodes (1536 pages): the interior fully
    // covers the middle leaf, which neither boundary materialized.
    let slab_base = 0x6000_0000_0000_u64;
    let size = 3 * 512 * PAGE;
    let s = leak_extent(0, slab_base, size, 3, true);

    // Enough budget for the boundary path only.
    let budget = BudgetAlloc::new(&base, usize::MAX);
    unsafe {
        map.register_boundary(&budget, &mut ctx, s, SizeClass::new(3), true).unwrap();
    }
    budget.refill(0);

    let err = unsafe { map.register_interior(&budget, &mut ctx, s, SizeClass::new(3)) };
    assert!(matches!(err, Err(MapError::OutOfNodes(_))));

    // The boundaries survived; every interior page is back to unmapped.
    assert_eq!(map.lookup(&mut ctx, va(slab_base), true), Some(s));
    assert_eq!(map.lookup(&mut ctx, va(slab_base + size - PAGE), true), Some(s));
    for i in [1, 100, 511, 512, 1000, 1534] {
        assert_eq!(
            map.lookup(&mut ctx, va(slab_base + i * PAGE), false),
            None,
            "page {i}"
        );
    }

    // And the interior registration works once storage is back.
    budget.refill(usize::MAX);
    unsafe {
        map.register_interior(&budget, &mut ctx, s, SizeClass::new(3)).unwrap();
    }
    for i in [1, 511, 512, 1000, 1534] {
        assert_eq!(map.lookup(&mut ctx, va(slab_base + i * PAGE), true), Some(s));
    }
}

#[test]
fn lock_from_addr_pins_the_covering_extent() {
    let base = arena();
    let map = ExtentMap::new();
    let mut ctx = RtreeCtx::new();

    let e = leak_extent(0, 0x1000_0000_0000, 16 * 1024, 42, false);
    unsafe {
        map.register_boundary(&base, &mut ctx, e, SizeClass::new(42), false).unwrap();
    }

    {
        let guard = map.lock_extent_from_addr(&mut ctx, va(0x1000_0000_3000), false).unwrap();
        assert_eq!(guard.extent(), e);
        // The guarded view covers the queried address.
        assert!(guard.contains(va(0x1000_0000_3000)));
        assert_eq!(guard.size(), 16 * 1024);
    }

    // Unmapped addresses pin nothing.
    assert!(map.lock_extent_from_addr(&mut ctx, va(0x1000_0000_1000), false).is_none());
    assert!(map.lock_extent_from_addr(&mut ctx, va(0x0F00_0000_0000), false).is_none());

    // A slab is never returned to inactive-only callers.
    let s = leak_extent(0, 0x2000_0000_0000, 8 * 1024, 3, true);
    unsafe {
        map.register_boundary(&base, &mut ctx, s, SizeClass::new(3), true).unwrap();
    }
    assert!(map.lock_extent_from_addr(&mut ctx, va(0x2000_0000_0000), true).is_none());
    assert!(map.lock_extent_from_addr(&mut ctx, va(0x2000_0000_0000), false).is_some());
}

#[test]
fn remap_retags_a_live_extent() {
    let base = arena();
    let map = ExtentMap::new();
    let mut ctx = RtreeCtx::new();

    let e = leak_extent(0, 0x7000_0000_0000, 32 * 1024, NSIZES, false);
    unsafe {
        map.register_boundary(&base, &mut ctx, e, SizeClass::NONE, false).unwrap();
        map.remap(&mut ctx, e, SizeClass::new(40), false);
    }

    for addr in [0x7000_0000_0000_u64, 0x7000_0000_7000] {
        let info = map.alloc_info_lookup(&mut ctx, va(addr), true).unwrap();
        assert_eq!(info.szind, SizeClass::new(40));
        assert_eq!(map.lookup(&mut ctx, va(addr), true), Some(e));
    }
    assert_eq!(unsafe { e.as_ref() }.szind(), SizeClass::new(40));
}

#[test]
fn debug_mapping_assertions_hold() {
    let base = arena();
    let map = ExtentMap::new();
    let mut ctx = RtreeCtx::new();

    let e = leak_extent(0, 0x0000_4000_0000, 8 * 1024, 1, false);
    map.assert_not_mapped(&mut ctx, unsafe { e.as_ref() });
    unsafe {
        map.register_boundary(&base, &mut ctx, e, SizeClass::new(1), false).unwrap();
    }
    map.assert_mapped(&mut ctx, unsafe { e.as_ref() });
    unsafe { map.deregister_boundary(&mut ctx, e) };
    map.assert_not_mapped(&mut ctx, unsafe { e.as_ref() });
}
