use crate::MapError;
use core::ptr::NonNull;
use emap_addresses::{LG_PAGE, PAGE_SIZE, VirtualAddress, VirtualPage};
use emap_extent::{Extent, SizeClass};
use emap_rtree::{LeafElm, NodeAlloc, Rtree, RtreeContents, RtreeCtx};
use emap_sync::MutexPool;
use log::trace;

/// The extent map: one radix tree plus one mutex pool.
///
/// The map holds *references* to descriptors, never ownership; every
/// registration-family entry point is `unsafe` with the corresponding
/// validity contract. Lookup and locking are safe: by the time a descriptor
/// can be found in the tree, its registration vouched for it.
pub struct ExtentMap {
    pub(crate) rtree: Rtree,
    pub(crate) pool: MutexPool,
}

/// Size class and slab flag of a mapping, as the free fast path wants them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocInfo {
    pub szind: SizeClass,
    pub slab: bool,
}

/// Shape of one half of a split: its size and the mapping tags it gets.
#[derive(Copy, Clone, Debug)]
pub struct SplitPiece {
    pub size: u64,
    pub szind: SizeClass,
    pub slab: bool,
}

/// The leaf elements backing a range's first and last page.
///
/// `last` is `None` for a single-page range, whose only element is `first`.
struct BoundaryElms<'t> {
    first: &'t LeafElm,
    last: Option<&'t LeafElm>,
}

impl BoundaryElms<'_> {
    fn write(&self, contents: RtreeContents) {
        self.first.write(contents);
        if let Some(last) = self.last {
            last.write(contents);
        }
    }
}

/// Output of [`ExtentMap::split_prepare`]: the four boundary elements plus
/// the shapes, everything commit needs in order to only perform stores.
pub struct SplitPrepare<'t> {
    lead: BoundaryElms<'t>,
    trail: BoundaryElms<'t>,
    lead_piece: SplitPiece,
    trail_piece: SplitPiece,
}

/// Output of [`ExtentMap::merge_prepare`].
pub struct MergePrepare<'t> {
    lead: BoundaryElms<'t>,
    trail: BoundaryElms<'t>,
}

impl Default for ExtentMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtentMap {
    /// An empty map. No tree nodes exist until the first registration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            rtree: Rtree::new(),
            pool: MutexPool::new(),
        }
    }

    /// The descriptor covering `addr`, if any.
    ///
    /// `dependent` callers hold proof the mapping exists (an address inside
    /// a live allocation); speculative callers get acquire ordering and may
    /// miss.
    #[inline]
    pub fn lookup(
        &self,
        ctx: &mut RtreeCtx,
        addr: VirtualAddress,
        dependent: bool,
    ) -> Option<NonNull<Extent>> {
        self.rtree.read(ctx, addr, dependent).extent
    }

    /// The `(szind, slab)` tags for `addr` without touching the descriptor.
    ///
    /// This is the free fast path: one dependent tree read. Returns `None`
    /// when nothing is mapped at `addr`.
    #[inline]
    pub fn alloc_info_lookup(
        &self,
        ctx: &mut RtreeCtx,
        addr: VirtualAddress,
        dependent: bool,
    ) -> Option<AllocInfo> {
        let contents = self.rtree.read(ctx, addr, dependent);
        contents.extent.map(|_| AllocInfo {
            szind: contents.szind,
            slab: contents.slab,
        })
    }

    /// Map the first and last page of `extent`.
    ///
    /// Both leaf elements are looked up (materializing nodes) before either
    /// is written: on failure the tree carries no trace of the extent.
    ///
    /// # Errors
    /// - [`MapError::OutOfNodes`] when the base allocator is exhausted.
    ///
    /// # Safety
    /// - `extent` must point to a valid descriptor that stays valid and
    ///   pinned at its address until deregistered.
    /// - The extent's range must not overlap any registered range.
    pub unsafe fn register_boundary<A: NodeAlloc>(
        &self,
        alloc: &A,
        ctx: &mut RtreeCtx,
        extent: NonNull<Extent>,
        szind: SizeClass,
        slab: bool,
    ) -> Result<(), MapError> {
        // SAFETY: valid per contract.
        let e = unsafe { extent.as_ref() };
        debug_assert!(!slab || szind.is_small(), "slab with a non-small class");

        let elms = self.range_elms_init(ctx, e.base(), e.size(), alloc)?;
        debug_assert!(
            elms.first.read(false).is_empty(),
            "range is already registered"
        );
        elms.write(RtreeContents::new(extent, szind, slab));
        trace!("registered extent {}..{}", e.base(), e.end());
        Ok(())
    }

    /// Map every interior page of a slab extent.
    ///
    /// Interior pages may straddle leaf-node boundaries, so this can
    /// materialize nodes and therefore fail; on failure every interior page
    /// written so far is cleared again, leaving only the boundary
    /// registration.
    ///
    /// # Errors
    /// - [`MapError::OutOfNodes`] when the base allocator is exhausted.
    ///
    /// # Safety
    /// - As for [`register_boundary`](Self::register_boundary), and the
    ///   boundary registration must already exist.
    pub unsafe fn register_interior<A: NodeAlloc>(
        &self,
        alloc: &A,
        ctx: &mut RtreeCtx,
        extent: NonNull<Extent>,
        szind: SizeClass,
    ) -> Result<(), MapError> {
        // SAFETY: valid per contract.
        let e = unsafe { extent.as_ref() };
        debug_assert!(e.slab(), "interior registration of a non-slab extent");

        let contents = RtreeContents::new(extent, szind, true);
        for i in 1..e.size_pages() - 1 {
            let addr = e.base().add_pages(i).base();
            if let Err(err) = self.rtree.write(ctx, addr, alloc, contents) {
                for j in 1..i {
                    self.rtree.clear(ctx, e.base().add_pages(j).base());
                }
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Clear the first and last page of `extent`.
    ///
    /// # Safety
    /// - `extent` must be boundary-registered in this map, and the caller
    ///   must hold its pool shard or otherwise be its unique owner.
    pub unsafe fn deregister_boundary(&self, ctx: &mut RtreeCtx, extent: NonNull<Extent>) {
        // SAFETY: valid per contract.
        let e = unsafe { extent.as_ref() };
        let Some(elms) = self.range_elms(ctx, e.base(), e.size()) else {
            unreachable!("deregistering an unregistered extent");
        };
        debug_assert_eq!(
            elms.first.extent(true),
            Some(extent),
            "descriptor mismatch on deregistration"
        );
        elms.write(RtreeContents::EMPTY);
        trace!("deregistered extent {}..{}", e.base(), e.end());
    }

    /// Clear every interior page of a slab extent.
    ///
    /// # Safety
    /// - As for [`deregister_boundary`](Self::deregister_boundary), with the
    ///   interior registration still in place.
    pub unsafe fn deregister_interior(&self, ctx: &mut RtreeCtx, extent: NonNull<Extent>) {
        // SAFETY: valid per contract.
        let e = unsafe { extent.as_ref() };
        debug_assert!(e.slab(), "interior deregistration of a non-slab extent");
        for i in 1..e.size_pages() - 1 {
            self.rtree.clear(ctx, e.base().add_pages(i).base());
        }
    }

    /// Retag the boundary mappings of a registered extent in place.
    ///
    /// Used when a live extent changes size class (promotion of a large
    /// allocation); only the boundaries are rewritten, as for any non-slab
    /// extent.
    ///
    /// # Safety
    /// - `extent` must be boundary-registered in this map and serialized
    ///   against concurrent structural operations by the caller.
    pub unsafe fn remap(
        &self,
        ctx: &mut RtreeCtx,
        extent: NonNull<Extent>,
        szind: SizeClass,
        slab: bool,
    ) {
        debug_assert!(!slab || szind.is_small(), "slab with a non-small class");
        // SAFETY: valid per contract; caller serializes mutation.
        let e = unsafe { &mut *extent.as_ptr() };
        e.set_szind(szind);
        e.set_slab(slab);
        let (base, size) = (e.base(), e.size());

        let Some(elms) = self.range_elms(ctx, base, size) else {
            unreachable!("remapping an unregistered extent");
        };
        debug_assert_eq!(elms.first.extent(true), Some(extent));
        elms.write(RtreeContents::new(extent, szind, slab));
    }

    /// First phase of splitting `extent` into `(lead, trail)`.
    ///
    /// Initializes the trail descriptor (base, size, tags; serial number,
    /// state, zeroed, committed and dumpable are inherited from `extent`;
    /// the arena index stays whatever the caller assigned, permitting
    /// cross-arena transfer) and looks up all four boundary elements,
    /// materializing nodes as needed. Nothing is written to the tree.
    ///
    /// # Errors
    /// - [`MapError::OutOfNodes`] when the base allocator is exhausted; the
    ///   tree is unchanged and the split is abandoned.
    ///
    /// # Safety
    /// - `extent` is registered in this map; the caller serializes
    ///   structural operations on it (holds its pool shard or owns it).
    /// - `trail` is a valid, unregistered descriptor exclusively owned by
    ///   the caller, distinct from `extent`.
    pub unsafe fn split_prepare<'t, A: NodeAlloc>(
        &'t self,
        alloc: &A,
        ctx: &mut RtreeCtx,
        extent: NonNull<Extent>,
        trail: NonNull<Extent>,
        lead_piece: SplitPiece,
        trail_piece: SplitPiece,
    ) -> Result<SplitPrepare<'t>, MapError> {
        debug_assert_ne!(extent, trail);
        // SAFETY: valid per contract.
        let e = unsafe { extent.as_ref() };
        debug_assert!(lead_piece.size > 0 && lead_piece.size % PAGE_SIZE == 0);
        debug_assert!(trail_piece.size > 0 && trail_piece.size % PAGE_SIZE == 0);
        debug_assert_eq!(lead_piece.size + trail_piece.size, e.size());

        let trail_base = VirtualPage::new_aligned(e.base().base() + lead_piece.size);
        {
            // SAFETY: `trail` is unregistered and exclusively the caller's.
            let t = unsafe { &mut *trail.as_ptr() };
            t.set_base(trail_base);
            t.set_size(trail_piece.size);
            t.set_szind(trail_piece.szind);
            t.set_slab(trail_piece.slab);
            t.set_sn(e.sn());
            t.set_state(e.state());
            t.set_zeroed(e.zeroed());
            t.set_committed(e.committed());
            t.set_dumpable(e.dumpable());
            t.set_head(false);
        }

        let lead = self.range_elms_init(ctx, e.base(), lead_piece.size, alloc)?;
        let trail_elms = self.range_elms_init(ctx, trail_base, trail_piece.size, alloc)?;
        Ok(SplitPrepare {
            lead,
            trail: trail_elms,
            lead_piece,
            trail_piece,
        })
    }

    /// Second phase of a split: stores only, cannot fail.
    ///
    /// Shrinks `extent` to the lead shape, then publishes the four boundary
    /// mappings. The descriptor updates precede the release stores, so a
    /// reader that observes the trail mapping observes the trail's fields.
    ///
    /// # Safety
    /// - `prepare` came from [`split_prepare`](Self::split_prepare) with the
    ///   same `extent` and `trail`, with no intervening structural change.
    pub unsafe fn split_commit(
        &self,
        prepare: SplitPrepare<'_>,
        extent: NonNull<Extent>,
        trail: NonNull<Extent>,
    ) {
        let SplitPrepare {
            lead,
            trail: trail_elms,
            lead_piece,
            trail_piece,
        } = prepare;
        let base = {
            // SAFETY: the caller serializes descriptor mutation.
            let e = unsafe { &mut *extent.as_ptr() };
            e.set_size(lead_piece.size);
            e.set_szind(lead_piece.szind);
            e.base()
        };
        lead.write(RtreeContents::new(extent, lead_piece.szind, lead_piece.slab));
        trail_elms.write(RtreeContents::new(
            trail,
            trail_piece.szind,
            trail_piece.slab,
        ));
        trace!(
            "split extent at {base} into {} + {} bytes",
            lead_piece.size, trail_piece.size
        );
    }

    /// First phase of merging adjacent `lead` and `trail`.
    ///
    /// Pure dependent lookups; cannot fail and writes nothing.
    ///
    /// # Safety
    /// - Both descriptors are registered in this map, `lead` ends exactly
    ///   where `trail` begins, and the caller serializes structural
    ///   operations on both (typically via
    ///   [`lock_extent_pair`](Self::lock_extent_pair)).
    pub unsafe fn merge_prepare<'t>(
        &'t self,
        ctx: &mut RtreeCtx,
        lead: NonNull<Extent>,
        trail: NonNull<Extent>,
    ) -> MergePrepare<'t> {
        // SAFETY: valid per contract.
        let (l, t) = unsafe { (lead.as_ref(), trail.as_ref()) };
        debug_assert_eq!(
            l.end().as_u64(),
            t.base().base().as_u64(),
            "merging non-adjacent extents"
        );
        let Some(lead_elms) = self.range_elms(ctx, l.base(), l.size()) else {
            unreachable!("merging an unregistered lead");
        };
        let Some(trail_elms) = self.range_elms(ctx, t.base(), t.size()) else {
            unreachable!("merging an unregistered trail");
        };
        MergePrepare {
            lead: lead_elms,
            trail: trail_elms,
        }
    }

    /// Second phase of a merge: stores only, cannot fail.
    ///
    /// Clears the inner boundaries, folds `trail`'s geometry into `lead`
    /// (size sum, size class reset, minimum serial number, conjunction of
    /// zeroed; commit and dumpable state must already agree and is not
    /// merged silently), then publishes the outer boundaries. `trail` is
    /// logically dead afterwards; returning its storage to the descriptor
    /// free list is the caller's job.
    ///
    /// # Safety
    /// - `prepare` came from [`merge_prepare`](Self::merge_prepare) with the
    ///   same descriptors, with no intervening structural change, and the
    ///   caller still serializes both descriptors.
    pub unsafe fn merge_commit(
        &self,
        prepare: MergePrepare<'_>,
        lead: NonNull<Extent>,
        trail: NonNull<Extent>,
    ) {
        let MergePrepare {
            lead: lead_elms,
            trail: trail_elms,
        } = prepare;

        // Clear the inner boundaries. A single-page piece has no separate
        // inner element; its only element is rewritten as an outer boundary
        // below.
        if let Some(inner) = lead_elms.last {
            inner.clear();
        }
        let merged_last = match trail_elms.last {
            Some(last) => {
                trail_elms.first.clear();
                last
            }
            None => trail_elms.first,
        };

        {
            // SAFETY: the caller serializes both descriptors.
            let l = unsafe { &mut *lead.as_ptr() };
            let t = unsafe { trail.as_ref() };
            debug_assert_eq!(l.committed(), t.committed(), "commit state must agree");
            debug_assert_eq!(l.dumpable(), t.dumpable(), "dumpability must agree");
            l.set_size(l.size() + t.size());
            l.set_szind(SizeClass::NONE);
            l.set_sn(if l.sn() < t.sn() { l.sn() } else { t.sn() });
            l.set_zeroed(l.zeroed() && t.zeroed());
        }

        let contents = RtreeContents::new(lead, SizeClass::NONE, false);
        lead_elms.first.write(contents);
        merged_last.write(contents);
        // SAFETY: as above.
        let l = unsafe { lead.as_ref() };
        trace!("merged into extent {}..{}", l.base(), l.end());
    }

    /// Debug check: the extent's base page resolves to this descriptor.
    pub fn assert_mapped(&self, ctx: &mut RtreeCtx, extent: &Extent) {
        debug_assert_eq!(
            self.rtree.read(ctx, extent.base().base(), true).extent,
            Some(NonNull::from(extent))
        );
    }

    /// Debug check: the extent's base page resolves to nothing.
    pub fn assert_not_mapped(&self, ctx: &mut RtreeCtx, extent: &Extent) {
        debug_assert!(self.rtree.read(ctx, extent.base().base(), false).is_empty());
    }

    /// Boundary elements of `[base, base + size)`, materializing nodes.
    fn range_elms_init<'t, A: NodeAlloc>(
        &'t self,
        ctx: &mut RtreeCtx,
        base: VirtualPage,
        size: u64,
        alloc: &A,
    ) -> Result<BoundaryElms<'t>, MapError> {
        let first = self.rtree.lookup_init(ctx, base.base(), alloc)?;
        let last = if size > PAGE_SIZE {
            let last_page = base.add_pages((size >> LG_PAGE) - 1);
            Some(self.rtree.lookup_init(ctx, last_page.base(), alloc)?)
        } else {
            None
        };
        Ok(BoundaryElms { first, last })
    }

    /// Boundary elements of a registered range, dependent lookups only.
    fn range_elms<'t>(
        &'t self,
        ctx: &mut RtreeCtx,
        base: VirtualPage,
        size: u64,
    ) -> Option<BoundaryElms<'t>> {
        let first = self.rtree.lookup(ctx, base.base(), true)?;
        let last = if size > PAGE_SIZE {
            let last_page = base.add_pages((size >> LG_PAGE) - 1);
            Some(self.rtree.lookup(ctx, last_page.base(), true)?)
        } else {
            None
        };
        Some(BoundaryElms { first, last })
    }
}
