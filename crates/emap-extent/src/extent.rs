use crate::{ExtentState, SizeClass};
use bitfield_struct::bitfield;
use core::fmt;
use core::ptr::NonNull;
use emap_addresses::{LG_PAGE, PAGE_SIZE, VirtualAddress, VirtualPage};

/// Packed descriptor word.
///
/// Everything that fits in a bit or two lives here; base, size and serial
/// number are wide enough to warrant their own fields.
#[bitfield(u64)]
struct ExtentBits {
    /// Index of the owning arena.
    #[bits(12)]
    arena_ind: u16,
    /// Size class, [`SizeClass::NONE`] when unknown or uncached.
    #[bits(8, default = SizeClass::NONE)]
    szind: SizeClass,
    /// The range is subdivided into equal small regions.
    slab: bool,
    /// Lifecycle state.
    #[bits(2, default = ExtentState::Active)]
    state: ExtentState,
    /// Contents are known to be zero.
    zeroed: bool,
    /// Pages are committed.
    committed: bool,
    /// Pages participate in core dumps.
    dumpable: bool,
    /// First extent carved out of a fresh mapping.
    head: bool,
    #[bits(37)]
    __: u64,
}

/// Intrusive linkage for the collector that currently owns the extent.
///
/// A descriptor sits in exactly one collector at a time: a bin's slab heap,
/// an extent cache list, or an in-flight operation. Those collectors thread
/// the descriptor through these fields. The address map never reads or
/// writes them.
#[derive(Copy, Clone)]
pub struct ExtentLinks {
    /// Pairing-heap linkage (first child, next sibling).
    pub heap: [Option<NonNull<Extent>>; 2],
    /// Doubly-linked list linkage (previous, next).
    pub list: [Option<NonNull<Extent>>; 2],
}

impl ExtentLinks {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap: [None; 2],
            list: [None; 2],
        }
    }
}

impl Default for ExtentLinks {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor of one contiguous, page-aligned range of virtual memory.
///
/// ### Invariants
/// - `size` is a non-zero multiple of the page size; `base` is page-aligned
///   by construction ([`VirtualPage`]).
/// - `slab` implies a small size class (`szind < NBINS`).
/// - Field mutation on a descriptor that is registered in a map is only
///   permitted while holding that descriptor's mutex-pool shard, and must
///   complete before the map publishes a mapping that leads readers to the
///   changed fields.
pub struct Extent {
    bits: ExtentBits,
    base: VirtualPage,
    size: u64,
    sn: u64,
    links: ExtentLinks,
}

impl Extent {
    /// Create a descriptor for `[base, base + size)`.
    ///
    /// The state starts [`Active`](ExtentState::Active); the serial number
    /// and the single-bit properties start cleared.
    ///
    /// ### Debug assertions
    /// - `size` is a non-zero multiple of the page size.
    /// - `slab` implies `szind < NBINS`.
    #[must_use]
    pub const fn new(
        arena_ind: u16,
        base: VirtualPage,
        size: u64,
        szind: SizeClass,
        slab: bool,
    ) -> Self {
        debug_assert!(size > 0 && size % PAGE_SIZE == 0, "size not page-granular");
        debug_assert!(!slab || szind.is_small(), "slab with a non-small class");
        Self {
            bits: ExtentBits::new()
                .with_arena_ind(arena_ind)
                .with_szind(szind)
                .with_slab(slab),
            base,
            size,
            sn: 0,
            links: ExtentLinks::new(),
        }
    }

    /// Base address of the range.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualPage {
        self.base
    }

    /// One past the last byte of the range.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.base().as_u64() + self.size)
    }

    /// The last page of the range.
    #[inline]
    #[must_use]
    pub const fn last_page(&self) -> VirtualPage {
        self.base.add_pages(self.size_pages() - 1)
    }

    /// Size of the range in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Size of the range in pages.
    #[inline]
    #[must_use]
    pub const fn size_pages(&self) -> u64 {
        self.size >> LG_PAGE
    }

    /// `true` when `addr` falls inside the range.
    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        let a = addr.as_u64();
        let base = self.base.base().as_u64();
        base <= a && a < base + self.size
    }

    #[inline]
    #[must_use]
    pub const fn arena_ind(&self) -> u16 {
        self.bits.arena_ind()
    }

    #[inline]
    #[must_use]
    pub const fn szind(&self) -> SizeClass {
        self.bits.szind()
    }

    #[inline]
    #[must_use]
    pub const fn slab(&self) -> bool {
        self.bits.slab()
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> ExtentState {
        self.bits.state()
    }

    /// Serial number; monotonic per arena, used for age ordering by the
    /// collectors that heap descriptors.
    #[inline]
    #[must_use]
    pub const fn sn(&self) -> u64 {
        self.sn
    }

    #[inline]
    #[must_use]
    pub const fn zeroed(&self) -> bool {
        self.bits.zeroed()
    }

    #[inline]
    #[must_use]
    pub const fn committed(&self) -> bool {
        self.bits.committed()
    }

    #[inline]
    #[must_use]
    pub const fn dumpable(&self) -> bool {
        self.bits.dumpable()
    }

    #[inline]
    #[must_use]
    pub const fn head(&self) -> bool {
        self.bits.head()
    }

    #[inline]
    pub const fn set_base(&mut self, base: VirtualPage) {
        self.base = base;
    }

    #[inline]
    pub const fn set_size(&mut self, size: u64) {
        debug_assert!(size > 0 && size % PAGE_SIZE == 0, "size not page-granular");
        self.size = size;
    }

    #[inline]
    pub const fn set_arena_ind(&mut self, arena_ind: u16) {
        self.bits.set_arena_ind(arena_ind);
    }

    #[inline]
    pub const fn set_szind(&mut self, szind: SizeClass) {
        self.bits.set_szind(szind);
    }

    #[inline]
    pub const fn set_slab(&mut self, slab: bool) {
        self.bits.set_slab(slab);
    }

    #[inline]
    pub const fn set_state(&mut self, state: ExtentState) {
        self.bits.set_state(state);
    }

    #[inline]
    pub const fn set_sn(&mut self, sn: u64) {
        self.sn = sn;
    }

    #[inline]
    pub const fn set_zeroed(&mut self, zeroed: bool) {
        self.bits.set_zeroed(zeroed);
    }

    #[inline]
    pub const fn set_committed(&mut self, committed: bool) {
        self.bits.set_committed(committed);
    }

    #[inline]
    pub const fn set_dumpable(&mut self, dumpable: bool) {
        self.bits.set_dumpable(dumpable);
    }

    #[inline]
    pub const fn set_head(&mut self, head: bool) {
        self.bits.set_head(head);
    }

    /// Linkage owned by the current collector.
    #[inline]
    #[must_use]
    pub const fn links(&self) -> &ExtentLinks {
        &self.links
    }

    /// Linkage owned by the current collector.
    #[inline]
    pub const fn links_mut(&mut self) -> &mut ExtentLinks {
        &mut self.links
    }
}

impl fmt::Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extent")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("arena_ind", &self.arena_ind())
            .field("szind", &self.szind())
            .field("slab", &self.slab())
            .field("state", &self.state())
            .field("sn", &self.sn)
            .finish_non_exhaustive()
    }
}
