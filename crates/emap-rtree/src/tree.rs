use crate::ctx::RtreeCtx;
use crate::leaf::{LeafElm, RtreeContents};
use crate::{NodeAlloc, RtreeError};
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};
use emap_addresses::{LG_PAGE, VirtualAddress};
use emap_sync::{SpinLock, WitnessRank};
use log::{trace, warn};

/// Significant key bits above the page offset.
const KEY_BITS: u32 = 64 - LG_PAGE;

/// Log base 2 of the interior fanout.
const LG_FANOUT: u32 = 9;

/// Number of levels; the deepest holds leaf elements.
const HEIGHT: usize = KEY_BITS.div_ceil(LG_FANOUT) as usize;

/// `(bits, cumulative bits)` per level, shallowest first. The top level
/// takes the remainder so every deeper level keeps the full fanout.
const GEOMETRY: [(u32, u32); HEIGHT] = geometry();

const fn geometry() -> [(u32, u32); HEIGHT] {
    let mut g = [(0u32, 0u32); HEIGHT];
    let mut bits = KEY_BITS - (HEIGHT as u32 - 1) * LG_FANOUT;
    let mut cum = 0;
    let mut level = 0;
    while level < HEIGHT {
        cum += bits;
        g[level] = (bits, cum);
        bits = LG_FANOUT;
        level += 1;
    }
    g
}

const fn fanout(level: usize) -> usize {
    1 << GEOMETRY[level].0
}

/// Extract the child index for `key` at `level` from the top bits down.
#[inline]
const fn subkey(key: u64, level: usize) -> usize {
    let (bits, cum) = GEOMETRY[level];
    ((key >> (64 - cum)) & ((1 << bits) - 1)) as usize
}

/// The deepest level whose subtree still covers `key`, so short keys skip
/// the empty upper levels entirely.
#[inline]
const fn start_level(key: u64) -> usize {
    if key == 0 {
        return HEIGHT - 1;
    }
    let width = 64 - key.leading_zeros();
    let mut level = HEIGHT;
    while level > 0 {
        level -= 1;
        // Bits consumed by the levels above this one must all be zero.
        let above = GEOMETRY[level].1 - GEOMETRY[level].0;
        if width <= 64 - above {
            return level;
        }
    }
    0
}

const fn layout_of(size: usize, align: usize) -> Layout {
    match Layout::from_size_align(size, align) {
        Ok(layout) => layout,
        Err(_) => panic!("invalid node layout"),
    }
}

/// Allocation layout of a node at each level.
const NODE_LAYOUTS: [Layout; HEIGHT] = node_layouts();

const fn node_layouts() -> [Layout; HEIGHT] {
    let mut layouts = [Layout::new::<u8>(); HEIGHT];
    let mut level = 0;
    while level < HEIGHT {
        layouts[level] = if level == HEIGHT - 1 {
            layout_of(
                size_of::<LeafElm>() * fanout(level),
                align_of::<LeafElm>(),
            )
        } else {
            layout_of(
                size_of::<AtomicPtr<u8>>() * fanout(level),
                align_of::<AtomicPtr<u8>>(),
            )
        };
        level += 1;
    }
    layouts
}

/// Why a descent stopped short of a leaf element.
enum DescentFail {
    /// A node on the path does not exist (lookup without materialization).
    Unmapped,
    /// Materialization was requested and the node allocator gave up.
    OutOfMemory,
}

/// The address radix tree. See the crate docs for shape and orderings.
///
/// All mutation of mappings goes through [`LeafElm`]s; the tree structure
/// itself only ever grows, one lazily materialized node at a time, under a
/// single init lock.
pub struct Rtree {
    /// Per-level subtree roots; `roots[l]` covers every key that starts its
    /// descent at level `l`. Install-once.
    roots: [AtomicPtr<u8>; HEIGHT],
    /// Serializes node materialization. Allocation failure is the only
    /// reason anything under this lock can fail.
    init_lock: SpinLock<()>,
}

impl Default for Rtree {
    fn default() -> Self {
        Self::new()
    }
}

impl Rtree {
    /// An empty tree. No nodes exist until the first write.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            roots: [const { AtomicPtr::new(core::ptr::null_mut()) }; HEIGHT],
            init_lock: SpinLock::new("rtree_init", WitnessRank::RtreeInit, ()),
        }
    }

    /// The leaf element for `addr`, or `None` when the path to it was never
    /// materialized.
    ///
    /// `dependent` callers assert the mapping exists (relaxed loads);
    /// speculative callers get acquire loads and may legitimately miss.
    #[inline]
    pub fn lookup<'t>(
        &'t self,
        ctx: &mut RtreeCtx,
        addr: VirtualAddress,
        dependent: bool,
    ) -> Option<&'t LeafElm> {
        let key = addr.page().base().as_u64();
        if let Some(elm) = ctx.cached(self.identity(), key) {
            // SAFETY: the context only caches elements of this tree, and
            // leaf nodes are never freed.
            return Some(unsafe { &*elm });
        }
        // Without an allocator the descent cannot fail, only miss.
        self.descend(ctx, key, dependent, None).ok()
    }

    /// The leaf element for `addr`, materializing missing nodes from
    /// `alloc`.
    ///
    /// # Errors
    /// - [`RtreeError::OutOfMemory`] when `alloc` is exhausted. The tree is
    ///   unchanged except for nodes already materialized along the path,
    ///   which remain valid and are reused by later attempts.
    pub fn lookup_init<'t, A: NodeAlloc>(
        &'t self,
        ctx: &mut RtreeCtx,
        addr: VirtualAddress,
        alloc: &A,
    ) -> Result<&'t LeafElm, RtreeError> {
        let key = addr.page().base().as_u64();
        if let Some(elm) = ctx.cached(self.identity(), key) {
            // SAFETY: as in `lookup`.
            return Ok(unsafe { &*elm });
        }
        self.descend(ctx, key, false, Some(alloc as &dyn NodeAlloc))
            .map_err(|_| RtreeError::OutOfMemory)
    }

    /// Read the mapping for `addr`.
    ///
    /// Returns [`RtreeContents::EMPTY`] when nothing is mapped.
    #[inline]
    pub fn read(
        &self,
        ctx: &mut RtreeCtx,
        addr: VirtualAddress,
        dependent: bool,
    ) -> RtreeContents {
        self.lookup(ctx, addr, dependent)
            .map_or(RtreeContents::EMPTY, |elm| elm.read(dependent))
    }

    /// Install a mapping at `addr`, materializing nodes as needed.
    ///
    /// Use [`clear`](Self::clear) to remove one; the contents here must
    /// carry a descriptor.
    ///
    /// # Errors
    /// - [`RtreeError::OutOfMemory`] when `alloc` is exhausted; no mapping
    ///   is installed.
    pub fn write<A: NodeAlloc>(
        &self,
        ctx: &mut RtreeCtx,
        addr: VirtualAddress,
        alloc: &A,
        contents: RtreeContents,
    ) -> Result<(), RtreeError> {
        debug_assert!(!contents.is_empty(), "use clear() to remove a mapping");
        let elm = self.lookup_init(ctx, addr, alloc)?;
        debug_assert!(elm.read(false).is_empty(), "key is already mapped");
        elm.write(contents);
        Ok(())
    }

    /// Install the empty mapping at `addr`.
    ///
    /// The key must be mapped; the caller owns the teardown (it holds the
    /// descriptor's pool shard or a uniqueness proof), which is what makes
    /// the dependent lookup legal.
    pub fn clear(&self, ctx: &mut RtreeCtx, addr: VirtualAddress) {
        let Some(elm) = self.lookup(ctx, addr, true) else {
            debug_assert!(false, "clearing an unmapped key");
            return;
        };
        elm.clear();
    }

    #[inline]
    fn identity(&self) -> *const () {
        core::ptr::from_ref(self).cast()
    }

    /// Walk from the start level to the leaf element for `key`.
    fn descend<'t>(
        &'t self,
        ctx: &mut RtreeCtx,
        key: u64,
        dependent: bool,
        init: Option<&dyn NodeAlloc>,
    ) -> Result<&'t LeafElm, DescentFail> {
        debug_assert!(!(dependent && init.is_some()));

        let start = start_level(key);
        let mut node = self.child(&self.roots[start], start, key, dependent, init)?;
        for level in start..HEIGHT - 1 {
            let idx = subkey(key, level);
            // SAFETY: `node` is an interior node at `level`: an array of
            // `fanout(level)` child pointers, zero-initialized before
            // publication. `idx` is masked to the fanout.
            let slot = unsafe { &*node.as_ptr().cast::<AtomicPtr<u8>>().add(idx) };
            node = self.child(slot, level + 1, key, dependent, init)?;
        }

        let idx = subkey(key, HEIGHT - 1);
        // SAFETY: the deepest node is an array of `fanout(HEIGHT - 1)` leaf
        // elements, zero-initialized (empty) before publication.
        let elm = unsafe { &*node.as_ptr().cast::<LeafElm>().add(idx) };
        ctx.insert(self.identity(), key, elm);
        Ok(elm)
    }

    /// Resolve one child pointer, materializing the node when allowed.
    fn child(
        &self,
        slot: &AtomicPtr<u8>,
        node_level: usize,
        key: u64,
        dependent: bool,
        init: Option<&dyn NodeAlloc>,
    ) -> Result<NonNull<u8>, DescentFail> {
        let ordering = if dependent {
            Ordering::Relaxed
        } else {
            Ordering::Acquire
        };
        if let Some(node) = NonNull::new(slot.load(ordering)) {
            return Ok(node);
        }
        debug_assert!(!dependent, "dependent lookup of an unregistered key 0x{key:x}");
        match init {
            Some(alloc) => self.install_node(slot, node_level, alloc),
            None => Err(DescentFail::Unmapped),
        }
    }

    /// Materialize the node behind `slot` under the init lock.
    fn install_node(
        &self,
        slot: &AtomicPtr<u8>,
        node_level: usize,
        alloc: &dyn NodeAlloc,
    ) -> Result<NonNull<u8>, DescentFail> {
        self.init_lock.with_lock(|_| {
            // Double-checked: someone may have won the race before the lock.
            if let Some(node) = NonNull::new(slot.load(Ordering::Acquire)) {
                return Ok(node);
            }
            let layout = NODE_LAYOUTS[node_level];
            let Some(node) = alloc.alloc_node(layout) else {
                warn!(
                    "node allocation failed at level {node_level} ({} bytes)",
                    layout.size()
                );
                return Err(DescentFail::OutOfMemory);
            };
            // A zeroed node is a valid empty interior node or leaf; zero it
            // while still private, then publish.
            // SAFETY: `node` satisfies `layout` per the NodeAlloc contract.
            unsafe { core::ptr::write_bytes(node.as_ptr(), 0, layout.size()) };
            trace!(
                "materialized level {node_level} node ({} bytes)",
                layout.size()
            );
            slot.store(node.as_ptr(), Ordering::Release);
            Ok(node)
        })
    }
}
