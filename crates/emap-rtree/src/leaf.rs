use core::hint::spin_loop;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use emap_extent::{Extent, SizeClass};

/// Low bit of the descriptor word, repurposed as the element lock.
///
/// Descriptors have alignment of at least 2 (statically asserted in
/// `emap-extent`), so the bit is always free in a real pointer.
const LOCK_BIT: usize = 0b1;

/// The mapping stored for one page: descriptor pointer, size class, slab
/// flag.
///
/// [`RtreeContents::EMPTY`] is what an unmapped page reads as.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RtreeContents {
    pub extent: Option<NonNull<Extent>>,
    pub szind: SizeClass,
    pub slab: bool,
}

impl RtreeContents {
    /// The value of an unmapped page.
    pub const EMPTY: Self = Self {
        extent: None,
        szind: SizeClass::NONE,
        slab: false,
    };

    #[must_use]
    pub const fn new(extent: NonNull<Extent>, szind: SizeClass, slab: bool) -> Self {
        Self {
            extent: Some(extent),
            szind,
            slab,
        }
    }

    /// `true` when no descriptor is mapped.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.extent.is_none()
    }
}

/// One leaf element of the radix tree: the mapping for a single page.
///
/// The descriptor pointer lives in an atomic word whose low bit is a spin
/// lock ([`acquire`](Self::acquire)). Size class and slab flag live in
/// adjacent relaxed atomics; they are only meaningful to a reader that first
/// observed a non-null descriptor through an acquire load, because
/// [`write`](Self::write) stores them before releasing the pointer word.
#[repr(C)]
pub struct LeafElm {
    /// Descriptor pointer; bit 0 is the element lock.
    ptr: AtomicUsize,
    /// Raw size class of the mapping.
    szind: AtomicU8,
    /// Slab flag of the mapping.
    slab: AtomicBool,
}

impl LeafElm {
    /// The descriptor currently mapped, or `None`.
    ///
    /// `dependent` callers (holding proof the mapping exists and is
    /// reachable) get a relaxed load; speculative callers get acquire.
    /// The lock bit is masked off either way.
    #[inline]
    #[must_use]
    pub fn extent(&self, dependent: bool) -> Option<NonNull<Extent>> {
        let ordering = if dependent {
            Ordering::Relaxed
        } else {
            Ordering::Acquire
        };
        let word = self.ptr.load(ordering);
        NonNull::new((word & !LOCK_BIT) as *mut Extent)
    }

    /// Raw size class field.
    ///
    /// Only meaningful after observing a non-null descriptor; see the type
    /// docs.
    #[inline]
    #[must_use]
    pub fn szind(&self) -> SizeClass {
        SizeClass::new(self.szind.load(Ordering::Relaxed))
    }

    /// Raw slab field. Same caveat as [`szind`](Self::szind).
    #[inline]
    #[must_use]
    pub fn slab(&self) -> bool {
        self.slab.load(Ordering::Relaxed)
    }

    /// Read the whole mapping.
    ///
    /// Returns [`RtreeContents::EMPTY`] when no descriptor is mapped.
    #[inline]
    #[must_use]
    pub fn read(&self, dependent: bool) -> RtreeContents {
        let Some(extent) = self.extent(dependent) else {
            return RtreeContents::EMPTY;
        };
        RtreeContents {
            extent: Some(extent),
            szind: self.szind(),
            slab: self.slab(),
        }
    }

    /// Install a mapping.
    ///
    /// Size class and slab flag are stored first with relaxed ordering, the
    /// descriptor word last with release, so any reader that acquires the
    /// pointer also observes matching side fields and fully initialized
    /// descriptor contents.
    pub fn write(&self, contents: RtreeContents) {
        let word = contents.extent.map_or(0, |p| p.as_ptr() as usize);
        debug_assert_eq!(word & LOCK_BIT, 0, "descriptor pointer uses the tag bit");
        debug_assert_eq!(
            self.ptr.load(Ordering::Relaxed) & LOCK_BIT,
            0,
            "plain write to an acquired element"
        );
        self.szind.store(contents.szind.raw(), Ordering::Relaxed);
        self.slab.store(contents.slab, Ordering::Relaxed);
        self.ptr.store(word, Ordering::Release);
    }

    /// Install the empty mapping.
    #[inline]
    pub fn clear(&self) {
        self.write(RtreeContents::EMPTY);
    }

    /// Spin until this element's lock bit is taken.
    ///
    /// The returned guard allows plain reads and rewrites of the element and
    /// releases the bit (with release ordering) on drop. At most one guard
    /// exists per element at a time.
    #[must_use]
    pub fn acquire(&self) -> LeafGuard<'_> {
        loop {
            let word = self.ptr.load(Ordering::Relaxed);
            if word & LOCK_BIT == 0
                && self
                    .ptr
                    .compare_exchange_weak(
                        word,
                        word | LOCK_BIT,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return LeafGuard { elm: self };
            }
            spin_loop();
        }
    }
}

/// Exclusive hold of one leaf element's lock bit.
///
/// Created by [`LeafElm::acquire`]. While the guard lives, the owning
/// thread may read and rewrite the element without further synchronization;
/// concurrent plain readers keep seeing the (masked) descriptor pointer.
pub struct LeafGuard<'a> {
    elm: &'a LeafElm,
}

impl LeafGuard<'_> {
    /// Read the mapping. No fences; the guard owns the element.
    #[must_use]
    pub fn read(&self) -> RtreeContents {
        let word = self.elm.ptr.load(Ordering::Relaxed) & !LOCK_BIT;
        let Some(extent) = NonNull::new(word as *mut Extent) else {
            return RtreeContents::EMPTY;
        };
        RtreeContents {
            extent: Some(extent),
            szind: self.elm.szind(),
            slab: self.elm.slab(),
        }
    }

    /// Rewrite the mapping, keeping the lock bit set.
    pub fn write(&self, contents: RtreeContents) {
        let word = contents.extent.map_or(0, |p| p.as_ptr() as usize);
        debug_assert_eq!(word & LOCK_BIT, 0, "descriptor pointer uses the tag bit");
        self.elm.szind.store(contents.szind.raw(), Ordering::Relaxed);
        self.elm.slab.store(contents.slab, Ordering::Relaxed);
        self.elm.ptr.store(word | LOCK_BIT, Ordering::Release);
    }

    /// Rewrite to the empty mapping.
    #[inline]
    pub fn clear(&self) {
        self.write(RtreeContents::EMPTY);
    }
}

impl Drop for LeafGuard<'_> {
    fn drop(&mut self) {
        let word = self.elm.ptr.load(Ordering::Relaxed) & !LOCK_BIT;
        self.elm.ptr.store(word, Ordering::Release);
    }
}
