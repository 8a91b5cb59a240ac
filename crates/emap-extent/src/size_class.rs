use core::fmt;

/// Number of small (slab-backed) size classes.
pub const NBINS: u8 = 36;

/// Total number of size classes; also the raw value of [`SizeClass::NONE`].
pub const NSIZES: u8 = 232;

/// Index into the allocator's size-class table.
///
/// The map stores a size class next to every registered descriptor pointer
/// so the free path can recover it without dereferencing the descriptor.
/// [`SizeClass::NONE`] marks mappings whose class is unknown or deliberately
/// uncached (large extents); consumers fall back to the descriptor itself.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SizeClass(u8);

impl SizeClass {
    /// Sentinel: unknown, or not a cached size class.
    pub const NONE: Self = Self(NSIZES);

    /// Construct from a raw table index.
    ///
    /// ### Debug assertions
    /// - Asserts `raw <= NSIZES` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(raw: u8) -> Self {
        debug_assert!(raw <= NSIZES);
        Self(raw)
    }

    /// The raw table index.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// `true` for a small (slab-backed) class.
    #[inline]
    #[must_use]
    pub const fn is_small(self) -> bool {
        self.0 < NBINS
    }

    /// `true` for the [`NONE`](Self::NONE) sentinel.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == NSIZES
    }

    /// Alias for [`new`](Self::new), for packed-field use.
    #[inline]
    #[must_use]
    #[doc(hidden)]
    pub const fn from_bits(v: u8) -> Self {
        Self(v)
    }

    /// Alias for [`raw`](Self::raw), for packed-field use.
    #[inline]
    #[must_use]
    #[doc(hidden)]
    pub const fn into_bits(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "SizeClass(NONE)")
        } else {
            write!(f, "SizeClass({})", self.0)
        }
    }
}
