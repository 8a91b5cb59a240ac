/// Lifecycle state of an extent.
///
/// State transitions are driven by the arena and the extent caches; the map
/// merely stores the current value and copies it across split and merge.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ExtentState {
    /// Backing a live allocation or slab.
    Active = 0,
    /// Freed with contents intact, awaiting reuse or purging.
    Dirty = 1,
    /// Freed and lazily purged; contents indeterminate.
    Muzzy = 2,
    /// Only the address range is retained; pages were returned to the system.
    Retained = 3,
}

impl ExtentState {
    /// Conversion for packed-field use.
    #[inline]
    #[must_use]
    #[doc(hidden)]
    pub const fn from_bits(v: u8) -> Self {
        match v & 0b11 {
            0 => Self::Active,
            1 => Self::Dirty,
            2 => Self::Muzzy,
            _ => Self::Retained,
        }
    }

    /// Conversion for packed-field use.
    #[inline]
    #[must_use]
    #[doc(hidden)]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_round_trip() {
        for s in [
            ExtentState::Active,
            ExtentState::Dirty,
            ExtentState::Muzzy,
            ExtentState::Retained,
        ] {
            assert_eq!(ExtentState::from_bits(s.into_bits()), s);
        }
    }
}
