use crate::raw_spin::RawSpin;
use crate::witness::{Witness, WitnessRank};
use core::cell::UnsafeCell;

/// A ranked spin lock protecting a small owned value.
///
/// `SpinLock` pairs a [`RawSpin`] with a [`Witness`] so that every
/// acquisition participates in lock-rank checking, and scopes the critical
/// section to a closure so the lock cannot leak out of it.
///
/// Suitable for short critical sections only (a cursor bump, a
/// double-checked pointer install); the callers in this workspace never do
/// more than a few memory operations under one.
///
/// # Examples
///
/// ```
/// use emap_sync::{SpinLock, WitnessRank};
///
/// let counter = SpinLock::new("counter", WitnessRank::Base, 0_u32);
/// let value = counter.with_lock(|c| {
///     *c += 1;
///     *c
/// });
/// assert_eq!(value, 1);
/// ```
pub struct SpinLock<T> {
    witness: Witness,
    raw: RawSpin,
    inner: UnsafeCell<T>,
}

// Safety: the raw lock provides mutual exclusion; the value may be shared
// across threads whenever it could also be sent between them.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked `SpinLock` at the given rank.
    pub const fn new(name: &'static str, rank: WitnessRank, inner: T) -> Self {
        Self {
            witness: Witness::new(name, rank),
            raw: RawSpin::new(),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Execute `f` with exclusive access to the inner value.
    ///
    /// Spins until the lock is acquired; the lock is released when `f`
    /// returns or unwinds.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.witness.lock();
        self.raw.lock();
        let _unlock = Unlock(self);

        // SAFETY: the raw lock is held for the lifetime of `_unlock`.
        let inner = unsafe { &mut *self.inner.get() };
        f(inner)
    }

    /// Returns a mutable reference to the inner value.
    ///
    /// Because you hold `&mut self`, no other references can exist, so
    /// locking is unnecessary.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// Releases the lock on drop so `with_lock` stays correct across unwinds.
struct Unlock<'a, T>(&'a SpinLock<T>);

impl<T> Drop for Unlock<'_, T> {
    fn drop(&mut self) {
        // SAFETY: `with_lock` acquired the raw lock before constructing us.
        unsafe { self.0.raw.unlock() };
        self.0.witness.unlock();
    }
}
