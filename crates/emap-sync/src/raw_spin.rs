use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// A test-and-test-and-set spin lock on an atomic flag.
///
/// `RawSpin` is the low-level primitive underneath the mutex pool and
/// [`SpinLock`](crate::SpinLock). It busy-waits until the flag clears, so it
/// is only suitable for critical sections that are a handful of loads and
/// stores long, which is all the extent map ever does under one.
///
/// The lock is not fair and not reentrant.
///
/// # Examples
///
/// ```
/// use emap_sync::RawSpin;
///
/// let lock = RawSpin::new();
///
/// lock.lock();
/// // critical section
/// unsafe { lock.unlock() };
/// ```
pub struct RawSpin {
    /// `true` while some caller holds the lock.
    held: AtomicBool,
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpin {
    /// Creates a new unlocked `RawSpin`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Waiters spin on a relaxed load and only retry the atomic swap once the
    /// flag reads clear, which keeps the cache line shared while contended.
    #[inline]
    pub fn lock(&self) {
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns `true` if the lock was acquired.
    ///
    /// # Examples
    ///
    /// ```
    /// use emap_sync::RawSpin;
    ///
    /// let lock = RawSpin::new();
    /// assert!(lock.try_lock());
    /// assert!(!lock.try_lock());
    /// unsafe { lock.unlock() };
    /// ```
    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.held.swap(true, Ordering::Acquire)
    }

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock through a prior successful
    /// [`lock`](Self::lock) or [`try_lock`](Self::try_lock).
    #[inline]
    pub unsafe fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}
