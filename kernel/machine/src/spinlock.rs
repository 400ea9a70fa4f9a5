//! Spinlock protecting the state of the simulated hardware.
//!
//! Only one execution context holds the CPU at a time, so these locks are
//! essentially never contended; they exist to make the machine state `Sync`
//! and to catch accidental re-entrance. Unlike the kernel primitives, a
//! [`SpinLock`] never touches the interrupt level and never blocks an
//! execution context.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A mutual exclusion primitive useful for protecting shared data
///
/// The data can only be accessed through the guard returned from [`lock`],
/// which guarantees that the data is only ever accessed when the spinlock is
/// locked.
///
/// [`lock`]: Self::lock
///
/// # Examples
///
/// ```
/// use machine::spinlock::SpinLock;
///
/// let data = SpinLock::new(0);
/// let mut guard = data.lock();
/// *guard += 1;
/// // the lock must be "explicitly" unlocked before `guard` goes out of scope.
/// guard.unlock();
/// assert_eq!(data.into_inner(), 1);
/// ```
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            data: UnsafeCell::new(t),
            locked: AtomicBool::new(false),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires a spinlock, spinning until it is able to do so.
    ///
    /// An guard is returned to allow scoped access of the lock. When the
    /// guard goes out of scope without [`SpinLockGuard::unlock`], panic
    /// occurs.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinLockGuard {
            caller: core::panic::Location::caller(),
            lock: self,
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// An implementation of a "scoped lock" of a spinlock. When this structure
/// is dropped (falls out of scope) without unlock, panic occurs.
///
/// The lock must be explicitly unlocked by [`unlock`] method.
///
/// [`unlock`]: Self::unlock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static core::panic::Location<'static>,
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the underlying [`SpinLock`].
    pub fn unlock(self) {
        self.lock.locked.store(false, Ordering::Release);
        core::mem::forget(self);
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // An unwinding context releases silently.
        self.lock.locked.store(false, Ordering::Release);
        if !std::thread::panicking() {
            panic!(
                "`.unlock()` must be explicitly called before dropping SpinLockGuard.
The lock is held at {:?}.",
                self.caller
            );
        }
    }
}
