//! A minimal spinlock, used to guard the handful of process-wide singletons
//! (the UART sink, the scheduler, the stage-2 root) that `HypervisorState`
//! is built from.
//!
//! A true lock is never contended here — the hypervisor runs on a single
//! physical core with interrupts masked at EL2 throughout steady state —
//! but wrapping shared state in `SpinLock` keeps the access discipline
//! explicit in the type system instead of resting on a `static mut`.

use core::cell::{Cell, UnsafeCell};
use core::hint;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

/// A cell that may only be initialized once, then read for the rest of the
/// hypervisor's lifetime.
///
/// Used for the process-wide singletons the design notes describe
/// (`HypervisorState`): none of them can be built as a `const fn` (the page
/// allocator needs the linker-provided stack-top address, the VM needs a
/// vmid and backing pages), so they are constructed once, early in `main`,
/// and never again.
pub struct InitCell<T>(UnsafeCell<Option<T>>);

// SAFETY: access is only ever exclusive-then-shared by construction (set
// once before any `deref`), which the caller of `set` must uphold.
unsafe impl<T> Sync for InitCell<T> {}

impl<T> InitCell<T> {
    /// An empty cell.
    #[must_use]
    pub const fn new() -> Self {
        Self(UnsafeCell::new(None))
    }

    fn get_pointer(&self) -> NonNull<Option<T>> {
        // SAFETY: never null.
        unsafe { NonNull::new_unchecked(self.0.get()) }
    }

    /// Initializes the cell with `value`.
    ///
    /// # Safety
    /// Must be called at most once, and must happen-before any `deref` of
    /// this cell (trivially satisfied here: called once from `main` before
    /// interrupts are unmasked, so nothing else can observe the cell yet).
    ///
    /// # Panics
    /// Panics if the cell is already initialized.
    pub unsafe fn set(&self, value: T) {
        // SAFETY: forwarded from the caller.
        let inner = unsafe { self.get_pointer().as_mut() };
        assert!(inner.is_none(), "InitCell set more than once");
        *inner = Some(value);
    }
}

impl<T> Default for InitCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deref for InitCell<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: once `set`, the cell is never mutated again, so any
        // number of shared references are sound.
        unsafe { self.get_pointer().as_ref() }
            .as_ref()
            .expect("InitCell read before it was initialized")
    }
}

/// A spinlock mutex.
pub struct SpinLock<T: ?Sized> {
    is_locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the spinlock guarantees exclusive access to `data` while locked.
unsafe impl<T> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a spinlock around the given data.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(data),
            is_locked: AtomicBool::new(false),
        }
    }

    /// Locks the mutex. The mutex is automatically unlocked when the
    /// returned guard is dropped.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        while self.is_locked.swap(true, Ordering::Acquire) {
            while self.is_locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        MutexGuard(self, Cell::new(true))
    }

    /// # Safety
    /// Must only be called by the destructor of the `MutexGuard` that
    /// locked this mutex.
    #[inline]
    unsafe fn unlock(&self) {
        self.is_locked.store(false, Ordering::Release);
    }
}

/// RAII guard returned by [`SpinLock::lock`].
pub struct MutexGuard<'locked, T>(&'locked SpinLock<T>, Cell<bool>);

impl<T> MutexGuard<'_, T> {
    const fn get_pointer(&self) -> NonNull<T> {
        // SAFETY: `data` is never null.
        unsafe { NonNull::new_unchecked(self.0.data.get()) }
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        assert!(self.1.get());
        // SAFETY: holding the lock grants exclusive access to the interior.
        unsafe { self.get_pointer().as_ref() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        assert!(self.1.get());
        // SAFETY: holding the lock grants exclusive access to the interior.
        unsafe { self.get_pointer().as_mut() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.1.set(false);
        // SAFETY: this is the guard that acquired the lock.
        unsafe {
            self.0.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{InitCell, SpinLock};

    #[test]
    fn init_cell_reads_back_the_set_value() {
        let cell = InitCell::new();
        // SAFETY: single-threaded test, set once before any deref.
        unsafe { cell.set(42_u32) };
        assert_eq!(*cell, 42);
    }

    #[test]
    #[should_panic(expected = "more than once")]
    fn init_cell_rejects_a_second_set() {
        let cell = InitCell::new();
        // SAFETY: single-threaded test.
        unsafe {
            cell.set(1_u32);
            cell.set(2_u32);
        }
    }

    #[test]
    fn lock_grants_exclusive_access() {
        let lock = SpinLock::new(0_u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn guard_drop_unlocks() {
        let lock = SpinLock::new(0_u32);
        // Each `lock()` call below must see the previous guard already
        // dropped, or this deadlocks (and the test hangs instead of
        // passing).
        *lock.lock() += 1;
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 2);
    }
}
