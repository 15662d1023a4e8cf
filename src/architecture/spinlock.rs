use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// A spinlock mutex
pub struct Spinlock<T> {
    inner: UnsafeCell<T>,
    is_locked: AtomicBool,
}

impl<T> Spinlock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: UnsafeCell::new(data),
            is_locked: AtomicBool::new(false),
        }
    }

    /// Locks the spinlock and grants the closure temporary mutable access to
    /// the inner state
    pub fn lock<'a, R>(&'a self, f: impl FnOnce(&'a mut T) -> R) -> R {
        use aarch64_cpu::asm::{sev, wfe};
        while self.is_locked.swap(true, Ordering::AcqRel) {
            core::hint::spin_loop();
            wfe();
        }

        // SAFETY: The `is_locked` flag guarantees exclusive access
        let result: R = f(unsafe { &mut *self.inner.get() });

        self.is_locked.store(false, Ordering::Release);
        sev();
        result
    }
}

// SAFETY: The lock flag serialises all access to the inner state
unsafe impl<T> Send for Spinlock<T> {}
// SAFETY: The lock flag serialises all access to the inner state
unsafe impl<T> Sync for Spinlock<T> {}
