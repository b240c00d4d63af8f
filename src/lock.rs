//! Spin locks that work inside shared mappings and signal handlers.
//!
//! Both locks are plain atomics with no pointers and no OS handles, so
//! they keep working when the memory holding them is `MAP_SHARED` between
//! forked processes. Neither allocates or blocks in the kernel.

use std::cell::UnsafeCell;
use std::hint::spin_loop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Test-and-set spin lock with exponential backoff.
///
/// Used for the segment directory, which lives in a region shared by every
/// process of the group. Critical sections are short and bounded.
#[repr(C)]
pub struct SpinLock<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: SpinLock provides synchronisation for T
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new, unlocked spin lock.
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.lock_unless(|| false) {
                return guard;
            }
        }
    }

    /// Acquire the lock, or give up once `give_up` returns true while the
    /// lock is contended.
    ///
    /// `give_up` is only consulted after a failed attempt, so an
    /// uncontended lock is always taken.
    pub fn lock_unless(&self, give_up: impl Fn() -> bool) -> Option<SpinLockGuard<'_, T>> {
        let mut backoff = 1u32;

        while self
            .state
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if give_up() {
                return None;
            }
            for _ in 0..backoff {
                spin_loop();
            }
            backoff = (backoff * 2).min(64);
        }

        Some(SpinLockGuard { lock: self })
    }

    /// Try to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    /// Whether some process currently holds the lock (snapshot).
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    fn unlock(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }
}

/// Guard for a held [`SpinLock`].
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: We hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: We hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Outcome of [`EntryLock::acquire`].
#[derive(Debug, PartialEq, Eq)]
pub enum Acquire<G> {
    /// The lock is now held by the calling thread.
    Locked(G),
    /// The calling thread already holds this lock: waiting would deadlock.
    HeldBySelf,
}

/// Spin lock that remembers which thread holds it.
///
/// Protects one Local Mapping Table entry. The fault handler may interrupt
/// a thread that is itself inside the entry's critical section; spinning
/// there would never end, so [`acquire`](Self::acquire) reports
/// [`Acquire::HeldBySelf`] instead. Other threads simply spin.
pub struct EntryLock<T> {
    /// Kernel thread id of the holder, 0 when free.
    owner: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: EntryLock provides synchronisation for T
unsafe impl<T: Send> Send for EntryLock<T> {}
unsafe impl<T: Send> Sync for EntryLock<T> {}

/// Kernel thread id of the caller. `gettid` is async-signal-safe.
#[inline]
fn current_tid() -> u32 {
    rustix::thread::gettid().as_raw_nonzero().get() as u32
}

impl<T> EntryLock<T> {
    /// Create a new, unlocked entry lock.
    pub const fn new(data: T) -> Self {
        Self {
            owner: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning while another thread holds it.
    pub fn acquire(&self) -> Acquire<EntryLockGuard<'_, T>> {
        let tid = current_tid();
        loop {
            match self
                .owner
                .compare_exchange_weak(0, tid, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return Acquire::Locked(EntryLockGuard { lock: self }),
                Err(holder) if holder == tid => return Acquire::HeldBySelf,
                Err(_) => spin_loop(),
            }
        }
    }
}

/// Guard for a held [`EntryLock`].
pub struct EntryLockGuard<'a, T> {
    lock: &'a EntryLock<T>,
}

impl<T> std::fmt::Debug for EntryLockGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryLockGuard")
            .field("owner", &self.lock.owner.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> PartialEq for EntryLockGuard<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.lock, other.lock)
    }
}

impl<T> Eq for EntryLockGuard<'_, T> {}

impl<T> Deref for EntryLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: We hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for EntryLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: We hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for EntryLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_spinlock_mutual_exclusion() {
        let lock = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn test_spinlock_try_lock() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(!lock.is_locked());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_spinlock_lock_unless_gives_up_when_held() {
        let lock = Arc::new(SpinLock::new(0u32));
        let guard = lock.lock();
        assert!(lock.lock_unless(|| true).is_none());

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.lock_unless(|| false).map(|g| *g))
        };
        thread::sleep(std::time::Duration::from_millis(20));
        drop(guard);
        assert_eq!(waiter.join().unwrap(), Some(0));

        // an uncontended lock is taken without consulting the callback
        assert!(lock.lock_unless(|| true).is_some());
    }

    #[test]
    fn test_entry_lock_detects_self_deadlock() {
        let lock = EntryLock::new(5u32);
        let Acquire::Locked(guard) = lock.acquire() else {
            panic!("fresh lock must be acquirable");
        };
        assert_eq!(*guard, 5);
        assert_eq!(lock.acquire(), Acquire::HeldBySelf);
        drop(guard);
        assert!(matches!(lock.acquire(), Acquire::Locked(_)));
    }

    #[test]
    fn test_entry_lock_other_thread_waits() {
        let lock = Arc::new(EntryLock::new(0u32));
        let Acquire::Locked(mut guard) = lock.acquire() else {
            panic!("fresh lock must be acquirable");
        };

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || match lock.acquire() {
                Acquire::Locked(guard) => *guard,
                Acquire::HeldBySelf => u32::MAX,
            })
        };

        *guard = 42;
        thread::sleep(std::time::Duration::from_millis(10));
        drop(guard);
        assert_eq!(waiter.join().unwrap(), 42);
    }
}
