//! # Process-Shared Robust Mutex
//!
//! Both the meta lock (cache line 1 of the meta block) and the per-thread
//! liveness beacons in shared memory are pthread mutexes living inside
//! memory-mapped regions shared by every process that opens the file. They
//! are initialized with `PTHREAD_PROCESS_SHARED` so any mapping can lock
//! them, and `PTHREAD_MUTEX_ROBUST` so the death of a holder surfaces as
//! `EOWNERDEAD` instead of wedging the file forever.
//!
//! The wrapper is deliberately thin: it exposes exactly the operations the
//! meta lock and the liveness probe need, and it never blocks the caller on
//! anything but the mutex itself.

use std::cell::UnsafeCell;

use eyre::{bail, Result};

/// A robust, process-shared pthread mutex embedded in mapped memory.
///
/// The struct must only ever be viewed in place inside a shared mapping;
/// it is never moved after [`RobustMutex::init`] has run.
#[repr(C)]
pub struct RobustMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread mutexes are designed for concurrent use from any thread
// (and, with PTHREAD_PROCESS_SHARED, any process) once initialized.
unsafe impl Send for RobustMutex {}
unsafe impl Sync for RobustMutex {}

impl RobustMutex {
    /// Initializes the mutex in place. Must run exactly once per mutex, by
    /// whichever process creates the region it lives in, before any `lock`.
    pub fn init(&self) -> Result<()> {
        // SAFETY: `attr` is a local initialized by pthread_mutexattr_init
        // before use; `self.inner` points into a live mapping and no other
        // thread can touch an uninitialized mutex by the caller's contract.
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            let rc = libc::pthread_mutexattr_init(&mut attr);
            if rc != 0 {
                bail!("pthread_mutexattr_init failed: {rc}");
            }
            libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
            let rc = libc::pthread_mutex_init(self.inner.get(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if rc != 0 {
                bail!("pthread_mutex_init failed: {rc}");
            }
        }
        Ok(())
    }

    /// Locks, recovering ownership from a dead holder if necessary.
    pub fn lock(&self) -> Result<()> {
        // SAFETY: the mutex was initialized by the region creator; see `init`.
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        match rc {
            0 => Ok(()),
            libc::EOWNERDEAD => {
                // the previous holder died; the state it protects is repaired
                // by our caller, so mark the mutex usable again and carry on
                // SAFETY: EOWNERDEAD means we hold the lock.
                unsafe { libc::pthread_mutex_consistent(self.inner.get()) };
                Ok(())
            }
            rc => bail!("pthread_mutex_lock failed: {rc}"),
        }
    }

    pub fn unlock(&self) {
        // SAFETY: only called by the lock holder.
        unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
    }

    /// Raw trylock result for liveness probing: `0` means the probe acquired
    /// the lock (so the owner is gone), `EBUSY` means a live owner holds it,
    /// `EOWNERDEAD` means the owner died while holding it.
    pub fn try_lock_raw(&self) -> i32 {
        // SAFETY: the mutex was initialized by the region creator.
        unsafe { libc::pthread_mutex_trylock(self.inner.get()) }
    }

    /// Marks a mutex acquired via `EOWNERDEAD` consistent again.
    pub fn make_consistent(&self) {
        // SAFETY: only called while holding the lock after EOWNERDEAD.
        unsafe { libc::pthread_mutex_consistent(self.inner.get()) };
    }

    /// Tears the mutex down before its slot is recycled.
    pub fn destroy(&self) {
        // SAFETY: only called once the slot owner is known to be gone and the
        // lock is not held.
        unsafe { libc::pthread_mutex_destroy(self.inner.get()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_cycle() {
        let mu = RobustMutex {
            inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        };
        mu.init().unwrap();

        mu.lock().unwrap();
        mu.unlock();
        mu.lock().unwrap();
        mu.unlock();
        mu.destroy();
    }

    #[test]
    fn trylock_reports_busy_while_held() {
        let mu = RobustMutex {
            inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        };
        mu.init().unwrap();

        mu.lock().unwrap();
        assert_eq!(mu.try_lock_raw(), libc::EBUSY);
        mu.unlock();

        assert_eq!(mu.try_lock_raw(), 0);
        mu.unlock();
        mu.destroy();
    }
}
