//! Process-shared mutex and condition variable.
//!
//! Thin wrappers over `pthread_mutex_t`/`pthread_cond_t` initialised with
//! `PTHREAD_PROCESS_SHARED` so they work when placed in a mapped region.
//! The mutex is robust: if a peer dies while holding it, the next locker
//! recovers it instead of blocking forever. The condvar measures timeouts
//! on `CLOCK_MONOTONIC`.
//!
//! Both types are only ever reached through a pointer into a [`Region`];
//! they are initialised in place by the resource creator and never moved.
//!
//! [`Region`]: crate::backend::Region

use crate::error::{ShmError, ShmResult};
use crate::platform;
use std::cell::UnsafeCell;
use std::time::Instant;
use tracing::warn;

fn check(op: &'static str, rc: libc::c_int) -> ShmResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(ShmError::Sync { op, errno: rc })
    }
}

/// Robust, process-shared mutex living in shared memory.
#[repr(C)]
pub struct ShmMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread mutexes are designed for concurrent access from any thread
// or, with PTHREAD_PROCESS_SHARED, any process.
unsafe impl Sync for ShmMutex {}
// SAFETY: as above.
unsafe impl Send for ShmMutex {}

impl ShmMutex {
    /// Initialise a mutex in place.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory sized and aligned for `ShmMutex`
    /// that no other thread or process is using yet.
    pub unsafe fn init(this: *mut ShmMutex) -> ShmResult<()> {
        // SAFETY: attr is a local initialised by pthread_mutexattr_init before use;
        // `this` is valid per the function contract.
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = core::mem::zeroed();
            check("pthread_mutexattr_init", libc::pthread_mutexattr_init(&mut attr))?;
            let result = (|| -> ShmResult<()> {
                check(
                    "pthread_mutexattr_setpshared",
                    libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED),
                )?;
                check(
                    "pthread_mutexattr_setrobust",
                    libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST),
                )?;
                check(
                    "pthread_mutex_init",
                    libc::pthread_mutex_init(UnsafeCell::raw_get(&raw const (*this).raw), &attr),
                )
            })();
            libc::pthread_mutexattr_destroy(&mut attr);
            result
        }
    }

    /// Block until the mutex is held.
    ///
    /// A mutex abandoned by a dead owner is marked consistent and returned;
    /// the protected state is whatever the owner left behind.
    pub fn lock(&self) -> ShmResult<ShmMutexGuard<'_>> {
        // SAFETY: the mutex was initialised by its creator before publication.
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        self.after_acquire("pthread_mutex_lock", rc)?;
        Ok(ShmMutexGuard { mutex: self })
    }

    fn after_acquire(&self, op: &'static str, rc: libc::c_int) -> ShmResult<()> {
        if rc == libc::EOWNERDEAD {
            warn!("Recovered mutex abandoned by a dead owner");
            // SAFETY: we hold the mutex in the EOWNERDEAD state.
            return check("pthread_mutex_consistent", unsafe {
                libc::pthread_mutex_consistent(self.raw.get())
            });
        }
        check(op, rc)
    }
}

/// Held lock on a [`ShmMutex`]; unlocks on drop.
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard holds the lock.
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.raw.get());
        }
    }
}

/// Process-shared condition variable on CLOCK_MONOTONIC.
#[repr(C)]
pub struct ShmCondvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: see ShmMutex.
unsafe impl Sync for ShmCondvar {}
// SAFETY: see ShmMutex.
unsafe impl Send for ShmCondvar {}

/// Outcome of a timed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken (possibly spuriously); re-check the predicate.
    Notified,
    /// The deadline passed.
    TimedOut,
}

impl ShmCondvar {
    /// Initialise a condvar in place.
    ///
    /// # Safety
    ///
    /// Same contract as [`ShmMutex::init`].
    pub unsafe fn init(this: *mut ShmCondvar) -> ShmResult<()> {
        // SAFETY: as in ShmMutex::init.
        unsafe {
            let mut attr: libc::pthread_condattr_t = core::mem::zeroed();
            check("pthread_condattr_init", libc::pthread_condattr_init(&mut attr))?;
            let result = (|| -> ShmResult<()> {
                check(
                    "pthread_condattr_setpshared",
                    libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED),
                )?;
                check(
                    "pthread_condattr_setclock",
                    libc::pthread_condattr_setclock(&mut attr, libc::CLOCK_MONOTONIC),
                )?;
                check(
                    "pthread_cond_init",
                    libc::pthread_cond_init(UnsafeCell::raw_get(&raw const (*this).raw), &attr),
                )
            })();
            libc::pthread_condattr_destroy(&mut attr);
            result
        }
    }

    /// Atomically release `guard`'s mutex and wait for a notification.
    pub fn wait(&self, guard: &mut ShmMutexGuard<'_>) -> ShmResult<()> {
        // SAFETY: guard proves the mutex is held by this thread.
        let rc = unsafe { libc::pthread_cond_wait(self.raw.get(), guard.mutex.raw.get()) };
        guard.mutex.after_acquire("pthread_cond_wait", rc)
    }

    /// Like [`ShmCondvar::wait`] but gives up at `deadline`.
    pub fn wait_until(
        &self,
        guard: &mut ShmMutexGuard<'_>,
        deadline: Instant,
    ) -> ShmResult<WaitOutcome> {
        let ts = platform::monotonic_deadline(deadline)?;
        // SAFETY: guard proves the mutex is held by this thread.
        let rc = unsafe {
            libc::pthread_cond_timedwait(self.raw.get(), guard.mutex.raw.get(), &ts)
        };
        if rc == libc::ETIMEDOUT {
            return Ok(WaitOutcome::TimedOut);
        }
        guard.mutex.after_acquire("pthread_cond_timedwait", rc)?;
        Ok(WaitOutcome::Notified)
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        // SAFETY: initialised by the creator.
        unsafe {
            libc::pthread_cond_broadcast(self.raw.get());
        }
    }
}
