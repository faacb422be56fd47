//! Backpressure governor.
//!
//! A blocking budget that keeps the total amount of buffered chunk bytes at
//! or below the configured limit. The driver reserves the bytes a job may
//! ever need *before* reading it; the reservation travels with the chunk as a
//! [`Permit`] and is handed back when the chunk is retired (dropped). If there
//! is not enough free capacity the caller blocks until some is returned.
//!
//! The counter itself is atomic; the mutex only exists so that waiters can
//! park on the condvar without missing a wakeup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// How long a blocked producer sleeps before re-checking the abort flag.
const ABORT_POLL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct Governor {
    budget: u64,
    in_flight: AtomicU64,
    peak: AtomicU64,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Governor {
    /// Create a new governor with the given total capacity (bytes).
    pub fn new(budget_bytes: u64) -> Arc<Self> {
        Arc::new(Governor {
            budget: budget_bytes,
            in_flight: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        })
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Bytes currently reserved by live permits.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest value `in_flight` ever reached.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }

    /// Reserve `bytes` without blocking. Returns `None` when it does not fit.
    pub fn try_acquire(self: &Arc<Self>, bytes: u64) -> Option<Permit> {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(bytes)?;
            if next > self.budget {
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::AcqRel);
                    return Some(Permit {
                        governor: Arc::clone(self),
                        bytes,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Blocks until `bytes` can be reserved.
    ///
    /// `aborted` is polled while waiting; once it reports `true` the call
    /// gives up with [`PipelineError::CancellationRequested`].
    pub fn acquire(self: &Arc<Self>, bytes: u64, aborted: impl Fn() -> bool) -> Result<Permit> {
        if bytes > self.budget {
            return Err(PipelineError::BackpressureDeadlock {
                budget: self.budget,
                required: bytes,
            });
        }
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if aborted() {
                return Err(PipelineError::CancellationRequested);
            }
            if let Some(permit) = self.try_acquire(bytes) {
                return Ok(permit);
            }
            guard = match self.cv.wait_timeout(guard, ABORT_POLL) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Wake every blocked producer, e.g. after an abort.
    pub fn wake_all(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.cv.notify_all();
    }

    fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.in_flight.fetch_sub(bytes, Ordering::AcqRel);
        self.wake_all();
    }
}

/// A reservation of governor capacity. Returned to the governor on drop.
#[derive(Debug)]
pub struct Permit {
    governor: Arc<Governor>,
    bytes: u64,
}

impl Permit {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Hand back the part of the reservation above `bytes`.
    ///
    /// Used once a job's working set has collapsed to its output size.
    /// Growing a permit is not possible; larger values are ignored.
    pub fn shrink_to(&mut self, bytes: u64) {
        if bytes < self.bytes {
            let surplus = self.bytes - bytes;
            self.bytes = bytes;
            self.governor.release(surplus);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.governor.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn permits_return_capacity_on_drop() {
        let governor = Governor::new(100);
        let a = governor.try_acquire(60).unwrap();
        assert!(governor.try_acquire(50).is_none());
        let b = governor.try_acquire(40).unwrap();
        assert_eq!(governor.in_flight(), 100);
        drop(a);
        drop(b);
        assert_eq!(governor.in_flight(), 0);
        assert_eq!(governor.peak(), 100);
    }

    #[test]
    fn shrink_releases_surplus() {
        let governor = Governor::new(100);
        let mut permit = governor.try_acquire(80).unwrap();
        permit.shrink_to(30);
        assert_eq!(governor.in_flight(), 30);
        permit.shrink_to(90);
        assert_eq!(permit.bytes(), 30);
        drop(permit);
        assert_eq!(governor.in_flight(), 0);
    }

    #[test]
    fn oversized_request_is_a_deadlock() {
        let governor = Governor::new(10);
        let err = governor.acquire(11, || false).unwrap_err();
        assert!(matches!(err, PipelineError::BackpressureDeadlock { budget: 10, required: 11 }));
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let governor = Governor::new(64);
        let held = governor.try_acquire(64).unwrap();
        let g = Arc::clone(&governor);
        let waiter = thread::spawn(move || g.acquire(32, || false).map(|p| p.bytes()));
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), 32);
        assert!(governor.peak() <= 64);
    }

    #[test]
    fn blocked_acquire_gives_up_on_abort() {
        let governor = Governor::new(8);
        let _held = governor.try_acquire(8).unwrap();
        let abort = Arc::new(AtomicBool::new(false));
        let g = Arc::clone(&governor);
        let flag = Arc::clone(&abort);
        let waiter = thread::spawn(move || g.acquire(4, || flag.load(Ordering::Acquire)));
        thread::sleep(Duration::from_millis(10));
        abort.store(true, Ordering::Release);
        governor.wake_all();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(PipelineError::CancellationRequested)
        ));
    }
}
