//! Concurrency bound shared by lifecycle operations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Tracks in-flight runtime operations (spawn/shutdown) so a burst of
/// requests cannot overwhelm the container runtime. Callers check
/// `try_acquire` before calling the runtime and `release` when done.
pub struct ConcurrencyLimiter {
    in_flight: AtomicU32,
    max: u32,
}

impl ConcurrencyLimiter {
    pub fn new(max: u32) -> Arc<Self> {
        Arc::new(Self {
            in_flight: AtomicU32::new(0),
            max,
        })
    }

    /// Try to acquire a slot. Returns `true` if acquired, `false` if at capacity.
    pub fn try_acquire(&self) -> bool {
        loop {
            let current = self.in_flight.load(Ordering::Relaxed);
            if current >= self.max {
                return false;
            }
            if self
                .in_flight
                .compare_exchange(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::Release);
    }

    pub fn current(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_limiter_basic() {
        let limiter = ConcurrencyLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.current(), 2);
        limiter.release();
        assert_eq!(limiter.current(), 1);
        assert!(limiter.try_acquire());
    }

    #[test]
    fn concurrency_limiter_zero() {
        let limiter = ConcurrencyLimiter::new(0);
        assert!(!limiter.try_acquire());
    }
}
