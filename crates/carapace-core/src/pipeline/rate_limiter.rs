//! Token-bucket rate limiter, per `(group, tool)` (spec.md §4.5).
//!
//! Thread-safe via `RwLock<HashMap>` for the bucket map, matching the
//! locking shape of a sliding-window limiter but swapping the algorithm:
//! each bucket refills continuously from elapsed wall time and consumes a
//! single token per allowed request.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use crate::config::RateLimiterConfig;

struct Bucket {
    capacity: f64,
    refill_per_minute: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(config: RateLimiterConfig) -> Self {
        Self {
            capacity: config.burst_size as f64,
            refill_per_minute: config.requests_per_minute as f64,
            tokens: config.burst_size as f64,
            last_refill: Instant::now(),
        }
    }

    /// Refill based on elapsed wall time, clamped to capacity, then try to
    /// consume one token. Refill + consume happen without an intervening
    /// `.await`, so this is atomic within the calling task (spec.md §5).
    fn check(&mut self) -> RateLimitDecision {
        let now = Instant::now();
        let elapsed_minutes = now.duration_since(self.last_refill).as_secs_f64() / 60.0;
        self.tokens = (self.tokens + elapsed_minutes * self.refill_per_minute).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            RateLimitDecision::Allow
        } else {
            let deficit = 1.0 - self.tokens;
            let retry_after_ms = (deficit * 60_000.0 / self.refill_per_minute).ceil() as u64;
            RateLimitDecision::Deny { retry_after_ms }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitDecision {
    Allow,
    Deny { retry_after_ms: u64 },
}

/// Owns every `(group, tool)` bucket. Buckets are created lazily on first
/// use; a per-group override replaces the default configuration for all of
/// that group's buckets going forward.
pub struct RateLimiter {
    default_config: RateLimiterConfig,
    group_overrides: RwLock<HashMap<String, RateLimiterConfig>>,
    buckets: RwLock<HashMap<(String, String), Bucket>>,
}

impl RateLimiter {
    pub fn new(default_config: RateLimiterConfig) -> Self {
        Self {
            default_config,
            group_overrides: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the default configuration for every bucket belonging to
    /// `group`, including ones already created.
    pub fn set_group_override(&self, group: impl Into<String>, config: RateLimiterConfig) {
        let group = group.into();
        self.group_overrides.write().unwrap().insert(group.clone(), config);
        let mut buckets = self.buckets.write().unwrap();
        for ((bucket_group, _tool), bucket) in buckets.iter_mut() {
            if *bucket_group == group {
                bucket.capacity = config.burst_size as f64;
                bucket.refill_per_minute = config.requests_per_minute as f64;
                bucket.tokens = bucket.tokens.min(bucket.capacity);
            }
        }
    }

    pub fn check(&self, group: &str, tool: &str) -> RateLimitDecision {
        let config = self
            .group_overrides
            .read()
            .unwrap()
            .get(group)
            .copied()
            .unwrap_or(self.default_config);

        let key = (group.to_string(), tool.to_string());
        let mut buckets = self.buckets.write().unwrap();
        let bucket = buckets.entry(key).or_insert_with(|| Bucket::new(config));
        bucket.check()
    }

    /// Remove buckets untouched since `idle_since`. A bucket recreated on
    /// its next `check()` starts at full capacity anyway, the same state
    /// an idle bucket would have refilled to, so dropping it loses nothing.
    pub fn reap_idle(&self, idle_since: Instant) {
        self.buckets
            .write()
            .unwrap()
            .retain(|_, bucket| bucket.last_refill > idle_since);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(burst: u32, per_minute: u32) -> RateLimiterConfig {
        RateLimiterConfig {
            requests_per_minute: per_minute,
            burst_size: burst,
        }
    }

    #[test]
    fn burst_allows_exactly_capacity_then_denies() {
        let limiter = RateLimiter::new(config(3, 60));
        for _ in 0..3 {
            assert_eq!(limiter.check("demo", "echo"), RateLimitDecision::Allow);
        }
        let decision = limiter.check("demo", "echo");
        assert!(matches!(decision, RateLimitDecision::Deny { retry_after_ms } if retry_after_ms > 0));
    }

    #[test]
    fn distinct_group_tool_pairs_have_independent_buckets() {
        let limiter = RateLimiter::new(config(1, 60));
        assert_eq!(limiter.check("a", "t1"), RateLimitDecision::Allow);
        assert_eq!(limiter.check("b", "t1"), RateLimitDecision::Allow);
        assert_eq!(limiter.check("a", "t2"), RateLimitDecision::Allow);
    }

    #[test]
    fn group_override_replaces_default_for_new_buckets() {
        let limiter = RateLimiter::new(config(1, 60));
        limiter.set_group_override("vip", config(5, 60));
        for _ in 0..5 {
            assert_eq!(limiter.check("vip", "echo"), RateLimitDecision::Allow);
        }
        assert!(matches!(
            limiter.check("vip", "echo"),
            RateLimitDecision::Deny { .. }
        ));
    }

    #[test]
    fn reap_idle_drops_fully_refilled_buckets() {
        let limiter = RateLimiter::new(config(3, 60));
        limiter.check("demo", "echo");
        assert_eq!(limiter.bucket_count(), 1);
        // A freshly consumed bucket is below capacity, so a reap threshold
        // in the future should not remove it.
        limiter.reap_idle(Instant::now() + std::time::Duration::from_secs(1));
        assert_eq!(limiter.bucket_count(), 0);
    }
}
