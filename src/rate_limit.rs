use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{config::Config, models::rate_limit::RateLimitPolicy, utils::SweepGate};

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: u32,
    capacity: u32,
    window: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, window: Duration, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            window,
            last_refill: now,
        }
    }

    /// Restores `capacity` tokens for every full window elapsed since the last
    /// refill, keeping refills aligned to the bucket's creation time.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);

        if self.window.is_zero() {
            self.tokens = self.capacity;
            self.last_refill = now;
            return;
        }

        let windows = elapsed.as_nanos() / self.window.as_nanos();
        if windows == 0 {
            return;
        }

        let restored = u64::try_from(windows)
            .unwrap_or(u64::MAX)
            .saturating_mul(u64::from(self.capacity));
        self.tokens = (u64::from(self.tokens).saturating_add(restored))
            .min(u64::from(self.capacity)) as u32;

        let advance = self.window.as_nanos().saturating_mul(windows);
        self.last_refill += u64::try_from(advance)
            .map(Duration::from_nanos)
            .unwrap_or(elapsed);
    }

    fn try_take(&mut self, cost: u32, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Zero while `cost` tokens are available, otherwise the wait until the
    /// next refill. A cost above capacity never fits; the next refill is still
    /// the earliest point anything changes.
    fn time_until_refill(&self, cost: u32, now: Instant) -> Duration {
        if self.tokens >= cost {
            return Duration::ZERO;
        }

        (self.last_refill + self.window).saturating_duration_since(now)
    }

    fn is_full(&self) -> bool {
        self.tokens >= self.capacity
    }
}

/// Keyed token-bucket registry for a single policy.
///
/// Buckets are created on first use through the `DashMap` entry API, so two
/// callers racing on an unseen key share one bucket. Consumption happens while
/// the entry guard is held, which makes check-and-decrement atomic per key
/// without a registry-wide lock.
#[derive(Clone)]
pub struct RateLimiter {
    policy: Arc<RateLimitPolicy>,
    buckets: Arc<DashMap<String, TokenBucket>>,
    sweep: Arc<SweepGate>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self::with_cleanup_threshold(policy, 10_000)
    }

    pub fn with_cleanup_threshold(policy: RateLimitPolicy, cleanup_threshold: usize) -> Self {
        debug!(
            policy = policy.name,
            capacity = policy.capacity,
            window_secs = policy.window.as_secs(),
            "Rate limiter initialized"
        );

        // Between two sweeps one window passes, so every bucket has had the
        // chance to refill.
        let sweep = SweepGate::new(cleanup_threshold, policy.window);

        Self {
            policy: Arc::new(policy),
            buckets: Arc::new(DashMap::new()),
            sweep: Arc::new(sweep),
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn try_consume(&self, key: &str) -> bool {
        self.try_consume_with_cost(key, 1)
    }

    /// Never waits: a denial is returned immediately.
    pub fn try_consume_with_cost(&self, key: &str, cost: u32) -> bool {
        let now = Instant::now();

        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.policy.capacity, self.policy.window, now));

        let granted = bucket.try_take(cost, now);
        let remaining = bucket.tokens;
        drop(bucket);

        if granted {
            trace!(
                policy = self.policy.name,
                key,
                cost,
                tokens_remaining = remaining,
                "Rate limit tokens consumed"
            );
        } else {
            debug!(
                policy = self.policy.name,
                key,
                cost,
                tokens_remaining = remaining,
                "Rate limit exceeded"
            );
        }

        if self.sweep.try_claim(self.buckets.len(), now) {
            self.evict_idle(now);
        }

        granted
    }

    /// Time until a single token can be taken again.
    pub fn retry_after(&self, key: &str) -> Duration {
        self.retry_after_with_cost(key, 1)
    }

    /// Time until `cost` tokens could be taken, zero if they are available now
    /// or the key has no bucket yet.
    pub fn retry_after_with_cost(&self, key: &str, cost: u32) -> Duration {
        let now = Instant::now();

        self.buckets
            .get_mut(key)
            .map(|mut bucket| {
                bucket.refill(now);
                bucket.time_until_refill(cost, now)
            })
            .unwrap_or(Duration::ZERO)
    }

    pub fn available_tokens(&self, key: &str) -> Option<u32> {
        let now = Instant::now();

        self.buckets.get_mut(key).map(|mut bucket| {
            bucket.refill(now);
            bucket.tokens
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drops buckets that have refilled completely. A full bucket behaves like
    /// a freshly created one, so eviction never hands out extra tokens.
    fn evict_idle(&self, now: Instant) {
        let before = self.buckets.len();

        self.buckets.retain(|_key, bucket| {
            bucket.refill(now);
            !bucket.is_full()
        });

        debug!(
            policy = self.policy.name,
            evicted = before.saturating_sub(self.buckets.len()),
            "Idle rate limit buckets evicted"
        );
    }
}

/// The independent limiters used across the service. Each owns its own
/// registry, so keys never collide between policies.
#[derive(Clone)]
pub struct RateLimiters {
    pub api: RateLimiter,
    pub otp: RateLimiter,
    pub verification: RateLimiter,
}

impl RateLimiters {
    pub fn from_config(config: &Config) -> Self {
        let threshold = config.rate_limit_cleanup_threshold;

        Self {
            api: RateLimiter::with_cleanup_threshold(config.api_rate_limit_policy(), threshold),
            otp: RateLimiter::with_cleanup_threshold(config.otp_rate_limit_policy(), threshold),
            verification: RateLimiter::with_cleanup_threshold(
                config.verification_rate_limit_policy(),
                threshold,
            ),
        }
    }
}
