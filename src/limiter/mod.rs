//! Leaky-bucket admission limiters.
//!
//! The global limiter is the system-wide throttle the feedback loop
//! steers; provider limiters cap traffic toward individual payment
//! gateways. Rate and capacity move together, so "the limit" is a
//! single number.
//!
//! Store failures never propagate out of this module. A failed consume
//! reads as a denial and a failed level read as an empty bucket, so the
//! gate stays up when the store is down while token state stays
//! conservative.

mod provider;

pub use provider::{LeakyProviderLimiter, ProviderLimiter, ProviderRegistry};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::LimiterConfig;
use crate::store::keys::GLOBAL_BUCKET;
use crate::store::{AtomicStore, ConsumeOutcome, QueueFamily, QueueKey};

pub struct GlobalRateLimiter {
    store: Arc<dyn AtomicStore>,
    limit: AtomicU32,
    initial_limit: u32,
    min_limit: u32,
    max_limit: u32,
}

impl GlobalRateLimiter {
    pub fn new(store: Arc<dyn AtomicStore>, config: &LimiterConfig) -> Self {
        Self {
            store,
            limit: AtomicU32::new(config.rate),
            initial_limit: config.rate,
            min_limit: config.min_limit,
            max_limit: config.max_limit,
        }
    }

    pub fn current_limit(&self) -> u32 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn min_limit(&self) -> u32 {
        self.min_limit
    }

    pub fn max_limit(&self) -> u32 {
        self.max_limit
    }

    fn rate(&self) -> f64 {
        f64::from(self.current_limit())
    }

    fn capacity(&self) -> f64 {
        f64::from(self.current_limit())
    }

    /// Admit one new request. A non-empty waiting room forces the
    /// request to queue even when tokens remain, so queued requests
    /// cannot be overtaken by fresh arrivals.
    pub fn try_consume(&self, now_ms: u64) -> ConsumeOutcome {
        let backlog = QueueKey::family_lanes(QueueFamily::Global);
        match self.store.bucket_consume_one(
            GLOBAL_BUCKET,
            now_ms,
            self.rate(),
            self.capacity(),
            Some(&backlog),
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "global consume failed, denying");
                ConsumeOutcome::DeniedCapacity
            }
        }
    }

    /// Take one token for an already-queued request. Skips the waiting
    /// room check, which only applies to fresh arrivals.
    pub fn try_consume_for_queue(&self, now_ms: u64) -> ConsumeOutcome {
        match self.store.bucket_consume_one(
            GLOBAL_BUCKET,
            now_ms,
            self.rate(),
            self.capacity(),
            None,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "global consume failed, denying");
                ConsumeOutcome::DeniedCapacity
            }
        }
    }

    /// Reserve up to `n` tokens, returning the granted count.
    pub fn try_consume_n(&self, n: u64, now_ms: u64) -> u64 {
        match self
            .store
            .bucket_consume_n(GLOBAL_BUCKET, now_ms, self.rate(), self.capacity(), n)
        {
            Ok(granted) => granted,
            Err(e) => {
                error!(error = %e, requested = n, "global reserve failed, granting none");
                0
            }
        }
    }

    pub fn refund_n(&self, n: u64, now_ms: u64) {
        if n == 0 {
            return;
        }
        if let Err(e) = self.store.bucket_refund(GLOBAL_BUCKET, now_ms, self.rate(), n) {
            warn!(error = %e, refund = n, "global refund failed");
        }
    }

    fn level(&self, now_ms: u64) -> f64 {
        match self.store.bucket_level(GLOBAL_BUCKET, now_ms, self.rate()) {
            Ok(level) => level,
            Err(e) => {
                warn!(error = %e, "global level read failed, assuming empty");
                0.0
            }
        }
    }

    /// Current water level after decay, for introspection.
    pub fn current_level(&self, now_ms: u64) -> f64 {
        self.level(now_ms)
    }

    pub fn available_tokens(&self, now_ms: u64) -> u64 {
        let capacity = self.capacity();
        let level = self.level(now_ms).round().min(capacity);
        (capacity - level) as u64
    }

    /// True once the bucket sits at 90% of capacity or above.
    pub fn is_saturated(&self, now_ms: u64) -> bool {
        self.level(now_ms) >= self.capacity() * 0.9
    }

    /// Raise the limit by `step`, clamped to the maximum. Returns the
    /// applied limit.
    pub fn increase_limit(&self, step: u32) -> u32 {
        let current = self.current_limit();
        let applied = current.saturating_add(step).min(self.max_limit);
        if applied != current {
            self.limit.store(applied, Ordering::Relaxed);
            info!(from = current, to = applied, "global limit raised");
        }
        applied
    }

    /// Lower the limit by `amount`, clamped to the minimum. Returns the
    /// applied limit.
    pub fn decrease_limit(&self, amount: u32) -> u32 {
        let current = self.current_limit();
        let applied = current.saturating_sub(amount).max(self.min_limit);
        if applied != current {
            self.limit.store(applied, Ordering::Relaxed);
            info!(from = current, to = applied, "global limit lowered");
        }
        applied
    }

    /// Set the limit directly, never below the minimum. Returns the
    /// applied limit.
    pub fn set_limit_with_floor(&self, target: u32) -> u32 {
        let applied = target.clamp(self.min_limit, self.max_limit);
        let previous = self.limit.swap(applied, Ordering::Relaxed);
        if applied != previous {
            info!(from = previous, to = applied, "global limit set");
        }
        applied
    }

    /// Drop all bucket state and restore the configured initial limit.
    pub fn reset(&self) {
        if let Err(e) = self.store.bucket_delete(GLOBAL_BUCKET) {
            warn!(error = %e, "global bucket delete failed");
        }
        self.limit.store(self.initial_limit, Ordering::Relaxed);
        info!(limit = self.initial_limit, "global limiter reset");
    }
}
