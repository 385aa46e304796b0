//! Latency-driven limit controller.
//!
//! While a scale-out is in flight the controller evaluates a composite
//! health score every tick and walks the global limit between the
//! activation floor and a moving target. Hysteresis on both sides keeps
//! single noisy samples from moving the limit.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::FeedbackConfig;
use crate::histogram::LatencyHistogram;
use crate::limiter::GlobalRateLimiter;
use crate::queue::WeightedQueues;
use crate::store::QueueFamily;
use crate::telemetry::now_ms;

use super::state::LoopStateManager;

/// Source of non-latency health inputs for the protected service.
pub trait MetricsSource: Send + Sync {
    /// Connection pool usage as a percentage in `[0, 100]`.
    fn pool_usage_percent(&self) -> f64;
}

/// Source used when no live metrics endpoint is wired in. Reporting
/// zero keeps the score in the unknown band until latency data exists.
pub struct NullMetricsSource;

impl MetricsSource for NullMetricsSource {
    fn pool_usage_percent(&self) -> f64 {
        0.0
    }
}

pub struct FeedbackController {
    limiter: Arc<GlobalRateLimiter>,
    queues: Arc<WeightedQueues>,
    histogram: Arc<LatencyHistogram>,
    metrics: Arc<dyn MetricsSource>,
    state: Arc<LoopStateManager>,
    config: FeedbackConfig,
    healthy_streak: u32,
    unhealthy_streak: u32,
}

impl FeedbackController {
    pub fn new(
        limiter: Arc<GlobalRateLimiter>,
        queues: Arc<WeightedQueues>,
        histogram: Arc<LatencyHistogram>,
        metrics: Arc<dyn MetricsSource>,
        state: Arc<LoopStateManager>,
        config: FeedbackConfig,
    ) -> Self {
        Self {
            limiter,
            queues,
            histogram,
            metrics,
            state,
            config,
            healthy_streak: 0,
            unhealthy_streak: 0,
        }
    }

    /// Drive the control loop until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.config.interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(now_ms()),
                _ = shutdown.changed() => {
                    info!("feedback controller stopping");
                    return;
                }
            }
        }
    }

    /// One control evaluation at `now_ms`. No-op while inactive.
    pub fn tick(&mut self, now_ms: u64) {
        if !self.state.is_active() {
            return;
        }

        let p95 = self.histogram.p95(now_ms);
        let p99 = self.histogram.p99(now_ms);
        let pool = self.metrics.pool_usage_percent();
        let queue_len = self.queue_len();

        debug!(
            p95,
            p99,
            pool,
            queue_len,
            current = self.limiter.current_limit(),
            floor = self.state.previous_limit(),
            target = self.state.target_limit(),
            "feedback tick"
        );

        match self.health_score(p95, p99, pool) {
            None => {
                debug!("no metrics yet, holding the limit");
                self.healthy_streak = 0;
                self.unhealthy_streak = 0;
            }
            Some(score) if score < 50.0 => self.on_unhealthy(score, now_ms),
            Some(score) if score >= 80.0 => self.on_healthy(queue_len, now_ms),
            Some(score) => {
                debug!(score, "middling health, holding the limit");
                self.healthy_streak = 0;
                self.unhealthy_streak = 0;
            }
        }
    }

    fn queue_len(&self) -> u64 {
        let mut total = 0;
        for family in [QueueFamily::Global, QueueFamily::Pg] {
            match self.queues.total_len(family) {
                Ok(len) => total += len,
                Err(e) => warn!(error = %e, ?family, "queue length read failed"),
            }
        }
        total
    }

    /// Weighted composite of the three inputs, `None` when every raw
    /// input is zero and the score would be meaningless.
    fn health_score(&self, p95: f64, p99: f64, pool: f64) -> Option<f64> {
        if p95 == 0.0 && p99 == 0.0 && pool == 0.0 {
            return None;
        }
        let latency = &self.config.latency;
        let weights = &self.config.score_weights;
        let p95_score = ramp_score(p95, latency.p95_good, latency.p95_bad);
        let p99_score = ramp_score(p99, latency.p99_good, latency.p99_bad);
        let pool_score = ramp_score(pool, self.config.pool.good, self.config.pool.bad);
        Some(p95_score * weights.p95 + p99_score * weights.p99 + pool_score * weights.pool)
    }

    fn on_unhealthy(&mut self, score: f64, _now_ms: u64) {
        self.unhealthy_streak += 1;
        self.healthy_streak = 0;
        warn!(score, streak = self.unhealthy_streak, "unhealthy tick");

        let params = &self.config.scale_out;
        if self.unhealthy_streak < params.consecutive_unhealthy_required {
            return;
        }

        let current = self.limiter.current_limit();
        let floor = self.state.previous_limit();
        let distance = current.saturating_sub(floor);
        if distance == 0 {
            debug!(floor, "already at the activation floor");
            self.unhealthy_streak = 0;
            return;
        }

        let decrease = ((f64::from(distance) * params.decrease_ratio).ceil() as u32).max(1);
        let new_limit = current.saturating_sub(decrease).max(floor);
        let actual = current - new_limit;
        if actual > 0 {
            self.limiter.decrease_limit(actual);
            self.unhealthy_streak = 0;
            warn!(from = current, to = new_limit, floor, "limit shed under load");
        }
        // Any pending ramp target is void after a shed
        self.state.set_target_limit(0);
    }

    fn on_healthy(&mut self, queue_len: u64, now_ms: u64) {
        self.healthy_streak += 1;
        self.unhealthy_streak = 0;

        // Only grow when something is actually waiting for the capacity
        let has_demand = queue_len > 0 || self.limiter.is_saturated(now_ms);
        if !has_demand {
            debug!("healthy but no demand, holding the limit");
            return;
        }

        let params = &self.config.scale_out;
        if self.healthy_streak < params.consecutive_healthy_required {
            return;
        }

        let current = self.limiter.current_limit();
        let mut target = self.state.target_limit();
        if target == 0 || current >= target {
            target = current
                .saturating_add(params.target_delta)
                .min(self.limiter.max_limit());
            self.state.set_target_limit(target);
            debug!(target, current, "new ramp target");
        }

        if current < target {
            let step = params.increase_step.min(target - current);
            self.limiter.increase_limit(step);
            self.healthy_streak = 0;
            debug!(from = current, to = current + step, target, "limit raised");
        }
    }
}

fn ramp_score(actual: f64, good: f64, bad: f64) -> f64 {
    if actual <= good {
        100.0
    } else if actual >= bad {
        0.0
    } else {
        100.0 * (1.0 - (actual - good) / (bad - good))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use crate::store::MemoryStore;

    struct FixedPool(f64);

    impl MetricsSource for FixedPool {
        fn pool_usage_percent(&self) -> f64 {
            self.0
        }
    }

    struct Rig {
        limiter: Arc<GlobalRateLimiter>,
        queues: Arc<WeightedQueues>,
        histogram: Arc<LatencyHistogram>,
        state: Arc<LoopStateManager>,
        controller: FeedbackController,
    }

    fn rig(pool_usage: f64) -> Rig {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let config = GateConfig::default();
        let limiter = Arc::new(GlobalRateLimiter::new(store.clone(), &config.limiter));
        let queues = Arc::new(WeightedQueues::new(store.clone(), config.weights.clone()));
        let histogram = Arc::new(LatencyHistogram::new(
            store.clone(),
            config.feedback.histogram.clone(),
        ));
        let state = Arc::new(LoopStateManager::new(store));
        let controller = FeedbackController::new(
            limiter.clone(),
            queues.clone(),
            histogram.clone(),
            Arc::new(FixedPool(pool_usage)),
            state.clone(),
            config.feedback.clone(),
        );
        Rig {
            limiter,
            queues,
            histogram,
            state,
            controller,
        }
    }

    fn queue_demand(r: &Rig) {
        r.queues
            .offer(QueueFamily::Global, &crate::item::QueueItem::new(1, None, None, 0))
            .unwrap();
    }

    fn record_latency(rig: &Rig, latency_ms: u64, samples: usize, now_ms: u64) {
        for _ in 0..samples {
            rig.histogram.record(latency_ms, now_ms);
        }
    }

    #[test]
    fn ramp_score_bands() {
        assert_eq!(ramp_score(500.0, 500.0, 1000.0), 100.0);
        assert_eq!(ramp_score(1000.0, 500.0, 1000.0), 0.0);
        assert_eq!(ramp_score(750.0, 500.0, 1000.0), 50.0);
    }

    #[test]
    fn inactive_loop_never_moves_the_limit() {
        let mut r = rig(50.0);
        record_latency(&r, 40, 100, 10_000);
        for t in 0..10u64 {
            r.controller.tick(10_000 + t * 2_000);
        }
        assert_eq!(r.limiter.current_limit(), 15);
    }

    #[test]
    fn all_zero_inputs_hold_the_limit() {
        let mut r = rig(0.0);
        r.state.activate_on_scale_out(15, 0);
        for t in 0..10u64 {
            r.controller.tick(t * 2_000);
        }
        assert_eq!(r.limiter.current_limit(), 15);
        assert_eq!(r.state.target_limit(), 0);
    }

    #[test]
    fn healthy_streak_with_demand_raises_toward_target() {
        let mut r = rig(50.0);
        r.state.activate_on_scale_out(15, 0);
        // Fast latencies, and a waiting request to signal demand
        record_latency(&r, 40, 100, 10_000);
        queue_demand(&r);

        // Two healthy ticks accumulate, the third adjusts
        r.controller.tick(10_000);
        r.controller.tick(10_050);
        assert_eq!(r.limiter.current_limit(), 15);
        r.controller.tick(10_100);
        assert_eq!(r.limiter.current_limit(), 17);
        // Target was set one delta above the pre-adjustment limit
        assert_eq!(r.state.target_limit(), 30);
    }

    #[test]
    fn healthy_without_demand_holds() {
        let mut r = rig(50.0);
        r.state.activate_on_scale_out(15, 0);
        record_latency(&r, 40, 100, 10_000);
        for t in 0..6u64 {
            r.controller.tick(10_000 + t * 10);
        }
        assert_eq!(r.limiter.current_limit(), 15);
        assert_eq!(r.state.target_limit(), 0);
    }

    #[test]
    fn unhealthy_streak_sheds_half_the_distance_to_floor() {
        let mut r = rig(99.0);
        r.state.activate_on_scale_out(15, 0);
        r.limiter.set_limit_with_floor(35);
        // Slow latencies push the score into the unhealthy band
        record_latency(&r, 5_000, 100, 10_000);

        r.controller.tick(10_000);
        assert_eq!(r.limiter.current_limit(), 35);
        r.controller.tick(10_050);
        // distance 20, ratio 0.5 -> shed 10
        assert_eq!(r.limiter.current_limit(), 25);
        assert_eq!(r.state.target_limit(), 0);

        // Next confirmed unhealthy pair sheds half the remainder
        r.controller.tick(10_100);
        r.controller.tick(10_150);
        assert_eq!(r.limiter.current_limit(), 20);
    }

    #[test]
    fn shed_never_goes_below_the_floor() {
        let mut r = rig(99.0);
        r.state.activate_on_scale_out(15, 0);
        r.limiter.set_limit_with_floor(16);
        record_latency(&r, 5_000, 100, 10_000);

        r.controller.tick(10_000);
        r.controller.tick(10_050);
        // distance 1 -> minimum shed of 1 lands exactly on the floor
        assert_eq!(r.limiter.current_limit(), 15);

        // At the floor, further unhealthy ticks hold
        r.controller.tick(10_100);
        r.controller.tick(10_150);
        assert_eq!(r.limiter.current_limit(), 15);
    }

    #[test]
    fn middling_tick_resets_the_healthy_streak() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let config = GateConfig::default();
        let limiter = Arc::new(GlobalRateLimiter::new(store.clone(), &config.limiter));
        let queues = Arc::new(WeightedQueues::new(store.clone(), config.weights.clone()));
        let histogram = Arc::new(LatencyHistogram::new(
            store.clone(),
            config.feedback.histogram.clone(),
        ));
        let state = Arc::new(LoopStateManager::new(store));
        let pool = Arc::new(parking_lot::Mutex::new(50.0));

        struct SharedPool(Arc<parking_lot::Mutex<f64>>);
        impl MetricsSource for SharedPool {
            fn pool_usage_percent(&self) -> f64 {
                *self.0.lock()
            }
        }

        let mut controller = FeedbackController::new(
            limiter.clone(),
            queues.clone(),
            histogram.clone(),
            Arc::new(SharedPool(pool.clone())),
            state.clone(),
            config.feedback.clone(),
        );

        state.activate_on_scale_out(15, 0);
        queues
            .offer(QueueFamily::Global, &crate::item::QueueItem::new(1, None, None, 0))
            .unwrap();
        for _ in 0..100 {
            histogram.record(40, 10_000);
        }

        controller.tick(10_000);
        controller.tick(10_050);
        // Pool pressure drags the score into the hold band:
        // 0.3*100 + 0.4*100 + 0.3*(100*(1 - 13/15)) = 74
        *pool.lock() = 93.0;
        controller.tick(10_100);
        *pool.lock() = 50.0;
        // The streak starts over, so two healthy ticks do not adjust
        controller.tick(10_150);
        controller.tick(10_200);
        assert_eq!(limiter.current_limit(), 15);
        // The third does
        controller.tick(10_250);
        assert_eq!(limiter.current_limit(), 17);
    }
}
