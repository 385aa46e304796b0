//! Feedback loop: scale-out activation, persisted state, and the
//! latency-driven limit controller.

mod controller;
mod state;

pub use controller::{FeedbackController, MetricsSource, NullMetricsSource};
pub use state::LoopStateManager;

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::histogram::LatencyHistogram;
use crate::limiter::GlobalRateLimiter;

/// Reply to a scale event. `accepted` is false when the event was a
/// no-op, with the reason in `message`.
#[derive(Debug, Clone, Serialize)]
pub struct ScaleEventResponse {
    pub accepted: bool,
    pub previous_limit: u32,
    pub current_limit: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackLoopStatus {
    pub active: bool,
    pub previous_limit: u32,
    pub current_limit: u32,
    pub target_limit: u32,
    pub active_since: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95_latency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99_latency: Option<f64>,
}

/// Operator-facing entry points for the feedback loop, driven by the
/// infrastructure's scale events.
pub struct ScaleEvents {
    state: Arc<LoopStateManager>,
    limiter: Arc<GlobalRateLimiter>,
    histogram: Arc<LatencyHistogram>,
}

impl ScaleEvents {
    pub fn new(
        state: Arc<LoopStateManager>,
        limiter: Arc<GlobalRateLimiter>,
        histogram: Arc<LatencyHistogram>,
    ) -> Self {
        Self {
            state,
            limiter,
            histogram,
        }
    }

    /// A new instance came up: arm the controller with the current
    /// limit as its floor.
    pub fn scale_out(&self, source: &str, now_ms: u64) -> ScaleEventResponse {
        debug!(source, "scale-out event received");
        if self.state.is_active() {
            let state = self.state.snapshot();
            return ScaleEventResponse {
                accepted: false,
                previous_limit: state.previous_limit,
                current_limit: self.limiter.current_limit(),
                message: format!(
                    "feedback loop already active since {}ms",
                    state.activated_at
                ),
            };
        }
        let state = self
            .state
            .activate_on_scale_out(self.limiter.current_limit(), now_ms);
        ScaleEventResponse {
            accepted: true,
            previous_limit: state.previous_limit,
            current_limit: self.limiter.current_limit(),
            message: format!("feedback loop activated, floor set at {}", state.previous_limit),
        }
    }

    pub fn status(&self, now_ms: u64) -> FeedbackLoopStatus {
        let state = self.state.snapshot();
        let current_limit = self.limiter.current_limit();
        if !state.active {
            return FeedbackLoopStatus {
                active: false,
                previous_limit: 0,
                current_limit,
                target_limit: 0,
                active_since: 0,
                p95_latency: None,
                p99_latency: None,
            };
        }
        FeedbackLoopStatus {
            active: true,
            previous_limit: state.previous_limit,
            current_limit,
            target_limit: state.target_limit,
            active_since: state.activated_at,
            p95_latency: Some(self.histogram.p95(now_ms)),
            p99_latency: Some(self.histogram.p99(now_ms)),
        }
    }

    /// Disarm the controller, keeping whatever limit it converged on.
    /// Recorded latency is dropped so a later activation starts fresh.
    pub fn deactivate(&self, now_ms: u64) -> ScaleEventResponse {
        let current_limit = self.limiter.current_limit();
        if !self.state.is_active() {
            return ScaleEventResponse {
                accepted: false,
                previous_limit: 0,
                current_limit,
                message: "feedback loop is not active".to_string(),
            };
        }
        self.state.deactivate();
        self.histogram.clear(now_ms);
        ScaleEventResponse {
            accepted: true,
            previous_limit: 0,
            current_limit,
            message: format!("feedback loop deactivated, final limit {current_limit}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use crate::store::MemoryStore;

    fn events() -> (Arc<GlobalRateLimiter>, ScaleEvents) {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let config = GateConfig::default();
        let limiter = Arc::new(GlobalRateLimiter::new(store.clone(), &config.limiter));
        let histogram = Arc::new(LatencyHistogram::new(
            store.clone(),
            config.feedback.histogram,
        ));
        let state = Arc::new(LoopStateManager::new(store));
        let events = ScaleEvents::new(state, limiter.clone(), histogram);
        (limiter, events)
    }

    #[test]
    fn scale_out_arms_once() {
        let (_, events) = events();
        let first = events.scale_out("autoscaler", 1_000);
        assert!(first.accepted);
        assert_eq!(first.previous_limit, 15);

        let second = events.scale_out("autoscaler", 2_000);
        assert!(!second.accepted);
        assert_eq!(second.previous_limit, 15);
    }

    #[test]
    fn status_reports_latency_only_while_active() {
        let (_, events) = events();
        let idle = events.status(0);
        assert!(!idle.active);
        assert!(idle.p95_latency.is_none());

        events.scale_out("autoscaler", 1_000);
        let active = events.status(2_000);
        assert!(active.active);
        assert_eq!(active.active_since, 1_000);
        assert_eq!(active.p95_latency, Some(0.0));
    }

    #[test]
    fn deactivate_keeps_the_converged_limit() {
        let (limiter, events) = events();
        assert!(!events.deactivate(0).accepted);

        events.scale_out("autoscaler", 1_000);
        limiter.increase_limit(10);
        let response = events.deactivate(2_000);
        assert!(response.accepted);
        assert_eq!(response.current_limit, 25);
        assert_eq!(limiter.current_limit(), 25);
        assert!(!events.status(2_000).active);
    }
}
