//! Admission gate for a traffic-spiked ordering service.
//!
//! The gate throttles incoming requests through a global leaky bucket,
//! parks overflow in weighted multi-class queues, drains those queues
//! against both the global and per-provider buckets, and ramps the
//! global limit up after a scale-out using a latency-driven feedback
//! loop.
//!
//! [`Gate`] wires the pieces together for embedders; each component is
//! public for callers that want to compose their own.

pub mod admission;
pub mod backend;
pub mod config;
pub mod error;
pub mod feedback;
pub mod histogram;
pub mod item;
pub mod limiter;
pub mod processor;
pub mod queue;
pub mod store;
pub mod telemetry;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use admission::AdmissionControl;
use backend::Backend;
use config::GateConfig;
use error::Result;
use feedback::{FeedbackController, LoopStateManager, MetricsSource, ScaleEvents};
use histogram::LatencyHistogram;
use limiter::{GlobalRateLimiter, ProviderRegistry};
use processor::QueueProcessor;
use queue::WeightedQueues;
use store::AtomicStore;

/// Fully wired gate. Construction restores persisted feedback state;
/// [`Gate::spawn`] starts the background loops.
pub struct Gate {
    pub admission: Arc<AdmissionControl>,
    pub scale_events: Arc<ScaleEvents>,
    processor: QueueProcessor,
    controller: FeedbackController,
}

/// What remains of a [`Gate`] once its loops are running.
pub struct GateHandles {
    pub admission: Arc<AdmissionControl>,
    pub scale_events: Arc<ScaleEvents>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Gate {
    pub fn new(
        config: GateConfig,
        store: Arc<dyn AtomicStore>,
        backend: Arc<dyn Backend>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Result<Self> {
        let global = Arc::new(GlobalRateLimiter::new(store.clone(), &config.limiter));
        let queues = Arc::new(WeightedQueues::new(store.clone(), config.weights.clone()));
        let providers = Arc::new(ProviderRegistry::from_config(
            store.clone(),
            &config.providers,
        ));
        let histogram = Arc::new(LatencyHistogram::new(
            store.clone(),
            config.feedback.histogram.clone(),
        ));
        let state = Arc::new(LoopStateManager::new(store));

        let admission = Arc::new(AdmissionControl::new(
            global.clone(),
            providers.clone(),
            queues.clone(),
            backend.clone(),
            config.admission.clone(),
            config.processor.default_provider.clone(),
        ));
        let scale_events = Arc::new(ScaleEvents::new(
            state.clone(),
            global.clone(),
            histogram.clone(),
        ));
        let processor = QueueProcessor::new(
            queues.clone(),
            global.clone(),
            &providers,
            backend,
            histogram.clone(),
            state.clone(),
            config.processor.clone(),
            config.retry.clone(),
        )?;
        let controller = FeedbackController::new(
            global,
            queues,
            histogram,
            metrics,
            state,
            config.feedback.clone(),
        );

        Ok(Self {
            admission,
            scale_events,
            processor,
            controller,
        })
    }

    /// Start the drain loop and the feedback controller. Both stop when
    /// `true` is sent on the shutdown channel.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> GateHandles {
        GateHandles {
            admission: self.admission,
            scale_events: self.scale_events,
            tasks: vec![
                tokio::spawn(self.processor.run(shutdown.clone())),
                tokio::spawn(self.controller.run(shutdown)),
            ],
        }
    }
}
