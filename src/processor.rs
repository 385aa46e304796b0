//! Queue drain loop.
//!
//! Every tick runs two lanes. The provider-gated lane reserves provider
//! tokens first, capped by its own backlog, then at most that many
//! global tokens, and drains the provider family with whatever both
//! granted. The global-only lane spends the rest of the tick's budget
//! on the global family. Tokens reserved beyond what the backlog could
//! fill are refunded in the same tick, so an idle system holds no
//! phantom reservations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::{ProcessorConfig, RetryConfig};
use crate::error::Result;
use crate::feedback::LoopStateManager;
use crate::histogram::LatencyHistogram;
use crate::item::QueueItem;
use crate::limiter::{GlobalRateLimiter, ProviderLimiter, ProviderRegistry};
use crate::queue::WeightedQueues;
use crate::store::{ConsumeOutcome, QueueClass, QueueFamily};
use crate::telemetry::now_ms;

#[derive(Debug, Default)]
pub struct ProcessorStats {
    dispatched: AtomicU64,
    retried: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessorStatsSnapshot {
    pub dispatched: u64,
    pub retried: u64,
    pub requeued: u64,
    pub dropped: u64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct QueueProcessor {
    queues: Arc<WeightedQueues>,
    global: Arc<GlobalRateLimiter>,
    provider: Arc<dyn ProviderLimiter>,
    backend: Arc<dyn Backend>,
    histogram: Arc<LatencyHistogram>,
    state: Arc<LoopStateManager>,
    config: ProcessorConfig,
    retry: RetryConfig,
    stats: ProcessorStats,
}

impl QueueProcessor {
    /// Fails when the configured default provider is not registered.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queues: Arc<WeightedQueues>,
        global: Arc<GlobalRateLimiter>,
        providers: &ProviderRegistry,
        backend: Arc<dyn Backend>,
        histogram: Arc<LatencyHistogram>,
        state: Arc<LoopStateManager>,
        config: ProcessorConfig,
        retry: RetryConfig,
    ) -> Result<Self> {
        let provider = providers.get(&config.default_provider)?;
        Ok(Self {
            queues,
            global,
            provider,
            backend,
            histogram,
            state,
            config,
            retry,
            stats: ProcessorStats::default(),
        })
    }

    pub fn stats(&self) -> ProcessorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Drive the drain loop until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.config.interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(now_ms()),
                _ = shutdown.changed() => {
                    info!("queue processor stopping");
                    return;
                }
            }
        }
    }

    pub fn tick(&self, now_ms: u64) {
        if self.config.atomic_poll {
            self.atomic_tick(now_ms);
        } else {
            self.sequential_tick(now_ms);
        }
    }

    /// Reserve-then-poll: tokens are taken up front in bulk and the poll
    /// runs as one store transaction, so concurrent admissions can never
    /// ride on slots this tick already claimed.
    fn atomic_tick(&self, now_ms: u64) {
        let desired = u64::from(self.global.current_limit());
        if desired == 0 {
            return;
        }

        // The provider lane only reserves what its backlog can fill;
        // over-reserving here would starve the global-only lane, which
        // sizes itself from whatever the provider lane left behind.
        let pg_backlog = match self.queues.total_len(QueueFamily::Pg) {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "provider backlog read failed, assuming full");
                desired
            }
        };
        let pg_reserved = self.provider.try_consume_n(desired.min(pg_backlog), now_ms);
        if pg_reserved > 0 {
            let global_reserved = self.global.try_consume_n(pg_reserved, now_ms);
            let allowed = pg_reserved.min(global_reserved);

            if pg_reserved > global_reserved {
                self.provider.refund_n(pg_reserved - global_reserved, now_ms);
            }

            if allowed == 0 {
                self.provider.refund_n(global_reserved, now_ms);
            } else {
                self.drain(QueueFamily::Pg, allowed, true, now_ms);
            }
        }

        let remain = desired.saturating_sub(pg_reserved);
        if remain > 0 {
            let global_allowed = self.global.try_consume_n(remain, now_ms);
            if global_allowed > 0 {
                self.drain(QueueFamily::Global, global_allowed, false, now_ms);
            }
        }
    }

    /// Poll one family with `allowed` pre-paid slots, refunding what the
    /// backlog could not fill.
    fn drain(&self, family: QueueFamily, allowed: u64, pg_lane: bool, now_ms: u64) {
        let batch = match self.queues.poll_weighted(family, allowed as usize, now_ms) {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, ?family, "weighted poll failed, refunding the batch");
                self.refund(allowed, pg_lane, now_ms);
                return;
            }
        };

        let refund = allowed.saturating_sub(batch.stats.total() as u64);
        if refund > 0 {
            self.refund(refund, pg_lane, now_ms);
        }

        if batch.items.is_empty() {
            return;
        }
        debug!(
            ?family,
            total = batch.stats.total(),
            order_retry = batch.stats.order_retry,
            order_normal = batch.stats.order_normal,
            other_retry = batch.stats.other_retry,
            other_normal = batch.stats.other_normal,
            "draining polled batch"
        );
        for item in batch.items {
            self.dispatch(item, family, now_ms);
        }
    }

    fn refund(&self, n: u64, pg_lane: bool, now_ms: u64) {
        if pg_lane {
            self.provider.refund_n(n, now_ms);
        }
        self.global.refund_n(n, now_ms);
    }

    /// Poll-then-consume: sizes are read first, tokens are taken one
    /// item at a time, and an item that finds the buckets drained goes
    /// back to the lane it came from.
    fn sequential_tick(&self, now_ms: u64) {
        for family in [QueueFamily::Pg, QueueFamily::Global] {
            let global_tokens = self.global.available_tokens(now_ms);
            if global_tokens == 0 {
                return;
            }
            // Only the provider family is bounded by the provider bucket
            let slots = match family {
                QueueFamily::Pg => global_tokens.min(self.provider.available_tokens(now_ms)),
                QueueFamily::Global => global_tokens,
            } as usize;
            if slots == 0 {
                continue;
            }
            self.sequential_family(family, slots, now_ms);
        }
    }

    fn sequential_family(&self, family: QueueFamily, slots: usize, now_ms: u64) {
        let (order_backlog, order_retry) = match self.class_backlog(family, QueueClass::Order, now_ms)
        {
            Some(sizes) => sizes,
            None => return,
        };
        let (other_backlog, other_retry) = match self.class_backlog(family, QueueClass::Other, now_ms)
        {
            Some(sizes) => sizes,
            None => return,
        };

        let (order_slots, other_slots) = crate::queue::split::split_classes(
            slots,
            order_backlog + order_retry,
            other_backlog + other_retry,
            self.queues_weights().0,
            self.queues_weights().1,
        );

        for (class, class_slots, retry_backlog) in [
            (QueueClass::Order, order_slots, order_retry),
            (QueueClass::Other, other_slots, other_retry),
        ] {
            let retry_slots = class_slots.min(retry_backlog);
            let normal_slots = class_slots - retry_slots;
            self.sequential_class(family, class, retry_slots, normal_slots, now_ms);
        }
    }

    fn class_backlog(
        &self,
        family: QueueFamily,
        class: QueueClass,
        now_ms: u64,
    ) -> Option<(usize, usize)> {
        let normal = match self.queues.normal_len(family, class) {
            Ok(len) => len as usize,
            Err(e) => {
                warn!(error = %e, ?family, ?class, "backlog read failed, skipping tick");
                return None;
            }
        };
        let retry = match self.queues.retry_eligible_count(family, class, now_ms) {
            Ok(len) => len as usize,
            Err(e) => {
                warn!(error = %e, ?family, ?class, "retry backlog read failed, skipping tick");
                return None;
            }
        };
        Some((normal, retry))
    }

    fn sequential_class(
        &self,
        family: QueueFamily,
        class: QueueClass,
        retry_slots: usize,
        normal_slots: usize,
        now_ms: u64,
    ) {
        if retry_slots > 0 {
            match self
                .queues
                .poll_retry_eligible(family, class, retry_slots, now_ms)
            {
                Ok(items) => {
                    for item in items {
                        self.process_checked(item, family, now_ms);
                    }
                }
                Err(e) => warn!(error = %e, ?family, ?class, "retry poll failed"),
            }
        }
        if normal_slots > 0 {
            match self.queues.poll_normal(family, class, normal_slots) {
                Ok(items) => {
                    for item in items {
                        self.process_checked(item, family, now_ms);
                    }
                }
                Err(e) => warn!(error = %e, ?family, ?class, "normal poll failed"),
            }
        }
    }

    /// Take the tokens for one already-polled item: a global token
    /// always, a provider token only for the provider family. When a
    /// bucket is dry the item goes back to the lane it came from.
    fn process_checked(&self, item: QueueItem, family: QueueFamily, now_ms: u64) {
        if self.global.try_consume_for_queue(now_ms) != ConsumeOutcome::Allowed {
            debug!(user_id = item.user_id, "global tokens exhausted, requeueing");
            self.requeue(item, family, now_ms);
            return;
        }
        if family == QueueFamily::Pg && !self.provider.try_consume(now_ms) {
            debug!(user_id = item.user_id, "provider tokens exhausted, requeueing");
            self.global.refund_n(1, now_ms);
            self.requeue(item, family, now_ms);
            return;
        }
        self.dispatch(item, family, now_ms);
    }

    fn requeue(&self, item: QueueItem, family: QueueFamily, now_ms: u64) {
        let was_retry = item.retry_count > 0;
        let result = if was_retry {
            self.queues.offer_retry(family, &item, now_ms)
        } else {
            self.queues.offer(family, &item)
        };
        match result {
            Ok(_) => {
                self.stats.requeued.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(error = %e, user_id = item.user_id, "requeue failed, dropping");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn dispatch(&self, item: QueueItem, family: QueueFamily, now_ms: u64) {
        let is_retry = item.retry_count > 0;
        debug!(
            user_id = item.user_id,
            is_retry,
            wait_ms = item.wait_time_ms(now_ms),
            "dispatching queued request"
        );

        let started = Instant::now();
        match self.backend.execute(&item) {
            Ok(response) => {
                if self.state.is_active() {
                    self.histogram
                        .record(started.elapsed().as_millis() as u64, now_ms);
                }
                debug!(
                    user_id = item.user_id,
                    status = response.status,
                    is_retry,
                    "queued request completed"
                );
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.on_dispatch_failure(item, family, e, now_ms),
        }
    }

    fn on_dispatch_failure(
        &self,
        mut item: QueueItem,
        family: QueueFamily,
        error: crate::backend::BackendError,
        now_ms: u64,
    ) {
        let is_retry = item.retry_count > 0;
        error!(
            user_id = item.user_id,
            is_retry,
            error = %error,
            "queued request failed"
        );

        if is_retry {
            error!(user_id = item.user_id, "retry failed, dropping request");
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if error.is_retryable() && item.can_retry(self.retry.max_retry_count) {
            item.increment_retry_count();
            warn!(user_id = item.user_id, "retryable failure, moving to retry lane");
            if let Err(e) = self.queues.offer_retry(family, &item, now_ms) {
                error!(error = %e, user_id = item.user_id, "retry enqueue failed, dropping");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            self.stats.retried.fetch_add(1, Ordering::Relaxed);
            return;
        }

        error!(user_id = item.user_id, "terminal failure, dropping request");
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn queues_weights(&self) -> (u32, u32) {
        self.queues.class_weights()
    }
}
