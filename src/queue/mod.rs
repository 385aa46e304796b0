//! Weighted multi-queue layer.
//!
//! Each queue family holds two request classes (order traffic and
//! everything else), each with a normal lane and a retry lane. Offers
//! score normal-lane members by original arrival time and retry-lane
//! members by the time they were requeued, so a retry only becomes
//! eligible again after the configured delay.

pub(crate) mod split;

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::config::WeightConfig;
use crate::error::Result;
use crate::item::QueueItem;
use crate::store::{AtomicStore, PollSpec, PollStats, QueueClass, QueueFamily, QueueKey};

/// Items removed by one weighted poll. `stats` counts lane removals,
/// including payloads that failed to decode, so callers can refund
/// exactly what was not dispatched.
#[derive(Debug, Default)]
pub struct WeightedBatch {
    pub items: Vec<QueueItem>,
    pub stats: PollStats,
}

/// Per-lane backlog sizes for one family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneSizes {
    pub order_normal: u64,
    pub order_retry: u64,
    pub other_normal: u64,
    pub other_retry: u64,
}

impl LaneSizes {
    pub fn total(&self) -> u64 {
        self.order_normal + self.order_retry + self.other_normal + self.other_retry
    }
}

pub struct WeightedQueues {
    store: Arc<dyn AtomicStore>,
    weights: WeightConfig,
}

impl WeightedQueues {
    pub fn new(store: Arc<dyn AtomicStore>, weights: WeightConfig) -> Self {
        Self { store, weights }
    }

    /// Order traffic gets the priority class; everything else shares the
    /// remainder.
    pub fn resolve_class(item: &QueueItem) -> QueueClass {
        match &item.http_request {
            Some(req) if req.method.eq_ignore_ascii_case("POST") && req.uri.contains("/orders") => {
                QueueClass::Order
            }
            _ => QueueClass::Other,
        }
    }

    /// Enqueue into the normal lane, scored by original arrival time so
    /// a request that bounced between buckets keeps its place in line.
    pub fn offer(&self, family: QueueFamily, item: &QueueItem) -> Result<bool> {
        let class = Self::resolve_class(item);
        let payload = serde_json::to_string(item)
            .map_err(|e| crate::error::GateError::ItemSerialization(e.to_string()))?;
        let added = self
            .store
            .lane_offer(QueueKey::normal(family, class), payload, item.enqueued_at)?;
        Ok(added)
    }

    /// Enqueue into the retry lane, scored by requeue time. The member
    /// stays invisible to polls until `retry_delay_ms` has elapsed.
    pub fn offer_retry(&self, family: QueueFamily, item: &QueueItem, now_ms: u64) -> Result<bool> {
        let class = Self::resolve_class(item);
        let payload = serde_json::to_string(item)
            .map_err(|e| crate::error::GateError::ItemSerialization(e.to_string()))?;
        let added = self
            .store
            .lane_offer(QueueKey::retry(family, class), payload, now_ms)?;
        Ok(added)
    }

    /// One weighted poll across all four lanes of a family.
    ///
    /// Slots split across classes by weight (order class rounded up),
    /// then within each class between eligible retries and normal
    /// members by the retry ratio. Unfillable slots spill over so the
    /// poll drains as many members as the backlog allows. Payloads that
    /// fail to decode are dropped with a warning; their slot still
    /// counts as removed.
    pub fn poll_weighted(
        &self,
        family: QueueFamily,
        total_slots: usize,
        now_ms: u64,
    ) -> Result<WeightedBatch> {
        if total_slots == 0 {
            return Ok(WeightedBatch::default());
        }
        let spec = PollSpec {
            total_slots,
            order_weight: self.weights.order,
            other_weight: self.weights.other,
            retry_ratio: self.weights.retry_ratio(),
            retry_threshold_ms: now_ms.saturating_sub(self.weights.retry_delay_ms),
        };
        let batch = self.store.poll_weighted(family, now_ms, &spec)?;
        let mut items = Vec::with_capacity(batch.entries.len());
        for entry in batch.entries {
            match serde_json::from_str::<QueueItem>(&entry.payload) {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!(lane = %entry.key, error = %e, "dropping undecodable queue member");
                }
            }
        }
        Ok(WeightedBatch {
            items,
            stats: batch.stats,
        })
    }

    fn decode_all(&self, lane: QueueKey, payloads: Vec<String>) -> Vec<QueueItem> {
        let mut items = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str::<QueueItem>(&payload) {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!(lane = %lane, error = %e, "dropping undecodable queue member");
                }
            }
        }
        items
    }

    /// Drain up to `max` members from one normal lane, oldest first.
    pub fn poll_normal(
        &self,
        family: QueueFamily,
        class: QueueClass,
        max: usize,
    ) -> Result<Vec<QueueItem>> {
        let lane = QueueKey::normal(family, class);
        let payloads = self.store.lane_poll_front(lane, max)?;
        Ok(self.decode_all(lane, payloads))
    }

    /// Drain up to `max` retry members whose delay has elapsed.
    pub fn poll_retry_eligible(
        &self,
        family: QueueFamily,
        class: QueueClass,
        max: usize,
        now_ms: u64,
    ) -> Result<Vec<QueueItem>> {
        let lane = QueueKey::retry(family, class);
        let threshold = now_ms.saturating_sub(self.weights.retry_delay_ms);
        let payloads = self.store.lane_poll_up_to(lane, threshold, max)?;
        Ok(self.decode_all(lane, payloads))
    }

    /// Retry-lane members whose delay has elapsed, without removing them.
    pub fn retry_eligible_count(
        &self,
        family: QueueFamily,
        class: QueueClass,
        now_ms: u64,
    ) -> Result<u64> {
        let threshold = now_ms.saturating_sub(self.weights.retry_delay_ms);
        Ok(self
            .store
            .lane_count_up_to(QueueKey::retry(family, class), threshold)?)
    }

    pub fn normal_len(&self, family: QueueFamily, class: QueueClass) -> Result<u64> {
        Ok(self.store.lane_len(QueueKey::normal(family, class))?)
    }

    /// 0-based rank of a waiting request in its class's normal lane,
    /// oldest first. `None` when the request is not in that lane.
    pub fn find_sequence(
        &self,
        family: QueueFamily,
        class: QueueClass,
        request_id: Uuid,
    ) -> Result<Option<u64>> {
        let lane = QueueKey::normal(family, class);
        for (rank, payload) in self.store.lane_scan(lane)?.into_iter().enumerate() {
            match serde_json::from_str::<QueueItem>(&payload) {
                Ok(item) if item.request_id == request_id => return Ok(Some(rank as u64)),
                Ok(_) => {}
                Err(e) => {
                    warn!(lane = %lane, error = %e, "skipping undecodable queue member");
                }
            }
        }
        Ok(None)
    }

    /// 1-based position of a waiting request across the family's lanes,
    /// in poll priority order. `None` when the request is no longer
    /// queued.
    pub fn queue_position(&self, family: QueueFamily, request_id: Uuid) -> Result<Option<u64>> {
        let mut position = 0u64;
        for lane in QueueKey::family_lanes(family) {
            for payload in self.store.lane_scan(lane)? {
                position += 1;
                match serde_json::from_str::<QueueItem>(&payload) {
                    Ok(item) if item.request_id == request_id => return Ok(Some(position)),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(lane = %lane, error = %e, "skipping undecodable queue member");
                    }
                }
            }
        }
        Ok(None)
    }

    pub fn lane_sizes(&self, family: QueueFamily) -> Result<LaneSizes> {
        Ok(LaneSizes {
            order_normal: self
                .store
                .lane_len(QueueKey::normal(family, QueueClass::Order))?,
            order_retry: self
                .store
                .lane_len(QueueKey::retry(family, QueueClass::Order))?,
            other_normal: self
                .store
                .lane_len(QueueKey::normal(family, QueueClass::Other))?,
            other_retry: self
                .store
                .lane_len(QueueKey::retry(family, QueueClass::Other))?,
        })
    }

    pub fn total_len(&self, family: QueueFamily) -> Result<u64> {
        Ok(self.lane_sizes(family)?.total())
    }

    pub fn class_weights(&self) -> (u32, u32) {
        (self.weights.order, self.weights.other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{HttpRequestData, QueueItem};
    use crate::store::MemoryStore;

    fn queues() -> WeightedQueues {
        WeightedQueues::new(Arc::new(MemoryStore::new()), WeightConfig::default())
    }

    fn order_item(user_id: u64, enqueued_at: u64) -> QueueItem {
        QueueItem::new(
            user_id,
            None,
            Some(HttpRequestData {
                method: "POST".to_string(),
                uri: "/api/v1/orders".to_string(),
                headers: Default::default(),
                body: None,
            }),
            enqueued_at,
        )
    }

    fn other_item(user_id: u64, enqueued_at: u64) -> QueueItem {
        QueueItem::new(
            user_id,
            None,
            Some(HttpRequestData {
                method: "GET".to_string(),
                uri: "/api/v1/products".to_string(),
                headers: Default::default(),
                body: None,
            }),
            enqueued_at,
        )
    }

    #[test]
    fn class_resolution() {
        assert_eq!(
            WeightedQueues::resolve_class(&order_item(1, 0)),
            QueueClass::Order
        );
        assert_eq!(
            WeightedQueues::resolve_class(&other_item(1, 0)),
            QueueClass::Other
        );
        // GET on the orders path is not order traffic
        let mut get_orders = order_item(1, 0);
        if let Some(req) = &mut get_orders.http_request {
            req.method = "GET".to_string();
        }
        assert_eq!(
            WeightedQueues::resolve_class(&get_orders),
            QueueClass::Other
        );
        // No captured request at all
        let bare = QueueItem::new(1, None, None, 0);
        assert_eq!(WeightedQueues::resolve_class(&bare), QueueClass::Other);
    }

    #[test]
    fn offer_then_weighted_poll_splits_by_class_weight() {
        let q = queues();
        for i in 0..10u64 {
            q.offer(QueueFamily::Global, &order_item(i, i)).unwrap();
            q.offer(QueueFamily::Global, &other_item(100 + i, i)).unwrap();
        }
        let batch = q.poll_weighted(QueueFamily::Global, 10, 50_000).unwrap();
        assert_eq!(batch.stats.order_normal, 7);
        assert_eq!(batch.stats.other_normal, 3);
        assert_eq!(batch.items.len(), 10);
        // Oldest order item first
        assert_eq!(batch.items[0].user_id, 0);
    }

    #[test]
    fn retries_become_eligible_after_delay() {
        let q = queues();
        let item = order_item(1, 1_000);
        q.offer_retry(QueueFamily::Global, &item, 10_000).unwrap();

        // 4000ms has not yet passed since the requeue
        let batch = q.poll_weighted(QueueFamily::Global, 5, 13_000).unwrap();
        assert!(batch.items.is_empty());

        let batch = q.poll_weighted(QueueFamily::Global, 5, 14_000).unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.stats.order_retry, 1);
    }

    #[test]
    fn queue_position_ranks_across_lanes_in_poll_order() {
        let q = queues();
        let retry = order_item(1, 1_000);
        let first = order_item(2, 2_000);
        let second = order_item(3, 3_000);
        let other = other_item(4, 500);
        q.offer_retry(QueueFamily::Global, &retry, 5_000).unwrap();
        q.offer(QueueFamily::Global, &first).unwrap();
        q.offer(QueueFamily::Global, &second).unwrap();
        q.offer(QueueFamily::Global, &other).unwrap();

        // Retry lane outranks normal, order class outranks other
        assert_eq!(
            q.queue_position(QueueFamily::Global, retry.request_id).unwrap(),
            Some(1)
        );
        assert_eq!(
            q.queue_position(QueueFamily::Global, first.request_id).unwrap(),
            Some(2)
        );
        assert_eq!(
            q.queue_position(QueueFamily::Global, second.request_id).unwrap(),
            Some(3)
        );
        assert_eq!(
            q.queue_position(QueueFamily::Global, other.request_id).unwrap(),
            Some(4)
        );
        assert_eq!(
            q.queue_position(QueueFamily::Global, Uuid::new_v4()).unwrap(),
            None
        );
    }

    #[test]
    fn find_sequence_is_a_zero_based_rank_in_the_normal_lane() {
        let q = queues();
        let first = order_item(1, 1_000);
        let second = order_item(2, 2_000);
        let retried = order_item(3, 500);
        q.offer(QueueFamily::Global, &first).unwrap();
        q.offer(QueueFamily::Global, &second).unwrap();
        q.offer_retry(QueueFamily::Global, &retried, 5_000).unwrap();

        assert_eq!(
            q.find_sequence(QueueFamily::Global, QueueClass::Order, first.request_id)
                .unwrap(),
            Some(0)
        );
        assert_eq!(
            q.find_sequence(QueueFamily::Global, QueueClass::Order, second.request_id)
                .unwrap(),
            Some(1)
        );
        // Retry-lane members and other classes are out of scope
        assert_eq!(
            q.find_sequence(QueueFamily::Global, QueueClass::Order, retried.request_id)
                .unwrap(),
            None
        );
        assert_eq!(
            q.find_sequence(QueueFamily::Global, QueueClass::Other, first.request_id)
                .unwrap(),
            None
        );
    }

    #[test]
    fn undecodable_member_still_counts_as_removed() {
        let store = Arc::new(MemoryStore::new());
        let q = WeightedQueues::new(store.clone(), WeightConfig::default());
        store
            .lane_offer(
                QueueKey::normal(QueueFamily::Global, QueueClass::Order),
                "not json".to_string(),
                1,
            )
            .unwrap();
        q.offer(QueueFamily::Global, &order_item(1, 2)).unwrap();

        let batch = q.poll_weighted(QueueFamily::Global, 5, 10_000).unwrap();
        assert_eq!(batch.stats.total(), 2);
        assert_eq!(batch.items.len(), 1);
    }

    #[test]
    fn class_level_polls_respect_the_retry_delay() {
        let q = queues();
        q.offer(QueueFamily::Global, &order_item(1, 100)).unwrap();
        q.offer_retry(QueueFamily::Global, &order_item(2, 50), 1_000)
            .unwrap();

        assert_eq!(q.normal_len(QueueFamily::Global, QueueClass::Order).unwrap(), 1);
        assert_eq!(
            q.retry_eligible_count(QueueFamily::Global, QueueClass::Order, 2_000)
                .unwrap(),
            0
        );
        assert_eq!(
            q.retry_eligible_count(QueueFamily::Global, QueueClass::Order, 5_000)
                .unwrap(),
            1
        );

        let retried = q
            .poll_retry_eligible(QueueFamily::Global, QueueClass::Order, 5, 5_000)
            .unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].user_id, 2);

        let normal = q.poll_normal(QueueFamily::Global, QueueClass::Order, 5).unwrap();
        assert_eq!(normal.len(), 1);
        assert_eq!(normal[0].user_id, 1);
    }

    #[test]
    fn lane_sizes_reflect_offers() {
        let q = queues();
        q.offer(QueueFamily::Pg, &order_item(1, 1)).unwrap();
        q.offer(QueueFamily::Pg, &other_item(2, 2)).unwrap();
        q.offer_retry(QueueFamily::Pg, &other_item(3, 3), 100).unwrap();

        let sizes = q.lane_sizes(QueueFamily::Pg).unwrap();
        assert_eq!(sizes.order_normal, 1);
        assert_eq!(sizes.other_normal, 1);
        assert_eq!(sizes.other_retry, 1);
        assert_eq!(sizes.total(), 3);
        // The other family is untouched
        assert_eq!(q.total_len(QueueFamily::Global).unwrap(), 0);
    }
}
