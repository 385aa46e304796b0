//! Bundled store engine: the full store state behind one mutex, so every
//! trait method is naturally one indivisible transaction. Suitable for
//! single-process deployments and tests; a networked store with atomic
//! script execution slots in behind the same trait.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::error::StoreResult;
use crate::queue::split::{split_classes, split_lanes};

use super::keys::{QueueClass, QueueFamily, QueueKey};
use super::{AtomicStore, ConsumeOutcome, PersistedLoopState, PollBatch, PollSpec, PolledEntry, PollStats};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    level: f64,
    last_leak_ms: u64,
}

#[derive(Debug, Default)]
struct HistogramSlice {
    counts: HashMap<u64, u64>,
    expires_at_ms: u64,
}

/// Lane members keyed by `(score, insertion_seq)`, so equal scores keep
/// insertion order.
type LaneSet = BTreeMap<(u64, u64), String>;

#[derive(Default)]
struct State {
    buckets: HashMap<String, Bucket>,
    lanes: HashMap<QueueKey, LaneSet>,
    seq: u64,
    loop_state: Option<PersistedLoopState>,
    histogram: BTreeMap<u64, HistogramSlice>,
}

/// In-memory [`AtomicStore`] engine.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl State {
    /// Decay a bucket's level to `now_ms` and return a mutable handle.
    fn leaked_bucket(&mut self, bucket: &str, now_ms: u64, leak_rate: f64) -> &mut Bucket {
        let b = self.buckets.entry(bucket.to_string()).or_insert(Bucket {
            level: 0.0,
            last_leak_ms: now_ms,
        });
        if now_ms > b.last_leak_ms {
            let elapsed_s = (now_ms - b.last_leak_ms) as f64 / 1000.0;
            b.level = (b.level - elapsed_s * leak_rate).max(0.0);
        }
        b.last_leak_ms = b.last_leak_ms.max(now_ms);
        b
    }

    fn lane(&mut self, key: QueueKey) -> &mut LaneSet {
        self.lanes.entry(key).or_default()
    }

    fn lane_len(&self, key: QueueKey) -> usize {
        self.lanes.get(&key).map_or(0, |l| l.len())
    }

    fn lane_count_up_to(&self, key: QueueKey, max_score: u64) -> usize {
        self.lanes
            .get(&key)
            .map_or(0, |l| l.range(..=(max_score, u64::MAX)).count())
    }

    /// Remove up to `max` members with score at or below `max_score`.
    fn drain_lane(&mut self, key: QueueKey, max_score: u64, max: usize) -> Vec<(u64, String)> {
        let lane = self.lane(key);
        let selected: Vec<(u64, u64)> = lane
            .range(..=(max_score, u64::MAX))
            .take(max)
            .map(|(k, _)| *k)
            .collect();
        selected
            .into_iter()
            .filter_map(|k| lane.remove(&k).map(|payload| (k.0, payload)))
            .collect()
    }

    fn drain_class(
        &mut self,
        family: QueueFamily,
        class: QueueClass,
        retry_slots: usize,
        normal_slots: usize,
        retry_threshold_ms: u64,
        batch: &mut PollBatch,
    ) {
        let retry_key = QueueKey::retry(family, class);
        for (score, payload) in self.drain_lane(retry_key, retry_threshold_ms, retry_slots) {
            batch.entries.push(PolledEntry {
                key: retry_key,
                payload,
                score,
            });
        }
        let normal_key = QueueKey::normal(family, class);
        for (score, payload) in self.drain_lane(normal_key, u64::MAX, normal_slots) {
            batch.entries.push(PolledEntry {
                key: normal_key,
                payload,
                score,
            });
        }
    }

    fn prune_expired_slices(&mut self, now_ms: u64) {
        self.histogram.retain(|_, s| s.expires_at_ms > now_ms);
    }
}

impl AtomicStore for MemoryStore {
    fn bucket_consume_one(
        &self,
        bucket: &str,
        now_ms: u64,
        leak_rate: f64,
        capacity: f64,
        backlog: Option<&[QueueKey]>,
    ) -> StoreResult<ConsumeOutcome> {
        let mut state = self.state.lock();
        state.leaked_bucket(bucket, now_ms, leak_rate);

        if let Some(lanes) = backlog {
            if lanes.iter().any(|l| state.lane_len(*l) > 0) {
                return Ok(ConsumeOutcome::DeniedQueue);
            }
        }

        let b = state.leaked_bucket(bucket, now_ms, leak_rate);
        if b.level + 1.0 <= capacity {
            b.level += 1.0;
            Ok(ConsumeOutcome::Allowed)
        } else {
            Ok(ConsumeOutcome::DeniedCapacity)
        }
    }

    fn bucket_consume_n(
        &self,
        bucket: &str,
        now_ms: u64,
        leak_rate: f64,
        capacity: f64,
        n: u64,
    ) -> StoreResult<u64> {
        if n == 0 {
            return Ok(0);
        }
        let mut state = self.state.lock();
        let b = state.leaked_bucket(bucket, now_ms, leak_rate);
        if b.level + n as f64 <= capacity {
            b.level += n as f64;
            Ok(n)
        } else {
            let granted = (capacity - b.level).max(0.0).floor() as u64;
            b.level = capacity.max(b.level);
            Ok(granted)
        }
    }

    fn bucket_refund(&self, bucket: &str, now_ms: u64, leak_rate: f64, n: u64) -> StoreResult<()> {
        if n == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        let b = state.leaked_bucket(bucket, now_ms, leak_rate);
        b.level = (b.level - n as f64).max(0.0);
        Ok(())
    }

    fn bucket_level(&self, bucket: &str, now_ms: u64, leak_rate: f64) -> StoreResult<f64> {
        let mut state = self.state.lock();
        Ok(state.leaked_bucket(bucket, now_ms, leak_rate).level)
    }

    fn bucket_delete(&self, bucket: &str) -> StoreResult<()> {
        self.state.lock().buckets.remove(bucket);
        Ok(())
    }

    fn lane_offer(&self, lane: QueueKey, payload: String, score: u64) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let seq = state.seq;
        state.seq += 1;
        let set = state.lane(lane);
        // Sorted-set semantics: re-offering an existing member only moves
        // its score.
        if let Some(existing) = set.iter().find(|(_, v)| **v == payload).map(|(k, _)| *k) {
            set.remove(&existing);
            set.insert((score, seq), payload);
            return Ok(false);
        }
        set.insert((score, seq), payload);
        Ok(true)
    }

    fn lane_poll_front(&self, lane: QueueKey, max: usize) -> StoreResult<Vec<String>> {
        let mut state = self.state.lock();
        Ok(state
            .drain_lane(lane, u64::MAX, max)
            .into_iter()
            .map(|(_, p)| p)
            .collect())
    }

    fn lane_poll_up_to(
        &self,
        lane: QueueKey,
        max_score: u64,
        max: usize,
    ) -> StoreResult<Vec<String>> {
        let mut state = self.state.lock();
        Ok(state
            .drain_lane(lane, max_score, max)
            .into_iter()
            .map(|(_, p)| p)
            .collect())
    }

    fn lane_len(&self, lane: QueueKey) -> StoreResult<u64> {
        Ok(self.state.lock().lane_len(lane) as u64)
    }

    fn lane_count_up_to(&self, lane: QueueKey, max_score: u64) -> StoreResult<u64> {
        Ok(self.state.lock().lane_count_up_to(lane, max_score) as u64)
    }

    fn lane_scan(&self, lane: QueueKey) -> StoreResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .lanes
            .get(&lane)
            .map(|l| l.values().cloned().collect())
            .unwrap_or_default())
    }

    fn poll_weighted(
        &self,
        family: QueueFamily,
        _now_ms: u64,
        spec: &PollSpec,
    ) -> StoreResult<PollBatch> {
        let mut state = self.state.lock();

        let order_retry =
            state.lane_count_up_to(QueueKey::retry(family, QueueClass::Order), spec.retry_threshold_ms);
        let order_normal = state.lane_len(QueueKey::normal(family, QueueClass::Order));
        let other_retry =
            state.lane_count_up_to(QueueKey::retry(family, QueueClass::Other), spec.retry_threshold_ms);
        let other_normal = state.lane_len(QueueKey::normal(family, QueueClass::Other));

        let (order_slots, other_slots) = split_classes(
            spec.total_slots,
            order_retry + order_normal,
            other_retry + other_normal,
            spec.order_weight,
            spec.other_weight,
        );
        let (order_retry_slots, order_normal_slots) =
            split_lanes(order_slots, order_retry, order_normal, spec.retry_ratio);
        let (other_retry_slots, other_normal_slots) =
            split_lanes(other_slots, other_retry, other_normal, spec.retry_ratio);

        let mut batch = PollBatch::default();
        state.drain_class(
            family,
            QueueClass::Order,
            order_retry_slots,
            order_normal_slots,
            spec.retry_threshold_ms,
            &mut batch,
        );
        state.drain_class(
            family,
            QueueClass::Other,
            other_retry_slots,
            other_normal_slots,
            spec.retry_threshold_ms,
            &mut batch,
        );

        batch.stats = PollStats {
            order_retry: order_retry_slots,
            order_normal: order_normal_slots,
            other_retry: other_retry_slots,
            other_normal: other_normal_slots,
        };
        Ok(batch)
    }

    fn load_loop_state(&self) -> StoreResult<Option<PersistedLoopState>> {
        Ok(self.state.lock().loop_state)
    }

    fn save_loop_state(&self, state: &PersistedLoopState) -> StoreResult<()> {
        self.state.lock().loop_state = Some(*state);
        Ok(())
    }

    fn save_target_limit(&self, target: u32) -> StoreResult<()> {
        let mut state = self.state.lock();
        match &mut state.loop_state {
            Some(s) => s.target_limit = target,
            None => {
                state.loop_state = Some(PersistedLoopState {
                    active: false,
                    previous_limit: 0,
                    target_limit: target,
                    activated_at: 0,
                });
            }
        }
        Ok(())
    }

    fn clear_loop_state(&self) -> StoreResult<()> {
        self.state.lock().loop_state = None;
        Ok(())
    }

    fn histogram_record(
        &self,
        slice_start_ms: u64,
        latency_ms: u64,
        boundaries: &[u64],
        ttl_ms: u64,
        now_ms: u64,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.prune_expired_slices(now_ms);
        let slice = state.histogram.entry(slice_start_ms).or_default();
        slice.expires_at_ms = now_ms + ttl_ms;
        for &boundary in boundaries {
            if boundary >= latency_ms {
                *slice.counts.entry(boundary).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    fn histogram_slice(&self, slice_start_ms: u64, now_ms: u64) -> StoreResult<HashMap<u64, u64>> {
        let state = self.state.lock();
        Ok(state
            .histogram
            .get(&slice_start_ms)
            .filter(|s| s.expires_at_ms > now_ms)
            .map(|s| s.counts.clone())
            .unwrap_or_default())
    }

    fn histogram_clear(&self, slice_starts_ms: &[u64]) -> StoreResult<()> {
        let mut state = self.state.lock();
        for slice in slice_starts_ms {
            state.histogram.remove(slice);
        }
        Ok(())
    }
}
