//! The shared atomic store seam.
//!
//! Every piece of state that concurrent gate instances share — bucket water
//! levels, queue membership, feedback-loop state, histogram slices — lives
//! behind [`AtomicStore`]. Each trait method is one indivisible transaction
//! against the store; this is the sole concurrency-safety mechanism, so no
//! in-process locking coordinates across instances. Methods take `now_ms`
//! explicitly: the caller's clock drives the leak math, which keeps every
//! operation deterministic under test.

pub(crate) mod keys;
mod memory;

use std::collections::HashMap;

use crate::error::StoreResult;

pub use keys::{Lane, QueueClass, QueueFamily, QueueKey};
pub use memory::MemoryStore;

/// Outcome of a single-unit bucket consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Allowed,
    /// The bucket is full.
    DeniedCapacity,
    /// Capacity remained but a backlog queue was non-empty; new arrivals
    /// must line up behind the existing backlog.
    DeniedQueue,
}

/// Parameters for one weighted poll transaction.
#[derive(Debug, Clone)]
pub struct PollSpec {
    pub total_slots: usize,
    pub order_weight: u32,
    pub other_weight: u32,
    /// Preferred retry share of each class's slots, in [0, 1].
    pub retry_ratio: f64,
    /// Retry-lane entries scored at or below this are eligible.
    pub retry_threshold_ms: u64,
}

/// One payload removed by a weighted poll, tagged with the lane it came from.
#[derive(Debug, Clone)]
pub struct PolledEntry {
    pub key: QueueKey,
    pub payload: String,
    pub score: u64,
}

/// Per-lane removal counts, so callers can compute exact refunds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub order_retry: usize,
    pub order_normal: usize,
    pub other_retry: usize,
    pub other_normal: usize,
}

impl PollStats {
    pub fn total(&self) -> usize {
        self.order_retry + self.order_normal + self.other_retry + self.other_normal
    }
}

/// Result of a weighted poll: the removed entries plus their lane counts.
#[derive(Debug, Clone, Default)]
pub struct PollBatch {
    pub entries: Vec<PolledEntry>,
    pub stats: PollStats,
}

/// Feedback-loop state as persisted in the store, restored at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedLoopState {
    pub active: bool,
    pub previous_limit: u32,
    pub target_limit: u32,
    pub activated_at: u64,
}

/// Atomic operations over the shared store. Implementations must be
/// thread-safe; every method executes as one indivisible step.
pub trait AtomicStore: Send + Sync {
    // --- Leaky buckets ---

    /// Leak the bucket to `now_ms`, then try to consume one unit. When
    /// `backlog` lanes are given and any is non-empty, the consume is denied
    /// with [`ConsumeOutcome::DeniedQueue`] even if capacity remains.
    fn bucket_consume_one(
        &self,
        bucket: &str,
        now_ms: u64,
        leak_rate: f64,
        capacity: f64,
        backlog: Option<&[QueueKey]>,
    ) -> StoreResult<ConsumeOutcome>;

    /// Leak the bucket to `now_ms`, then consume up to `n` whole units.
    /// Returns the granted count, which may be any value in `0..=n` —
    /// callers must treat a partial grant as a reservation of exactly that
    /// amount, never as failure.
    fn bucket_consume_n(
        &self,
        bucket: &str,
        now_ms: u64,
        leak_rate: f64,
        capacity: f64,
        n: u64,
    ) -> StoreResult<u64>;

    /// Lower the stored level by `n`, floored at zero.
    fn bucket_refund(&self, bucket: &str, now_ms: u64, leak_rate: f64, n: u64) -> StoreResult<()>;

    /// Leak the bucket to `now_ms` and return the current water level.
    fn bucket_level(&self, bucket: &str, now_ms: u64, leak_rate: f64) -> StoreResult<f64>;

    /// Drop the bucket entirely (level resets to zero on next access).
    fn bucket_delete(&self, bucket: &str) -> StoreResult<()>;

    // --- Ordered lanes ---

    /// Insert a payload with the given score. Returns false if the identical
    /// payload is already a member of the lane.
    fn lane_offer(&self, lane: QueueKey, payload: String, score: u64) -> StoreResult<bool>;

    /// Remove and return up to `max` payloads in ascending score order.
    fn lane_poll_front(&self, lane: QueueKey, max: usize) -> StoreResult<Vec<String>>;

    /// Remove and return up to `max` payloads whose score is at or below
    /// `max_score`, ascending.
    fn lane_poll_up_to(&self, lane: QueueKey, max_score: u64, max: usize)
        -> StoreResult<Vec<String>>;

    fn lane_len(&self, lane: QueueKey) -> StoreResult<u64>;

    /// Count of members scored at or below `max_score`.
    fn lane_count_up_to(&self, lane: QueueKey, max_score: u64) -> StoreResult<u64>;

    /// All payloads in ascending score order, without removing them.
    fn lane_scan(&self, lane: QueueKey) -> StoreResult<Vec<String>>;

    /// The parametrized weighted poll: split `spec.total_slots` between the
    /// family's classes proportional to the weights (capped by true backlog,
    /// leftovers redistributed), split each class between retry-eligible and
    /// normal by `retry_ratio`, then remove exactly the selected members.
    fn poll_weighted(
        &self,
        family: QueueFamily,
        now_ms: u64,
        spec: &PollSpec,
    ) -> StoreResult<PollBatch>;

    // --- Feedback-loop state ---

    fn load_loop_state(&self) -> StoreResult<Option<PersistedLoopState>>;

    fn save_loop_state(&self, state: &PersistedLoopState) -> StoreResult<()>;

    /// Update only the target-limit field of the persisted state.
    fn save_target_limit(&self, target: u32) -> StoreResult<()>;

    fn clear_loop_state(&self) -> StoreResult<()>;

    // --- Latency histogram ---

    /// Within the slice keyed by `slice_start_ms`, increment the cumulative
    /// count of every boundary >= `latency_ms`. The slice expires
    /// `ttl_ms` after this write.
    fn histogram_record(
        &self,
        slice_start_ms: u64,
        latency_ms: u64,
        boundaries: &[u64],
        ttl_ms: u64,
        now_ms: u64,
    ) -> StoreResult<()>;

    /// The boundary -> cumulative-count map of one slice. Missing or expired
    /// slices read as empty.
    fn histogram_slice(&self, slice_start_ms: u64, now_ms: u64) -> StoreResult<HashMap<u64, u64>>;

    /// Drop the given slices.
    fn histogram_clear(&self, slice_starts_ms: &[u64]) -> StoreResult<()>;
}
