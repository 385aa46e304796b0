//! Logical key names for everything the gate keeps in the shared store.
//!
//! Keys are plain strings so any number of processes sharing one store agree
//! on the same buckets, lanes, and state hashes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bucket key for the global leaky bucket.
pub const GLOBAL_BUCKET: &str = "leaky:global:bucket";

/// Hash key for the persisted feedback-loop state.
pub const LOOP_STATE: &str = "feedback:loop:state";

/// Key prefix for latency-histogram time slices.
pub const HISTOGRAM_PREFIX: &str = "latency:histogram:";

/// Bucket key for a payment provider's leaky bucket.
pub fn provider_bucket(name: &str) -> String {
    format!("leaky:pg:{}", name.to_lowercase())
}

/// Which backlog a queue belongs to: the global admission backlog or the
/// payment-gated backlog drained only while provider tokens are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueFamily {
    Global,
    Pg,
}

impl QueueFamily {
    fn key_part(self) -> &'static str {
        match self {
            QueueFamily::Global => "global",
            QueueFamily::Pg => "pg",
        }
    }
}

/// Service class of a queued request. ORDER traffic gets the larger share of
/// the weighted poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueClass {
    Order,
    Other,
}

impl QueueClass {
    pub fn name(self) -> &'static str {
        match self {
            QueueClass::Order => "ORDER",
            QueueClass::Other => "OTHER",
        }
    }

    fn key_part(self) -> &'static str {
        match self {
            QueueClass::Order => "order",
            QueueClass::Other => "other",
        }
    }
}

/// Sub-lane within a class: fresh arrivals vs delayed retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    Normal,
    Retry,
}

/// Fully-qualified ordered collection: family x class x lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    pub family: QueueFamily,
    pub class: QueueClass,
    pub lane: Lane,
}

impl QueueKey {
    pub fn normal(family: QueueFamily, class: QueueClass) -> Self {
        Self {
            family,
            class,
            lane: Lane::Normal,
        }
    }

    pub fn retry(family: QueueFamily, class: QueueClass) -> Self {
        Self {
            family,
            class,
            lane: Lane::Retry,
        }
    }

    /// The four lanes of one family in weighted-poll order:
    /// order-retry, order-normal, other-retry, other-normal.
    pub fn family_lanes(family: QueueFamily) -> [QueueKey; 4] {
        [
            Self::retry(family, QueueClass::Order),
            Self::normal(family, QueueClass::Order),
            Self::retry(family, QueueClass::Other),
            Self::normal(family, QueueClass::Other),
        ]
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queue:{}:{}",
            self.family.key_part(),
            self.class.key_part()
        )?;
        if self.lane == Lane::Retry {
            write!(f, ":retry")?;
        }
        Ok(())
    }
}
