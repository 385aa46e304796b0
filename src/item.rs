use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The forwardable HTTP request captured at admission time so a queued
/// request can be replayed later by the processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpRequestData {
    pub method: String,
    pub uri: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// A queued admission request. Identity (`request_id`, `enqueued_at`) is
/// fixed at first enqueue; only `retry_count` changes across re-enqueues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub request_id: Uuid,
    pub user_id: u64,
    pub access_token: Option<String>,
    pub http_request: Option<HttpRequestData>,
    pub retry_count: u32,
    /// Wall-clock enqueue time in milliseconds; also the normal-lane score.
    pub enqueued_at: u64,
}

impl QueueItem {
    pub fn new(
        user_id: u64,
        access_token: Option<String>,
        http_request: Option<HttpRequestData>,
        now_ms: u64,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            user_id,
            access_token,
            http_request,
            retry_count: 0,
            enqueued_at: now_ms,
        }
    }

    pub fn increment_retry_count(&mut self) {
        self.retry_count += 1;
    }

    pub fn can_retry(&self, max_retry_count: u32) -> bool {
        self.retry_count < max_retry_count
    }

    /// Queue wait time relative to the original enqueue, saturating for
    /// clock skew between the enqueuing and processing hosts.
    pub fn wait_time_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.enqueued_at)
    }
}
