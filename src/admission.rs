//! Admission control: the decision every incoming request passes
//! through before it reaches the protected service.
//!
//! Only paths under the limited prefix are throttled. An admitted
//! payment-path request must also clear its provider's bucket; a denial
//! on either bucket parks the request in the matching queue family and
//! reports its position, so callers can poll instead of retrying.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::config::AdmissionConfig;
use crate::error::Result;
use crate::item::{HttpRequestData, QueueItem};
use crate::limiter::{GlobalRateLimiter, ProviderRegistry};
use crate::queue::WeightedQueues;
use crate::store::{ConsumeOutcome, QueueFamily};

#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub user_id: u64,
    pub path: String,
    pub provider: Option<String>,
    pub access_token: Option<String>,
    pub http_request: Option<HttpRequestData>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionResponse {
    pub allowed: bool,
    pub queued: bool,
    pub current_limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AdmissionResponse {
    fn passthrough(current_limit: u32) -> Self {
        Self {
            allowed: true,
            queued: false,
            current_limit,
            request_id: None,
            queue_position: None,
            backend_status: None,
            backend_body: None,
            message: None,
        }
    }
}

/// Gate-wide counters for the status endpoints.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GateStatus {
    pub current_limit: u32,
    pub current_level: f64,
    pub available_tokens: u64,
    pub global_queued: u64,
    pub pg_queued: u64,
}

pub struct AdmissionControl {
    global: Arc<GlobalRateLimiter>,
    providers: Arc<ProviderRegistry>,
    queues: Arc<WeightedQueues>,
    backend: Arc<dyn Backend>,
    config: AdmissionConfig,
    default_provider: String,
}

impl AdmissionControl {
    pub fn new(
        global: Arc<GlobalRateLimiter>,
        providers: Arc<ProviderRegistry>,
        queues: Arc<WeightedQueues>,
        backend: Arc<dyn Backend>,
        config: AdmissionConfig,
        default_provider: String,
    ) -> Self {
        Self {
            global,
            providers,
            queues,
            backend,
            config,
            default_provider,
        }
    }

    /// Decide one request. Fails only on an unknown provider name;
    /// everything else resolves to a response.
    pub fn check(&self, request: AdmissionRequest, now_ms: u64) -> Result<AdmissionResponse> {
        if !request.path.starts_with(&self.config.limited_prefix) {
            return Ok(AdmissionResponse::passthrough(self.global.current_limit()));
        }

        match self.global.try_consume(now_ms) {
            ConsumeOutcome::Allowed => {
                if request.path.starts_with(&self.config.payment_prefix) {
                    let name = request.provider.as_deref().unwrap_or(&self.default_provider);
                    let provider = match self.providers.get(name) {
                        Ok(provider) => provider,
                        Err(e) => {
                            // The token taken above belongs to no request now
                            self.global.refund_n(1, now_ms);
                            return Err(e);
                        }
                    };
                    if !provider.try_consume(now_ms) {
                        debug!(user_id = request.user_id, provider = name, "provider bucket full, queueing");
                        // Give back the global token; the queued request
                        // will pay for both on dispatch
                        self.global.refund_n(1, now_ms);
                        return Ok(self.enqueue(request, QueueFamily::Pg, now_ms));
                    }
                }
                debug!(user_id = request.user_id, path = %request.path, "admitted");
                Ok(self.forward(request))
            }
            outcome => {
                debug!(
                    user_id = request.user_id,
                    ?outcome,
                    path = %request.path,
                    "global limit reached, queueing"
                );
                Ok(self.enqueue(request, QueueFamily::Global, now_ms))
            }
        }
    }

    /// Pass an admitted request through to the backend. A backend
    /// failure degrades to an allowed-but-unforwarded response; the
    /// caller already holds the tokens, and the request is theirs to
    /// retry upstream.
    fn forward(&self, request: AdmissionRequest) -> AdmissionResponse {
        let current_limit = self.global.current_limit();
        let Some(http_request) = request.http_request else {
            warn!(user_id = request.user_id, "no forwardable request data");
            return AdmissionResponse {
                message: Some("request allowed (no forwarding data)".to_string()),
                ..AdmissionResponse::passthrough(current_limit)
            };
        };

        let item = QueueItem {
            request_id: Uuid::new_v4(),
            user_id: request.user_id,
            access_token: request.access_token,
            http_request: Some(http_request),
            retry_count: 0,
            enqueued_at: 0,
        };
        match self.backend.execute(&item) {
            Ok(response) => AdmissionResponse {
                backend_status: Some(response.status),
                backend_body: response.body,
                ..AdmissionResponse::passthrough(current_limit)
            },
            Err(e) => {
                error!(user_id = item.user_id, error = %e, "forward failed, degrading");
                AdmissionResponse {
                    message: Some(format!("backend request failed: {e}")),
                    ..AdmissionResponse::passthrough(current_limit)
                }
            }
        }
    }

    fn enqueue(
        &self,
        request: AdmissionRequest,
        family: QueueFamily,
        now_ms: u64,
    ) -> AdmissionResponse {
        let item = QueueItem::new(
            request.user_id,
            request.access_token,
            request.http_request,
            now_ms,
        );
        let request_id = item.request_id;

        let added = match self.queues.offer(family, &item) {
            Ok(added) => added,
            Err(e) => {
                error!(error = %e, user_id = item.user_id, "enqueue failed");
                false
            }
        };
        if !added {
            return AdmissionResponse {
                allowed: false,
                queued: false,
                current_limit: self.global.current_limit(),
                request_id: None,
                queue_position: None,
                backend_status: None,
                backend_body: None,
                message: Some("failed to add to queue".to_string()),
            };
        }

        let position = match self.queues.queue_position(family, request_id) {
            Ok(position) => position,
            Err(e) => {
                warn!(error = %e, "queue position lookup failed");
                None
            }
        };
        AdmissionResponse {
            allowed: false,
            queued: true,
            current_limit: self.global.current_limit(),
            request_id: Some(request_id),
            queue_position: position,
            backend_status: None,
            backend_body: None,
            message: Some("request queued".to_string()),
        }
    }

    /// 1-based position of a queued request, searched across both
    /// families.
    pub fn queue_position(&self, request_id: Uuid) -> Result<Option<u64>> {
        for family in [QueueFamily::Global, QueueFamily::Pg] {
            if let Some(position) = self.queues.queue_position(family, request_id)? {
                return Ok(Some(position));
            }
        }
        Ok(None)
    }

    pub fn status(&self, now_ms: u64) -> Result<GateStatus> {
        Ok(GateStatus {
            current_limit: self.global.current_limit(),
            current_level: self.global.current_level(now_ms),
            available_tokens: self.global.available_tokens(now_ms),
            global_queued: self.queues.total_len(QueueFamily::Global)?,
            pg_queued: self.queues.total_len(QueueFamily::Pg)?,
        })
    }
}
