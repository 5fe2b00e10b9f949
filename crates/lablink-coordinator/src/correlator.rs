//! Request/response correlation over the fire-and-forget transport.
//!
//! A command is published with a caller-generated `req_id` and parked in a
//! pending table; the matching response envelope resolves it. Each attempt
//! waits one timeout window, then the identical envelope (same `req_id`)
//! is republished after a short doubling gap. Responses for unknown or
//! already-resolved ids are dropped, which is what makes at-least-once
//! redelivery safe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use lablink_core::config::RetryConfig;
use lablink_core::envelope::{Actor, Envelope};
use lablink_core::eventbus::{EventBus, FleetEvent};
use lablink_core::{Error, ErrorCode, Result};

use crate::transport::{PublishOptions, Transport};

const EVENT_SOURCE: &str = "correlator";

/// Per-send correlation options.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl SendOptions {
    pub fn from_retry(retry: &RetryConfig) -> Self {
        Self {
            timeout: retry.timeout(),
            max_retries: retry.max_retries,
        }
    }
}

/// Observable state of an in-flight request.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    pub req_id: Uuid,
    pub device_id: String,
    pub action: String,
    pub issued_at: DateTime<Utc>,
    /// Latest wall-clock time by which the request resolves or expires.
    pub deadline: DateTime<Utc>,
    pub retries_remaining: u32,
}

struct PendingEntry {
    info: PendingRequest,
    tx: oneshot::Sender<Result<Envelope>>,
}

impl PendingEntry {
    /// The waiting future was dropped without cancel or resolution.
    fn abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Pending-request table plus send loop.
#[derive(Clone)]
pub struct Correlator {
    transport: Arc<dyn Transport>,
    pending: Arc<RwLock<HashMap<Uuid, PendingEntry>>>,
    retry: RetryConfig,
    events: EventBus,
}

impl Correlator {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryConfig, events: EventBus) -> Self {
        Self {
            transport,
            pending: Arc::new(RwLock::new(HashMap::new())),
            retry,
            events,
        }
    }

    /// Build and send a command, waiting for its response.
    pub async fn send(
        &self,
        device_id: &str,
        topic: &str,
        actor: Actor,
        action: impl Into<String>,
        params: Map<String, Value>,
        options: SendOptions,
    ) -> Result<Envelope> {
        let envelope = Envelope::command(actor, action, params);
        self.send_envelope(device_id, topic, &envelope, options)
            .await
    }

    /// Send a prepared command envelope and wait for the response
    /// correlated by its `req_id`.
    ///
    /// The same bytes are republished on retry so the receiver can
    /// deduplicate by `req_id`. Publish failures are not fatal: the
    /// attempt window still runs and the retry loop decides the outcome.
    pub async fn send_envelope(
        &self,
        device_id: &str,
        topic: &str,
        envelope: &Envelope,
        options: SendOptions,
    ) -> Result<Envelope> {
        if !envelope.is_command() {
            return Err(Error::InvalidParams(
                "only command envelopes can be sent".into(),
            ));
        }
        let payload = envelope.encode()?;
        let req_id = envelope.req_id;
        let total_attempts = options.max_retries + 1;

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.pending.write().await;
            if pending.contains_key(&req_id) {
                return Err(Error::InvalidParams(format!(
                    "req_id already in flight: {}",
                    req_id
                )));
            }
            let issued_at = Utc::now();
            pending.insert(
                req_id,
                PendingEntry {
                    info: PendingRequest {
                        req_id,
                        device_id: device_id.to_string(),
                        action: envelope.action.clone().unwrap_or_default(),
                        issued_at,
                        deadline: issued_at
                            + chrono::Duration::from_std(self.window(options))
                                .unwrap_or_else(|_| chrono::Duration::seconds(0)),
                        retries_remaining: options.max_retries,
                    },
                    tx,
                },
            );
        }

        for attempt in 0..total_attempts {
            if attempt > 0 {
                tokio::time::sleep(jittered(self.gap(attempt - 1))).await;
                // The response may have landed during the gap; skip the
                // redundant republish if so.
                if let Ok(result) = rx.try_recv() {
                    return result;
                }
                if let Some(entry) = self.pending.write().await.get_mut(&req_id) {
                    entry.info.retries_remaining = total_attempts - 1 - attempt;
                }
                debug!(req_id = %req_id, attempt, "retrying request");
            }

            if let Err(e) = self
                .transport
                .publish(topic, payload.clone(), PublishOptions::transient())
                .await
            {
                warn!(req_id = %req_id, error = %e, "publish failed, awaiting retry window");
            }

            match tokio::time::timeout(options.timeout, &mut rx).await {
                Ok(Ok(result)) => return result,
                Ok(Err(_)) => return Err(Error::ChannelClosed),
                Err(_) => continue,
            }
        }

        self.pending.write().await.remove(&req_id);
        self.events.publish(
            FleetEvent::RequestExpired {
                req_id,
                device_id: device_id.to_string(),
            },
            EVENT_SOURCE,
        );
        Err(Error::Timeout {
            attempts: total_attempts,
        })
    }

    /// Resolve a pending request with an inbound response envelope.
    ///
    /// Returns `false` for non-responses and for unknown or
    /// already-resolved ids (duplicate deliveries land here).
    pub async fn resolve(&self, envelope: &Envelope) -> bool {
        if !envelope.is_response() {
            return false;
        }
        let entry = self.pending.write().await.remove(&envelope.req_id);
        match entry {
            Some(entry) => {
                self.events.publish(
                    FleetEvent::RequestResolved {
                        req_id: envelope.req_id,
                        success: envelope.success.unwrap_or(false),
                    },
                    EVENT_SOURCE,
                );
                let _ = entry.tx.send(Ok(envelope.clone()));
                true
            }
            None => {
                debug!(req_id = %envelope.req_id, "response for unknown request, dropping");
                false
            }
        }
    }

    /// Cancel a pending request; the waiter gets an error with `code`.
    pub async fn cancel(&self, req_id: Uuid, code: ErrorCode) -> bool {
        match self.pending.write().await.remove(&req_id) {
            Some(entry) => {
                let _ = entry.tx.send(Err(Error::Cancelled(code)));
                true
            }
            None => false,
        }
    }

    /// Cancel every pending request targeting `device_id`. Returns how
    /// many were cancelled.
    pub async fn cancel_device(&self, device_id: &str, code: ErrorCode) -> usize {
        let mut pending = self.pending.write().await;
        let ids: Vec<Uuid> = pending
            .iter()
            .filter(|(_, e)| e.info.device_id == device_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(entry) = pending.remove(id) {
                let _ = entry.tx.send(Err(Error::Cancelled(code)));
            }
        }
        ids.len()
    }

    /// Drop entries whose waiting future went away without resolution or
    /// cancellation, so the pending table stays bounded even when a
    /// caller abandons a send mid-flight. Returns how many were reaped.
    pub async fn prune_abandoned(&self) -> usize {
        let mut pending = self.pending.write().await;
        let ids: Vec<Uuid> = pending
            .iter()
            .filter(|(_, e)| e.abandoned())
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            debug!(req_id = %id, "pruning abandoned request");
            pending.remove(id);
        }
        ids.len()
    }

    /// Snapshot of all in-flight requests.
    pub async fn pending(&self) -> Vec<PendingRequest> {
        self.pending
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    fn gap(&self, retry_index: u32) -> Duration {
        let base = self.retry.backoff_base_ms.max(1);
        let ms = base
            .saturating_mul(1u64 << retry_index.min(16))
            .min(self.retry.backoff_cap_ms);
        Duration::from_millis(ms)
    }

    /// Upper bound on the full retry window for a send.
    fn window(&self, options: SendOptions) -> Duration {
        let mut total = options.timeout * (options.max_retries + 1);
        for i in 0..options.max_retries {
            total += self.gap(i);
        }
        total
    }
}

fn jittered(gap: Duration) -> Duration {
    let spread = (gap.as_millis() as u64 / 4).max(1);
    gap + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
}
