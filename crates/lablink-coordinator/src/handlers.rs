//! Built-in capability handlers.
//!
//! [`PassthroughHandler`] covers the common case of a device-hosted
//! capability module: coordinator-side commands are forwarded verbatim to
//! the device (same `req_id`, so the device response correlates back),
//! gated by the capability's lease. `reserve`/`release` manage that lease
//! without touching the device.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use lablink_core::envelope::{Actor, Envelope};
use lablink_core::{Error, Result};

use crate::router::{CapabilityHandler, HandlerContext};

const DEFAULT_LEASE_SECS: u64 = 60;

/// Forwards an allow-listed set of actions to the device-side module.
pub struct PassthroughHandler {
    actions: HashSet<String>,
    default_lease: Duration,
}

/// One deferred command parsed out of a `schedule` request.
struct ScheduledCommand {
    device_id: String,
    action: String,
    params: Map<String, Value>,
}

impl PassthroughHandler {
    /// Create a handler forwarding exactly the given actions.
    pub fn new<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
            default_lease: Duration::from_secs(DEFAULT_LEASE_SECS),
        }
    }

    pub fn with_default_lease(mut self, ttl: Duration) -> Self {
        self.default_lease = ttl;
        self
    }

    async fn reserve(
        &self,
        ctx: &HandlerContext,
        envelope: &Envelope,
        device_id: &str,
        holder: &str,
    ) -> Result<()> {
        let ttl = match envelope.params.get("lease_s") {
            None => self.default_lease,
            Some(v) => match v.as_u64() {
                Some(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(Error::InvalidParams(
                        "lease_s must be a positive integer".into(),
                    ))
                }
            },
        };
        let reason = envelope
            .params
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string);

        let lease = ctx.acquire_lease(device_id, holder, ttl, reason).await?;

        let mut data = Map::new();
        data.insert("lease".to_string(), serde_json::to_value(&lease)?);
        ctx.publish_reply(&Envelope::response(envelope.req_id, Actor::Orchestrator, data))
            .await
    }

    async fn release(
        &self,
        ctx: &HandlerContext,
        envelope: &Envelope,
        device_id: &str,
        holder: &str,
    ) -> Result<()> {
        ctx.release_lease(device_id, holder).await?;

        let mut data = Map::new();
        data.insert("released".to_string(), Value::Bool(true));
        ctx.publish_reply(&Envelope::response(envelope.req_id, Actor::Orchestrator, data))
            .await
    }

    /// One-shot deferred execution: validate now, ack `SCHEDULED`, then at
    /// the requested instant re-check the lease and forward each command
    /// with a fresh `req_id`. Outcomes land on the reply path like any
    /// other dispatch.
    async fn schedule(
        &self,
        ctx: &HandlerContext,
        envelope: &Envelope,
        holder: &str,
    ) -> Result<()> {
        let at_raw = envelope
            .params
            .get("at")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidParams("missing at timestamp".into()))?;
        let at: DateTime<Utc> = at_raw
            .parse()
            .map_err(|_| Error::InvalidParams(format!("unparseable at timestamp: {}", at_raw)))?;

        let entries = envelope
            .params
            .get("commands")
            .and_then(Value::as_array)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::InvalidParams("commands must be a non-empty array".into()))?;
        let mut commands = Vec::with_capacity(entries.len());
        for entry in entries {
            let device_id = entry
                .get("device_id")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::InvalidParams("scheduled command missing device_id".into()))?;
            let action = entry
                .get("action")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::InvalidParams("scheduled command missing action".into()))?;
            if !self.actions.contains(action) {
                return Err(Error::InvalidParams(format!(
                    "unsupported scheduled action: {}",
                    action
                )));
            }
            let params = entry
                .get("params")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            commands.push(ScheduledCommand {
                device_id: device_id.to_string(),
                action: action.to_string(),
                params,
            });
        }

        let mut data = Map::new();
        data.insert("scheduled".to_string(), Value::Bool(true));
        data.insert("at".to_string(), Value::from(at.to_rfc3339()));
        data.insert("commands".to_string(), Value::from(commands.len()));
        ctx.publish_reply(&Envelope::response(envelope.req_id, Actor::Orchestrator, data))
            .await?;

        // A timestamp in the past fires immediately.
        let delay = (at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let ctx = ctx.clone();
        let holder = holder.to_string();
        let options = ctx.send_options();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for command in commands {
                // The lease situation may have changed since scheduling;
                // gate again at fire time.
                if let Some(lease) = ctx.lease_holder(&command.device_id).await {
                    if lease.holder != holder {
                        warn!(device_id = %command.device_id, holder = %holder,
                            lease_holder = %lease.holder, "scheduled command blocked by lease");
                        let reply = Envelope::error(
                            uuid::Uuid::new_v4(),
                            Actor::Orchestrator,
                            Error::ResourceBusy {
                                device_id: command.device_id.clone(),
                                resource: ctx.capability().to_string(),
                                holder: lease.holder.clone(),
                            }
                            .code(),
                            format!(
                                "scheduled {} on {} blocked: lease held by {}",
                                command.action, command.device_id, lease.holder
                            ),
                        );
                        if let Err(e) = ctx.publish_reply(&reply).await {
                            warn!(error = %e, "failed to publish blocked-schedule reply");
                        }
                        continue;
                    }
                }

                let mut params = command.params;
                params.insert(
                    "device_id".to_string(),
                    Value::from(command.device_id.clone()),
                );
                let cmd = Envelope::command(Actor::Orchestrator, command.action, params);
                let outcome = match ctx.send_to_device(&command.device_id, &cmd, options).await {
                    Ok(response) => response,
                    Err(e) => {
                        Envelope::error(cmd.req_id, Actor::Orchestrator, e.code(), e.to_string())
                    }
                };
                if let Err(e) = ctx.publish_reply(&outcome).await {
                    warn!(error = %e, "failed to publish scheduled command outcome");
                }
            }
        });
        Ok(())
    }

    async fn forward(
        &self,
        ctx: &HandlerContext,
        envelope: Envelope,
        device_id: &str,
        holder: &str,
    ) -> Result<()> {
        if let Some(lease) = ctx.lease_holder(device_id).await {
            if lease.holder != holder {
                return Err(Error::ResourceBusy {
                    device_id: device_id.to_string(),
                    resource: ctx.capability().to_string(),
                    holder: lease.holder,
                });
            }
        }

        // Tell the caller the command is on its way; the device's own
        // response follows under the same req_id.
        let mut ack = Map::new();
        ack.insert("dispatched".to_string(), Value::Bool(true));
        ctx.publish_reply(&Envelope::response(envelope.req_id, Actor::Orchestrator, ack))
            .await?;

        let response = ctx
            .send_to_device(device_id, &envelope, ctx.send_options())
            .await?;
        ctx.publish_reply(&response).await
    }
}

#[async_trait]
impl CapabilityHandler for PassthroughHandler {
    async fn handle_command(&self, ctx: &HandlerContext, envelope: Envelope) -> Result<()> {
        let action = envelope
            .action
            .clone()
            .ok_or_else(|| Error::InvalidParams("missing action".into()))?;
        // Lease identity: explicit holder param, else the acting party.
        let holder = envelope
            .params
            .get("holder")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| envelope.actor.as_str().to_string());

        // Schedule names its targets per command; everything else targets
        // one device.
        if action == "schedule" {
            return self.schedule(ctx, &envelope, &holder).await;
        }

        let device_id = envelope
            .params
            .get("device_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidParams("missing device_id".into()))?;

        match action.as_str() {
            "reserve" => self.reserve(ctx, &envelope, &device_id, &holder).await,
            "release" => self.release(ctx, &envelope, &device_id, &holder).await,
            a if self.actions.contains(a) => {
                self.forward(ctx, envelope, &device_id, &holder).await
            }
            other => Err(Error::InvalidParams(format!(
                "unsupported action: {}",
                other
            ))),
        }
    }

    /// Unsolicited device events (tally changes, recorder state) are
    /// surfaced on the capability's reply path for external consumers.
    async fn handle_device_event(
        &self,
        ctx: &HandlerContext,
        device_id: &str,
        envelope: Envelope,
    ) -> Result<()> {
        debug!(device_id = %device_id, capability = %ctx.capability(), "relaying device event");
        ctx.publish_reply(&envelope).await
    }
}
