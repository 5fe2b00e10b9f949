//! Capability routing.
//!
//! Features plug into the coordinator as [`CapabilityHandler`]s registered
//! under a capability name. Inbound commands on
//! `{root}/coordinator/{capability}/cmd` and device events on
//! `{root}/device/{device_id}/{capability}/evt` are dispatched to the
//! matching handler; a command for an unregistered capability is answered
//! with `MODULE_NOT_AVAILABLE` on the reply path.
//!
//! Handlers never touch the raw transport. Everything they need
//! (device round trips, leases, fleet lookups, reply publishing) goes
//! through the [`HandlerContext`], so a handler cannot publish outside its
//! own capability namespace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use lablink_core::config::RetryConfig;
use lablink_core::envelope::{Actor, Envelope};
use lablink_core::topic::TopicSpace;
use lablink_core::{Error, Result};

use crate::correlator::{Correlator, SendOptions};
use crate::lease::{Lease, LeaseManager};
use crate::registry::{Device, DeviceRegistry, RegistrySnapshot};
use crate::transport::{PublishOptions, Transport};

/// A coordinator-side feature handling one capability.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Handle a command addressed to this capability.
    ///
    /// Returning an error publishes an error envelope for the command's
    /// `req_id` on the capability's reply path.
    async fn handle_command(&self, ctx: &HandlerContext, envelope: Envelope) -> Result<()>;

    /// Handle an unsolicited device event for this capability. Events
    /// that resolved a pending request never reach here.
    async fn handle_device_event(
        &self,
        _ctx: &HandlerContext,
        _device_id: &str,
        _envelope: Envelope,
    ) -> Result<()> {
        Ok(())
    }
}

/// Capability-scoped view of the coordinator given to handlers.
#[derive(Clone)]
pub struct HandlerContext {
    capability: String,
    correlator: Correlator,
    leases: LeaseManager,
    registry: DeviceRegistry,
    transport: Arc<dyn Transport>,
    topics: TopicSpace,
    retry: RetryConfig,
}

impl HandlerContext {
    /// The capability this context is scoped to.
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Default correlation options from coordinator configuration.
    pub fn send_options(&self) -> SendOptions {
        SendOptions::from_retry(&self.retry)
    }

    /// Send a command envelope to this capability's module on a device
    /// and wait for the response.
    pub async fn send_to_device(
        &self,
        device_id: &str,
        envelope: &Envelope,
        options: SendOptions,
    ) -> Result<Envelope> {
        if !self.registry.contains(device_id).await {
            return Err(Error::DeviceNotFound(device_id.to_string()));
        }
        let topic = self.topics.capability_cmd(device_id, &self.capability);
        self.correlator
            .send_envelope(device_id, &topic, envelope, options)
            .await
    }

    /// Publish a response or event envelope on this capability's reply
    /// path (`{root}/coordinator/{capability}/evt`).
    pub async fn publish_reply(&self, envelope: &Envelope) -> Result<()> {
        let topic = self.topics.coordinator_evt(&self.capability);
        self.transport
            .publish(&topic, envelope.encode()?, PublishOptions::transient())
            .await
    }

    /// Acquire or renew the lease on this capability's resource.
    pub async fn acquire_lease(
        &self,
        device_id: &str,
        holder: &str,
        ttl: Duration,
        reason: Option<String>,
    ) -> Result<Lease> {
        self.leases
            .acquire(device_id, &self.capability, holder, ttl, reason)
            .await
    }

    /// Release the lease on this capability's resource.
    pub async fn release_lease(&self, device_id: &str, holder: &str) -> Result<()> {
        self.leases
            .release(device_id, &self.capability, holder)
            .await
    }

    /// Current lease on this capability's resource, if any.
    pub async fn lease_holder(&self, device_id: &str) -> Option<Lease> {
        self.leases.check(device_id, &self.capability).await
    }

    pub async fn device(&self, device_id: &str) -> Option<Device> {
        self.registry.get(device_id).await
    }

    pub async fn fleet_snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot().await
    }
}

struct Registered {
    handler: Arc<dyn CapabilityHandler>,
    ctx: Arc<HandlerContext>,
}

/// Dispatch table from capability name to handler.
#[derive(Clone)]
pub struct CapabilityRouter {
    handlers: Arc<RwLock<HashMap<String, Registered>>>,
    correlator: Correlator,
    leases: LeaseManager,
    registry: DeviceRegistry,
    transport: Arc<dyn Transport>,
    topics: TopicSpace,
    retry: RetryConfig,
}

impl CapabilityRouter {
    pub fn new(
        correlator: Correlator,
        leases: LeaseManager,
        registry: DeviceRegistry,
        transport: Arc<dyn Transport>,
        topics: TopicSpace,
        retry: RetryConfig,
    ) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            correlator,
            leases,
            registry,
            transport,
            topics,
            retry,
        }
    }

    /// Register a handler under a capability name, replacing any
    /// previous registration.
    pub async fn register(&self, capability: &str, handler: Arc<dyn CapabilityHandler>) {
        let ctx = Arc::new(HandlerContext {
            capability: capability.to_string(),
            correlator: self.correlator.clone(),
            leases: self.leases.clone(),
            registry: self.registry.clone(),
            transport: self.transport.clone(),
            topics: self.topics.clone(),
            retry: self.retry.clone(),
        });
        let previous = self
            .handlers
            .write()
            .await
            .insert(capability.to_string(), Registered { handler, ctx });
        if previous.is_some() {
            warn!(capability = %capability, "capability handler replaced");
        } else {
            info!(capability = %capability, "capability handler registered");
        }
    }

    pub async fn unregister(&self, capability: &str) -> bool {
        self.handlers.write().await.remove(capability).is_some()
    }

    /// Registered capability names, sorted.
    pub async fn capabilities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatch a command to its capability handler.
    ///
    /// Runs the handler on its own task so a slow device round trip never
    /// stalls the inbound message loop.
    pub async fn dispatch_command(&self, capability: &str, envelope: Envelope) {
        if !envelope.is_command() {
            warn!(capability = %capability, req_id = %envelope.req_id,
                "non-command envelope on command topic, dropping");
            return;
        }

        let registered = {
            let handlers = self.handlers.read().await;
            handlers
                .get(capability)
                .map(|r| (r.handler.clone(), r.ctx.clone()))
        };

        match registered {
            Some((handler, ctx)) => {
                tokio::spawn(async move {
                    let req_id = envelope.req_id;
                    if let Err(e) = handler.handle_command(&ctx, envelope).await {
                        debug!(capability = %ctx.capability, req_id = %req_id, error = %e,
                            "command failed");
                        let reply =
                            Envelope::error(req_id, Actor::Orchestrator, e.code(), e.to_string());
                        if let Err(e) = ctx.publish_reply(&reply).await {
                            error!(req_id = %req_id, error = %e, "failed to publish error reply");
                        }
                    }
                });
            }
            None => {
                warn!(capability = %capability, req_id = %envelope.req_id,
                    "command for unregistered capability");
                let reply = Envelope::error(
                    envelope.req_id,
                    Actor::Orchestrator,
                    Error::ModuleNotAvailable(capability.to_string()).code(),
                    format!("no handler registered for capability: {}", capability),
                );
                let topic = self.topics.coordinator_evt(capability);
                match reply.encode() {
                    Ok(payload) => {
                        if let Err(e) = self
                            .transport
                            .publish(&topic, payload, PublishOptions::transient())
                            .await
                        {
                            error!(error = %e, "failed to publish MODULE_NOT_AVAILABLE reply");
                        }
                    }
                    Err(e) => error!(error = %e, "failed to encode error reply"),
                }
            }
        }
    }

    /// Dispatch an unsolicited device event to its capability handler.
    /// Events without a handler are dropped with a log entry.
    pub async fn dispatch_device_event(
        &self,
        capability: &str,
        device_id: &str,
        envelope: Envelope,
    ) {
        let registered = {
            let handlers = self.handlers.read().await;
            handlers
                .get(capability)
                .map(|r| (r.handler.clone(), r.ctx.clone()))
        };

        match registered {
            Some((handler, ctx)) => {
                let device_id = device_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = handler.handle_device_event(&ctx, &device_id, envelope).await {
                        warn!(capability = %ctx.capability, device_id = %device_id, error = %e,
                            "device event handler failed");
                    }
                });
            }
            None => {
                debug!(capability = %capability, device_id = %device_id,
                    "event for unregistered capability, dropping");
            }
        }
    }
}
