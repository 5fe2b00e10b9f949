//! Coordinator runtime.
//!
//! Owns the transport, wires the registry, correlator, lease manager and
//! capability router together, and runs the background loops: the inbound
//! message pump, the registry liveness sweep and the lease expiry sweep.
//! Every fleet state change republishes the retained registry snapshot so
//! late subscribers always see current state.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lablink_core::config::CoordinatorConfig;
use lablink_core::envelope::{Actor, Envelope};
use lablink_core::eventbus::EventBus;
use lablink_core::topic::{InboundTopic, TopicSpace};
use lablink_core::{Error, ErrorCode, Result};

use crate::correlator::Correlator;
use crate::lease::LeaseManager;
use crate::registry::{Device, DeviceRegistry};
use crate::router::{CapabilityHandler, CapabilityRouter};
use crate::transport::{PublishOptions, Transport, TransportMessage};

/// The assembled coordination service.
#[derive(Clone)]
pub struct Coordinator {
    config: CoordinatorConfig,
    topics: TopicSpace,
    transport: Arc<dyn Transport>,
    registry: DeviceRegistry,
    correlator: Correlator,
    leases: LeaseManager,
    router: CapabilityRouter,
    events: EventBus,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, transport: Arc<dyn Transport>) -> Self {
        let topics = TopicSpace::new(config.root.clone());
        let events = EventBus::new();
        let registry = DeviceRegistry::new(config.liveness.clone(), events.clone());
        let correlator = Correlator::new(transport.clone(), config.retry.clone(), events.clone());
        let leases = LeaseManager::new(registry.clone(), events.clone());
        let router = CapabilityRouter::new(
            correlator.clone(),
            leases.clone(),
            registry.clone(),
            transport.clone(),
            topics.clone(),
            config.retry.clone(),
        );
        Self {
            config,
            topics,
            transport,
            registry,
            correlator,
            leases,
            router,
            events,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn topics(&self) -> &TopicSpace {
        &self.topics
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn router(&self) -> &CapabilityRouter {
        &self.router
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register a capability handler.
    pub async fn register_capability(&self, name: &str, handler: Arc<dyn CapabilityHandler>) {
        self.router.register(name, handler).await;
        self.publish_snapshot().await;
    }

    /// Subscribe, start the background loops and publish the initial
    /// snapshot. Call once.
    pub async fn start(&self) -> Result<()> {
        self.transport
            .subscribe(&self.topics.coordinator_subscriptions())
            .await?;
        let mut inbound = self
            .transport
            .take_inbound()
            .await
            .ok_or_else(|| Error::Network("inbound stream already taken".into()))?;

        let pump = self.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                pump.route(message).await;
            }
            info!("inbound stream closed, coordinator pump stopping");
        });

        let sweeper = self.clone();
        let mut registry_tick = tokio::time::interval(self.config.liveness.sweep_interval());
        tokio::spawn(async move {
            loop {
                registry_tick.tick().await;
                if !sweeper.registry.sweep().await.is_empty() {
                    sweeper.publish_snapshot().await;
                }
            }
        });

        let reaper = self.clone();
        let mut lease_tick = tokio::time::interval(self.config.lease_sweep_interval());
        tokio::spawn(async move {
            loop {
                lease_tick.tick().await;
                reaper.leases.sweep().await;
                reaper.correlator.prune_abandoned().await;
            }
        });

        self.publish_snapshot().await;
        info!(root = %self.topics.root(), "coordinator started");
        Ok(())
    }

    /// Submit a command to a capability from inside the process (the API
    /// layer). Returns the command's `req_id`; the outcome arrives on the
    /// capability's reply path.
    pub async fn submit_command(&self, capability: &str, envelope: Envelope) -> Result<Uuid> {
        envelope.validate()?;
        if !envelope.is_command() {
            return Err(Error::InvalidParams("expected a command envelope".into()));
        }
        let req_id = envelope.req_id;
        self.router.dispatch_command(capability, envelope).await;
        Ok(req_id)
    }

    /// Remove a device from the fleet.
    ///
    /// Cascades: revokes its leases, fails its pending requests with
    /// `DEVICE_NOT_FOUND`, clears its retained topics and republishes the
    /// snapshot.
    pub async fn remove_device(&self, device_id: &str) -> Result<Device> {
        let device = self.registry.remove(device_id).await?;

        let revoked = self.leases.revoke_device(device_id).await;
        let cancelled = self
            .correlator
            .cancel_device(device_id, ErrorCode::DeviceNotFound)
            .await;
        info!(device_id = %device_id, leases = revoked.len(), pending = cancelled,
            "device removal cascaded");

        self.clear_retained(&self.topics.device_meta(device_id)).await;
        self.clear_retained(&self.topics.device_status(device_id)).await;
        for module in &device.modules {
            self.clear_retained(&self.topics.capability_status(device_id, module))
                .await;
            self.clear_retained(&self.topics.capability_cfg(device_id, module))
                .await;
        }

        self.publish_snapshot().await;
        Ok(device)
    }

    /// Publish the retained registry snapshot.
    pub async fn publish_snapshot(&self) {
        let snapshot = self.registry.snapshot().await;
        let mut value = match serde_json::to_value(&snapshot) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to serialize registry snapshot");
                return;
            }
        };
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "capabilities".to_string(),
                Value::from(self.router.capabilities().await),
            );
        }
        let payload = value.to_string().into_bytes();
        if let Err(e) = self
            .transport
            .publish(
                &self.topics.coordinator_registry(),
                payload,
                PublishOptions::retained(),
            )
            .await
        {
            warn!(error = %e, "failed to publish registry snapshot");
        }
    }

    async fn route(&self, message: TransportMessage) {
        // Empty retained payloads are slot clears, not messages.
        if message.payload.is_empty() {
            return;
        }
        let topic = match self.topics.parse(&message.topic) {
            Some(topic) => topic,
            None => {
                debug!(topic = %message.topic, "message outside coordinator namespace");
                return;
            }
        };

        match topic {
            InboundTopic::DeviceMeta { device_id } => {
                match parse_json(&message.payload) {
                    Ok(value) => match self.registry.ingest_metadata(&device_id, &value).await {
                        Ok(()) => self.publish_snapshot().await,
                        Err(e) => {
                            warn!(device_id = %device_id, error = %e, "rejected metadata")
                        }
                    },
                    Err(e) => warn!(device_id = %device_id, error = %e, "unparseable metadata"),
                }
            }
            InboundTopic::DeviceStatus { device_id } => {
                match parse_json(&message.payload) {
                    Ok(value) => match self.registry.ingest_status(&device_id, &value).await {
                        Ok(()) => self.publish_snapshot().await,
                        Err(e) => {
                            warn!(device_id = %device_id, error = %e, "rejected status report")
                        }
                    },
                    Err(e) => {
                        warn!(device_id = %device_id, error = %e, "unparseable status report")
                    }
                }
            }
            InboundTopic::CapabilityStatus {
                device_id,
                capability,
            } => match parse_json(&message.payload) {
                Ok(value) => {
                    self.registry
                        .ingest_capability_status(&device_id, &capability, value)
                        .await;
                    self.publish_snapshot().await;
                }
                Err(e) => {
                    warn!(device_id = %device_id, capability = %capability, error = %e,
                        "unparseable capability status")
                }
            },
            InboundTopic::DeviceEvent { device_id } => match Envelope::decode(&message.payload) {
                Ok(envelope) => {
                    if !self.correlator.resolve(&envelope).await {
                        debug!(device_id = %device_id, req_id = %envelope.req_id,
                            "unsolicited device event, dropping");
                    }
                }
                Err(e) => debug!(device_id = %device_id, error = %e, "unparseable device event"),
            },
            InboundTopic::CapabilityEvent {
                device_id,
                capability,
            } => match Envelope::decode(&message.payload) {
                Ok(envelope) => {
                    // Responses to pending requests resolve there; anything
                    // else is an unsolicited module event for the handler.
                    if !self.correlator.resolve(&envelope).await {
                        self.router
                            .dispatch_device_event(&capability, &device_id, envelope)
                            .await;
                    }
                }
                Err(e) => {
                    debug!(device_id = %device_id, capability = %capability, error = %e,
                        "unparseable capability event")
                }
            },
            InboundTopic::CoordinatorCommand { capability } => {
                match Envelope::decode(&message.payload) {
                    Ok(envelope) => self.router.dispatch_command(&capability, envelope).await,
                    Err(e) => {
                        // Reply with INVALID_PARAMS when the sender at
                        // least gave us a correlatable req_id.
                        match extract_req_id(&message.payload) {
                            Some(req_id) => {
                                warn!(capability = %capability, req_id = %req_id, error = %e,
                                    "malformed command");
                                let reply = Envelope::error(
                                    req_id,
                                    Actor::Orchestrator,
                                    ErrorCode::InvalidParams,
                                    e.to_string(),
                                );
                                self.publish_reply(&capability, &reply).await;
                            }
                            None => {
                                warn!(capability = %capability, error = %e,
                                    "malformed command without req_id, dropping")
                            }
                        }
                    }
                }
            }
        }
    }

    async fn publish_reply(&self, capability: &str, envelope: &Envelope) {
        let topic = self.topics.coordinator_evt(capability);
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode reply envelope");
                return;
            }
        };
        if let Err(e) = self
            .transport
            .publish(&topic, payload, PublishOptions::transient())
            .await
        {
            warn!(topic = %topic, error = %e, "failed to publish reply");
        }
    }

    async fn clear_retained(&self, topic: &str) {
        if let Err(e) = self
            .transport
            .publish(topic, Vec::new(), PublishOptions::retained())
            .await
        {
            warn!(topic = %topic, error = %e, "failed to clear retained topic");
        }
    }
}

fn parse_json(payload: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(payload)?)
}

/// Best-effort `req_id` extraction from a payload that failed envelope
/// validation.
fn extract_req_id(payload: &[u8]) -> Option<Uuid> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    value
        .get("req_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}
