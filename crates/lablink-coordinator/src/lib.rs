//! LabLink coordination core.
//!
//! This crate implements the coordination layer for a fleet of remote
//! device agents reached over an at-least-once publish/subscribe
//! transport:
//!
//! - **Registry** — reconciles presence/status messages (duplicated,
//!   reordered, or missing) into a consistent view of fleet state.
//! - **Correlator** — turns fire-and-forget pub/sub into
//!   synchronous-looking request/response with timeout, retry and
//!   duplicate suppression.
//! - **Lease manager** — exclusive, time-bounded control of a
//!   `(device, resource)` pair.
//! - **Capability router** — dispatches commands/events to feature
//!   handlers registered by name, without hard-wiring features into the
//!   coordinator.
//!
//! The transport is abstracted behind the [`Transport`] trait; an MQTT
//! implementation ([`MqttTransport`]) and an in-process one
//! ([`MemoryBroker`]/[`MemoryTransport`]) are provided.

pub mod coordinator;
pub mod correlator;
pub mod handlers;
pub mod lease;
pub mod mqtt;
pub mod registry;
pub mod router;
pub mod transport;

pub use coordinator::Coordinator;
pub use correlator::{Correlator, PendingRequest, SendOptions};
pub use handlers::PassthroughHandler;
pub use lease::{Lease, LeaseManager};
pub use mqtt::MqttTransport;
pub use registry::{Device, DeviceRegistry, DeviceStatus, RegistrySnapshot, StatusCounts};
pub use router::{CapabilityHandler, CapabilityRouter, HandlerContext};
pub use transport::{
    AckLevel, MemoryBroker, MemoryTransport, PublishOptions, Transport, TransportMessage,
};
