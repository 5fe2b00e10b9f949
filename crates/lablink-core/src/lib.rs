//! Core types for the LabLink fleet coordinator.
//!
//! This crate defines the foundational pieces shared by every other crate:
//! the message envelope and its wire codec, the error taxonomy, the MQTT
//! topic hierarchy, coordinator configuration, and the event bus used for
//! in-process lifecycle notifications.

pub mod config;
pub mod envelope;
pub mod error;
pub mod eventbus;
pub mod topic;

pub use config::{CoordinatorConfig, LivenessConfig, MqttConfig, RetryConfig};
pub use envelope::{Actor, Envelope, MAX_PAYLOAD_BYTES};
pub use error::{Error, ErrorCode, Result};
pub use eventbus::{EventBus, EventBusReceiver, FilteredReceiver, FleetEvent};
pub use topic::{InboundTopic, TopicSpace, filter_matches};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
