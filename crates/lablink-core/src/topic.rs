//! MQTT topic hierarchy for the coordination namespace.
//!
//! All producers and consumers build topics through [`TopicSpace`] so the
//! layout stays consistent across the coordinator, the API and device
//! agents:
//!
//! - `{root}/device/{device_id}/meta` (retained), `/status` (retained),
//!   `/cmd`, `/evt`
//! - `{root}/device/{device_id}/{capability}/cmd`, `/cfg` (retained),
//!   `/status` (retained), `/evt`
//! - `{root}/coordinator/registry` (retained snapshot)
//! - `{root}/coordinator/{capability}/cmd`, `/evt`

/// Typed view of an inbound topic the coordinator consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    /// Retained device metadata announcement.
    DeviceMeta { device_id: String },
    /// Retained device liveness/status report.
    DeviceStatus { device_id: String },
    /// Device-level event or command response.
    DeviceEvent { device_id: String },
    /// Retained per-capability status report.
    CapabilityStatus {
        device_id: String,
        capability: String,
    },
    /// Per-capability event or command response.
    CapabilityEvent {
        device_id: String,
        capability: String,
    },
    /// Command submitted to a coordinator-side capability handler.
    CoordinatorCommand { capability: String },
}

/// Topic builder rooted at a configurable namespace.
#[derive(Debug, Clone)]
pub struct TopicSpace {
    root: String,
}

impl TopicSpace {
    /// Create a topic space. Leading/trailing slashes in `root` are trimmed.
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            root: root.trim_matches('/').to_string(),
        }
    }

    /// The root namespace.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn device_meta(&self, device_id: &str) -> String {
        format!("{}/device/{}/meta", self.root, device_id)
    }

    pub fn device_status(&self, device_id: &str) -> String {
        format!("{}/device/{}/status", self.root, device_id)
    }

    pub fn device_cmd(&self, device_id: &str) -> String {
        format!("{}/device/{}/cmd", self.root, device_id)
    }

    pub fn device_evt(&self, device_id: &str) -> String {
        format!("{}/device/{}/evt", self.root, device_id)
    }

    pub fn capability_cmd(&self, device_id: &str, capability: &str) -> String {
        format!("{}/device/{}/{}/cmd", self.root, device_id, capability)
    }

    pub fn capability_cfg(&self, device_id: &str, capability: &str) -> String {
        format!("{}/device/{}/{}/cfg", self.root, device_id, capability)
    }

    pub fn capability_status(&self, device_id: &str, capability: &str) -> String {
        format!("{}/device/{}/{}/status", self.root, device_id, capability)
    }

    pub fn capability_evt(&self, device_id: &str, capability: &str) -> String {
        format!("{}/device/{}/{}/evt", self.root, device_id, capability)
    }

    pub fn coordinator_registry(&self) -> String {
        format!("{}/coordinator/registry", self.root)
    }

    pub fn coordinator_cmd(&self, capability: &str) -> String {
        format!("{}/coordinator/{}/cmd", self.root, capability)
    }

    pub fn coordinator_evt(&self, capability: &str) -> String {
        format!("{}/coordinator/{}/evt", self.root, capability)
    }

    /// The subscription filters the coordinator needs.
    pub fn coordinator_subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}/device/+/meta", self.root),
            format!("{}/device/+/status", self.root),
            format!("{}/device/+/evt", self.root),
            format!("{}/device/+/+/status", self.root),
            format!("{}/device/+/+/evt", self.root),
            format!("{}/coordinator/+/cmd", self.root),
        ]
    }

    /// Parse a concrete topic into its typed inbound form.
    ///
    /// Returns `None` for topics outside this namespace or ones the
    /// coordinator does not consume (e.g. its own outbound `cmd` topics).
    pub fn parse(&self, topic: &str) -> Option<InboundTopic> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.first() != Some(&self.root.as_str()) {
            return None;
        }

        match parts.as_slice() {
            [_, "device", device_id, leaf] => match *leaf {
                "meta" => Some(InboundTopic::DeviceMeta {
                    device_id: device_id.to_string(),
                }),
                "status" => Some(InboundTopic::DeviceStatus {
                    device_id: device_id.to_string(),
                }),
                "evt" => Some(InboundTopic::DeviceEvent {
                    device_id: device_id.to_string(),
                }),
                _ => None,
            },
            [_, "device", device_id, capability, leaf] => match *leaf {
                "status" => Some(InboundTopic::CapabilityStatus {
                    device_id: device_id.to_string(),
                    capability: capability.to_string(),
                }),
                "evt" => Some(InboundTopic::CapabilityEvent {
                    device_id: device_id.to_string(),
                    capability: capability.to_string(),
                }),
                _ => None,
            },
            [_, "coordinator", capability, "cmd"] => Some(InboundTopic::CoordinatorCommand {
                capability: capability.to_string(),
            }),
            _ => None,
        }
    }
}

/// Match a concrete topic against an MQTT filter with `+`/`#` wildcards.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');

    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(fl), Some(tl)) if fl == tl => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_builders() {
        let t = TopicSpace::new("lab");
        assert_eq!(t.device_meta("dev-1"), "lab/device/dev-1/meta");
        assert_eq!(t.capability_cmd("dev-1", "ndi"), "lab/device/dev-1/ndi/cmd");
        assert_eq!(t.coordinator_registry(), "lab/coordinator/registry");
        assert_eq!(t.coordinator_evt("ndi"), "lab/coordinator/ndi/evt");
    }

    #[test]
    fn test_root_trimming() {
        let t = TopicSpace::new("/lab/");
        assert_eq!(t.device_cmd("dev-1"), "lab/device/dev-1/cmd");
    }

    #[test]
    fn test_parse_device_topics() {
        let t = TopicSpace::new("lab");
        assert_eq!(
            t.parse("lab/device/dev-1/meta"),
            Some(InboundTopic::DeviceMeta {
                device_id: "dev-1".into()
            })
        );
        assert_eq!(
            t.parse("lab/device/dev-1/ndi/evt"),
            Some(InboundTopic::CapabilityEvent {
                device_id: "dev-1".into(),
                capability: "ndi".into()
            })
        );
        assert_eq!(
            t.parse("lab/coordinator/ndi/cmd"),
            Some(InboundTopic::CoordinatorCommand {
                capability: "ndi".into()
            })
        );
        // Outbound-only and foreign topics parse to nothing.
        assert_eq!(t.parse("lab/device/dev-1/cmd"), None);
        assert_eq!(t.parse("other/device/dev-1/meta"), None);
        assert_eq!(t.parse("lab/coordinator/registry"), None);
    }

    #[test]
    fn test_filter_matching() {
        assert!(filter_matches("lab/device/+/meta", "lab/device/dev-1/meta"));
        assert!(filter_matches("lab/device/+/+/evt", "lab/device/dev-1/ndi/evt"));
        assert!(filter_matches("lab/#", "lab/coordinator/ndi/cmd"));
        assert!(!filter_matches("lab/device/+/meta", "lab/device/dev-1/status"));
        assert!(!filter_matches("lab/device/+/meta", "lab/device/dev-1/ndi/meta"));
        assert!(!filter_matches("lab/device/+/+/evt", "lab/device/dev-1/evt"));
    }
}
