//! Device registry.
//!
//! Reconciles retained metadata announcements and periodic status reports
//! into a consistent fleet view. Messages may arrive duplicated, reordered
//! or not at all; the registry converges on last-writer-wins per device and
//! a periodic sweep demotes silent devices through `online -> stale ->
//! offline`.
//!
//! Wall-clock timestamps are kept for reporting; liveness decisions use a
//! monotonic clock so they survive wall-clock jumps.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use lablink_core::config::LivenessConfig;
use lablink_core::eventbus::{EventBus, FleetEvent};
use lablink_core::{Error, Result};

const EVENT_SOURCE: &str = "registry";

/// Liveness state of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Reporting within the online window.
    Online,
    /// Silent past the online window but not yet presumed gone.
    Stale,
    /// Silent past the offline window, or explicitly reported offline.
    Offline,
}

/// A device known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    /// Free-form grouping labels from the metadata announcement.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Capability modules the device claims to run.
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Platform facts (os, arch, agent version, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub platform: Map<String, Value>,
    pub status: DeviceStatus,
    /// Wall-clock time of the last message from this device.
    pub last_seen: DateTime<Utc>,
    /// Last telemetry fields from the status report.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub telemetry: Map<String, Value>,
    /// Last retained status per capability module.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub module_status: Map<String, Value>,
}

struct DeviceEntry {
    device: Device,
    /// Monotonic timestamp of the last message, used by the sweep.
    seen_at: Instant,
}

/// Aggregate counts for a snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub online: usize,
    pub stale: usize,
    pub offline: usize,
    pub total: usize,
}

/// Point-in-time view of the fleet, serialized onto the retained
/// registry topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub ts: DateTime<Utc>,
    pub devices: BTreeMap<String, Device>,
    pub counts: StatusCounts,
}

/// Shared fleet registry.
#[derive(Clone)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, DeviceEntry>>>,
    liveness: LivenessConfig,
    events: EventBus,
}

impl DeviceRegistry {
    pub fn new(liveness: LivenessConfig, events: EventBus) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            liveness,
            events,
        }
    }

    /// Apply a metadata announcement.
    ///
    /// Known fields are merged over the existing record; unknown fields are
    /// ignored. A malformed payload is rejected without touching the
    /// last-known-good record.
    pub async fn ingest_metadata(&self, device_id: &str, payload: &Value) -> Result<()> {
        let meta = payload
            .as_object()
            .ok_or_else(|| Error::InvalidParams("metadata payload must be an object".into()))?;

        let labels = string_list(meta.get("labels"))?;
        let modules = string_list(meta.get("modules"))?;
        let ip_address = match meta.get("ip_address") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                return Err(Error::InvalidParams("ip_address must be a string".into()));
            }
        };
        let platform = match meta.get("platform") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map.clone()),
            Some(_) => {
                return Err(Error::InvalidParams("platform must be an object".into()));
            }
        };

        let mut devices = self.devices.write().await;
        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceEntry {
                device: new_device(device_id, DeviceStatus::Online),
                seen_at: Instant::now(),
            });

        let was = entry.device.status;
        if let Some(labels) = labels {
            entry.device.labels = labels;
        }
        if let Some(modules) = modules {
            entry.device.modules = modules;
        }
        if ip_address.is_some() {
            entry.device.ip_address = ip_address;
        }
        if let Some(platform) = platform {
            entry.device.platform = platform;
        }
        entry.device.status = DeviceStatus::Online;
        entry.device.last_seen = Utc::now();
        entry.seen_at = Instant::now();

        if was != DeviceStatus::Online {
            info!(device_id = %device_id, "device online");
            self.events.publish(
                FleetEvent::DeviceOnline {
                    device_id: device_id.to_string(),
                },
                EVENT_SOURCE,
            );
        }
        Ok(())
    }

    /// Apply a status report.
    ///
    /// A report for an unknown device registers it implicitly as stale
    /// until metadata arrives. `online: false` forces the device offline;
    /// any other report from a known device marks it online. Remaining
    /// payload fields are kept as telemetry.
    pub async fn ingest_status(&self, device_id: &str, payload: &Value) -> Result<()> {
        let report = payload
            .as_object()
            .ok_or_else(|| Error::InvalidParams("status payload must be an object".into()))?;

        let online = match report.get("online") {
            None => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(_) => {
                return Err(Error::InvalidParams("online must be a boolean".into()));
            }
        };
        let telemetry: Map<String, Value> = report
            .iter()
            .filter(|(k, _)| k.as_str() != "online")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut devices = self.devices.write().await;
        let known = devices.contains_key(device_id);
        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceEntry {
                device: new_device(device_id, DeviceStatus::Stale),
                seen_at: Instant::now(),
            });

        let was = entry.device.status;
        let now = match (known, online) {
            (_, Some(false)) => DeviceStatus::Offline,
            // Status before metadata: hold at stale until the device
            // announces itself.
            (false, _) => DeviceStatus::Stale,
            (true, _) => DeviceStatus::Online,
        };

        entry.device.status = now;
        entry.device.last_seen = Utc::now();
        entry.device.telemetry = telemetry;
        entry.seen_at = Instant::now();

        if was != now {
            self.publish_transition(device_id, now);
        }
        Ok(())
    }

    /// Record the retained status of a capability module on a device.
    /// Reports for unknown devices are dropped.
    pub async fn ingest_capability_status(
        &self,
        device_id: &str,
        capability: &str,
        payload: Value,
    ) {
        let mut devices = self.devices.write().await;
        match devices.get_mut(device_id) {
            Some(entry) => {
                entry
                    .device
                    .module_status
                    .insert(capability.to_string(), payload);
                entry.device.last_seen = Utc::now();
                entry.seen_at = Instant::now();
            }
            None => {
                debug!(device_id = %device_id, capability = %capability,
                    "capability status for unknown device, dropping");
            }
        }
    }

    /// Demote devices that went silent past their liveness windows.
    /// Returns the transitions applied.
    pub async fn sweep(&self) -> Vec<(String, DeviceStatus)> {
        let online_timeout = self.liveness.online_timeout();
        let offline_timeout = self.liveness.offline_timeout();
        let now = Instant::now();

        let mut transitions = Vec::new();
        {
            let mut devices = self.devices.write().await;
            for (device_id, entry) in devices.iter_mut() {
                let silent = now.saturating_duration_since(entry.seen_at);
                let next = match entry.device.status {
                    DeviceStatus::Offline => continue,
                    _ if silent >= offline_timeout => DeviceStatus::Offline,
                    DeviceStatus::Online if silent >= online_timeout => DeviceStatus::Stale,
                    _ => continue,
                };
                entry.device.status = next;
                transitions.push((device_id.clone(), next));
            }
        }

        for (device_id, status) in &transitions {
            self.publish_transition(device_id, *status);
        }
        transitions
    }

    /// Remove a device from the registry.
    pub async fn remove(&self, device_id: &str) -> Result<Device> {
        let entry = self
            .devices
            .write()
            .await
            .remove(device_id)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;

        info!(device_id = %device_id, "device removed");
        self.events.publish(
            FleetEvent::DeviceRemoved {
                device_id: device_id.to_string(),
            },
            EVENT_SOURCE,
        );
        Ok(entry.device)
    }

    pub async fn get(&self, device_id: &str) -> Option<Device> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|e| e.device.clone())
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.devices.read().await.contains_key(device_id)
    }

    /// Build a point-in-time snapshot of the fleet.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let devices = self.devices.read().await;
        let mut counts = StatusCounts::default();
        let mut map = BTreeMap::new();
        for (device_id, entry) in devices.iter() {
            match entry.device.status {
                DeviceStatus::Online => counts.online += 1,
                DeviceStatus::Stale => counts.stale += 1,
                DeviceStatus::Offline => counts.offline += 1,
            }
            counts.total += 1;
            map.insert(device_id.clone(), entry.device.clone());
        }
        RegistrySnapshot {
            ts: Utc::now(),
            devices: map,
            counts,
        }
    }

    fn publish_transition(&self, device_id: &str, status: DeviceStatus) {
        let device_id = device_id.to_string();
        let event = match status {
            DeviceStatus::Online => FleetEvent::DeviceOnline { device_id },
            DeviceStatus::Stale => FleetEvent::DeviceStale { device_id },
            DeviceStatus::Offline => FleetEvent::DeviceOffline { device_id },
        };
        self.events.publish(event, EVENT_SOURCE);
    }
}

fn new_device(device_id: &str, status: DeviceStatus) -> Device {
    Device {
        device_id: device_id.to_string(),
        labels: Vec::new(),
        modules: Vec::new(),
        ip_address: None,
        platform: Map::new(),
        status,
        last_seen: Utc::now(),
        telemetry: Map::new(),
        module_status: Map::new(),
    }
}

fn string_list(value: Option<&Value>) -> Result<Option<Vec<String>>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => out.push(s.clone()),
                    _ => {
                        return Err(Error::InvalidParams(
                            "expected an array of strings".into(),
                        ))
                    }
                }
            }
            Ok(Some(out))
        }
        Some(_) => Err(Error::InvalidParams("expected an array of strings".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(
            LivenessConfig {
                online_timeout_secs: 30,
                offline_timeout_secs: 120,
                sweep_interval_secs: 5,
            },
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn test_metadata_registers_online() {
        let reg = registry();
        reg.ingest_metadata(
            "dev-1",
            &json!({"labels": ["studio-a"], "modules": ["ndi"], "ip_address": "10.0.0.5"}),
        )
        .await
        .unwrap();

        let device = reg.get("dev-1").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.modules, vec!["ndi"]);
        assert_eq!(device.ip_address.as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_malformed_metadata_keeps_last_known_good() {
        let reg = registry();
        reg.ingest_metadata("dev-1", &json!({"labels": ["studio-a"]}))
            .await
            .unwrap();

        assert!(reg
            .ingest_metadata("dev-1", &json!({"labels": "not-a-list"}))
            .await
            .is_err());
        assert!(reg.ingest_metadata("dev-1", &json!("garbage")).await.is_err());

        let device = reg.get("dev-1").await.unwrap();
        assert_eq!(device.labels, vec!["studio-a"]);
    }

    #[tokio::test]
    async fn test_status_before_metadata_is_stale() {
        let reg = registry();
        reg.ingest_status("dev-1", &json!({"online": true, "cpu": 0.4}))
            .await
            .unwrap();

        let device = reg.get("dev-1").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Stale);
        assert_eq!(device.telemetry["cpu"], json!(0.4));

        // Metadata arriving afterwards promotes to online.
        reg.ingest_metadata("dev-1", &json!({"modules": ["ndi"]}))
            .await
            .unwrap();
        assert_eq!(reg.get("dev-1").await.unwrap().status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn test_explicit_offline_report() {
        let reg = registry();
        reg.ingest_metadata("dev-1", &json!({})).await.unwrap();
        reg.ingest_status("dev-1", &json!({"online": false}))
            .await
            .unwrap();
        assert_eq!(
            reg.get("dev-1").await.unwrap().status,
            DeviceStatus::Offline
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_demotes_silent_devices() {
        let reg = registry();
        reg.ingest_metadata("dev-1", &json!({})).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let transitions = reg.sweep().await;
        assert_eq!(transitions, vec![("dev-1".to_string(), DeviceStatus::Stale)]);

        tokio::time::advance(Duration::from_secs(90)).await;
        let transitions = reg.sweep().await;
        assert_eq!(
            transitions,
            vec![("dev-1".to_string(), DeviceStatus::Offline)]
        );

        // Already offline: sweep is idempotent.
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(reg.sweep().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_resurrects_swept_device() {
        let reg = registry();
        reg.ingest_metadata("dev-1", &json!({})).await.unwrap();
        tokio::time::advance(Duration::from_secs(130)).await;
        reg.sweep().await;
        assert_eq!(
            reg.get("dev-1").await.unwrap().status,
            DeviceStatus::Offline
        );

        reg.ingest_status("dev-1", &json!({"online": true}))
            .await
            .unwrap();
        assert_eq!(reg.get("dev-1").await.unwrap().status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn test_remove_unknown_device() {
        let reg = registry();
        assert!(matches!(
            reg.remove("ghost").await,
            Err(Error::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_counts() {
        let reg = registry();
        reg.ingest_metadata("dev-1", &json!({})).await.unwrap();
        reg.ingest_status("dev-2", &json!({})).await.unwrap();

        let snapshot = reg.snapshot().await;
        assert_eq!(snapshot.counts.total, 2);
        assert_eq!(snapshot.counts.online, 1);
        assert_eq!(snapshot.counts.stale, 1);
        assert!(snapshot.devices.contains_key("dev-1"));
    }

    #[tokio::test]
    async fn test_duplicate_metadata_is_idempotent() {
        let reg = registry();
        let meta = json!({"labels": ["studio-a"], "modules": ["ndi"]});
        reg.ingest_metadata("dev-1", &meta).await.unwrap();
        reg.ingest_metadata("dev-1", &meta).await.unwrap();

        let snapshot = reg.snapshot().await;
        assert_eq!(snapshot.counts.total, 1);
        assert_eq!(snapshot.counts.online, 1);
    }
}
