//! Time-bounded exclusive leases on `(device, resource)` pairs.
//!
//! A lease grants one holder exclusive use of a resource on a device until
//! it is released or its TTL lapses. Expiry is lazy on every lookup plus a
//! periodic sweep, so a crashed holder can never wedge a resource.
//! Deadlines use the monotonic clock; wall-clock times are reporting only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use lablink_core::eventbus::{EventBus, FleetEvent};
use lablink_core::{Error, Result};

use crate::registry::DeviceRegistry;

const EVENT_SOURCE: &str = "leases";

/// An active lease.
#[derive(Debug, Clone, Serialize)]
pub struct Lease {
    pub device_id: String,
    pub resource: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Free-form reason recorded at acquisition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

struct LeaseEntry {
    lease: Lease,
    deadline: Instant,
}

impl LeaseEntry {
    fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Lease table guarding device resources.
#[derive(Clone)]
pub struct LeaseManager {
    leases: Arc<RwLock<HashMap<(String, String), LeaseEntry>>>,
    registry: DeviceRegistry,
    events: EventBus,
}

impl LeaseManager {
    pub fn new(registry: DeviceRegistry, events: EventBus) -> Self {
        Self {
            leases: Arc::new(RwLock::new(HashMap::new())),
            registry,
            events,
        }
    }

    /// Acquire or renew a lease.
    ///
    /// Fails with `DeviceNotFound` for unregistered devices and
    /// `ResourceBusy` when another holder owns an unexpired lease. The
    /// current holder re-acquiring renews: the deadline moves to
    /// `now + ttl`.
    pub async fn acquire(
        &self,
        device_id: &str,
        resource: &str,
        holder: &str,
        ttl: Duration,
        reason: Option<String>,
    ) -> Result<Lease> {
        if !self.registry.contains(device_id).await {
            return Err(Error::DeviceNotFound(device_id.to_string()));
        }

        let now = Instant::now();
        let key = (device_id.to_string(), resource.to_string());
        let mut leases = self.leases.write().await;

        // Renewal keeps the original acquisition time.
        let prior = match leases.get(&key) {
            Some(entry) if !entry.expired(now) => {
                if entry.lease.holder != holder {
                    return Err(Error::ResourceBusy {
                        device_id: device_id.to_string(),
                        resource: resource.to_string(),
                        holder: entry.lease.holder.clone(),
                    });
                }
                Some(entry.lease.acquired_at)
            }
            _ => None,
        };
        let renewed = prior.is_some();
        let acquired_at = prior.unwrap_or_else(Utc::now);
        let lease = Lease {
            device_id: device_id.to_string(),
            resource: resource.to_string(),
            holder: holder.to_string(),
            acquired_at,
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0)),
            reason,
        };
        leases.insert(
            key,
            LeaseEntry {
                lease: lease.clone(),
                deadline: now + ttl,
            },
        );
        drop(leases);

        info!(device_id = %device_id, resource = %resource, holder = %holder,
            renewed, "lease granted");
        self.events.publish(
            FleetEvent::LeaseGranted {
                device_id: device_id.to_string(),
                resource: resource.to_string(),
                holder: holder.to_string(),
                renewed,
            },
            EVENT_SOURCE,
        );
        Ok(lease)
    }

    /// Release a lease held by `holder`.
    ///
    /// Only the holder may release; anyone else gets `PermissionDenied`.
    /// Releasing an expired or absent lease is also `PermissionDenied`,
    /// since the caller no longer holds anything.
    pub async fn release(&self, device_id: &str, resource: &str, holder: &str) -> Result<()> {
        let key = (device_id.to_string(), resource.to_string());
        let now = Instant::now();
        let mut leases = self.leases.write().await;

        let entry = leases.get(&key).filter(|e| !e.expired(now)).ok_or_else(|| {
            Error::PermissionDenied(format!("no active lease on {}/{}", device_id, resource))
        })?;
        if entry.lease.holder != holder {
            return Err(Error::PermissionDenied(format!(
                "lease on {}/{} held by {}",
                device_id, resource, entry.lease.holder
            )));
        }
        let entry = match leases.remove(&key) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        drop(leases);

        info!(device_id = %device_id, resource = %resource, holder = %holder, "lease released");
        self.publish_released(entry.lease, false);
        Ok(())
    }

    /// Current holder of `(device, resource)`, if the lease is unexpired.
    /// An expired lease found here is dropped on the spot.
    pub async fn check(&self, device_id: &str, resource: &str) -> Option<Lease> {
        let key = (device_id.to_string(), resource.to_string());
        let now = Instant::now();
        let mut leases = self.leases.write().await;
        match leases.get(&key) {
            Some(entry) if entry.expired(now) => {
                let entry = leases.remove(&key);
                drop(leases);
                if let Some(entry) = entry {
                    self.publish_released(entry.lease, true);
                }
                None
            }
            Some(entry) => Some(entry.lease.clone()),
            None => None,
        }
    }

    /// Drop every expired lease. Returns how many were reaped.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let reaped: Vec<Lease> = {
            let mut leases = self.leases.write().await;
            let keys: Vec<(String, String)> = leases
                .iter()
                .filter(|(_, e)| e.expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter()
                .filter_map(|k| leases.remove(k))
                .map(|e| e.lease)
                .collect()
        };

        for lease in &reaped {
            debug!(device_id = %lease.device_id, resource = %lease.resource,
                holder = %lease.holder, "lease expired");
        }
        let count = reaped.len();
        for lease in reaped {
            self.publish_released(lease, true);
        }
        count
    }

    /// Revoke every lease on a device, expired or not. Used when a device
    /// is removed from the fleet.
    pub async fn revoke_device(&self, device_id: &str) -> Vec<Lease> {
        let revoked: Vec<Lease> = {
            let mut leases = self.leases.write().await;
            let keys: Vec<(String, String)> = leases
                .keys()
                .filter(|(d, _)| d == device_id)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|k| leases.remove(k))
                .map(|e| e.lease)
                .collect()
        };

        for lease in &revoked {
            self.publish_released(lease.clone(), false);
        }
        revoked
    }

    /// All unexpired leases.
    pub async fn active(&self) -> Vec<Lease> {
        let now = Instant::now();
        self.leases
            .read()
            .await
            .values()
            .filter(|e| !e.expired(now))
            .map(|e| e.lease.clone())
            .collect()
    }

    fn publish_released(&self, lease: Lease, expired: bool) {
        self.events.publish(
            FleetEvent::LeaseReleased {
                device_id: lease.device_id,
                resource: lease.resource,
                holder: lease.holder,
                expired,
            },
            EVENT_SOURCE,
        );
    }
}
