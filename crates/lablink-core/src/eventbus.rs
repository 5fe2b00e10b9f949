//! Event bus for coordinator lifecycle notifications.
//!
//! Components publish [`FleetEvent`]s when fleet state changes; interested
//! parties (the API layer, tests, future observers) subscribe. The bus is
//! a broadcast channel: slow subscribers may drop old events, publishers
//! never block.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Fleet lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    /// A device announced itself or resumed reporting.
    DeviceOnline { device_id: String },
    /// A device missed its liveness window.
    DeviceStale { device_id: String },
    /// A device went silent past the offline window or reported offline.
    DeviceOffline { device_id: String },
    /// A device was administratively removed.
    DeviceRemoved { device_id: String },
    /// A lease was granted or renewed.
    LeaseGranted {
        device_id: String,
        resource: String,
        holder: String,
        renewed: bool,
    },
    /// A lease ended, either explicitly or by expiry.
    LeaseReleased {
        device_id: String,
        resource: String,
        holder: String,
        expired: bool,
    },
    /// A pending request resolved with a response.
    RequestResolved { req_id: Uuid, success: bool },
    /// A pending request exhausted its retry window.
    RequestExpired { req_id: Uuid, device_id: String },
}

/// Metadata attached to every published event.
#[derive(Debug, Clone)]
pub struct EventMetadata {
    /// Component that published the event.
    pub source: String,
    /// Publication timestamp.
    pub ts: DateTime<Utc>,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ts: Utc::now(),
        }
    }
}

/// Broadcast event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(FleetEvent, EventMetadata)>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus buffering up to `capacity` events for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event. Returns `true` if at least one subscriber got it.
    pub fn publish(&self, event: FleetEvent, source: &str) -> bool {
        self.tx.send((event, EventMetadata::new(source))).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to events matching a filter predicate.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&FleetEvent) -> bool + Send + 'static,
    {
        FilteredReceiver {
            rx: self.tx.subscribe(),
            filter,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all events.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(FleetEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event. Returns `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<(FleetEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(pair) => return Some(pair),
                // Missed events under lag; keep receiving from where we are.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Receiver delivering only events that pass a filter.
pub struct FilteredReceiver<F> {
    rx: broadcast::Receiver<(FleetEvent, EventMetadata)>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&FleetEvent) -> bool,
{
    /// Receive the next matching event. Returns `None` once the bus closes.
    pub async fn recv(&mut self) -> Option<(FleetEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
