//! Transport abstraction over the pub/sub fabric.
//!
//! The coordinator only ever talks to a [`Transport`]: publish bytes to a
//! topic, subscribe to filters, and drain one inbound message stream. The
//! production implementation is [`crate::MqttTransport`]; tests use the
//! in-process [`MemoryBroker`] which honors retained messages, wildcard
//! filters and at-least-once redelivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};

use lablink_core::topic::filter_matches;
use lablink_core::Result;

/// Delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckLevel {
    /// Best effort, no broker acknowledgement.
    FireAndForget,
    /// Broker-acknowledged, may be delivered more than once.
    AtLeastOnce,
}

/// Per-publish options.
#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    /// Retain the message on the broker for late subscribers.
    pub retain: bool,
    /// Requested delivery guarantee.
    pub ack: AckLevel,
}

impl PublishOptions {
    /// At-least-once, not retained. The default for commands and events.
    pub fn transient() -> Self {
        Self {
            retain: false,
            ack: AckLevel::AtLeastOnce,
        }
    }

    /// At-least-once and retained. Used for current-state topics.
    pub fn retained() -> Self {
        Self {
            retain: true,
            ack: AckLevel::AtLeastOnce,
        }
    }
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self::transient()
    }
}

/// A message delivered from the transport.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Pub/sub transport used by the coordinator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `payload` to `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()>;

    /// Subscribe to the given topic filters. Retained messages matching a
    /// new filter are replayed into the inbound stream.
    async fn subscribe(&self, filters: &[String]) -> Result<()>;

    /// Take the inbound message stream. Yields `None` after the first call;
    /// there is exactly one consumer.
    async fn take_inbound(&self) -> Option<mpsc::Receiver<TransportMessage>>;
}

const CLIENT_CHANNEL_CAPACITY: usize = 256;

struct BrokerClient {
    filters: Vec<String>,
    tx: mpsc::Sender<TransportMessage>,
}

struct BrokerState {
    clients: Vec<BrokerClient>,
    /// Retained payload per topic; an empty publish clears the slot.
    retained: HashMap<String, Vec<u8>>,
    /// Every accepted publish, in order, for test assertions.
    log: Vec<TransportMessage>,
}

/// In-process broker for tests and examples.
///
/// Mirrors the broker behaviors the coordinator depends on: wildcard
/// subscription filters, retained replay on subscribe, and delivery to
/// every matching client including the publisher itself.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<RwLock<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(BrokerState {
                clients: Vec::new(),
                retained: HashMap::new(),
                log: Vec::new(),
            })),
        }
    }

    /// Connect a new client to this broker.
    pub async fn client(&self) -> MemoryTransport {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        let mut state = self.state.write().await;
        state.clients.push(BrokerClient {
            filters: Vec::new(),
            tx,
        });
        let index = state.clients.len() - 1;
        MemoryTransport {
            broker: self.clone(),
            index,
            inbound: Arc::new(Mutex::new(Some(rx))),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Topics published so far, oldest first, filtered by an MQTT filter.
    pub async fn published(&self, filter: &str) -> Vec<TransportMessage> {
        let state = self.state.read().await;
        state
            .log
            .iter()
            .filter(|m| filter_matches(filter, &m.topic))
            .cloned()
            .collect()
    }

    /// Current retained payload for a topic, if any.
    pub async fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state.read().await.retained.get(topic).cloned()
    }

    /// Redeliver the most recent publish matching `filter` to all
    /// subscribers. Simulates at-least-once duplicate delivery.
    pub async fn redeliver_last(&self, filter: &str) -> bool {
        let message = {
            let state = self.state.read().await;
            state
                .log
                .iter()
                .rev()
                .find(|m| filter_matches(filter, &m.topic))
                .cloned()
        };
        match message {
            Some(message) => {
                self.deliver(&message).await;
                true
            }
            None => false,
        }
    }

    async fn deliver(&self, message: &TransportMessage) {
        let state = self.state.read().await;
        for client in &state.clients {
            if client
                .filters
                .iter()
                .any(|f| filter_matches(f, &message.topic))
            {
                // A full client buffer drops the message, like a broker
                // shedding a slow consumer.
                let _ = client.tx.try_send(message.clone());
            }
        }
    }

    async fn publish(&self, message: TransportMessage, options: PublishOptions) {
        {
            let mut state = self.state.write().await;
            if options.retain {
                if message.payload.is_empty() {
                    state.retained.remove(&message.topic);
                } else {
                    state
                        .retained
                        .insert(message.topic.clone(), message.payload.clone());
                }
            }
            state.log.push(message.clone());
        }
        self.deliver(&message).await;
    }

    async fn subscribe(&self, index: usize, filters: &[String]) {
        let replay: Vec<TransportMessage> = {
            let mut state = self.state.write().await;
            let retained: Vec<TransportMessage> = state
                .retained
                .iter()
                .filter(|(topic, _)| filters.iter().any(|f| filter_matches(f, topic)))
                .map(|(topic, payload)| TransportMessage {
                    topic: topic.clone(),
                    payload: payload.clone(),
                })
                .collect();
            state.clients[index]
                .filters
                .extend(filters.iter().cloned());
            retained
        };

        let state = self.state.read().await;
        for message in replay {
            let _ = state.clients[index].tx.try_send(message);
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// A client connection to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    index: usize,
    inbound: Arc<Mutex<Option<mpsc::Receiver<TransportMessage>>>>,
    online: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Simulate link loss: while offline, publishes are silently dropped
    /// (the caller still sees success, as with a queuing MQTT client).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()> {
        if !self.online.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.broker
            .publish(
                TransportMessage {
                    topic: topic.to_string(),
                    payload,
                },
                options,
            )
            .await;
        Ok(())
    }

    async fn subscribe(&self, filters: &[String]) -> Result<()> {
        self.broker.subscribe(self.index, filters).await;
        Ok(())
    }

    async fn take_inbound(&self) -> Option<mpsc::Receiver<TransportMessage>> {
        self.inbound.lock().await.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_matching_subscriber() {
        let broker = MemoryBroker::new();
        let sub = broker.client().await;
        let publisher = broker.client().await;

        sub.subscribe(&["lab/device/+/meta".to_string()])
            .await
            .unwrap();
        let mut rx = sub.take_inbound().await.unwrap();

        publisher
            .publish(
                "lab/device/dev-1/meta",
                b"{}".to_vec(),
                PublishOptions::transient(),
            )
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "lab/device/dev-1/meta");
    }

    #[tokio::test]
    async fn test_retained_replay_on_subscribe() {
        let broker = MemoryBroker::new();
        let publisher = broker.client().await;
        publisher
            .publish(
                "lab/device/dev-1/status",
                b"{\"online\":true}".to_vec(),
                PublishOptions::retained(),
            )
            .await
            .unwrap();

        let late = broker.client().await;
        late.subscribe(&["lab/device/+/status".to_string()])
            .await
            .unwrap();
        let mut rx = late.take_inbound().await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "lab/device/dev-1/status");
    }

    #[tokio::test]
    async fn test_empty_retained_publish_clears_slot() {
        let broker = MemoryBroker::new();
        let publisher = broker.client().await;
        publisher
            .publish(
                "lab/device/dev-1/meta",
                b"{}".to_vec(),
                PublishOptions::retained(),
            )
            .await
            .unwrap();
        publisher
            .publish(
                "lab/device/dev-1/meta",
                Vec::new(),
                PublishOptions::retained(),
            )
            .await
            .unwrap();
        assert!(broker.retained("lab/device/dev-1/meta").await.is_none());
    }

    #[tokio::test]
    async fn test_offline_client_drops_publishes() {
        let broker = MemoryBroker::new();
        let publisher = broker.client().await;
        publisher.set_online(false);
        publisher
            .publish("lab/device/dev-1/cmd", b"x".to_vec(), PublishOptions::transient())
            .await
            .unwrap();
        assert!(broker.published("lab/#").await.is_empty());
    }

    #[tokio::test]
    async fn test_redeliver_last() {
        let broker = MemoryBroker::new();
        let sub = broker.client().await;
        sub.subscribe(&["lab/#".to_string()]).await.unwrap();
        let mut rx = sub.take_inbound().await.unwrap();

        sub.publish("lab/a", b"1".to_vec(), PublishOptions::transient())
            .await
            .unwrap();
        assert!(broker.redeliver_last("lab/a").await);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.payload, second.payload);
    }
}
