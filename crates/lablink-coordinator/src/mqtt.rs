//! MQTT transport backed by `rumqttc`.
//!
//! A background task drives the event loop: inbound publishes are fed to
//! the coordinator's message stream, connection errors trigger a backoff
//! and reconnect, and every (re)connect replays the recorded subscription
//! filters so a broker restart does not silently drop topics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use lablink_core::config::MqttConfig;
use lablink_core::{Error, Result};

use crate::transport::{AckLevel, PublishOptions, Transport, TransportMessage};

const EVENT_LOOP_CAPACITY: usize = 64;
const INBOUND_CHANNEL_CAPACITY: usize = 256;
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Production transport over an MQTT broker.
pub struct MqttTransport {
    client: AsyncClient,
    filters: Arc<RwLock<Vec<String>>>,
    inbound: Mutex<Option<mpsc::Receiver<TransportMessage>>>,
}

impl MqttTransport {
    /// Connect to the broker and start the event loop task.
    pub fn connect(config: &MqttConfig) -> Result<Self> {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("lablink-{}", uuid::Uuid::new_v4().simple()));

        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(options, EVENT_LOOP_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let filters: Arc<RwLock<Vec<String>>> = Arc::new(RwLock::new(Vec::new()));

        let loop_client = client.clone();
        let loop_filters = filters.clone();
        tokio::spawn(async move {
            let mut backoff = RECONNECT_BASE;
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                        backoff = RECONNECT_BASE;
                        let filters = loop_filters.read().await.clone();
                        for filter in filters {
                            if let Err(e) =
                                loop_client.subscribe(&filter, QoS::AtLeastOnce).await
                            {
                                warn!(filter = %filter, error = %e, "resubscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = TransportMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if inbound_tx.send(message).await.is_err() {
                            debug!("inbound consumer gone, stopping mqtt event loop");
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, backoff = ?backoff, "mqtt connection error");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RECONNECT_CAP);
                    }
                }
            }
        });

        Ok(Self {
            client,
            filters,
            inbound: Mutex::new(Some(inbound_rx)),
        })
    }
}

fn qos_for(ack: AckLevel) -> QoS {
    match ack {
        AckLevel::FireAndForget => QoS::AtMostOnce,
        AckLevel::AtLeastOnce => QoS::AtLeastOnce,
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()> {
        self.client
            .publish(topic, qos_for(options.ack), options.retain, payload)
            .await
            .map_err(|e| Error::Network(format!("publish to {}: {}", topic, e)))
    }

    async fn subscribe(&self, filters: &[String]) -> Result<()> {
        {
            let mut recorded = self.filters.write().await;
            for filter in filters {
                if !recorded.contains(filter) {
                    recorded.push(filter.clone());
                }
            }
        }
        for filter in filters {
            self.client
                .subscribe(filter, QoS::AtLeastOnce)
                .await
                .map_err(|e| Error::Network(format!("subscribe to {}: {}", filter, e)))?;
        }
        Ok(())
    }

    async fn take_inbound(&self) -> Option<mpsc::Receiver<TransportMessage>> {
        self.inbound.lock().await.take()
    }
}
