//! Coordinator configuration.
//!
//! Defaults work against a local broker; every knob can come from the
//! environment (`MQTT_HOST`, `MQTT_PORT`, `MQTT_USERNAME`, `MQTT_PASSWORD`,
//! `LABLINK_ROOT`, `LABLINK_API_ADDR`) or be set programmatically.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Username for authentication.
    #[serde(default)]
    pub username: Option<String>,
    /// Password for authentication.
    #[serde(default)]
    pub password: Option<String>,
    /// Client id; generated when absent.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    30
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: None,
            keep_alive_secs: 30,
        }
    }
}

impl MqttConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Liveness windows driving the registry sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Seconds of silence before an online device turns stale.
    #[serde(default = "default_online_timeout")]
    pub online_timeout_secs: u64,
    /// Seconds of silence before a device is declared offline.
    #[serde(default = "default_offline_timeout")]
    pub offline_timeout_secs: u64,
    /// Sweep interval in seconds.
    #[serde(default = "default_registry_sweep")]
    pub sweep_interval_secs: u64,
}

fn default_online_timeout() -> u64 {
    30
}
fn default_offline_timeout() -> u64 {
    120
}
fn default_registry_sweep() -> u64 {
    5
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            online_timeout_secs: default_online_timeout(),
            offline_timeout_secs: default_offline_timeout(),
            sweep_interval_secs: default_registry_sweep(),
        }
    }
}

impl LivenessConfig {
    pub fn online_timeout(&self) -> Duration {
        Duration::from_secs(self.online_timeout_secs)
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::from_secs(self.offline_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Defaults for request correlation retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base gap between attempts, in milliseconds; doubles per retry.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    /// Cap on the inter-attempt gap, in milliseconds.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,
}

fn default_request_timeout() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    250
}
fn default_backoff_cap() -> u64 {
    5000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
        }
    }
}

impl RetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Broker connection.
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// Root topic namespace.
    #[serde(default = "default_root")]
    pub root: String,
    /// Registry liveness windows.
    #[serde(default)]
    pub liveness: LivenessConfig,
    /// Correlator retry defaults.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Lease sweep interval in seconds.
    #[serde(default = "default_lease_sweep")]
    pub lease_sweep_interval_secs: u64,
    /// HTTP API bind address.
    #[serde(default = "default_api_addr")]
    pub api_addr: String,
}

fn default_root() -> String {
    "lab".to_string()
}
fn default_lease_sweep() -> u64 {
    10
}
fn default_api_addr() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            root: default_root(),
            liveness: LivenessConfig::default(),
            retry: RetryConfig::default(),
            lease_sweep_interval_secs: default_lease_sweep(),
            api_addr: default_api_addr(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("MQTT_HOST") {
            config.mqtt.host = host;
        }
        if let Ok(port) = std::env::var("MQTT_PORT") {
            config.mqtt.port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid MQTT_PORT: {}", port)))?;
        }
        if let Ok(username) = std::env::var("MQTT_USERNAME") {
            config.mqtt.username = Some(username);
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            config.mqtt.password = Some(password);
        }
        if let Ok(root) = std::env::var("LABLINK_ROOT") {
            config.root = root;
        }
        if let Ok(addr) = std::env::var("LABLINK_API_ADDR") {
            config.api_addr = addr;
        }

        Ok(config)
    }

    pub fn lease_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lease_sweep_interval_secs)
    }
}
