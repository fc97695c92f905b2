use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Upper bound accepted for `link.reconnectMaxDelayMs`.
pub const RECONNECT_DELAY_CEILING_MS: u64 = 30_000;

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierSettings {
    pub link: LinkSettings,
    pub hub: HubSettings,
    pub logging: LoggingSettings,
}

impl CourierSettings {
    pub fn validate(&self) -> Result<()> {
        self.link.validate()?;
        self.hub.validate()
    }
}

/// Privileged endpoint: its outbound connection to the hub.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkSettings {
    /// Hub endpoint URL (`ws://` or `wss://`).
    pub relay_url: String,
    /// Shared secret presented to the hub.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Stable id of this endpoint, also used for leadership ordering.
    pub endpoint_id: String,
    /// Keep-alive ping interval in seconds.
    pub ping_interval_secs: u64,
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Abort an opening handshake after this long.
    pub connect_timeout_ms: u64,
    /// Default timeout for requests issued by the endpoint itself.
    pub request_timeout_ms: u64,
    /// Ceiling on a single handler invocation.
    pub handler_timeout_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080/ws/endpoint".to_string(),
            api_key: None,
            endpoint_id: "endpoint".to_string(),
            ping_interval_secs: 30,
            max_reconnect_attempts: 20,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            connect_timeout_ms: 5000,
            request_timeout_ms: 10_000,
            handler_timeout_ms: 60_000,
        }
    }
}

impl LinkSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if !(self.relay_url.starts_with("ws://") || self.relay_url.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "link.relayUrl must be a ws:// or wss:// URL, got {}",
                self.relay_url
            )));
        }
        if self.endpoint_id.is_empty() {
            return Err(SettingsError::InvalidValue("link.endpointId is empty".into()));
        }
        if self.ping_interval_secs == 0 {
            return Err(SettingsError::InvalidValue("link.pingIntervalSecs must be > 0".into()));
        }
        if self.reconnect_base_delay_ms == 0
            || self.reconnect_max_delay_ms < self.reconnect_base_delay_ms
        {
            return Err(SettingsError::InvalidValue(
                "link reconnect delays must satisfy 0 < base <= max".into(),
            ));
        }
        if self.reconnect_max_delay_ms > RECONNECT_DELAY_CEILING_MS {
            return Err(SettingsError::InvalidValue(format!(
                "link.reconnectMaxDelayMs must be <= {RECONNECT_DELAY_CEILING_MS}"
            )));
        }
        Ok(())
    }
}

/// Relay hub server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Bind address.
    pub host: String,
    pub port: u16,
    /// When set, callers and the endpoint must present this key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// How long a forwarded caller request may wait for the endpoint.
    pub request_timeout_ms: u64,
    /// WebSocket ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Drop connections silent for longer than this.
    pub client_timeout_ms: u64,
    /// Per-connection outbound queue capacity.
    pub max_send_queue: usize,
    pub max_connections: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            api_key: None,
            request_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            client_timeout_ms: 60_000,
            max_send_queue: 256,
            max_connections: 100,
        }
    }
}

impl HubSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue("hub.maxSendQueue must be > 0".into()));
        }
        if self.client_timeout_ms <= self.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(
                "hub.clientTimeoutMs must exceed hub.heartbeatIntervalMs".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` wins when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-module levels, e.g. `{"courier_link": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}
