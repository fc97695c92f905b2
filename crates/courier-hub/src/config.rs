//! Hub configuration.

use std::time::Duration;

use courier_core::security::ApiKey;
use courier_settings::HubSettings;

/// Runtime configuration for the relay hub.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind; `0` picks a free one.
    pub port: u16,
    /// Shared secret callers and the endpoint must present, if any.
    pub api_key: Option<ApiKey>,
    /// How long a forwarded request waits for the endpoint.
    pub request_timeout: Duration,
    /// Protocol-level ping interval.
    pub heartbeat_interval: Duration,
    /// Connections silent for longer than this are dropped.
    pub client_timeout: Duration,
    /// Per-connection outbound queue capacity.
    pub max_send_queue: usize,
    /// Maximum concurrent caller connections.
    pub max_connections: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_settings(&HubSettings::default())
    }
}

impl HubConfig {
    pub fn from_settings(settings: &HubSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            api_key: settings
                .api_key
                .as_deref()
                .filter(|k| !k.is_empty())
                .map(ApiKey::new),
            request_timeout: settings.request_timeout(),
            heartbeat_interval: settings.heartbeat_interval(),
            client_timeout: settings.client_timeout(),
            max_send_queue: settings.max_send_queue,
            max_connections: settings.max_connections,
        }
    }

    pub fn auth_required(&self) -> bool {
        self.api_key.is_some()
    }

    /// Accept `presented` if no key is configured or it matches.
    pub fn authorize(&self, presented: Option<&str>) -> bool {
        match (&self.api_key, presented) {
            (None, _) => true,
            (Some(key), Some(token)) => key.matches(token),
            (Some(_), None) => false,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8080");
        assert_eq!(cfg.request_timeout, Duration::from_secs(10));
        assert_eq!(cfg.max_send_queue, 256);
        assert!(!cfg.auth_required());
    }

    #[test]
    fn open_hub_accepts_anyone() {
        let cfg = HubConfig::default();
        assert!(cfg.authorize(None));
        assert!(cfg.authorize(Some("whatever")));
    }

    #[test]
    fn keyed_hub_checks_token() {
        let settings = HubSettings {
            api_key: Some("k3y".into()),
            ..HubSettings::default()
        };
        let cfg = HubConfig::from_settings(&settings);
        assert!(cfg.auth_required());
        assert!(cfg.authorize(Some("k3y")));
        assert!(!cfg.authorize(Some("nope")));
        assert!(!cfg.authorize(None));
    }

    #[test]
    fn empty_key_means_no_auth() {
        let settings = HubSettings {
            api_key: Some(String::new()),
            ..HubSettings::default()
        };
        assert!(!HubConfig::from_settings(&settings).auth_required());
    }
}
