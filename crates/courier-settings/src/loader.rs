//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::CourierSettings;

/// Resolve the path to the settings file (`~/.courier/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".courier").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CourierSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid final value is
/// an error.
pub fn load_settings_from_path(path: &Path) -> Result<CourierSettings> {
    let mut settings = load_file_layer(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<CourierSettings> {
    let defaults = serde_json::to_value(CourierSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `COURIER_*` overrides read through `lookup`.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_overrides(settings: &mut CourierSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Link settings ───────────────────────────────────────────────
    if let Some(v) = env.string("COURIER_RELAY_URL") {
        settings.link.relay_url = v;
    }
    if let Some(v) = env.string("COURIER_API_KEY") {
        settings.link.api_key = Some(v.clone());
        settings.hub.api_key = Some(v);
    }
    if let Some(v) = env.string("COURIER_ENDPOINT_ID") {
        settings.link.endpoint_id = v;
    }
    if let Some(v) = env.u64("COURIER_PING_INTERVAL", 1, 3600) {
        settings.link.ping_interval_secs = v;
    }
    if let Some(v) = env.u64("COURIER_RECONNECT_MAX_ATTEMPTS", 0, 1000) {
        settings.link.max_reconnect_attempts = v as u32;
    }
    if let Some(v) = env.u64("COURIER_RECONNECT_BASE_DELAY", 100, 60_000) {
        settings.link.reconnect_base_delay_ms = v;
    }
    if let Some(v) = env.u64("COURIER_CONNECT_TIMEOUT_MS", 100, 120_000) {
        settings.link.connect_timeout_ms = v;
    }

    // ── Hub settings ────────────────────────────────────────────────
    if let Some(v) = env.string("COURIER_HUB_HOST") {
        settings.hub.host = v;
    }
    if let Some(v) = env.u64("COURIER_HUB_PORT", 1, 65535) {
        settings.hub.port = v as u16;
    }
    if let Some(v) = env.u64("COURIER_REQUEST_TIMEOUT_MS", 100, 600_000) {
        settings.hub.request_timeout_ms = v;
        settings.link.request_timeout_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("COURIER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("COURIER_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"hub": {"port": 8080, "host": "0.0.0.0"}});
        let source = serde_json::json!({"hub": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["hub"]["port"], 9090);
        assert_eq!(merged["hub"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let merged = deep_merge(target, serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3]}),
            serde_json::json!({"items": [4]}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_file_layer(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.hub.port, 8080);
        assert_eq!(settings.link.max_reconnect_attempts, 20);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"link": {"pingIntervalSecs": 10, "apiKey": "k"}, "hub": {"port": 9000}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.link.ping_interval_secs, 10);
        assert_eq!(settings.link.api_key.as_deref(), Some("k"));
        assert_eq!(settings.link.reconnect_base_delay_ms, 1000);
        assert_eq!(settings.hub.port, 9000);
        assert_eq!(settings.hub.request_timeout_ms, 10_000);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(load_file_layer(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn load_rejects_invalid_final_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"link": {"relayUrl": "ftp://nope"}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply_valid_values() {
        let mut settings = CourierSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("COURIER_RELAY_URL", "wss://relay.example/ws/endpoint"),
                ("COURIER_API_KEY", "secret"),
                ("COURIER_PING_INTERVAL", "15"),
                ("COURIER_RECONNECT_MAX_ATTEMPTS", "5"),
                ("COURIER_HUB_PORT", "3010"),
                ("COURIER_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(settings.link.relay_url, "wss://relay.example/ws/endpoint");
        assert_eq!(settings.link.api_key.as_deref(), Some("secret"));
        assert_eq!(settings.hub.api_key.as_deref(), Some("secret"));
        assert_eq!(settings.link.ping_interval_secs, 15);
        assert_eq!(settings.link.max_reconnect_attempts, 5);
        assert_eq!(settings.hub.port, 3010);
        assert!(settings.logging.json);
    }

    #[test]
    fn overrides_ignore_invalid_values() {
        let mut settings = CourierSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("COURIER_PING_INTERVAL", "0"),
                ("COURIER_HUB_PORT", "70000"),
                ("COURIER_LOG_JSON", "maybe"),
                ("COURIER_RELAY_URL", ""),
            ]),
        );
        let defaults = CourierSettings::default();
        assert_eq!(settings.link.ping_interval_secs, defaults.link.ping_interval_secs);
        assert_eq!(settings.hub.port, defaults.hub.port);
        assert!(!settings.logging.json);
        assert_eq!(settings.link.relay_url, defaults.link.relay_url);
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in &["true", "1", "yes", "on", "TRUE"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in &["false", "0", "no", "off", "Off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_u64_bounds() {
        assert_eq!(parse_u64_range("30", 1, 3600), Some(30));
        assert_eq!(parse_u64_range("0", 1, 3600), None);
        assert_eq!(parse_u64_range("abc", 1, 3600), None);
    }
}
