pub mod metrics;

use std::str::FromStr;

use courier_settings::LoggingSettings;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "courier_link" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from loaded settings. Unknown level names fall back to INFO
    /// (module entries with unknown levels are skipped).
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        Self {
            log_level: Level::from_str(&settings.level).unwrap_or(Level::INFO),
            module_levels: settings
                .modules
                .iter()
                .filter_map(|(module, level)| {
                    Level::from_str(level).ok().map(|l| (module.clone(), l))
                })
                .collect(),
            json: settings.json,
        }
    }

    /// `EnvFilter` directive string, e.g. `info,courier_link=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Initialize the tracing subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    if tracing_subscriber::registry().with(fmt_layer).try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn directives_include_module_levels() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("courier_hub".into(), Level::DEBUG)],
            json: false,
        };
        assert_eq!(config.filter_directives(), "warn,courier_hub=debug");
    }

    #[test]
    fn from_settings_parses_levels() {
        let settings = LoggingSettings {
            level: "debug".into(),
            json: true,
            modules: BTreeMap::from([
                ("courier_link".to_string(), "trace".to_string()),
                ("noisy".to_string(), "loud".to_string()),
            ]),
        };
        let config = TelemetryConfig::from_settings(&settings);
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.module_levels, vec![("courier_link".to_string(), Level::TRACE)]);
        assert!(config.json);
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        let settings = LoggingSettings {
            level: "chatty".into(),
            ..Default::default()
        };
        assert_eq!(TelemetryConfig::from_settings(&settings).log_level, Level::INFO);
    }
}
