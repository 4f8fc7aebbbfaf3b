//! Broker configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`BrokerConfig::default()`]
//! 2. Merge a JSON file, when one is given
//! 3. Merge `WSPERF_`-prefixed environment variables (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Environment variable prefix, e.g. `WSPERF_WORKER_PORT=9190`.
pub const ENV_PREFIX: &str = "WSPERF_";

/// Configuration for the broker process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Host to bind every listener on.
    pub host: String,
    /// Port of the worker-facing WebSocket endpoint (`0` auto-assigns).
    pub worker_port: u16,
    /// Port of the observer-facing WebSocket/HTTP endpoint (`0` auto-assigns).
    pub observer_port: u16,
    /// Port of the static file server. Only bound when `static_dir` is set.
    pub static_port: u16,
    /// Directory with the observer UI assets.
    pub static_dir: Option<PathBuf>,
    /// Outbound queue depth per connection.
    pub send_queue: usize,
    /// Capacity of the observer event channel.
    pub event_buffer: usize,
    /// Interval between server-initiated Ping frames.
    pub heartbeat_interval_secs: u64,
    /// Log every command and decoded worker message.
    pub debug: bool,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            worker_port: 9090,
            observer_port: 9091,
            static_port: 8080,
            static_dir: None,
            send_queue: 256,
            event_buffer: 1024,
            heartbeat_interval_secs: 30,
            debug: false,
            log_level: "info".into(),
            log_json: false,
        }
    }
}

impl BrokerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),
}

/// Load the broker configuration from defaults, an optional JSON file and the
/// environment.
pub fn load_config(path: Option<&Path>) -> Result<BrokerConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(BrokerConfig::default()));
    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        tracing::debug!(?path, "loading config file");
        figment = figment.merge(Json::file(path));
    }
    figment
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .map_err(|e| ConfigError::Invalid(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn default_ports() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.worker_port, 9090);
        assert_eq!(cfg.observer_port, 9091);
        assert_eq!(cfg.static_port, 8080);
        assert!(cfg.static_dir.is_none());
        assert!(!cfg.debug);
    }

    #[test]
    fn heartbeat_never_zero() {
        let cfg = BrokerConfig {
            heartbeat_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: BrokerConfig = serde_json::from_str(r#"{"worker_port": 7000}"#).unwrap();
        assert_eq!(cfg.worker_port, 7000);
        assert_eq!(cfg.observer_port, 9091);
    }

    #[test]
    fn load_without_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let cfg = load_config(None).map_err(|e| e.to_string())?;
            assert_eq!(cfg, BrokerConfig::default());
            Ok(())
        });
    }

    #[test]
    fn file_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "broker.json",
                r#"{"worker_port": 7000, "observer_port": 7001, "static_dir": "ui"}"#,
            )?;
            jail.set_env("WSPERF_OBSERVER_PORT", "7100");
            jail.set_env("WSPERF_DEBUG", "true");

            let cfg = load_config(Some(Path::new("broker.json"))).map_err(|e| e.to_string())?;
            assert_eq!(cfg.worker_port, 7000);
            assert_eq!(cfg.observer_port, 7100);
            assert_eq!(cfg.static_dir, Some(PathBuf::from("ui")));
            assert!(cfg.debug);
            Ok(())
        });
    }

    #[test]
    fn missing_file_is_an_error() {
        Jail::expect_with(|_jail| {
            let err = load_config(Some(Path::new("nope.json"))).unwrap_err();
            assert!(matches!(err, ConfigError::NotFound(_)));
            Ok(())
        });
    }

    #[test]
    fn invalid_value_is_an_error() {
        Jail::expect_with(|jail| {
            jail.set_env("WSPERF_WORKER_PORT", "not-a-port");
            let err = load_config(None).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)));
            Ok(())
        });
    }
}
