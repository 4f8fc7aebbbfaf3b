//! Process-wide tracing setup for the wsperf commander.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "wsperf_broker" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
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
    /// Raise the broker crates to DEBUG, which logs every command and
    /// decoded worker message.
    pub fn with_protocol_debug(mut self) -> Self {
        for module in ["wsperf_broker", "wsperf_core"] {
            self.module_levels.push((module.to_string(), Level::DEBUG));
        }
        self
    }

    /// The filter directive built from this config, e.g. `info,wsperf_broker=debug`.
    pub fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

/// Returned by [`init_telemetry`]; reports the filter that ended up active.
#[derive(Debug)]
pub struct TelemetryGuard {
    filter: String,
}

impl TelemetryGuard {
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let directive = config.filter_directive();
    let (env_filter, filter) = match EnvFilter::try_from_default_env() {
        Ok(env) => {
            let text = env.to_string();
            (env, text)
        }
        Err(_) => (EnvFilter::new(&directive), directive),
    };

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry().with(fmt_layer).try_init()?;

    Ok(TelemetryGuard { filter })
}

/// Parse a level name (`"warn"`, `"DEBUG"`, ...). Unknown names yield `None`.
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_is_info() {
        assert_eq!(TelemetryConfig::default().filter_directive(), "info");
    }

    #[test]
    fn module_levels_are_appended() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("tower_http".into(), Level::TRACE)],
            json: true,
        };
        assert_eq!(config.filter_directive(), "warn,tower_http=trace");
    }

    #[test]
    fn protocol_debug_raises_broker_crates() {
        let directive = TelemetryConfig::default().with_protocol_debug().filter_directive();
        assert_eq!(directive, "info,wsperf_broker=debug,wsperf_core=debug");
    }

    #[test]
    fn parse_level_accepts_any_case() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }
}
