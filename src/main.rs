use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use wsperf_broker::BrokerConfig;
use wsperf_telemetry::TelemetryConfig;

/// Command-and-control broker for distributed WebSocket performance tests.
#[derive(Debug, Parser)]
#[command(name = "wsperf-commander", version)]
struct Cli {
    /// JSON config file, merged over the built-in defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    /// Port workers connect to.
    #[arg(long)]
    worker_port: Option<u16>,
    /// Port for observer RPC, health and metrics.
    #[arg(long)]
    observer_port: Option<u16>,
    #[arg(long)]
    static_port: Option<u16>,
    /// Serve this directory over HTTP on the static port.
    #[arg(long)]
    static_dir: Option<PathBuf>,
    /// Log every command sent and every worker message received.
    #[arg(short, long)]
    debug: bool,
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(self, config: &mut BrokerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.worker_port {
            config.worker_port = port;
        }
        if let Some(port) = self.observer_port {
            config.observer_port = port;
        }
        if let Some(port) = self.static_port {
            config.static_port = port;
        }
        if self.static_dir.is_some() {
            config.static_dir = self.static_dir;
        }
        config.debug |= self.debug;
        config.log_json |= self.json_logs;
    }
}

fn telemetry_config(config: &BrokerConfig) -> TelemetryConfig {
    let mut telemetry = TelemetryConfig {
        log_level: wsperf_telemetry::parse_level(&config.log_level).unwrap_or(tracing::Level::INFO),
        json: config.log_json,
        ..TelemetryConfig::default()
    };
    if config.debug {
        telemetry = telemetry.with_protocol_debug();
    }
    telemetry
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = wsperf_broker::load_config(cli.config.as_deref())
        .context("failed to load configuration")?;
    cli.apply(&mut config);

    let telemetry = wsperf_telemetry::init_telemetry(&telemetry_config(&config))
        .context("failed to initialize logging")?;
    tracing::info!(filter = telemetry.filter(), "starting wsperf commander");

    let metrics = match wsperf_broker::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder not installed");
            None
        }
    };

    let broker = wsperf_broker::start(&config, metrics)
        .await
        .context("failed to start broker")?;
    tracing::info!(
        worker = %broker.worker_addr,
        observer = %broker.observer_addr,
        "wsperf commander ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    broker.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_loaded_config() {
        let cli = Cli::parse_from([
            "wsperf-commander",
            "--worker-port",
            "9190",
            "--static-dir",
            "web",
            "--debug",
        ]);
        let mut config = BrokerConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.worker_port, 9190);
        assert_eq!(config.observer_port, 9091);
        assert_eq!(config.static_dir, Some(PathBuf::from("web")));
        assert!(config.debug);
        assert!(!config.log_json);
    }

    #[test]
    fn debug_raises_broker_logging() {
        let config = BrokerConfig {
            debug: true,
            log_level: "warn".into(),
            ..BrokerConfig::default()
        };
        let telemetry = telemetry_config(&config);
        assert_eq!(
            telemetry.filter_directive(),
            "warn,wsperf_broker=debug,wsperf_core=debug"
        );
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let config = BrokerConfig {
            log_level: "chatty".into(),
            ..BrokerConfig::default()
        };
        assert_eq!(telemetry_config(&config).log_level, tracing::Level::INFO);
    }
}
