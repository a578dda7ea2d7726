//! RT Bridge - Main Entry Point
//!
//! Usage: `rt-bridge [CONFIG]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bridge::{
    init_logging, install_metrics_exporter, run_stats_reporter, Bridge, BridgeConfig,
    LogPublisher, MqttPublisher, Publisher,
};
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = BridgeConfig::load(path.as_deref()).context("loading configuration")?;

    init_logging(&config.log_level, config.log_json)?;
    info!("=== RT Bridge v{} ===", env!("CARGO_PKG_VERSION"));

    if config.metrics.enabled {
        install_metrics_exporter(&config.metrics)?;
    }

    let mqtt = if config.mqtt.dry_run {
        info!("Dry run: messages are logged, not sent");
        None
    } else {
        Some(Arc::new(MqttPublisher::connect(&config.mqtt)?))
    };
    let publisher: Arc<dyn Publisher> = match &mqtt {
        Some(mqtt) => Arc::clone(mqtt) as Arc<dyn Publisher>,
        None => Arc::new(LogPublisher::new()),
    };

    let mut bridge = Bridge::start(config.clone(), Arc::clone(&publisher)).context("starting bridge")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reporter = tokio::spawn(run_stats_reporter(
        bridge.stats_source(),
        Arc::clone(&publisher),
        config.mqtt.topic_prefix.clone(),
        Duration::from_millis(config.stats_interval_ms),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down...");

    // Reverse of start order
    let _ = shutdown_tx.send(true);
    reporter.await.context("stats reporter")?;

    tokio::task::spawn_blocking(move || bridge.stop())
        .await
        .context("stopping bridge")?;

    if let Some(mqtt) = mqtt {
        mqtt.disconnect();
    }

    info!("Goodbye");
    Ok(())
}
