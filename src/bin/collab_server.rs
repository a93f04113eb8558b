//! Thin CLI entry point: loads configuration, wires the coordinator to the
//! in-memory session store and metrics aggregator, and runs the WebSocket
//! front door until shutdown.

use std::sync::Arc;

use clap::Parser;
use collab_ot::config::Config;
use collab_ot::coordinator::Coordinator;
use collab_ot::metrics::MetricsAggregator;
use collab_ot::server;
use collab_ot::session::InMemorySessionStore;

/// Real-time collaborative text-editing server.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Address to bind the WebSocket listener to.
    #[arg(long)]
    bind_address: Option<String>,

    /// Port to bind the WebSocket listener to.
    #[arg(long)]
    port: Option<u16>,

    /// Log level passed through to `env_logger` (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level)).init();

    let mut config = Config::from_env();
    if let Some(bind_address) = cli.bind_address {
        config.network.bind_address = bind_address;
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }

    let store = Arc::new(InMemorySessionStore::new());
    let metrics = Arc::new(MetricsAggregator::new());
    let coordinator = Arc::new(Coordinator::new(config.clone(), store, metrics));

    let health_coordinator = coordinator.clone();
    let health_interval = config.health_check_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(health_interval);
        loop {
            ticker.tick().await;
            health_coordinator.health_check().await;
        }
    });

    let cleanup_coordinator = coordinator.clone();
    let cleanup_interval = config.cleanup_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        loop {
            ticker.tick().await;
            cleanup_coordinator.retention_cleanup().await;
        }
    });

    let bind_address = config.network.bind_address.clone();
    let port = config.network.port;

    tokio::select! {
        result = server::run(coordinator, &bind_address, port) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutdown signal received, draining connections");
            Ok(())
        }
    }
}
