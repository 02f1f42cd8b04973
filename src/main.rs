//! edge-relay server binary.
//!
//! ```text
//!   clients ──▶ net::listener ──▶ http::server ──▶ routing::table ──┬─▶ built-in handlers
//!                                                                   ├─▶ proxy::route ──▶ upstreams
//!                                                                   └─▶ tunnel::primary ──▶ satellites
//!   satellite mode: tunnel::satellite ◀──▶ primary, feeding the local http::server
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use edge_relay::config::loader::load_config;
use edge_relay::config::watcher::ConfigWatcher;
use edge_relay::lifecycle::{self, signals, Shutdown};
use edge_relay::net::tls;
use edge_relay::observability::{logging, metrics};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "edge-relay", version, about = "HTTP/1.1 server, reverse proxy and tunnel")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "edge-relay.toml")]
    config: PathBuf,

    /// Load and validate the configuration, then exit.
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if cli.validate {
        println!("{}: configuration is valid", cli.config.display());
        return ExitCode::SUCCESS;
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "edge-relay starting");
    tls::install_crypto_provider();

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    let running = match lifecycle::start(&config, &shutdown).await {
        Ok(running) => running,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(http = %running.http_addr, tunnel = ?running.tunnel_addr, "edge-relay ready");

    let (watcher, mut updates) = ConfigWatcher::new(&cli.config);
    let _watcher = match watcher.run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "Config hot reload disabled");
            None
        }
    };

    loop {
        tokio::select! {
            _ = signals::wait_for_shutdown_signal() => break,
            Some(new_config) = updates.recv() => running.apply_reload(&new_config),
        }
    }

    shutdown
        .trigger_and_drain(running.http.tracker(), SHUTDOWN_GRACE)
        .await;
    running.join().await;
    tracing::info!("Shutdown complete");
    ExitCode::SUCCESS
}
