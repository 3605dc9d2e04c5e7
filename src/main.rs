//! dynvol-csi: CSI driver for Anexia Dynamic Volumes.

use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dynvol_csi::engine::{DEFAULT_ENGINE_URL, EngineConfig};
use dynvol_csi::{Components, Config, Driver, Error};

#[derive(Parser, Debug)]
#[command(name = "dynvol-csi")]
#[command(about = "CSI driver for Anexia Dynamic Volumes")]
struct Args {
    /// CSI endpoint (unix:// or tcp://).
    #[arg(long, default_value = "unix:///tmp/csi.sock")]
    endpoint: String,

    /// Node ID, defaults to the hostname.
    #[arg(long = "nodeid")]
    node_id: Option<String>,

    /// Services to run: controller, node or combined.
    #[arg(long, default_value = "combined")]
    components: Components,

    /// Anexia Engine base URL.
    #[arg(long, env = "ANEXIA_BASE_URL", default_value = DEFAULT_ENGINE_URL)]
    engine_url: String,

    /// Anexia Engine API token. Required for the controller.
    #[arg(long, env = "ANEXIA_TOKEN", default_value = "", hide_env_values = true)]
    engine_token: String,

    /// Deadline for volume creation when the caller sends no grpc-timeout.
    #[arg(long, default_value = "60")]
    create_timeout_secs: u64,

    /// Interval between engine state polls, at least 100.
    #[arg(long, default_value = "1000", value_parser = clap::value_parser!(u64).range(100..))]
    poll_interval_ms: u64,

    /// Time allowed for in-flight requests after a shutdown signal.
    #[arg(long, default_value = "10")]
    shutdown_grace_secs: u64,

    /// Verbosity level (0-4).
    #[arg(short, default_value = "0")]
    v: u8,
}

/// Cancel `token` on SIGINT or SIGTERM.
fn cancel_on_signal(token: CancellationToken) -> std::io::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
        }
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Only this crate gets detailed logging; h2, tonic, hyper and reqwest stay at warn.
    let filter = match args.v {
        0 => "warn".to_string(),
        1 => "dynvol_csi=info,warn".to_string(),
        2 => "dynvol_csi=debug,warn".to_string(),
        3 => "dynvol_csi=trace,warn".to_string(),
        _ => "dynvol_csi=trace,info".to_string(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let defaults = Config::default();
    let config = Config {
        endpoint: args.endpoint,
        node_id: args.node_id.unwrap_or(defaults.node_id),
        components: args.components,
        engine: EngineConfig {
            url: args.engine_url,
            token: args.engine_token,
            ..Default::default()
        },
        create_timeout: Duration::from_secs(args.create_timeout_secs),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        name: defaults.name,
        version: defaults.version,
    };

    let driver = Driver::new(config)?;

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone())?;

    match driver.run(shutdown).await {
        Err(Error::Cancelled) => {
            info!("CSI driver stopped");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "CSI driver failed");
            Err(e.into())
        }
        Ok(()) => Ok(()),
    }
}
