//! bacsync
//!
//! Runs the synchronization engine against a simulated network and logs what
//! the device model looks like as it changes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bacsync::bacnet::SimulatedNetwork;
use bacsync::{Engine, EngineHandle, EngineOptions, SnapshotStore};

/// BACnet device state synchronization
#[derive(Parser, Debug)]
#[command(name = "bacsync")]
#[command(about = "BACnet device state synchronization", long_about = None)]
struct Args {
    /// Path to the JSON options file
    #[arg(short, long, default_value = "options.json")]
    options: PathBuf,

    /// Device fixture for the simulated network; a built-in demo network is
    /// used when omitted
    #[arg(long)]
    simulate: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bacsync=info,bacsync_runtime=info"));
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting bacsync v{}", env!("CARGO_PKG_VERSION"));

    let options_path = args.options.exists().then_some(args.options.as_path());
    if options_path.is_none() {
        warn!("Options file {} not found, using defaults", args.options.display());
    }
    let options = EngineOptions::load(options_path)?;
    info!(
        devices_setup = options.devices_setup.len(),
        read_concurrency = options.read_concurrency,
        "Loaded options"
    );

    let network = match &args.simulate {
        Some(path) => SimulatedNetwork::from_fixture(path)?,
        None => SimulatedNetwork::demo(),
    };
    warn!("No fieldbus stack configured, running against a simulated network");

    let store = match &options.snapshot_path {
        Some(path) => Some(SnapshotStore::open(path)?),
        None => None,
    };

    let (engine, handle, mut bridged) = Engine::new(options, Arc::new(network), store);
    let running = tokio::spawn(engine.run());

    // Stand-in application: accept every bridged write
    tokio::spawn(async move {
        while let Some(write) = bridged.recv().await {
            info!(object = %write.object, property = %write.property, value = %write.value, "Accepting bridged write");
            write.ack();
        }
    });

    tokio::spawn(log_updates(handle.clone()));

    shutdown_signal().await;

    info!("Shutting down...");
    if let Err(e) = handle.shutdown().await {
        warn!("Engine already stopped: {}", e);
    }
    running.await??;

    info!("Shutdown complete");
    Ok(())
}

async fn log_updates(handle: EngineHandle) {
    if handle.ready().await.is_err() {
        return;
    }
    info!(tasks = handle.task_names().len(), "Engine ready");

    let mut updated = handle.updated();
    while updated.changed().await.is_ok() {
        let snapshot = handle.snapshot();
        let devices = snapshot.as_object().map(|m| m.len()).unwrap_or(0);
        info!(revision = *updated.borrow(), devices, "Device model updated");
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
