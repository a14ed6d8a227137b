//! mic-arbiter-daemon: decides which guest VM may use the microphone
//!
//! The daemon runs in the admin domain and provides:
//! - Arbitration of the single physical microphone between guests
//! - Relay-side enforcement through the audio agent service or QubesDB
//! - Migration and cleanup of per-guest permission records
//! - IPC for lifecycle hooks and management tools
//!
//! Out of scope:
//! - Audio routing itself (done by the relay's audio agent)
//! - Device pickers or any other UI

mod arbiter;
mod config;
mod confirm;
mod device;
mod domain;
mod error;
mod events;
mod ipc;
mod lifecycle;
mod permission;
mod qdb;
mod rpc;
mod state;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::arbiter::{ArbiterSettings, Collaborators, MicArbiter};
use crate::config::{Backend, Config};
use crate::confirm::StaticConfirmer;
use crate::domain::{Inventory, MemoryRegistry};
use crate::events::{Dispatcher, MicEvent};
use crate::ipc::{Server, ServerContext};
use crate::lifecycle::ShutdownSignal;
use crate::qdb::{CommandQubesDb, KvChannel, MemoryQubesDb};
use crate::rpc::{QrexecInvoker, RemoteInvoker, UnavailableInvoker};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "mic-arbiter-daemon starting"
    );
    info!(?config.socket_path, ?config.backend, admin = %config.admin_domain, "configuration loaded");

    let mut shutdown = ShutdownSignal::install().context("failed to install signal handlers")?;

    let inventory = match &config.inventory_path {
        Some(path) => Inventory::load(path)?,
        None => {
            warn!("no inventory configured, only the admin domain is known");
            Inventory::default()
        }
    };
    let registry = Arc::new(MemoryRegistry::from_inventory(inventory, &config.admin_domain));
    info!(domains = registry.snapshot().len(), "inventory loaded");

    let qdb: Arc<dyn KvChannel> = match config.backend {
        Backend::Qubes => Arc::new(CommandQubesDb::new(&config.qubesdb_dir, config.qubesdb_timeout)),
        Backend::Memory => Arc::new(MemoryQubesDb::new()),
    };
    let invoker: Arc<dyn RemoteInvoker> = match config.backend {
        Backend::Qubes => Arc::new(QrexecInvoker::new(
            &config.qrexec_client,
            config.admin_domain.clone(),
            config.rpc_timeout,
        )),
        Backend::Memory => Arc::new(UnavailableInvoker),
    };

    // Arbiter -> IPC subscribers and the log loop below
    let (event_tx, mut event_rx) = broadcast::channel::<MicEvent>(64);

    let arbiter = MicArbiter::new(
        Collaborators {
            registry: registry.clone(),
            qdb,
            invoker,
            confirmer: Arc::new(StaticConfirmer::new(config.auto_confirm)),
        },
        ArbiterSettings {
            admin_domain: config.admin_domain.clone(),
            rpc_namespace: config.rpc_namespace.clone(),
        },
        event_tx.clone(),
    );

    let mut dispatcher = Dispatcher::new();
    arbiter.register(&mut dispatcher);

    let server = Server::new(
        &config.socket_path,
        ServerContext {
            dispatcher: Arc::new(dispatcher),
            registry,
            arbiter,
            admin_domain: config.admin_domain.clone(),
            start_time: Instant::now(),
        },
        event_tx,
    )?;

    info!("daemon initialized, entering main loop");

    tokio::select! {
        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Log every mic transition
        _ = async {
            loop {
                match event_rx.recv().await {
                    Ok(event) => info!(guest = event.guest(), %event, "mic event"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "mic event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        } => {
            info!("mic event logger exited");
        }

        // Wait for shutdown signal
        signal = shutdown.wait() => {
            info!(signal, "shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");
    server.shutdown().await;
    info!("mic-arbiter-daemon stopped");

    Ok(())
}
