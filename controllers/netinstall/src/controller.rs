//! Main controller implementation.
//!
//! This module contains the `Controller` struct that starts the provisioning
//! server and runs the event log and operator console next to it until the
//! process is interrupted.

use crate::console::run_console;
use crate::watcher::watch_events;
use anyhow::{Context, Result};
use netinstall_server::{NetInstallServer, ServerConfig};
use tokio::sync::watch;
use tracing::{info, warn};

/// Main controller for the NetInstall server.
pub struct Controller {
    server: NetInstallServer,
}

impl Controller {
    /// Creates a new controller instance.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let server = NetInstallServer::new(config).context("invalid server configuration")?;
        Ok(Self { server })
    }

    /// Runs the controller until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = self.server.subscribe();

        let running = self
            .server
            .start(shutdown_rx.clone())
            .await
            .context("failed to start NetInstall server")?;

        let watcher = tokio::spawn(watch_events(events, shutdown_rx.clone()));
        let console = tokio::spawn(run_console(running.operator(), shutdown_rx));

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        info!("Shutting down");

        if shutdown_tx.send(true).is_err() {
            warn!("Every listener had already stopped");
        }
        running.wait().await;

        for task in [watcher, console] {
            if let Err(e) = task.await {
                warn!(error = %e, "Controller task panicked");
            }
        }
        Ok(())
    }
}
