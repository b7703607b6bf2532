//! Server orchestration.
//!
//! Binds one broadcast-capable socket per protocol, feeds every received
//! datagram to its handler in a task of its own, and runs the operator
//! command loop and (optionally) the HTTP API next to them. Everything stops
//! when the shutdown signal turns true.

use crate::api;
use crate::catalog::{DirectoryCatalog, ImageCatalog};
use crate::config::ServerConfig;
use crate::dhcp::BootResponder;
use crate::engine::TransferEngine;
use crate::error::{NetInstallError, Result};
use crate::events::{EventBus, ServerEvent};
use crate::identity::BootIdentityTable;
use crate::operator::{CommandLoop, OperatorHandle};
use crate::session::SessionRegistry;
use crate::tftp::{BlockTransferServer, DirectoryFileProvider, FileProvider};
use crate::transport::{DatagramHandler, bind_udp};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Largest datagram we accept
const RECV_BUFFER_LEN: usize = 65535;

/// NetInstall provisioning server
pub struct NetInstallServer {
    config: ServerConfig,
    events: EventBus,
    identities: Arc<BootIdentityTable>,
    sessions: Arc<SessionRegistry>,
    files: Arc<dyn FileProvider>,
    catalog: Arc<dyn ImageCatalog>,
}

impl NetInstallServer {
    /// Create a server reading boot files and images from the configured directories.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            files: Arc::new(DirectoryFileProvider::new(&config.boot_dir)),
            catalog: Arc::new(DirectoryCatalog::new(&config.image_dir)),
            config,
            events: EventBus::new(),
            identities: Arc::new(BootIdentityTable::new()),
            sessions: Arc::new(SessionRegistry::new()),
        })
    }

    /// Serve boot files from `files` instead of the boot directory
    pub fn with_file_provider(mut self, files: Arc<dyn FileProvider>) -> Self {
        self.files = files;
        self
    }

    /// Offer images from `catalog` instead of the image directory
    pub fn with_catalog(mut self, catalog: Arc<dyn ImageCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Bind every socket and spawn the listeners.
    ///
    /// Binding errors are reported here, before anything runs.
    pub async fn start(self, shutdown: watch::Receiver<bool>) -> Result<RunningServer> {
        let mut tasks = Vec::new();

        let netinstall_socket = Arc::new(bind_udp(self.config.netinstall_bind_addr())?);
        let engine = Arc::new(TransferEngine::new(
            &self.config,
            self.sessions.clone(),
            netinstall_socket.clone(),
            self.events.clone(),
        ));

        if self.config.netinstall_only {
            info!("NetInstall-only mode, boot and block-transfer listeners disabled");
        } else {
            let boot_socket = Arc::new(bind_udp(self.config.boot_bind_addr())?);
            let responder = Arc::new(BootResponder::new(
                &self.config,
                self.identities.clone(),
                boot_socket.clone(),
                self.events.clone(),
            ));

            let tftp_socket = Arc::new(bind_udp(self.config.tftp_bind_addr())?);
            let transfers = Arc::new(BlockTransferServer::new(
                self.identities.clone(),
                self.files.clone(),
                tftp_socket.clone(),
                self.events.clone(),
            ));

            tasks.push(spawn_listener(
                "boot",
                boot_socket,
                responder,
                self.events.clone(),
                shutdown.clone(),
            ));
            tasks.push(spawn_listener(
                "tftp",
                tftp_socket,
                transfers,
                self.events.clone(),
                shutdown.clone(),
            ));
        }

        tasks.push(spawn_listener(
            "netinstall",
            netinstall_socket,
            engine.clone(),
            self.events.clone(),
            shutdown.clone(),
        ));

        let (command_loop, operator) =
            CommandLoop::new(engine, self.catalog.clone(), &self.config.key_dir);
        tasks.push(tokio::spawn(command_loop.run(shutdown.clone())));

        if let Some(addr) = self.config.api_addr {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|source| NetInstallError::BindFailed { addr, source })?;
            let operator = operator.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = api::serve(listener, operator, shutdown).await {
                    error!(error = %e, "Operator API failed");
                }
            }));
        }

        info!(
            host_ip = %self.config.host_ip,
            host_mac = %self.config.host_mac,
            client_ip = %self.config.client_ip,
            "NetInstall server started"
        );

        Ok(RunningServer {
            operator,
            events: self.events,
            tasks,
        })
    }

    /// Start and wait for shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.start(shutdown).await?.wait().await;
        Ok(())
    }
}

/// Handle to a started server
pub struct RunningServer {
    operator: OperatorHandle,
    events: EventBus,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    pub fn operator(&self) -> OperatorHandle {
        self.operator.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Wait until every listener has stopped.
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Server task panicked");
            }
        }
        info!("NetInstall server stopped");
    }
}

fn spawn_listener(
    protocol: &'static str,
    socket: Arc<UdpSocket>,
    handler: Arc<dyn DatagramHandler>,
    events: EventBus,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(receive_loop(protocol, socket, handler, events, shutdown))
}

async fn receive_loop(
    protocol: &'static str,
    socket: Arc<UdpSocket>,
    handler: Arc<dyn DatagramHandler>,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
) {
    match socket.local_addr() {
        Ok(addr) => info!(protocol, addr = %addr, "Listening"),
        Err(e) => warn!(protocol, error = %e, "Listening on unknown address"),
    }
    let mut buf = vec![0u8; RECV_BUFFER_LEN];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        let data = buf[..len].to_vec();
                        let handler = handler.clone();
                        let events = events.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle(&data, from).await {
                                report(protocol, from, &e, &events);
                            }
                        });
                    }
                    Err(e) => error!(protocol, error = %e, "Error receiving datagram"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(protocol, "Listener shutting down");
                    break;
                }
            }
        }
    }
}

/// Log a failed datagram at a level matching whose fault it was.
fn report(protocol: &'static str, from: SocketAddr, err: &NetInstallError, events: &EventBus) {
    match err {
        NetInstallError::ResourceBusy(_) => {
            debug!(protocol, peer = %from, reason = %err, "Ignoring duplicate request");
            return;
        }
        NetInstallError::MalformedFrame(_) | NetInstallError::UnknownPeer(_) => {
            debug!(protocol, peer = %from, reason = %err, "Dropped datagram");
        }
        NetInstallError::ProtocolViolation(_) => {
            warn!(protocol, peer = %from, reason = %err, "Dropped datagram");
        }
        _ => {
            error!(protocol, peer = %from, error = %err, "Failed to handle datagram");
        }
    }
    events.emit(ServerEvent::FrameDropped {
        peer: from.to_string(),
        reason: err.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::hwaddr::MacAddr;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[test]
    fn test_new_validates_config() {
        let config = ServerConfig::new(Ipv4Addr::UNSPECIFIED, MacAddr::new([2, 0, 0, 0, 0, 1]));
        assert!(matches!(
            NetInstallServer::new(config),
            Err(NetInstallError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_report_emits_drop_events() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let from: SocketAddr = "192.168.88.20:5000".parse().unwrap();

        report("netinstall", from, &NetInstallError::ResourceBusy("dup".into()), &events);
        report("netinstall", from, &NetInstallError::ProtocolViolation("stale".into()), &events);

        match rx.recv().await.unwrap() {
            ServerEvent::FrameDropped { peer, reason } => {
                assert_eq!(peer, "192.168.88.20:5000");
                assert!(reason.contains("stale"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut config = ServerConfig::new(
            Ipv4Addr::new(127, 0, 0, 1),
            MacAddr::new([2, 0, 0, 0, 0, 1]),
        )
        .with_netinstall_only(true)
        .with_broadcast_ip(Ipv4Addr::LOCALHOST);
        config.client_ip = Ipv4Addr::new(127, 0, 0, 2);
        // Any free port
        config.netinstall_port = 0;

        let server = NetInstallServer::new(config)
            .unwrap()
            .with_catalog(Arc::new(MemoryCatalog::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = server.start(shutdown_rx).await.unwrap();

        let operator = running.operator();
        assert!(operator.list_sessions().await.unwrap().is_empty());
        assert!(operator.list_images(None).await.unwrap().is_empty());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running.wait())
            .await
            .unwrap();
        assert!(matches!(
            operator.list_sessions().await,
            Err(NetInstallError::ChannelClosed)
        ));
    }
}
