//! Operator command queue.
//!
//! The console and the HTTP API never touch sessions directly. They send
//! [`OperatorCommand`]s through a cloneable [`OperatorHandle`]; a single
//! [`CommandLoop`] task executes them against the engine and the catalog and
//! answers on a oneshot channel.

use crate::catalog::{ImageCatalog, ImageMetadata};
use crate::engine::TransferEngine;
use crate::error::{NetInstallError, Result};
use crate::hwaddr::MacAddr;
use crate::keyfile::write_key_file;
use crate::session::SessionSummary;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

/// Queued commands before senders wait
const COMMAND_QUEUE_DEPTH: usize = 32;

#[derive(Debug)]
pub enum OperatorCommand {
    ListSessions {
        reply: oneshot::Sender<Vec<SessionSummary>>,
    },
    StartTransfer {
        mac: MacAddr,
        image: String,
        reply: oneshot::Sender<Result<ImageMetadata>>,
    },
    ExportKey {
        mac: MacAddr,
        reply: oneshot::Sender<Result<PathBuf>>,
    },
    ListImages {
        arch: Option<String>,
        reply: oneshot::Sender<Result<Vec<ImageMetadata>>>,
    },
}

/// Cloneable sender side of the command queue
#[derive(Debug, Clone)]
pub struct OperatorHandle {
    tx: mpsc::Sender<OperatorCommand>,
}

impl OperatorHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> OperatorCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| NetInstallError::ChannelClosed)?;
        rx.await.map_err(|_| NetInstallError::ChannelClosed)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.request(|reply| OperatorCommand::ListSessions { reply })
            .await
    }

    /// Offer `image` to the device; returns the offered image's metadata.
    pub async fn start_transfer(
        &self,
        mac: MacAddr,
        image: impl Into<String>,
    ) -> Result<ImageMetadata> {
        let image = image.into();
        self.request(|reply| OperatorCommand::StartTransfer { mac, image, reply })
            .await?
    }

    /// Save the device's key; returns the written path.
    pub async fn export_key(&self, mac: MacAddr) -> Result<PathBuf> {
        self.request(|reply| OperatorCommand::ExportKey { mac, reply })
            .await?
    }

    /// Images in the catalog, optionally only those built for `arch`.
    pub async fn list_images(&self, arch: Option<String>) -> Result<Vec<ImageMetadata>> {
        self.request(|reply| OperatorCommand::ListImages { arch, reply })
            .await?
    }
}

/// Executes operator commands one at a time
pub struct CommandLoop {
    engine: Arc<TransferEngine>,
    catalog: Arc<dyn ImageCatalog>,
    key_dir: PathBuf,
    rx: mpsc::Receiver<OperatorCommand>,
}

impl CommandLoop {
    /// Creates the loop and the handle that feeds it.
    pub fn new(
        engine: Arc<TransferEngine>,
        catalog: Arc<dyn ImageCatalog>,
        key_dir: impl Into<PathBuf>,
    ) -> (Self, OperatorHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let command_loop = Self {
            engine,
            catalog,
            key_dir: key_dir.into(),
            rx,
        };
        (command_loop, OperatorHandle { tx })
    }

    /// Run until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Operator command loop started");
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        debug!("All operator handles dropped");
                        break;
                    };
                    self.execute(command).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Operator command loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn execute(&self, command: OperatorCommand) {
        // A dropped receiver means the caller stopped waiting; nothing to report.
        match command {
            OperatorCommand::ListSessions { reply } => {
                let _ = reply.send(self.engine.sessions().list().await);
            }
            OperatorCommand::StartTransfer { mac, image, reply } => {
                let result = self.start_transfer(mac, &image).await;
                if let Err(e) = &result {
                    log_failure("start transfer", &mac, e);
                }
                let _ = reply.send(result);
            }
            OperatorCommand::ExportKey { mac, reply } => {
                let result = self.export_key(mac).await;
                if let Err(e) = &result {
                    log_failure("export key", &mac, e);
                }
                let _ = reply.send(result);
            }
            OperatorCommand::ListImages { arch, reply } => {
                let result = match arch {
                    Some(arch) => self.catalog.compatible_with(&arch).await,
                    None => self.catalog.list().await,
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn start_transfer(&self, mac: MacAddr, image: &str) -> Result<ImageMetadata> {
        let arch = {
            let session = self.engine.sessions().get(&mac).await?;
            let arch = session.lock().await.arch.clone();
            arch
        };
        let metadata = self.catalog.resolve(image).await?;
        if metadata.arch != arch {
            return Err(NetInstallError::ImageNotFound(format!(
                "{image} is built for {}, {mac} is {arch}",
                metadata.arch
            )));
        }
        let content = self.catalog.load(image).await?;
        self.engine.start(&mac, &metadata.filename, content).await?;
        Ok(metadata)
    }

    async fn export_key(&self, mac: MacAddr) -> Result<PathBuf> {
        let (key_id, key) = {
            let session = self.engine.sessions().get(&mac).await?;
            let session = session.lock().await;
            (session.key_id.clone(), session.key.clone())
        };
        write_key_file(&self.key_dir, &mac, &key_id, &key).await
    }
}

fn log_failure(action: &str, mac: &MacAddr, e: &NetInstallError) {
    if e.is_peer_fault() {
        info!(mac = %mac, error = %e, "Could not {action}");
    } else {
        error!(mac = %mac, error = %e, "Could not {action}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::catalog::tests::metadata;
    use crate::config::ServerConfig;
    use crate::events::EventBus;
    use crate::packet::Discovery;
    use crate::session::{SessionRegistry, TransferPhase};
    use crate::transport::mock::RecordingSink;
    use std::net::Ipv4Addr;

    const DEVICE: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    struct Fixture {
        handle: OperatorHandle,
        engine: Arc<TransferEngine>,
        sink: Arc<RecordingSink>,
        shutdown: watch::Sender<bool>,
        key_dir: PathBuf,
    }

    async fn fixture(name: &str) -> Fixture {
        let config = ServerConfig::new(
            Ipv4Addr::new(192, 168, 88, 2),
            MacAddr::new([2, 0, 0, 0, 0, 1]),
        );
        let sink = Arc::new(RecordingSink::new());
        let sessions = Arc::new(SessionRegistry::new());
        sessions
            .on_discovery(Discovery {
                mac: DEVICE,
                key_id: "keyid1".to_string(),
                key: "KEYDATA".to_string(),
                name: "RB1100".to_string(),
                arch: "arm".to_string(),
            })
            .await;
        let engine = Arc::new(TransferEngine::new(
            &config,
            sessions,
            sink.clone(),
            EventBus::new(),
        ));

        let mut catalog = MemoryCatalog::new();
        catalog.add_image(metadata("routeros-arm.npk", "arm"), vec![1u8; 3000]);
        catalog.add_image(metadata("routeros-mipsbe.npk", "mipsbe"), vec![2u8; 3000]);

        let key_dir =
            std::env::temp_dir().join(format!("netinstall-op-{name}-{}", std::process::id()));
        let (command_loop, handle) = CommandLoop::new(engine.clone(), Arc::new(catalog), &key_dir);
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(command_loop.run(shutdown_rx));

        Fixture {
            handle,
            engine,
            sink,
            shutdown,
            key_dir,
        }
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let fixture = fixture("list").await;
        let sessions = fixture.handle.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].mac, DEVICE);
        assert_eq!(sessions[0].phase, TransferPhase::Idle);
    }

    #[tokio::test]
    async fn test_start_transfer_offers_image() {
        let fixture = fixture("start").await;
        let image = fixture
            .handle
            .start_transfer(DEVICE, "routeros-arm.npk")
            .await
            .unwrap();
        assert_eq!(image.arch, "arm");
        assert_eq!(fixture.sink.len(), 1);

        let session = fixture.engine.sessions().get(&DEVICE).await.unwrap();
        assert_eq!(session.lock().await.phase(), TransferPhase::Offered);

        let err = fixture
            .handle
            .start_transfer(DEVICE, "routeros-arm.npk")
            .await
            .unwrap_err();
        assert!(matches!(err, NetInstallError::ResourceBusy(_)));
    }

    #[tokio::test]
    async fn test_start_transfer_rejects_other_arch() {
        let fixture = fixture("arch").await;
        let err = fixture
            .handle
            .start_transfer(DEVICE, "routeros-mipsbe.npk")
            .await
            .unwrap_err();
        assert!(matches!(err, NetInstallError::ImageNotFound(_)));
        assert!(fixture.sink.is_empty());
    }

    #[tokio::test]
    async fn test_list_images_by_arch() {
        let fixture = fixture("images").await;
        let all = fixture.handle.list_images(None).await.unwrap();
        assert_eq!(all.len(), 2);
        let arm = fixture
            .handle
            .list_images(Some("arm".to_string()))
            .await
            .unwrap();
        assert_eq!(arm.len(), 1);
        assert_eq!(arm[0].filename, "routeros-arm.npk");
    }

    #[tokio::test]
    async fn test_export_key() {
        let fixture = fixture("key").await;
        let path = fixture.handle.export_key(DEVICE).await.unwrap();
        assert_eq!(path, fixture.key_dir.join("aabbccddeeff_keyid1.key"));
        assert!(tokio::fs::read_to_string(&path).await.unwrap().contains("KEYDATA"));

        let err = fixture
            .handle
            .export_key(MacAddr::new([9; 6]))
            .await
            .unwrap_err();
        assert!(matches!(err, NetInstallError::UnknownPeer(_)));
        tokio::fs::remove_dir_all(&fixture.key_dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_after_shutdown() {
        let fixture = fixture("shutdown").await;
        fixture.shutdown.send(true).unwrap();
        // The loop drops its receiver once it sees the signal
        let mut closed = false;
        for _ in 0..50 {
            if matches!(
                fixture.handle.list_sessions().await,
                Err(NetInstallError::ChannelClosed)
            ) {
                closed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(closed);
    }
}
