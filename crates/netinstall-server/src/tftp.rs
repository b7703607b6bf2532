//! Block-transfer (TFTP) server.
//!
//! Serves the boot file to devices that were just answered by the boot
//! responder. The file served does not depend on the requested name: it is
//! the one named after the vendor class identifier the requesting address
//! declared in its boot request.
//!
//! Each (address, port) pair gets one independent transfer. Blocks advance
//! strictly on acknowledgement; there are no timers and no retransmission
//! beyond answering a repeated acknowledgement with the same next block.

use crate::error::{NetInstallError, Result};
use crate::events::{EventBus, ServerEvent};
use crate::identity::BootIdentityTable;
use crate::packet::TftpPacket;
use crate::transport::{DatagramHandler, DatagramSink};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Block size used when the client does not negotiate one (RFC 1350)
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Smallest block size we agree to (RFC 2348)
pub const MIN_BLOCK_SIZE: u16 = 8;

/// Largest block size we agree to (RFC 2348)
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// Block numbers are 16 bits wide and never wrap
pub const MAX_BLOCKS: usize = u16::MAX as usize;

/// TFTP error code for an illegal operation
const ERROR_ACCESS_VIOLATION: u16 = 2;

/// Source of boot files, addressed by vendor class identifier
#[async_trait]
pub trait FileProvider: Send + Sync {
    async fn load(&self, name: &str) -> Result<Bytes>;
}

/// Serves files from a directory. Names containing path components are refused.
#[derive(Debug, Clone)]
pub struct DirectoryFileProvider {
    root: PathBuf,
}

impl DirectoryFileProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl FileProvider for DirectoryFileProvider {
    async fn load(&self, name: &str) -> Result<Bytes> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(NetInstallError::ImageNotFound(format!(
                "refusing boot file name {name:?}"
            )));
        }
        let path = self.root.join(name);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NetInstallError::ImageNotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory file provider
#[derive(Debug, Default, Clone)]
pub struct MemoryFileProvider {
    files: HashMap<String, Bytes>,
}

impl MemoryFileProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.files.insert(name.into(), data.into());
    }
}

#[async_trait]
impl FileProvider for MemoryFileProvider {
    async fn load(&self, name: &str) -> Result<Bytes> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| NetInstallError::ImageNotFound(name.to_string()))
    }
}

/// One in-flight transfer
#[derive(Debug)]
struct BlockTransferClient {
    filename: String,
    blksize: u16,
    data: Bytes,
    total_blocks: usize,
}

impl BlockTransferClient {
    /// Bytes of 1-based block `n`
    fn block(&self, n: usize) -> Bytes {
        let size = usize::from(self.blksize);
        let start = ((n - 1) * size).min(self.data.len());
        let end = (n * size).min(self.data.len());
        self.data.slice(start..end)
    }
}

/// Number of `blksize` blocks needed for `len` bytes when the size was negotiated.
pub fn total_blocks(len: usize, blksize: u16) -> usize {
    len.div_ceil(usize::from(blksize))
}

/// TFTP server for boot files, one transfer per client address and port.
pub struct BlockTransferServer {
    identities: Arc<BootIdentityTable>,
    files: Arc<dyn FileProvider>,
    sink: Arc<dyn DatagramSink>,
    events: EventBus,
    clients: RwLock<HashMap<SocketAddr, Arc<Mutex<BlockTransferClient>>>>,
}

impl BlockTransferServer {
    /// Creates a new server reading boot files from `files`.
    pub fn new(
        identities: Arc<BootIdentityTable>,
        files: Arc<dyn FileProvider>,
        sink: Arc<dyn DatagramSink>,
        events: EventBus,
    ) -> Self {
        Self {
            identities,
            files,
            sink,
            events,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Number of transfers in flight
    pub async fn active_transfers(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Accept a read request from `from`.
    ///
    /// With a `blksize` option the negotiated size is confirmed with an OACK
    /// and the client starts by acknowledging block 0. Without one, 512-byte
    /// blocks are used, block 1 is sent straight away and the last block is
    /// always shorter than 512 bytes.
    pub async fn on_read_request(
        &self,
        from: SocketAddr,
        requested: &str,
        blksize: Option<u16>,
    ) -> Result<()> {
        let IpAddr::V4(ip) = from.ip() else {
            return Err(NetInstallError::UnknownPeer(from.to_string()));
        };
        let Some(identifier) = self.identities.lookup(ip).await else {
            return Err(NetInstallError::UnknownPeer(format!(
                "{from} never sent a boot request"
            )));
        };
        if self.clients.read().await.contains_key(&from) {
            return Err(NetInstallError::ResourceBusy(format!(
                "transfer to {from} already in progress"
            )));
        }

        let data = self.files.load(&identifier).await?;
        let negotiated = blksize.map(|size| size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE));
        let size = negotiated.unwrap_or(DEFAULT_BLOCK_SIZE);
        let blocks = match negotiated {
            Some(_) => total_blocks(data.len(), size),
            // The client only sees the end of the file in a short block, so a
            // file filling its last block gets an empty one after it
            None => data.len() / usize::from(size) + 1,
        };
        if blocks > MAX_BLOCKS {
            return Err(NetInstallError::FileTooLarge {
                size: data.len(),
                blocks,
            });
        }

        let client = Arc::new(Mutex::new(BlockTransferClient {
            filename: identifier.clone(),
            blksize: size,
            data,
            total_blocks: blocks,
        }));

        // Hold the client lock until the first frame is out so an early ACK waits for it
        let guard = {
            let mut clients = self.clients.write().await;
            match clients.entry(from) {
                Entry::Occupied(_) => {
                    return Err(NetInstallError::ResourceBusy(format!(
                        "transfer to {from} already in progress"
                    )));
                }
                Entry::Vacant(slot) => {
                    let guard = client.clone().lock_owned().await;
                    slot.insert(client);
                    guard
                }
            }
        };

        info!(
            client = %from,
            requested = %requested,
            filename = %identifier,
            blksize = size,
            total_blocks = blocks,
            "Read request accepted"
        );
        self.events.emit(ServerEvent::ReadRequest {
            client: from,
            filename: identifier,
            blksize: size,
            total_blocks: blocks,
        });

        let sent = match negotiated {
            Some(blksize) => self.send(&TftpPacket::Oack { blksize }, from).await,
            None => self.send_block(&guard, 1, from).await,
        };
        drop(guard);
        if sent.is_err() {
            self.clients.write().await.remove(&from);
        }
        sent
    }

    /// Acknowledgement of block `n`: send block `n + 1`, or finish after the last one.
    pub async fn on_ack(&self, from: SocketAddr, n: u16) -> Result<()> {
        let client = self
            .clients
            .read()
            .await
            .get(&from)
            .cloned()
            .ok_or_else(|| NetInstallError::UnknownPeer(format!("no transfer for {from}")))?;
        let client = client.lock().await;
        let acked = usize::from(n);

        if acked == client.total_blocks {
            info!(client = %from, filename = %client.filename, "Block transfer complete");
            self.events.emit(ServerEvent::BlockTransferCompleted {
                client: from,
                filename: client.filename.clone(),
            });
            self.clients.write().await.remove(&from);
            return Ok(());
        }
        if acked > client.total_blocks {
            return Err(NetInstallError::ProtocolViolation(format!(
                "{from} acknowledged block {acked} of {}",
                client.total_blocks
            )));
        }

        self.send_block(&client, acked + 1, from).await
    }

    /// The client gave up; forget its transfer.
    pub async fn on_error(&self, from: SocketAddr, code: u16, message: &str) -> Result<()> {
        warn!(client = %from, code, message = %message, "Client aborted block transfer");
        self.clients.write().await.remove(&from);
        Ok(())
    }

    async fn send_block(
        &self,
        client: &BlockTransferClient,
        n: usize,
        to: SocketAddr,
    ) -> Result<()> {
        let packet = TftpPacket::Data {
            block: n as u16,
            data: client.block(n),
        };
        self.send(&packet, to).await?;
        debug!(client = %to, block = n, total = client.total_blocks, "Sent block");
        self.events.emit(ServerEvent::BlockProgress {
            client: to,
            block: n,
            total_blocks: client.total_blocks,
        });
        Ok(())
    }

    async fn send(&self, packet: &TftpPacket, to: SocketAddr) -> Result<()> {
        self.sink.send_to(&packet.encode(), to).await
    }
}

#[async_trait]
impl DatagramHandler for BlockTransferServer {
    async fn handle(&self, data: &[u8], from: SocketAddr) -> Result<()> {
        let packet = TftpPacket::parse(data)?;
        match &packet {
            TftpPacket::ReadRequest { filename, .. } => {
                self.on_read_request(from, filename, packet.requested_blksize())
                    .await
            }
            TftpPacket::Ack { block } => self.on_ack(from, *block).await,
            TftpPacket::Error { code, message } => self.on_error(from, *code, message).await,
            TftpPacket::WriteRequest { filename, .. } => {
                let refusal = TftpPacket::Error {
                    code: ERROR_ACCESS_VIOLATION,
                    message: "Write not supported".to_string(),
                };
                self.send(&refusal, from).await?;
                Err(NetInstallError::ProtocolViolation(format!(
                    "{from} tried to write {filename}"
                )))
            }
            TftpPacket::Data { .. } | TftpPacket::Oack { .. } => Err(
                NetInstallError::ProtocolViolation(format!("unexpected packet from {from}")),
            ),
        }
    }
}
