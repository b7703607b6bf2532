//! NetInstall transfer engine.
//!
//! Drives the install handshake for each discovered device:
//!
//! ```text
//! Idle --start--> Offered --YACK--> Acked --STRT--> Started --RETR--> Retrieving --RETR--> ...
//!                    any phase with a transfer --WTRM--> Done
//! ```
//!
//! Every frame after discovery is gated on the session counters. An inbound
//! frame is accepted only when it carries exactly the session's remote and
//! local counters. Each send bumps the remote counter, stamps the new remote
//! value together with the current local value, and bumps the local counter
//! once the datagram is out. A failed send leaves both counters untouched.
//!
//! The session lock is held from the counter check until the post-send
//! increment, so two datagrams for the same device never interleave.

use crate::config::ServerConfig;
use crate::error::{NetInstallError, Result};
use crate::events::{EventBus, ServerEvent, percent};
use crate::hwaddr::MacAddr;
use crate::packet::netinstall::control_payload;
use crate::packet::{Command, Discovery, NetInstallFrame};
use crate::session::{DeviceSession, SessionRegistry, TransferPhase, TransferState};
use crate::transport::{DatagramHandler, DatagramSink};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Bytes of image content per `RETR`
pub const CHUNK_SIZE: usize = 1452;

/// NetInstall transfer engine.
///
/// Owns no state of its own: every frame is checked and answered against the
/// session in the registry, under that session's lock.
pub struct TransferEngine {
    sessions: Arc<SessionRegistry>,
    sink: Arc<dyn DatagramSink>,
    events: EventBus,
    host_mac: MacAddr,
    target: SocketAddr,
}

impl TransferEngine {
    /// Creates a new engine sending NetInstall frames through `sink`.
    pub fn new(
        config: &ServerConfig,
        sessions: Arc<SessionRegistry>,
        sink: Arc<dyn DatagramSink>,
        events: EventBus,
    ) -> Self {
        Self {
            sessions,
            sink,
            events,
            host_mac: config.host_mac,
            target: config.netinstall_target(),
        }
    }

    /// Returns the registry the engine drives.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Offer `image` to the device at `mac`.
    ///
    /// Fails with `ResourceBusy`, changing nothing, while an earlier transfer
    /// to the device has not finished.
    pub async fn start(&self, mac: &MacAddr, image: &str, content: Bytes) -> Result<()> {
        let handle = self.sessions.get(mac).await?;
        let mut session = handle.lock().await;

        if let Some(transfer) = session.transfer.as_ref().filter(|t| t.is_active()) {
            return Err(NetInstallError::ResourceBusy(format!(
                "{mac} is already receiving {} ({})",
                transfer.image, transfer.phase
            )));
        }

        self.send(&mut session, control_payload(&["OFFR", "", ""]))
            .await?;
        session.transfer = Some(TransferState::new(image, content));

        info!(mac = %mac, image = %image, "Offered image");
        self.events.emit(ServerEvent::TransferOffered {
            mac: *mac,
            image: image.to_string(),
        });
        Ok(())
    }

    /// Handle one decoded frame.
    pub async fn on_frame(&self, frame: NetInstallFrame) -> Result<()> {
        let command = frame.command();
        if command == Some(Command::Discover) {
            return self.on_discovery(&frame).await;
        }
        if frame.destination != self.host_mac {
            debug!(
                source = %frame.source,
                destination = %frame.destination,
                "Ignoring frame addressed to another host"
            );
            return Ok(());
        }

        let handle = self.sessions.get(&frame.source).await?;
        let mut session = handle.lock().await;

        if !session.counters_match(&frame) {
            return Err(NetInstallError::ProtocolViolation(format!(
                "{} sent counters {}/{}, expected {}/{}",
                frame.source,
                frame.remote_counter,
                frame.local_counter,
                session.remote_counter,
                session.local_counter
            )));
        }

        let Some(command) = command else {
            return Err(NetInstallError::ProtocolViolation(format!(
                "{} sent an unknown command",
                frame.source
            )));
        };
        self.advance(&mut session, command).await
    }

    async fn on_discovery(&self, frame: &NetInstallFrame) -> Result<()> {
        let discovery = Discovery::from_frame(frame)?;
        info!(
            mac = %discovery.mac,
            name = %discovery.name,
            arch = %discovery.arch,
            "Device ready for NetInstall"
        );
        self.events.emit(ServerEvent::DeviceDiscovered {
            mac: discovery.mac,
            name: discovery.name.clone(),
            arch: discovery.arch.clone(),
        });
        self.sessions.on_discovery(discovery).await;
        Ok(())
    }

    /// Apply `command` to a session whose counters already matched.
    async fn advance(&self, session: &mut DeviceSession, command: Command) -> Result<()> {
        let mac = session.mac;
        let phase = session.phase();

        match (phase, command) {
            (TransferPhase::Idle, _) => Err(NetInstallError::ProtocolViolation(format!(
                "{mac} sent {command} with no transfer in progress"
            ))),
            (_, Command::Terminate) => {
                self.set_phase(session, TransferPhase::Done);
                info!(mac = %mac, "Device is writing the image and rebooting");
                self.events.emit(ServerEvent::TransferTerminated { mac });
                Ok(())
            }
            (TransferPhase::Offered, Command::YesAck) => {
                self.send(session, Bytes::new()).await?;
                self.set_phase(session, TransferPhase::Acked);
                info!(mac = %mac, "Offer accepted, waiting for the transfer to start");
                Ok(())
            }
            (TransferPhase::Acked, Command::Start) => {
                self.send(session, Bytes::new()).await?;
                self.set_phase(session, TransferPhase::Started);
                Ok(())
            }
            (TransferPhase::Started, Command::Retrieve) => {
                let Some(transfer) = session.transfer.as_ref() else {
                    return Ok(());
                };
                let header = format!("FILE\n{}\n{}\n", transfer.image, transfer.len());
                self.send(session, Bytes::from(header)).await?;
                if let Some(transfer) = session.transfer.as_mut() {
                    transfer.started = true;
                    transfer.phase = TransferPhase::Retrieving;
                }
                Ok(())
            }
            (TransferPhase::Retrieving, Command::Retrieve) => self.send_chunk(session).await,
            _ => Err(NetInstallError::ProtocolViolation(format!(
                "{mac} sent {command} while {phase}"
            ))),
        }
    }

    async fn send_chunk(&self, session: &mut DeviceSession) -> Result<()> {
        let Some(transfer) = session.transfer.as_ref() else {
            return Ok(());
        };
        let start = transfer.offset.min(transfer.len());
        let end = (start + CHUNK_SIZE).min(transfer.len());
        let chunk = transfer.content.slice(start..end);

        self.send(session, chunk).await?;

        let mac = session.mac;
        if let Some(transfer) = session.transfer.as_mut() {
            transfer.offset = end;
            let total = transfer.len();
            let pct = percent(end, total);
            debug!(
                mac = %mac,
                image = %transfer.image,
                sent = end,
                total,
                percent = pct,
                "Sent chunk"
            );
            self.events.emit(ServerEvent::ChunkProgress {
                mac,
                sent: end,
                total,
                percent: pct,
            });
        }
        Ok(())
    }

    fn set_phase(&self, session: &mut DeviceSession, phase: TransferPhase) {
        if let Some(transfer) = session.transfer.as_mut() {
            transfer.phase = phase;
        }
    }

    /// Counter-stamped send. The caller holds the session lock.
    async fn send(&self, session: &mut DeviceSession, payload: Bytes) -> Result<()> {
        let remote = session.remote_counter.wrapping_add(1);
        let frame = NetInstallFrame {
            source: self.host_mac,
            destination: session.mac,
            remote_counter: remote,
            local_counter: session.local_counter,
            payload,
        };
        self.sink.send_to(&frame.encode(), self.target).await?;
        session.remote_counter = remote;
        session.local_counter = session.local_counter.wrapping_add(1);
        Ok(())
    }
}

#[async_trait]
impl DatagramHandler for TransferEngine {
    async fn handle(&self, data: &[u8], _from: SocketAddr) -> Result<()> {
        let frame = NetInstallFrame::parse(data)?;
        self.on_frame(frame).await
    }
}
