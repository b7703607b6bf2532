//! Device sessions.
//!
//! One session per device that announced itself on the NetInstall port,
//! keyed by hardware address. A session owns the device's two sequence
//! counters and its transfer progress; the registry hands out shared handles
//! whose lock must be held across every check-send-increment sequence.

use crate::error::{NetInstallError, Result};
use crate::events::percent;
use crate::hwaddr::MacAddr;
use crate::packet::{Discovery, NetInstallFrame};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Where a session is in the install handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Idle,
    Offered,
    Acked,
    Started,
    Retrieving,
    Done,
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferPhase::Idle => "idle",
            TransferPhase::Offered => "offered",
            TransferPhase::Acked => "acked",
            TransferPhase::Started => "started",
            TransferPhase::Retrieving => "retrieving",
            TransferPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// An image being pushed to a device
#[derive(Debug, Clone)]
pub struct TransferState {
    /// File name announced in the `FILE` header
    pub image: String,
    pub content: Bytes,
    /// Bytes already sent
    pub offset: usize,
    /// Set once the `FILE` header went out
    pub started: bool,
    pub phase: TransferPhase,
}

impl TransferState {
    pub fn new(image: impl Into<String>, content: Bytes) -> Self {
        Self {
            image: image.into(),
            content,
            offset: 0,
            started: false,
            phase: TransferPhase::Offered,
        }
    }

    /// A finished transfer does not block a new one.
    pub fn is_active(&self) -> bool {
        self.phase != TransferPhase::Done
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Per-device state
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub mac: MacAddr,
    pub key_id: String,
    /// Activation key material as declared by the device
    pub key: String,
    pub name: String,
    pub arch: String,
    /// Stamped into the remote field of every frame; bumped before each send
    pub remote_counter: u16,
    /// Stamped into the local field; bumped after each successful send
    pub local_counter: u16,
    pub transfer: Option<TransferState>,
    pub discovered_at: DateTime<Utc>,
}

impl DeviceSession {
    pub fn from_discovery(discovery: Discovery) -> Self {
        Self {
            mac: discovery.mac,
            key_id: discovery.key_id,
            key: discovery.key,
            name: discovery.name,
            arch: discovery.arch,
            remote_counter: 0,
            local_counter: 0,
            transfer: None,
            discovered_at: Utc::now(),
        }
    }

    pub fn phase(&self) -> TransferPhase {
        self.transfer
            .as_ref()
            .map_or(TransferPhase::Idle, |transfer| transfer.phase)
    }

    /// Whether `frame` carries exactly the counters this session expects.
    pub fn counters_match(&self, frame: &NetInstallFrame) -> bool {
        frame.remote_counter == self.remote_counter && frame.local_counter == self.local_counter
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            mac: self.mac,
            key_id: self.key_id.clone(),
            name: self.name.clone(),
            arch: self.arch.clone(),
            phase: self.phase(),
            remote_counter: self.remote_counter,
            local_counter: self.local_counter,
            image: self.transfer.as_ref().map(|t| t.image.clone()),
            progress: self.transfer.as_ref().map(|t| TransferProgress {
                sent: t.offset,
                total: t.len(),
                percent: percent(t.offset, t.len()),
            }),
            discovered_at: self.discovered_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub sent: usize,
    pub total: usize,
    pub percent: u8,
}

/// Point-in-time view of a session for operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub mac: MacAddr,
    pub key_id: String,
    pub name: String,
    pub arch: String,
    pub phase: TransferPhase,
    pub remote_counter: u16,
    pub local_counter: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<TransferProgress>,
    pub discovered_at: DateTime<Utc>,
}

/// Shared handle to one session
pub type SessionHandle = Arc<Mutex<DeviceSession>>;

/// Sessions of every discovered device, keyed by hardware address.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<MacAddr, SessionHandle>>,
}

impl SessionRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session for a discovered device, replacing any earlier one
    /// with fresh counters.
    pub async fn on_discovery(&self, discovery: Discovery) -> SessionHandle {
        let mac = discovery.mac;
        let session = Arc::new(Mutex::new(DeviceSession::from_discovery(discovery)));
        self.sessions.write().await.insert(mac, session.clone());
        session
    }

    pub async fn get(&self, mac: &MacAddr) -> Result<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(mac)
            .cloned()
            .ok_or_else(|| NetInstallError::UnknownPeer(mac.to_string()))
    }

    /// Summaries of every session, oldest discovery first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.lock().await.summary());
        }
        summaries.sort_by(|a, b| {
            a.discovered_at
                .cmp(&b.discovered_at)
                .then_with(|| a.mac.cmp(&b.mac))
        });
        summaries
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
