//! NetInstall server errors

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur while serving boot, block-transfer and NetInstall traffic.
///
/// The first four variants describe faults of the peer and are expected on a
/// busy LAN; handlers drop the datagram and keep going.
#[derive(Debug, Error)]
pub enum NetInstallError {
    /// Truncated or unparseable datagram
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Counter mismatch or a command that is not valid in the current state
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Datagram from a device or client we hold no state for
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Duplicate start for a device or duplicate read-request for an endpoint
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("malformed image {filename}: {reason}")]
    MalformedImage { filename: String, reason: String },

    #[error("file too large: {size} bytes needs {blocks} blocks (max: 65535)")]
    FileTooLarge { size: usize, blocks: usize },

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The command loop has stopped
    #[error("operator command channel closed")]
    ChannelClosed,
}

impl NetInstallError {
    /// True for errors caused by what a peer sent rather than by this host.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            NetInstallError::MalformedFrame(_)
                | NetInstallError::ProtocolViolation(_)
                | NetInstallError::UnknownPeer(_)
                | NetInstallError::ResourceBusy(_)
        )
    }
}

/// Result type for NetInstall server operations
pub type Result<T> = std::result::Result<T, NetInstallError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_error_display() {
        let err = NetInstallError::UnknownPeer("aa:bb:cc:dd:ee:ff".to_string());
        assert_eq!(err.to_string(), "unknown peer: aa:bb:cc:dd:ee:ff");

        let err = NetInstallError::FileTooLarge {
            size: 100_000_000,
            blocks: 195_313,
        };
        assert!(err.to_string().contains("too large"));

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5000);
        let err = NetInstallError::BindFailed {
            addr,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        };
        assert!(err.to_string().contains("failed to bind"));
    }

    #[test]
    fn test_peer_fault_classification() {
        assert!(NetInstallError::MalformedFrame("short".into()).is_peer_fault());
        assert!(NetInstallError::ProtocolViolation("counter".into()).is_peer_fault());
        assert!(NetInstallError::ResourceBusy("busy".into()).is_peer_fault());
        assert!(!NetInstallError::ChannelClosed.is_peer_fault());
        assert!(!NetInstallError::Io(std::io::Error::other("boom")).is_peer_fault());
    }
}
