//! Datagram transport.
//!
//! Handlers never touch sockets directly; they send through a [`DatagramSink`]
//! so that the protocol logic can be driven from tests without binding ports.

use crate::error::{NetInstallError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Something that can transmit one datagram to an address.
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<()>;
}

#[async_trait]
impl DatagramSink for UdpSocket {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<()> {
        UdpSocket::send_to(self, payload, target).await?;
        Ok(())
    }
}

/// Protocol handler fed one received datagram at a time.
///
/// Handlers are shared between concurrently running tasks, one per datagram.
#[async_trait]
pub trait DatagramHandler: Send + Sync {
    async fn handle(&self, data: &[u8], from: SocketAddr) -> Result<()>;
}

/// Bind a broadcast-capable, address-reusing UDP socket for use with tokio.
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let bind_failed = |source| NetInstallError::BindFailed { addr, source };

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(bind_failed)?;

    socket.set_reuse_address(true).map_err(bind_failed)?;
    socket.set_broadcast(true).map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;
    socket.set_nonblocking(true).map_err(bind_failed)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_failed)
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    //! In-memory sinks for driving handlers in tests.

    use super::*;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    /// Records every datagram instead of sending it.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        fn sent(&self) -> MutexGuard<'_, Vec<(SocketAddr, Vec<u8>)>> {
            self.sent.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Drain everything sent so far.
        pub fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
            std::mem::take(&mut *self.sent())
        }

        pub fn len(&self) -> usize {
            self.sent().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    #[async_trait]
    impl DatagramSink for RecordingSink {
        async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<()> {
            self.sent().push((target, payload.to_vec()));
            Ok(())
        }
    }

    /// Fails every send with an IO error.
    #[derive(Debug, Default)]
    pub struct FailingSink;

    #[async_trait]
    impl DatagramSink for FailingSink {
        async fn send_to(&self, _payload: &[u8], _target: SocketAddr) -> Result<()> {
            Err(NetInstallError::Io(std::io::Error::other("network unreachable")))
        }
    }
}
