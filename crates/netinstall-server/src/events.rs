//! Server events.
//!
//! Every handler publishes what it does on a broadcast channel. The
//! controller logs them; tests subscribe to assert on progress.

use crate::hwaddr::MacAddr;
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::sync::broadcast;

/// Capacity of the event channel. Slow subscribers lag rather than block.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Event emitted by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A device asked to boot
    BootRequest { mac: MacAddr, vendor_class: String },
    /// A boot reply was broadcast
    BootReplySent { mac: MacAddr, assigned: Ipv4Addr },
    /// A boot file transfer was accepted
    ReadRequest {
        client: SocketAddr,
        filename: String,
        blksize: u16,
        total_blocks: usize,
    },
    /// A data block was sent
    BlockProgress {
        client: SocketAddr,
        block: usize,
        total_blocks: usize,
    },
    /// The final block was acknowledged
    BlockTransferCompleted { client: SocketAddr, filename: String },
    /// A device announced itself on the NetInstall port
    DeviceDiscovered {
        mac: MacAddr,
        name: String,
        arch: String,
    },
    /// An image was offered to a device
    TransferOffered { mac: MacAddr, image: String },
    /// A chunk of the image was sent
    ChunkProgress {
        mac: MacAddr,
        sent: usize,
        total: usize,
        percent: u8,
    },
    /// The device reported it is writing the image and rebooting
    TransferTerminated { mac: MacAddr },
    /// A datagram was dropped
    FrameDropped { peer: String, reason: String },
}

/// Cloneable publisher for [`ServerEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Whole-number percentage of `sent` over `total`; an empty total is complete.
pub fn percent(sent: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (sent.min(total) as u128 * 100) / total as u128;
    pct as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 10), 0);
        assert_eq!(percent(5, 10), 50);
        assert_eq!(percent(10, 10), 100);
        assert_eq!(percent(20, 10), 100);
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(1452, 4000), 36);
    }

    #[tokio::test]
    async fn test_event_bus_delivers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mac = MacAddr::new([1, 2, 3, 4, 5, 6]);
        bus.emit(ServerEvent::TransferTerminated { mac });
        assert_eq!(rx.recv().await.unwrap(), ServerEvent::TransferTerminated { mac });
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventBus::new().emit(ServerEvent::FrameDropped {
            peer: "10.0.0.1:69".to_string(),
            reason: "test".to_string(),
        });
    }

    #[test]
    fn test_event_serialization() {
        let event = ServerEvent::ChunkProgress {
            mac: MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            sent: 1452,
            total: 2904,
            percent: 50,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "chunk_progress");
        assert_eq!(json["mac"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(json["percent"], 50);
    }
}
