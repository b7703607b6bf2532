//! Server event watcher.
//!
//! Subscribes to the server's event stream and turns it into the operator's
//! log: boots, block transfers, discovered devices and install progress.

use netinstall_server::ServerEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Log events until shutdown or until the server drops its sender.
pub async fn watch_events(
    mut events: broadcast::Receiver<ServerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_percent = None;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event, &mut last_percent),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Log one event. `last_percent` keeps chunk progress to one line per percent.
fn log_event(event: &ServerEvent, last_percent: &mut Option<u8>) {
    match event {
        ServerEvent::BootRequest { mac, vendor_class } => {
            info!("Got boot request from {} for \"{}\"", mac, vendor_class);
        }
        ServerEvent::BootReplySent { mac, assigned } => {
            info!("Offered {} to {}", assigned, mac);
        }
        ServerEvent::ReadRequest {
            client,
            filename,
            blksize,
            total_blocks,
        } => {
            info!(
                "Sending boot file \"{}\" to {} ({} blocks of {} bytes)",
                filename, client, total_blocks, blksize
            );
        }
        ServerEvent::BlockProgress {
            client,
            block,
            total_blocks,
        } => {
            debug!("Sent block {}/{} to {}", block, total_blocks, client);
        }
        ServerEvent::BlockTransferCompleted { client, filename } => {
            info!("Boot file \"{}\" delivered to {}", filename, client);
        }
        ServerEvent::DeviceDiscovered { mac, name, arch } => {
            info!(
                "Device \"{} ({})\" with mac {} is ready. Press \"i\" for menu",
                name, arch, mac
            );
        }
        ServerEvent::TransferOffered { mac, image } => {
            *last_percent = None;
            info!("Offered \"{}\" to {}", image, mac);
        }
        ServerEvent::ChunkProgress {
            mac,
            sent,
            total,
            percent,
        } => {
            if *last_percent != Some(*percent) {
                *last_percent = Some(*percent);
                info!("Sending to {}: {}% ({}/{} bytes)", mac, percent, sent, total);
            }
        }
        ServerEvent::TransferTerminated { mac } => {
            info!("Done, {} is rebooting into the new system", mac);
        }
        ServerEvent::FrameDropped { peer, reason } => {
            debug!("Dropped datagram from {}: {}", peer, reason);
        }
    }
}
