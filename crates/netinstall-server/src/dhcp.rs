//! Boot responder.
//!
//! Answers BOOTP boot requests from devices in etherboot mode. Every device is
//! handed the same configured client address; the vendor class identifier it
//! declared is recorded so the block-transfer server knows which boot file to
//! serve to that address.

use crate::config::ServerConfig;
use crate::error::Result;
use crate::events::{EventBus, ServerEvent};
use crate::identity::BootIdentityTable;
use crate::packet::BootpFrame;
use crate::transport::{DatagramHandler, DatagramSink};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

/// BOOTP responder for devices in etherboot mode.
pub struct BootResponder {
    identities: Arc<BootIdentityTable>,
    sink: Arc<dyn DatagramSink>,
    events: EventBus,
    client_ip: Ipv4Addr,
    host_ip: Ipv4Addr,
    reply_target: SocketAddr,
}

impl BootResponder {
    /// Creates a new responder assigning `config.client_ip` to every device.
    pub fn new(
        config: &ServerConfig,
        identities: Arc<BootIdentityTable>,
        sink: Arc<dyn DatagramSink>,
        events: EventBus,
    ) -> Self {
        Self {
            identities,
            sink,
            events,
            client_ip: config.client_ip,
            host_ip: config.host_ip,
            reply_target: config.boot_reply_target(),
        }
    }

    /// Handle a decoded boot request.
    ///
    /// Frames that are not boot requests, or that carry no vendor class
    /// identifier as their first option, are ignored.
    pub async fn on_boot_request(&self, request: &BootpFrame) -> Result<()> {
        if !request.is_boot_request() {
            debug!(op = request.op, "Ignoring BOOTP frame that is not a request");
            return Ok(());
        }
        let mac = request.mac_address();
        let Some(vendor_class) = request.vendor_class_identifier() else {
            debug!(mac = %mac, "Ignoring boot request without vendor class identifier");
            return Ok(());
        };

        info!(mac = %mac, vendor_class = %vendor_class, xid = request.xid, "Boot request");
        self.events.emit(ServerEvent::BootRequest {
            mac,
            vendor_class: vendor_class.clone(),
        });

        self.identities.record(self.client_ip, vendor_class).await;

        let reply = BootpFrame::reply(request, self.client_ip, self.host_ip);
        self.sink.send_to(&reply.encode(), self.reply_target).await?;

        info!(mac = %mac, assigned = %self.client_ip, "Boot reply sent");
        self.events.emit(ServerEvent::BootReplySent {
            mac,
            assigned: self.client_ip,
        });
        Ok(())
    }
}

#[async_trait]
impl DatagramHandler for BootResponder {
    async fn handle(&self, data: &[u8], _from: SocketAddr) -> Result<()> {
        let request = BootpFrame::parse(data)?;
        self.on_boot_request(&request).await
    }
}
