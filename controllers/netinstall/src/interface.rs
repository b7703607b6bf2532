//! Host interface discovery.
//!
//! NetInstall frames are addressed by hardware address, so the controller
//! needs the MAC of the interface carrying the configured host address. The
//! interface may not be up yet when the controller starts (e.g. a USB NIC
//! plugged in later), so the lookup polls until it appears.

use crate::error::ControllerError;
use netinstall_server::MacAddr;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Addresses and hardware address of one interface
struct Candidate {
    ips: Vec<Ipv4Addr>,
    mac: Option<String>,
}

impl From<&NetworkInterface> for Candidate {
    fn from(iface: &NetworkInterface) -> Self {
        let ips = iface
            .addr
            .iter()
            .filter_map(|addr| match addr {
                Addr::V4(v4) => Some(v4.ip),
                _ => None,
            })
            .collect();
        Self {
            ips,
            mac: iface.mac_addr.clone(),
        }
    }
}

/// Find the hardware address of the interface carrying `host_ip`.
pub fn find_host_mac(host_ip: Ipv4Addr) -> Result<Option<MacAddr>, ControllerError> {
    let interfaces = NetworkInterface::show()
        .map_err(|e| ControllerError::Interface(format!("failed to list interfaces: {e}")))?;
    debug!("Found {} network interfaces", interfaces.len());
    let candidates: Vec<Candidate> = interfaces.iter().map(Candidate::from).collect();
    Ok(mac_for_ip(&candidates, host_ip))
}

fn mac_for_ip(candidates: &[Candidate], host_ip: Ipv4Addr) -> Option<MacAddr> {
    candidates
        .iter()
        .filter(|candidate| candidate.ips.contains(&host_ip))
        .filter_map(|candidate| candidate.mac.as_deref())
        .filter_map(|mac| mac.parse::<MacAddr>().ok())
        .find(|mac| mac.octets() != [0; 6])
}

/// Poll every second until an interface carrying `host_ip` shows up.
pub async fn wait_for_host_mac(host_ip: Ipv4Addr) -> Result<MacAddr, ControllerError> {
    let mut announced = false;
    loop {
        if let Some(mac) = find_host_mac(host_ip)? {
            info!(host_ip = %host_ip, host_mac = %mac, "Found host interface");
            return Ok(mac);
        }
        if !announced {
            info!(host_ip = %host_ip, "Waiting for network interface...");
            announced = true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
