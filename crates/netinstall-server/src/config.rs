//! Server configuration
//!
//! Addresses, ports and directories used by the boot responder, the block
//! transfer server and the NetInstall engine.

use crate::error::{NetInstallError, Result};
use crate::hwaddr::MacAddr;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;

/// Port the boot responder listens on
pub const BOOT_SERVER_PORT: u16 = 67;

/// Port boot replies are broadcast to
pub const BOOT_CLIENT_PORT: u16 = 68;

/// Block-transfer (TFTP) port
pub const TFTP_PORT: u16 = 69;

/// NetInstall port
pub const NETINSTALL_PORT: u16 = 5000;

/// Address handed to every booting device unless configured otherwise
pub const DEFAULT_CLIENT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 88, 20);

/// NetInstall server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of this host on the provisioning LAN. Sent as the server
    /// address in boot replies; the block-transfer socket binds to it.
    pub host_ip: Ipv4Addr,

    /// Hardware address of the interface carrying `host_ip`. NetInstall
    /// frames addressed to any other destination are ignored.
    pub host_mac: MacAddr,

    /// Address assigned to booting devices (single fixed address, no pool)
    pub client_ip: Ipv4Addr,

    /// Run only the NetInstall listener, for devices that are already in
    /// NetInstall mode
    pub netinstall_only: bool,

    /// Directory holding boot files, named by vendor class identifier
    pub boot_dir: PathBuf,

    /// Directory holding installable packages
    pub image_dir: PathBuf,

    /// Directory key files are exported to
    pub key_dir: PathBuf,

    /// Address for the HTTP operator API. Disabled when `None`.
    pub api_addr: Option<SocketAddr>,

    /// Destination for every broadcast send
    pub broadcast_ip: Ipv4Addr,

    pub boot_server_port: u16,
    pub boot_client_port: u16,
    pub tftp_port: u16,
    pub netinstall_port: u16,
}

impl ServerConfig {
    /// Creates a configuration for `host_ip` with every other setting at its default.
    pub fn new(host_ip: Ipv4Addr, host_mac: MacAddr) -> Self {
        Self {
            host_ip,
            host_mac,
            client_ip: DEFAULT_CLIENT_IP,
            netinstall_only: false,
            boot_dir: PathBuf::from("./vmlinux"),
            image_dir: PathBuf::from("./npk"),
            key_dir: PathBuf::from("./key"),
            api_addr: None,
            broadcast_ip: Ipv4Addr::BROADCAST,
            boot_server_port: BOOT_SERVER_PORT,
            boot_client_port: BOOT_CLIENT_PORT,
            tftp_port: TFTP_PORT,
            netinstall_port: NETINSTALL_PORT,
        }
    }

    /// Set the address assigned to booting devices
    pub fn with_client_ip(mut self, client_ip: Ipv4Addr) -> Self {
        self.client_ip = client_ip;
        self
    }

    /// Skip the boot and block-transfer listeners
    pub fn with_netinstall_only(mut self, netinstall_only: bool) -> Self {
        self.netinstall_only = netinstall_only;
        self
    }

    pub fn with_boot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.boot_dir = dir.into();
        self
    }

    pub fn with_image_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_dir = dir.into();
        self
    }

    pub fn with_key_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.key_dir = dir.into();
        self
    }

    /// Enable the HTTP operator API
    pub fn with_api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = Some(addr);
        self
    }

    /// Override the broadcast destination (e.g. a directed broadcast)
    pub fn with_broadcast_ip(mut self, broadcast_ip: Ipv4Addr) -> Self {
        self.broadcast_ip = broadcast_ip;
        self
    }

    /// Where boot replies are sent
    pub fn boot_reply_target(&self) -> SocketAddr {
        SocketAddrV4::new(self.broadcast_ip, self.boot_client_port).into()
    }

    /// Where NetInstall frames are sent
    pub fn netinstall_target(&self) -> SocketAddr {
        SocketAddrV4::new(self.broadcast_ip, self.netinstall_port).into()
    }

    pub fn boot_bind_addr(&self) -> SocketAddr {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.boot_server_port).into()
    }

    pub fn tftp_bind_addr(&self) -> SocketAddr {
        SocketAddrV4::new(self.host_ip, self.tftp_port).into()
    }

    pub fn netinstall_bind_addr(&self) -> SocketAddr {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.netinstall_port).into()
    }

    /// Check that the addresses make sense together.
    pub fn validate(&self) -> Result<()> {
        if self.host_ip.is_unspecified() || self.host_ip.is_broadcast() {
            return Err(NetInstallError::Configuration(format!(
                "host address {} is not a unicast address",
                self.host_ip
            )));
        }
        if self.client_ip.is_unspecified() || self.client_ip.is_broadcast() {
            return Err(NetInstallError::Configuration(format!(
                "client address {} is not a unicast address",
                self.client_ip
            )));
        }
        if self.client_ip == self.host_ip {
            return Err(NetInstallError::Configuration(format!(
                "client address {} collides with the host address",
                self.client_ip
            )));
        }
        Ok(())
    }
}
