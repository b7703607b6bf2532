//! NetInstall Controller
//!
//! Reinstalls MikroTik RouterOS devices over the network.
//!
//! This controller runs the NetInstall provisioning server on a host
//! interface: it answers BOOTP requests, serves the boot file over TFTP and
//! hands RouterOS packages to devices that enter NetInstall mode. Devices
//! and packages are driven from the console (press `i`) or the HTTP API.
//!
//! Configuration comes from environment variables:
//!
//! - `NETINSTALL_HOST_IP` (required): address of the serving interface
//! - `NETINSTALL_HOST_MAC`: its hardware address, looked up when unset
//! - `NETINSTALL_CLIENT_IP`: address handed to booting devices
//! - `NETINSTALL_ONLY`: skip BOOTP and TFTP when `true` or `1`
//! - `NETINSTALL_BOOT_DIR`, `NETINSTALL_IMAGE_DIR`, `NETINSTALL_KEY_DIR`
//! - `NETINSTALL_API_ADDR`: enables the HTTP API on this address
//! - `RUST_LOG`: log filter, `info` by default

mod console;
mod controller;
mod error;
mod interface;
mod watcher;

use crate::error::ControllerError;
use anyhow::{Context, Result};
use controller::Controller;
use netinstall_server::{MacAddr, ServerConfig};
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting NetInstall Controller");

    let settings = Settings::from_lookup(|key| std::env::var(key).ok())?;
    let host_mac = match settings.host_mac {
        Some(mac) => mac,
        None => interface::wait_for_host_mac(settings.host_ip)
            .await
            .context("failed to find the host interface")?,
    };
    let config = settings.into_config(host_mac);

    info!("Configuration:");
    info!("  Host: {} ({})", config.host_ip, config.host_mac);
    info!("  Client IP: {}", config.client_ip);
    info!("  NetInstall only: {}", config.netinstall_only);
    info!("  Boot files: {}", config.boot_dir.display());
    info!("  Images: {}", config.image_dir.display());
    info!("  Keys: {}", config.key_dir.display());
    match config.api_addr {
        Some(addr) => info!("  API: {}", addr),
        None => info!("  API: disabled"),
    }

    Controller::new(config)?.run().await
}

/// Settings read from the environment before the host MAC is known
#[derive(Debug)]
struct Settings {
    host_ip: Ipv4Addr,
    host_mac: Option<MacAddr>,
    client_ip: Option<Ipv4Addr>,
    netinstall_only: bool,
    boot_dir: Option<String>,
    image_dir: Option<String>,
    key_dir: Option<String>,
    api_addr: Option<SocketAddr>,
}

impl Settings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let host_ip = parse_var(&lookup, "NETINSTALL_HOST_IP")?.ok_or_else(|| {
            ControllerError::InvalidConfig(
                "NETINSTALL_HOST_IP environment variable is required".to_string(),
            )
        })?;

        let netinstall_only = match lookup("NETINSTALL_ONLY").as_deref().map(str::trim) {
            None | Some("" | "0" | "false") => false,
            Some("1" | "true") => true,
            Some(other) => {
                return Err(ControllerError::InvalidConfig(format!(
                    "NETINSTALL_ONLY must be true or false, got {other:?}"
                )));
            }
        };

        Ok(Self {
            host_ip,
            host_mac: parse_var(&lookup, "NETINSTALL_HOST_MAC")?,
            client_ip: parse_var(&lookup, "NETINSTALL_CLIENT_IP")?,
            netinstall_only,
            boot_dir: lookup("NETINSTALL_BOOT_DIR"),
            image_dir: lookup("NETINSTALL_IMAGE_DIR"),
            key_dir: lookup("NETINSTALL_KEY_DIR"),
            api_addr: parse_var(&lookup, "NETINSTALL_API_ADDR")?,
        })
    }

    fn into_config(self, host_mac: MacAddr) -> ServerConfig {
        let mut config =
            ServerConfig::new(self.host_ip, host_mac).with_netinstall_only(self.netinstall_only);
        if let Some(client_ip) = self.client_ip {
            config = config.with_client_ip(client_ip);
        }
        if let Some(dir) = self.boot_dir {
            config = config.with_boot_dir(dir);
        }
        if let Some(dir) = self.image_dir {
            config = config.with_image_dir(dir);
        }
        if let Some(dir) = self.key_dir {
            config = config.with_key_dir(dir);
        }
        if let Some(addr) = self.api_addr {
            config = config.with_api_addr(addr);
        }
        config
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ControllerError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|_| {
            ControllerError::InvalidConfig(format!("{key} has an invalid value: {value:?}"))
        }),
    }
}
