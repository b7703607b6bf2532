//! NetInstall provisioning server
//!
//! Provisions MikroTik devices over a LAN by speaking three UDP protocols:
//!
//! - **Boot responder** (BOOTP, port 67): hands a booting device its address
//!   and records which boot file it asked for
//! - **Block-transfer server** (TFTP, port 69): serves that boot file
//! - **Transfer engine** (NetInstall, port 5000): drives the install handshake
//!   and pushes a package image to each discovered device
//!
//! Operators drive transfers through a command queue ([`OperatorHandle`]),
//! either from the controller's console or over the optional HTTP API.

pub mod api;
pub mod catalog;
pub mod config;
pub mod dhcp;
pub mod engine;
pub mod error;
pub mod events;
pub mod hwaddr;
pub mod identity;
pub mod keyfile;
pub mod operator;
pub mod packet;
pub mod server;
pub mod session;
pub mod tftp;
pub mod transport;

pub use catalog::{DirectoryCatalog, ImageCatalog, ImageMetadata, MemoryCatalog};
pub use config::ServerConfig;
pub use dhcp::BootResponder;
pub use engine::TransferEngine;
pub use error::*;
pub use events::{EventBus, ServerEvent};
pub use hwaddr::MacAddr;
pub use identity::BootIdentityTable;
pub use operator::{CommandLoop, OperatorHandle};
pub use server::*;
pub use session::{SessionRegistry, SessionSummary, TransferPhase};
pub use tftp::{BlockTransferServer, DirectoryFileProvider, FileProvider, MemoryFileProvider};
pub use transport::{DatagramHandler, DatagramSink};
