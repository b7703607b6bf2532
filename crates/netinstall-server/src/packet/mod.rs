//! Wire formats for the three protocols the server speaks.
//!
//! - [`bootp`]: boot-request/reply frames (UDP 67/68)
//! - [`tftp`]: block-transfer frames (UDP 69)
//! - [`netinstall`]: NetInstall frames (UDP 5000)
//!
//! All codecs are stateless; decoding never panics on short input and reports
//! [`NetInstallError::MalformedFrame`](crate::error::NetInstallError::MalformedFrame) instead.

pub mod bootp;
pub mod netinstall;
pub mod tftp;

pub use bootp::BootpFrame;
pub use netinstall::{Command, Discovery, NetInstallFrame};
pub use tftp::TftpPacket;
