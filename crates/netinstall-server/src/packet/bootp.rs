//! BOOTP boot-request/reply frames.
//!
//! Layout (RFC 951 with the RFC 2132 vendor area):
//!
//! ```text
//! 0      op | htype | hlen | hops
//! 4      xid
//! 8      secs | flags
//! 12     ciaddr
//! 16     yiaddr
//! 20     siaddr
//! 24     giaddr
//! 28     chaddr (16)
//! 44     sname (64)
//! 108    file (128)
//! 236    vendor area: magic cookie (4) + options ... end
//! ```

use crate::error::{NetInstallError, Result};
use crate::hwaddr::MacAddr;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dhcproto::v4::{Opcode, OptionCode};
use std::net::Ipv4Addr;

/// Length of the fixed header preceding the vendor area
pub const FIXED_HEADER_LEN: usize = 236;

/// DHCP magic cookie opening the vendor area
pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const HTYPE_ETHERNET: u8 = 1;

/// A BOOTP frame with every fixed field kept verbatim.
///
/// `vendor` holds everything after the fixed header (cookie, options, end tag
/// and any trailing padding) so that a decoded frame re-encodes byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootpFrame {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub vendor: Bytes,
}

impl BootpFrame {
    /// Parse a frame. Only the fixed header is mandatory.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(NetInstallError::MalformedFrame(format!(
                "BOOTP frame too short: {} bytes",
                data.len()
            )));
        }

        let mut buf = data;
        let op = buf.get_u8();
        let htype = buf.get_u8();
        let hlen = buf.get_u8();
        let hops = buf.get_u8();
        let xid = buf.get_u32();
        let secs = buf.get_u16();
        let flags = buf.get_u16();
        let ciaddr = Ipv4Addr::from(buf.get_u32());
        let yiaddr = Ipv4Addr::from(buf.get_u32());
        let siaddr = Ipv4Addr::from(buf.get_u32());
        let giaddr = Ipv4Addr::from(buf.get_u32());

        let mut chaddr = [0u8; 16];
        buf.copy_to_slice(&mut chaddr);
        let mut sname = [0u8; 64];
        buf.copy_to_slice(&mut sname);
        let mut file = [0u8; 128];
        buf.copy_to_slice(&mut file);

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            vendor: Bytes::copy_from_slice(buf),
        })
    }

    /// Encode the frame to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + self.vendor.len());
        buf.put_u8(self.op);
        buf.put_u8(self.htype);
        buf.put_u8(self.hlen);
        buf.put_u8(self.hops);
        buf.put_u32(self.xid);
        buf.put_u16(self.secs);
        buf.put_u16(self.flags);
        buf.put_u32(u32::from(self.ciaddr));
        buf.put_u32(u32::from(self.yiaddr));
        buf.put_u32(u32::from(self.siaddr));
        buf.put_u32(u32::from(self.giaddr));
        buf.put_slice(&self.chaddr);
        buf.put_slice(&self.sname);
        buf.put_slice(&self.file);
        buf.put_slice(&self.vendor);
        buf.freeze()
    }

    pub fn opcode(&self) -> Opcode {
        Opcode::from(self.op)
    }

    pub fn is_boot_request(&self) -> bool {
        matches!(self.opcode(), Opcode::BootRequest)
    }

    /// Client hardware address (first six bytes of `chaddr`)
    pub fn mac_address(&self) -> MacAddr {
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&self.chaddr[..6]);
        MacAddr::new(bytes)
    }

    pub fn has_magic_cookie(&self) -> bool {
        self.vendor.starts_with(&MAGIC_COOKIE)
    }

    /// The vendor class identifier, when it is the first option after the cookie.
    ///
    /// Devices that netboot this way always put option 60 first, so the lookup
    /// is by fixed offset rather than by walking the option list.
    pub fn vendor_class_identifier(&self) -> Option<String> {
        if !self.has_magic_cookie() {
            return None;
        }
        let options = &self.vendor[MAGIC_COOKIE.len()..];
        let (&tag, rest) = options.split_first()?;
        if !matches!(OptionCode::from(tag), OptionCode::ClassIdentifier) {
            return None;
        }
        let (&len, rest) = rest.split_first()?;
        let value = rest.get(..usize::from(len))?;
        Some(String::from_utf8_lossy(value).into_owned())
    }

    /// Build the reply sent to a boot request.
    ///
    /// Echoes the transaction id, elapsed seconds and hardware address; every
    /// other field not named here is zero.
    pub fn reply(request: &BootpFrame, your_addr: Ipv4Addr, server_addr: Ipv4Addr) -> Self {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&request.chaddr[..6]);

        let mut vendor = BytesMut::with_capacity(MAGIC_COOKIE.len() + 1);
        vendor.put_slice(&MAGIC_COOKIE);
        vendor.put_u8(u8::from(OptionCode::End));

        Self {
            op: u8::from(Opcode::BootReply),
            htype: HTYPE_ETHERNET,
            hlen: 6,
            hops: 0,
            xid: request.xid,
            secs: request.secs,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_addr,
            siaddr: server_addr,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            vendor: vendor.freeze(),
        }
    }
}
