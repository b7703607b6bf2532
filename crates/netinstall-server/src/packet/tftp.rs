//! TFTP block-transfer frames (RFC 1350, options per RFC 2347/2348).
//!
//! Only the `blksize` option is understood; any other option in a read
//! request is skipped.

use crate::error::{NetInstallError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// TFTP opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl TryFrom<u16> for Opcode {
    type Error = NetInstallError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(NetInstallError::MalformedFrame(format!(
                "unknown TFTP opcode: {value}"
            ))),
        }
    }
}

/// TFTP packet types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftpPacket {
    /// Read request. `options` keeps every name/value pair in wire order.
    ReadRequest {
        filename: String,
        mode: String,
        options: Vec<(String, String)>,
    },
    /// Write request (never served)
    WriteRequest { filename: String, mode: String },
    Data { block: u16, data: Bytes },
    Ack { block: u16 },
    Error { code: u16, message: String },
    /// Option acknowledgement confirming the negotiated block size
    Oack { blksize: u16 },
}

impl TftpPacket {
    /// Parse a TFTP packet from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(NetInstallError::MalformedFrame(
                "TFTP packet too short".to_string(),
            ));
        }

        let mut buf = data;
        let opcode = Opcode::try_from(buf.get_u16())?;

        match opcode {
            Opcode::Rrq => Self::parse_read_request(buf),
            Opcode::Wrq => {
                let mut fields = NulFields::new(buf);
                let filename = fields.required("filename")?;
                let mode = fields.required("mode")?;
                Ok(TftpPacket::WriteRequest { filename, mode })
            }
            Opcode::Data => {
                let block = Self::block_number(&mut buf, "data")?;
                Ok(TftpPacket::Data {
                    block,
                    data: Bytes::copy_from_slice(buf),
                })
            }
            Opcode::Ack => {
                let block = Self::block_number(&mut buf, "ack")?;
                Ok(TftpPacket::Ack { block })
            }
            Opcode::Error => {
                let code = Self::block_number(&mut buf, "error")?;
                let message = NulFields::new(buf).next().unwrap_or_default();
                Ok(TftpPacket::Error { code, message })
            }
            Opcode::Oack => {
                let mut fields = NulFields::new(buf);
                let name = fields.required("option name")?;
                let value = fields.required("option value")?;
                if !name.eq_ignore_ascii_case("blksize") {
                    return Err(NetInstallError::MalformedFrame(format!(
                        "unexpected option in OACK: {name}"
                    )));
                }
                let blksize = value.parse().map_err(|_| {
                    NetInstallError::MalformedFrame(format!("invalid blksize: {value}"))
                })?;
                Ok(TftpPacket::Oack { blksize })
            }
        }
    }

    fn block_number(buf: &mut &[u8], kind: &str) -> Result<u16> {
        if buf.len() < 2 {
            return Err(NetInstallError::MalformedFrame(format!(
                "{kind} packet too short"
            )));
        }
        Ok(buf.get_u16())
    }

    fn parse_read_request(data: &[u8]) -> Result<Self> {
        let mut fields = NulFields::new(data);
        let filename = fields.required("filename")?;
        let mode = fields.required("mode")?;

        let mut options = Vec::new();
        while let Some(name) = fields.next() {
            if name.is_empty() {
                break;
            }
            let Some(value) = fields.next() else {
                break;
            };
            options.push((name, value));
        }

        Ok(TftpPacket::ReadRequest {
            filename,
            mode,
            options,
        })
    }

    /// The requested block size, if the read request carries a parseable `blksize`.
    pub fn requested_blksize(&self) -> Option<u16> {
        match self {
            TftpPacket::ReadRequest { options, .. } => options
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("blksize"))
                .and_then(|(_, value)| value.parse().ok()),
            _ => None,
        }
    }

    /// Encode the packet to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            TftpPacket::ReadRequest {
                filename,
                mode,
                options,
            } => {
                buf.put_u16(Opcode::Rrq as u16);
                put_nul_str(&mut buf, filename);
                put_nul_str(&mut buf, mode);
                for (name, value) in options {
                    put_nul_str(&mut buf, name);
                    put_nul_str(&mut buf, value);
                }
            }
            TftpPacket::WriteRequest { filename, mode } => {
                buf.put_u16(Opcode::Wrq as u16);
                put_nul_str(&mut buf, filename);
                put_nul_str(&mut buf, mode);
            }
            TftpPacket::Data { block, data } => {
                buf.put_u16(Opcode::Data as u16);
                buf.put_u16(*block);
                buf.put_slice(data);
            }
            TftpPacket::Ack { block } => {
                buf.put_u16(Opcode::Ack as u16);
                buf.put_u16(*block);
            }
            TftpPacket::Error { code, message } => {
                buf.put_u16(Opcode::Error as u16);
                buf.put_u16(*code);
                put_nul_str(&mut buf, message);
            }
            TftpPacket::Oack { blksize } => {
                buf.put_u16(Opcode::Oack as u16);
                put_nul_str(&mut buf, "blksize");
                put_nul_str(&mut buf, &blksize.to_string());
            }
        }

        buf.freeze()
    }
}

fn put_nul_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Iterator over NUL-terminated ASCII strings.
///
/// A trailing string without its terminator is not yielded.
struct NulFields<'a> {
    rest: &'a [u8],
}

impl<'a> NulFields<'a> {
    fn new(rest: &'a [u8]) -> Self {
        Self { rest }
    }

    fn required(&mut self, what: &str) -> Result<String> {
        self.next()
            .ok_or_else(|| NetInstallError::MalformedFrame(format!("missing {what}")))
    }
}

impl Iterator for NulFields<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let end = self.rest.iter().position(|&b| b == 0)?;
        let field = String::from_utf8_lossy(&self.rest[..end]).into_owned();
        self.rest = &self.rest[end + 1..];
        Some(field)
    }
}
