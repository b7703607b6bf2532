//! NetInstall frames.
//!
//! ```text
//! 0    source hardware address (6)
//! 6    destination hardware address (6)
//! 12   reserved, zero (2)
//! 14   payload length, LE (2)
//! 16   remote counter, LE (2)
//! 18   local counter, LE (2)
//! 20   payload
//! ```
//!
//! The payload of a control frame is a list of `\n`-separated ASCII lines, the
//! first of which is the command token. File chunks are raw bytes.

use crate::error::{NetInstallError, Result};
use crate::hwaddr::MacAddr;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

pub const HEADER_LEN: usize = 20;

/// Command tokens carried on the first payload line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Device announces itself (device → host)
    Discover,
    /// Host offers an image (host → device)
    Offer,
    /// Device accepts the offer
    YesAck,
    /// Device is ready for the transfer to start
    Start,
    /// Device asks for the next piece of the file
    Retrieve,
    /// File header (host → device)
    File,
    /// Device finished writing and is about to reboot
    Terminate,
}

impl Command {
    pub fn token(&self) -> &'static str {
        match self {
            Command::Discover => "DSCV",
            Command::Offer => "OFFR",
            Command::YesAck => "YACK",
            Command::Start => "STRT",
            Command::Retrieve => "RETR",
            Command::File => "FILE",
            Command::Terminate => "WTRM",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "DSCV" => Some(Command::Discover),
            "OFFR" => Some(Command::Offer),
            "YACK" => Some(Command::YesAck),
            "STRT" => Some(Command::Start),
            "RETR" => Some(Command::Retrieve),
            "FILE" => Some(Command::File),
            "WTRM" => Some(Command::Terminate),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A decoded NetInstall frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInstallFrame {
    pub source: MacAddr,
    pub destination: MacAddr,
    pub remote_counter: u16,
    pub local_counter: u16,
    pub payload: Bytes,
}

impl NetInstallFrame {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(NetInstallError::MalformedFrame(format!(
                "NetInstall frame too short: {} bytes",
                data.len()
            )));
        }

        let mut buf = data;
        let source = MacAddr::from_slice(buf).ok_or_else(|| {
            NetInstallError::MalformedFrame("missing source address".to_string())
        })?;
        buf.advance(6);
        let destination = MacAddr::from_slice(buf).ok_or_else(|| {
            NetInstallError::MalformedFrame("missing destination address".to_string())
        })?;
        buf.advance(6);
        // Reserved
        buf.advance(2);
        let len = usize::from(buf.get_u16_le());
        let remote_counter = buf.get_u16_le();
        let local_counter = buf.get_u16_le();

        let payload = buf.get(..len).ok_or_else(|| {
            NetInstallError::MalformedFrame(format!(
                "payload length {len} exceeds the {} bytes received",
                buf.len()
            ))
        })?;

        Ok(Self {
            source,
            destination,
            remote_counter,
            local_counter,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Encode the frame to bytes.
    ///
    /// Payloads are bounded by the UDP datagram size, well below `u16::MAX`.
    pub fn encode(&self) -> Bytes {
        debug_assert!(
            self.payload.len() <= usize::from(u16::MAX),
            "NetInstall payload of {} bytes does not fit the length field",
            self.payload.len()
        );
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(&self.source.octets());
        buf.put_slice(&self.destination.octets());
        buf.put_u16(0);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_u16_le(self.remote_counter);
        buf.put_u16_le(self.local_counter);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Payload lines with trailing whitespace of the whole payload removed.
    pub fn lines(&self) -> Vec<String> {
        let text = String::from_utf8_lossy(&self.payload);
        let trimmed = text.trim_end();
        if trimmed.is_empty() {
            return Vec::new();
        }
        trimmed.split('\n').map(|line| line.trim_end().to_string()).collect()
    }

    /// The command token on the first line, if it is one we know.
    pub fn command(&self) -> Option<Command> {
        let end = self
            .payload
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(self.payload.len());
        let token = std::str::from_utf8(&self.payload[..end]).ok()?;
        Command::from_token(token.trim())
    }
}

/// Builds the `\n`-joined payload of a control frame.
pub fn control_payload(lines: &[&str]) -> Bytes {
    Bytes::from(lines.join("\n"))
}

/// Identity a device declares in its `DSCV` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub mac: MacAddr,
    pub key_id: String,
    pub key: String,
    pub name: String,
    pub arch: String,
}

impl Discovery {
    /// Extract the declared identity from a discovery frame.
    pub fn from_frame(frame: &NetInstallFrame) -> Result<Self> {
        let lines = frame.lines();
        if lines.first().map(String::as_str) != Some(Command::Discover.token()) {
            return Err(NetInstallError::MalformedFrame(
                "not a discovery frame".to_string(),
            ));
        }
        let [_, key_id, key, name, arch, ..] = lines.as_slice() else {
            return Err(NetInstallError::MalformedFrame(format!(
                "discovery from {} carries {} of 5 lines",
                frame.source,
                lines.len()
            )));
        };

        Ok(Self {
            mac: frame.source,
            key_id: key_id.clone(),
            key: key.clone(),
            name: name.clone(),
            arch: arch.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    const HOST: MacAddr = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

    fn frame(payload: &[u8], remote: u16, local: u16) -> NetInstallFrame {
        NetInstallFrame {
            source: DEVICE,
            destination: HOST,
            remote_counter: remote,
            local_counter: local,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_encode_layout() {
        let encoded = frame(b"YACK\n", 0x0102, 0x0304).encode();
        assert_eq!(&encoded[0..6], &DEVICE.octets());
        assert_eq!(&encoded[6..12], &HOST.octets());
        assert_eq!(&encoded[12..14], &[0, 0]);
        assert_eq!(&encoded[14..16], &[5, 0]);
        assert_eq!(&encoded[16..18], &[0x02, 0x01]);
        assert_eq!(&encoded[18..20], &[0x04, 0x03]);
        assert_eq!(&encoded[20..], b"YACK\n");
    }

    #[test]
    fn test_parse_counters_little_endian() {
        let mut packet = Vec::new();
        packet.extend_from_slice(&DEVICE.octets());
        packet.extend_from_slice(&HOST.octets());
        packet.extend_from_slice(&[0, 0, 5, 0, 0x07, 0x00, 0x06, 0x00]);
        packet.extend_from_slice(b"RETR\n");

        let parsed = NetInstallFrame::parse(&packet).unwrap();
        assert_eq!(parsed.source, DEVICE);
        assert_eq!(parsed.destination, HOST);
        assert_eq!(parsed.remote_counter, 7);
        assert_eq!(parsed.local_counter, 6);
        assert_eq!(parsed.command(), Some(Command::Retrieve));
    }

    #[test]
    fn test_parse_rejects_short_and_overlong() {
        assert!(NetInstallFrame::parse(&[0u8; 19]).is_err());

        let mut encoded = frame(b"STRT", 1, 1).encode().to_vec();
        encoded.truncate(22);
        assert!(matches!(
            NetInstallFrame::parse(&encoded),
            Err(NetInstallError::MalformedFrame(_))
        ));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "does not fit the length field")]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; usize::from(u16::MAX) + 1];
        let _ = frame(&payload, 0, 0).encode();
    }

    #[test]
    fn test_parse_encode_identity() {
        let payloads: [&[u8]; 4] = [
            b"",
            b"OFFR\n\n",
            b"DSCV\nk\nK\nRB\narm\n",
            &[0u8, 159, 255, 10],
        ];
        for payload in payloads {
            let encoded = frame(payload, 3, 2).encode();
            let parsed = NetInstallFrame::parse(&encoded).unwrap();
            assert_eq!(parsed.encode(), encoded);
        }
    }

    #[test]
    fn test_lines_trim_trailing_whitespace() {
        let parsed = frame(b"DSCV\nkeyid1\nKEYDATA\nRB1100\narm\n\n  ", 0, 0);
        assert_eq!(
            parsed.lines(),
            vec!["DSCV", "keyid1", "KEYDATA", "RB1100", "arm"]
        );
        assert!(frame(b"", 0, 0).lines().is_empty());
        assert_eq!(frame(b"", 0, 0).command(), None);
    }

    #[test]
    fn test_discovery_from_frame() {
        let parsed = frame(b"DSCV\nkeyid1\nKEYDATA\nRB1100\narm\n", 0, 0);
        let discovery = Discovery::from_frame(&parsed).unwrap();
        assert_eq!(discovery.mac, DEVICE);
        assert_eq!(discovery.key_id, "keyid1");
        assert_eq!(discovery.key, "KEYDATA");
        assert_eq!(discovery.name, "RB1100");
        assert_eq!(discovery.arch, "arm");
    }

    #[test]
    fn test_discovery_missing_lines() {
        let parsed = frame(b"DSCV\nkeyid1\n", 0, 0);
        assert!(matches!(
            Discovery::from_frame(&parsed),
            Err(NetInstallError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_command_tokens() {
        for command in [
            Command::Discover,
            Command::Offer,
            Command::YesAck,
            Command::Start,
            Command::Retrieve,
            Command::File,
            Command::Terminate,
        ] {
            assert_eq!(Command::from_token(command.token()), Some(command));
        }
        assert_eq!(Command::from_token("NOPE"), None);
        assert_eq!(
            control_payload(&["FILE", "routeros.npk", "1024", ""]),
            Bytes::from_static(b"FILE\nrouteros.npk\n1024\n")
        );
    }
}
