//! Ethernet hardware addresses.

use crate::error::NetInstallError;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 6-byte Ethernet hardware address.
///
/// Displays as lower-case colon-separated hex (`aa:bb:cc:dd:ee:ff`). Parsing
/// accepts `:` or `-` separators, or 12 bare hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Reads an address from the first six bytes of `buf`.
    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; 6] = buf.get(..6)?.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Hex digits without separators, as used in key file names.
    pub fn to_compact(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddr {
    type Err = NetInstallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(NetInstallError::MalformedFrame(format!(
                "invalid hardware address: {s}"
            )));
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16).map_err(|_| {
                NetInstallError::MalformedFrame(format!("invalid hardware address: {s}"))
            })?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_formats() {
        let expected = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!("AA:BB:CC:DD:EE:FF".parse::<MacAddr>().unwrap(), expected);
        assert_eq!("aa-bb-cc-dd-ee-ff".parse::<MacAddr>().unwrap(), expected);
        assert_eq!("aabbccddeeff".parse::<MacAddr>().unwrap(), expected);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("aa:bb:cc".parse::<MacAddr>().is_err());
        assert!("zz:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
        assert!("".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_display_and_compact() {
        let mac = MacAddr::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(mac.to_string(), "00:11:22:33:44:55");
        assert_eq!(mac.to_compact(), "001122334455");
    }

    #[test]
    fn test_from_slice() {
        assert_eq!(
            MacAddr::from_slice(&[1, 2, 3, 4, 5, 6, 7]),
            Some(MacAddr::new([1, 2, 3, 4, 5, 6]))
        );
        assert_eq!(MacAddr::from_slice(&[1, 2, 3]), None);
    }
}
