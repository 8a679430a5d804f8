//! Peer hardware addresses
//!
//! A peer is identified by its stable 48-bit hardware address. The address is
//! the registry key for state machines, group membership and policy records,
//! and serializes as the familiar `AA:BB:CC:DD:EE:FF` string so it can be used
//! as a JSON map key.

use crate::CoordinatorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a hardware address in bytes
pub const ADDRESS_LEN: usize = 6;

/// Stable hardware address of a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress([u8; ADDRESS_LEN]);

impl PeerAddress {
    /// Create an address from raw bytes (most significant byte first)
    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl From<[u8; ADDRESS_LEN]> for PeerAddress {
    fn from(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }
}

impl FromStr for PeerAddress {
    type Err = CoordinatorError;

    /// Parse `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF` or bare `AABBCCDDEEFF`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits: String = if trimmed.contains(':') || trimmed.contains('-') {
            let parts: Vec<&str> = trimmed.split(|c| c == ':' || c == '-').collect();
            if parts.len() != ADDRESS_LEN || parts.iter().any(|p| p.len() != 2) {
                return Err(CoordinatorError::InvalidAddress(s.to_string()));
            }
            parts.concat()
        } else {
            trimmed.to_string()
        };

        let bytes =
            hex::decode(&digits).map_err(|_| CoordinatorError::InvalidAddress(s.to_string()))?;
        let bytes: [u8; ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| CoordinatorError::InvalidAddress(s.to_string()))?;

        Ok(Self(bytes))
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = CoordinatorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerAddress> for String {
    fn from(address: PeerAddress) -> Self {
        address.to_string()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_colon_separated() {
        let addr: PeerAddress = "00:11:22:aa:BB:cc".parse().unwrap();
        assert_eq!(addr.as_bytes(), &[0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC]);
        assert_eq!(addr.to_string(), "00:11:22:AA:BB:CC");
    }

    #[test]
    fn test_parse_dash_and_bare_forms() {
        let dashed: PeerAddress = "01-02-03-04-05-06".parse().unwrap();
        let bare: PeerAddress = "010203040506".parse().unwrap();
        assert_eq!(dashed, bare);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("00:11:22".parse::<PeerAddress>().is_err());
        assert!("00:11:22:33:44:5".parse::<PeerAddress>().is_err());
        assert!("zz:11:22:33:44:55".parse::<PeerAddress>().is_err());
        assert!("0011223344556677".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let addr = PeerAddress::new([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"DE:AD:BE:EF:00:01\"");

        let back: PeerAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
