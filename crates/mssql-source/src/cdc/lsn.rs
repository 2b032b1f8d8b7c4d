//! SQL Server log sequence numbers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Error type for LSN parsing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LsnError {
    #[error("LSN must be 10 bytes, got {0}")]
    Length(usize),

    #[error("Invalid LSN '{0}': expected 20 hex digits or VLF:offset:slot")]
    Format(String),
}

/// A 10-byte log sequence number: VLF sequence (4 bytes), log block
/// offset (4 bytes) and slot (2 bytes), compared as big-endian bytes.
///
/// Serializes as 20 upper-case hex digits; either case parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn([u8; 10]);

impl Lsn {
    pub const ZERO: Lsn = Lsn([0; 10]);

    pub fn new(bytes: [u8; 10]) -> Self {
        Self(bytes)
    }

    /// Build from a `binary(10)` column value.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LsnError> {
        let arr: [u8; 10] = bytes
            .try_into()
            .map_err(|_| LsnError::Length(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn from_hex(text: &str) -> Result<Self, LsnError> {
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        if digits.len() != 20 {
            return Err(LsnError::Format(text.to_string()));
        }
        let bytes = hex::decode(digits).map_err(|_| LsnError::Format(text.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 10] {
        &self.0
    }

    /// `fn_cdc_get_min_lsn` answers all zeros for unknown or empty capture instances.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    // VLF:offset:slot, the form SQL Server prints in its own messages.
    fn parse_triplet(text: &str) -> Result<Self, LsnError> {
        let err = || LsnError::Format(text.to_string());
        let mut parts = text.split(':');
        let (Some(vlf), Some(offset), Some(slot), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(err());
        };

        let vlf = u32::from_str_radix(vlf, 16).map_err(|_| err())?;
        let offset = u32::from_str_radix(offset, 16).map_err(|_| err())?;
        let slot = u16::from_str_radix(slot, 16).map_err(|_| err())?;

        let mut bytes = [0u8; 10];
        bytes[..4].copy_from_slice(&vlf.to_be_bytes());
        bytes[4..8].copy_from_slice(&offset.to_be_bytes());
        bytes[8..].copy_from_slice(&slot.to_be_bytes());
        Ok(Self(bytes))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        let vlf = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        let offset = u32::from_be_bytes([b[4], b[5], b[6], b[7]]);
        let slot = u16::from_be_bytes([b[8], b[9]]);
        write!(f, "{vlf:08X}:{offset:08X}:{slot:04X}")
    }
}

impl FromStr for Lsn {
    type Err = LsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains(':') {
            Self::parse_triplet(s)
        } else {
            Self::from_hex(s)
        }
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_hex_and_display() {
        let lsn = Lsn::from_hex("0000002700000758000500").unwrap_err();
        assert_eq!(lsn, LsnError::Format("0000002700000758000500".into()));

        let lsn = Lsn::from_hex("00000027000007580005").unwrap();
        assert_eq!(lsn.to_hex(), "00000027000007580005");
        assert_eq!(lsn.to_string(), "00000027:00000758:0005");
        assert_eq!("00000027:00000758:0005".parse::<Lsn>().unwrap(), lsn);
        assert_eq!("0x00000027000007580005".parse::<Lsn>().unwrap(), lsn);
    }

    #[test]
    fn test_lsn_hex_is_upper_case() {
        let lsn = Lsn::from_hex("0000002a000001f0000b").unwrap();
        assert_eq!(lsn.to_hex(), "0000002A000001F0000B");
        assert_eq!(Lsn::from_hex(&lsn.to_hex()).unwrap(), lsn);
        assert_eq!(
            serde_json::to_string(&lsn).unwrap(),
            r#""0000002A000001F0000B""#
        );
    }

    #[test]
    fn test_lsn_ordering_is_bytewise() {
        let a: Lsn = "00000027:00000758:0005".parse().unwrap();
        let b: Lsn = "00000027:00000759:0001".parse().unwrap();
        let c: Lsn = "00000028:00000001:0000".parse().unwrap();
        assert!(Lsn::ZERO < a);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.max(c), c);
    }

    #[test]
    fn test_lsn_from_column_bytes() {
        assert!(Lsn::from_bytes(&[0u8; 10]).unwrap().is_zero());
        assert_eq!(Lsn::from_bytes(&[1, 2, 3]), Err(LsnError::Length(3)));
    }

    #[test]
    fn test_lsn_serde_is_hex_string() {
        let lsn: Lsn = "00000027:00000758:0005".parse().unwrap();
        let json = serde_json::to_string(&lsn).unwrap();
        assert_eq!(json, r#""00000027000007580005""#);
        assert_eq!(serde_json::from_str::<Lsn>(&json).unwrap(), lsn);
        assert!(serde_json::from_str::<Lsn>(r#""zz""#).is_err());
    }
}
