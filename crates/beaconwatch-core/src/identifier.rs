//! Beacon identifiers.
//!
//! An [`Identifier`] is an immutable run of bytes lifted out of an
//! advertisement. How it is rendered depends on its width:
//!
//! - 16 bytes render as a UUID (`2f234454-cf6d-4a0f-adf2-f4911ba9ffa6`)
//! - 2 bytes render as a decimal integer (`1`, `65535`)
//! - anything else renders as `0x`-prefixed hex (`0x0102030405`)
//!
//! Every rendering parses back to an identically sized identifier, so the
//! display form doubles as the serialized form.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when building an identifier from text or numbers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentifierError {
    /// The input string was empty.
    #[error("Identifier string cannot be empty")]
    Empty,

    /// The input string matches none of the accepted encodings.
    #[error("Unable to parse identifier '{0}'. Expected 0x-prefixed hex, a UUID, or a decimal in 0..=65535")]
    InvalidFormat(String),

    /// A decimal identifier was outside the range of an unsigned 16-bit value.
    #[error("Decimal identifier {0} is out of range (0..=65535)")]
    OutOfRange(String),

    /// The requested byte width cannot hold the value.
    #[error("Value {value} does not fit in {width} bytes")]
    TooWide {
        /// Value that was requested.
        value: u64,
        /// Byte width that was requested.
        width: usize,
    },
}

/// An opaque, ordered beacon identifier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    bytes: Box<[u8]>,
}

impl Identifier {
    /// Creates an identifier from raw bytes, reversing them first when the
    /// field was transmitted little-endian.
    #[must_use]
    pub fn from_bytes(bytes: &[u8], little_endian: bool) -> Self {
        let mut owned = bytes.to_vec();
        if little_endian {
            owned.reverse();
        }
        Self {
            bytes: owned.into_boxed_slice(),
        }
    }

    /// Creates a two byte identifier from an unsigned 16-bit value.
    #[must_use]
    pub fn from_int(value: u16) -> Self {
        Self::from_bytes(&value.to_be_bytes(), false)
    }

    /// Creates a big-endian identifier of `width` bytes holding `value`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentifierError::TooWide`] if `value` needs more than `width` bytes.
    pub fn from_u64(value: u64, width: usize) -> Result<Self, IdentifierError> {
        let significant = 8 - (value.leading_zeros() as usize / 8);
        if width < significant {
            return Err(IdentifierError::TooWide { value, width });
        }
        let mut bytes = vec![0u8; width];
        let be = value.to_be_bytes();
        for (i, b) in be.iter().rev().take(width.min(8)).enumerate() {
            bytes[width - 1 - i] = *b;
        }
        Ok(Self {
            bytes: bytes.into_boxed_slice(),
        })
    }

    /// Creates a sixteen byte identifier from a UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self::from_bytes(uuid.as_bytes(), false)
    }

    /// Parses any of the textual encodings produced by [`fmt::Display`].
    ///
    /// Accepted forms, in order of precedence:
    /// 1. thirty-two hex digits without dashes (sixteen bytes)
    /// 2. decimal `0..=65535` without a leading zero (two bytes)
    /// 3. `0x`-prefixed hex of any length (odd lengths get a leading zero)
    /// 4. an even number of hex digits without prefix
    /// 5. canonical UUID with dashes (sixteen bytes)
    ///
    /// # Errors
    ///
    /// Returns an [`IdentifierError`] describing why the string was rejected.
    pub fn parse(input: &str) -> Result<Self, IdentifierError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(IdentifierError::Empty);
        }
        let all_hex = s.bytes().all(|b| b.is_ascii_hexdigit());

        if s.len() == 32 && all_hex {
            if let Some(bytes) = decode_hex(s) {
                return Ok(Self {
                    bytes: bytes.into_boxed_slice(),
                });
            }
        }

        // Leading zeros mean hex.
        let decimal = s.bytes().all(|b| b.is_ascii_digit()) && (s == "0" || !s.starts_with('0'));
        if decimal {
            let value: u16 = s
                .parse()
                .map_err(|_| IdentifierError::OutOfRange(s.to_string()))?;
            return Ok(Self::from_int(value));
        }

        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return decode_hex(hex)
                .map(|bytes| Self {
                    bytes: bytes.into_boxed_slice(),
                })
                .ok_or_else(|| IdentifierError::InvalidFormat(s.to_string()));
        }

        if s.len() % 2 == 0 && all_hex {
            if let Some(bytes) = decode_hex(s) {
                return Ok(Self {
                    bytes: bytes.into_boxed_slice(),
                });
            }
        }

        if s.len() == 36 {
            if let Ok(uuid) = Uuid::parse_str(s) {
                return Ok(Self::from_uuid(uuid));
            }
        }

        Err(IdentifierError::InvalidFormat(s.to_string()))
    }

    /// Raw bytes in big-endian order.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of bytes in this identifier.
    #[must_use]
    pub fn byte_count(&self) -> usize {
        self.bytes.len()
    }

    /// Lowercase hex with a `0x` prefix.
    #[must_use]
    pub fn to_hex_string(&self) -> String {
        format!("0x{}", encode_hex(&self.bytes))
    }

    /// UUID rendering, available only for sixteen byte identifiers.
    #[must_use]
    pub fn to_uuid(&self) -> Option<Uuid> {
        Uuid::from_slice(&self.bytes).ok()
    }

    /// Canonical dashed UUID string, available only for sixteen byte identifiers.
    #[must_use]
    pub fn to_uuid_string(&self) -> Option<String> {
        self.to_uuid().map(|u| u.hyphenated().to_string())
    }

    /// Integer value, available only for identifiers of at most two bytes.
    #[must_use]
    pub fn to_int(&self) -> Option<u16> {
        match self.bytes.len() {
            1 => Some(u16::from(self.bytes[0])),
            2 => Some(u16::from_be_bytes([self.bytes[0], self.bytes[1]])),
            _ => None,
        }
    }

    /// Bytes interpreted as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn to_utf8_string(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bytes.len() {
            2 => write!(f, "{}", u16::from_be_bytes([self.bytes[0], self.bytes[1]])),
            16 => match self.to_uuid() {
                Some(uuid) => write!(f, "{}", uuid.hyphenated()),
                None => f.write_str(&self.to_hex_string()),
            },
            _ => f.write_str(&self.to_hex_string()),
        }
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({self})")
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Shorter identifiers sort first; equal widths compare bytewise.
impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes
            .len()
            .cmp(&other.bytes.len())
            .then_with(|| self.bytes.cmp(&other.bytes))
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

pub(crate) fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let padded = if hex.len() % 2 == 1 {
        format!("0{hex}")
    } else {
        hex.to_string()
    };
    (0..padded.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&padded[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sixteen_bytes_render_as_uuid() {
        let uuid = Uuid::parse_str("2f234454-cf6d-4a0f-adf2-f4911ba9ffa6").unwrap();
        let id = Identifier::from_uuid(uuid);
        assert_eq!(id.to_string(), "2f234454-cf6d-4a0f-adf2-f4911ba9ffa6");
        assert_eq!(id.byte_count(), 16);
    }

    #[test]
    fn test_two_bytes_render_as_decimal() {
        let id = Identifier::from_bytes(&[0x01, 0x02], false);
        assert_eq!(id.to_string(), "258");
        assert_eq!(id.to_int(), Some(258));
    }

    #[test]
    fn test_little_endian_bytes_are_reversed() {
        let id = Identifier::from_bytes(&[0x02, 0x01], true);
        assert_eq!(id.as_bytes(), &[0x01, 0x02]);
    }

    #[test]
    fn test_other_widths_render_as_hex() {
        let id = Identifier::from_bytes(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06], false);
        assert_eq!(id.to_string(), "0x010203040506");
        assert_eq!(Identifier::from_bytes(&[0x05], false).to_string(), "0x05");
    }

    #[test]
    fn test_display_round_trips_preserve_width() {
        for bytes in [
            vec![0x05],
            vec![0x00, 0x07],
            vec![0xaa, 0xbb, 0xcc],
            (0u8..16).collect::<Vec<_>>(),
            (0u8..20).collect::<Vec<_>>(),
        ] {
            let id = Identifier::from_bytes(&bytes, false);
            let parsed = Identifier::parse(&id.to_string()).unwrap();
            assert_eq!(parsed, id, "round trip failed for {id}");
            assert_eq!(parsed.byte_count(), bytes.len());
        }
    }

    #[test]
    fn test_parse_accepts_bare_uuid_hex() {
        let id = Identifier::parse("2f234454cf6d4a0fadf2f4911ba9ffa6").unwrap();
        assert_eq!(id.to_string(), "2f234454-cf6d-4a0f-adf2-f4911ba9ffa6");
    }

    #[test]
    fn test_parse_accepts_unprefixed_hex() {
        let id = Identifier::parse("abcdef").unwrap();
        assert_eq!(id.as_bytes(), &[0xab, 0xcd, 0xef]);
        assert!(Identifier::parse("abc").is_err());
        assert_eq!(
            Identifier::from_int(7).to_uuid_string(),
            None
        );
    }

    #[test]
    fn test_parse_leading_zero_digits_as_hex() {
        let id = Identifier::parse("0102").unwrap();
        assert_eq!(id.as_bytes(), &[0x01, 0x02]);
        assert_eq!(Identifier::parse("0").unwrap(), Identifier::from_int(0));
        assert_eq!(Identifier::parse("258").unwrap(), Identifier::from_int(258));
    }

    #[test]
    fn test_parse_all_digit_uuid_hex() {
        let id = Identifier::parse("00000000000000000000000000000001").unwrap();
        assert_eq!(id.byte_count(), 16);
        assert_eq!(id.as_bytes()[15], 0x01);
        assert_eq!(id.to_string(), "00000000-0000-0000-0000-000000000001");

        let id = Identifier::parse("12345678901234567890123456789012").unwrap();
        assert_eq!(id.byte_count(), 16);
    }

    #[test]
    fn test_parse_odd_length_hex_is_padded() {
        let id = Identifier::parse("0xabc").unwrap();
        assert_eq!(id.as_bytes(), &[0x0a, 0xbc]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(Identifier::parse(""), Err(IdentifierError::Empty));
        assert!(matches!(
            Identifier::parse("65536"),
            Err(IdentifierError::OutOfRange(_))
        ));
        assert!(matches!(
            Identifier::parse("0xzz"),
            Err(IdentifierError::InvalidFormat(_))
        ));
        assert!(matches!(
            Identifier::parse("not-an-id"),
            Err(IdentifierError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_from_u64_pads_to_width() {
        let id = Identifier::from_u64(0x0102, 4).unwrap();
        assert_eq!(id.as_bytes(), &[0x00, 0x00, 0x01, 0x02]);
        assert!(Identifier::from_u64(0x010203, 2).is_err());
    }

    #[test]
    fn test_ordering_compares_width_then_bytes() {
        let short = Identifier::from_bytes(&[0xff], false);
        let long = Identifier::from_bytes(&[0x00, 0x00], false);
        assert!(short < long);
        assert!(Identifier::from_int(1) < Identifier::from_int(2));
    }

    #[test]
    fn test_serde_uses_display_form() {
        let id = Identifier::from_int(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"42\"");
        let back: Identifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
