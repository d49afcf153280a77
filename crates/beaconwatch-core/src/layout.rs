//! Beacon layout descriptors.
//!
//! A layout describes where each field of a beacon format lives inside an
//! advertisement payload, using a compact comma separated mini-language:
//!
//! | Token | Meaning |
//! |-------|---------|
//! | `m:2-3=beac` | type code bytes that must match (required, exactly one) |
//! | `s:0-1=feaa` | 16-bit service UUID (service data layouts only) |
//! | `i:4-19` | identifier field; suffix `l` little-endian, `v` variable length |
//! | `p:24-24` | signed calibrated power, optional `:-41` correction |
//! | `d:25-25` | numeric data field; suffix `l` little-endian |
//! | `x` | auxiliary frame with no identifiers of its own |
//!
//! Offsets are inclusive and relative to the first byte after the AD type.
//! For manufacturer specific data, bytes 0-1 hold the manufacturer code.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::identifier::{decode_hex, encode_hex};

/// AltBeacon open format.
pub const ALTBEACON_LAYOUT: &str = "m:2-3=beac,i:4-19,i:20-21,i:22-23,p:24-24,d:25-25";
/// Apple iBeacon.
pub const IBEACON_LAYOUT: &str = "m:2-3=0215,i:4-19,i:20-21,i:22-23,p:24-24";
/// Eddystone UID frame.
pub const EDDYSTONE_UID_LAYOUT: &str = "s:0-1=feaa,m:2-2=00,p:3-3:-41,i:4-13,i:14-19";
/// Eddystone URL frame. The URL itself is a variable length identifier.
pub const EDDYSTONE_URL_LAYOUT: &str = "s:0-1=feaa,m:2-2=10,p:3-3:-41,i:4-21v";
/// Eddystone telemetry frame. Carries data only and is merged into its UID sibling.
pub const EDDYSTONE_TLM_LAYOUT: &str = "x,s:0-1=feaa,m:2-2=20,d:3-3,d:4-5,d:6-7,d:8-11,d:12-15";
/// URI beacon.
pub const URI_BEACON_LAYOUT: &str = "s:0-1=fed8,m:2-2=00,p:3-3:-41,i:4-21v";

/// Manufacturer code assigned to Radius Networks, used for AltBeacon filtering.
pub const ALTBEACON_MANUFACTURER: u16 = 0x0118;
/// Manufacturer code assigned to Apple.
pub const APPLE_MANUFACTURER: u16 = 0x004c;

/// Widest identifier a layout may declare.
pub const MAX_IDENTIFIER_BYTES: usize = 20;
/// Widest numeric data field a layout may declare.
pub const MAX_DATA_BYTES: usize = 8;

static IDENTIFIER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^i:(\d+)-(\d+)([blv]*)$").expect("valid regex"));
static MATCHING_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^m:(\d+)-(\d+)=([0-9A-Fa-f]+)$").expect("valid regex"));
static SERVICE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^s:(\d+)-(\d+)=([0-9A-Fa-f]+)$").expect("valid regex"));
static DATA_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^d:(\d+)-(\d+)([bl]*)$").expect("valid regex"));
static POWER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^p:(\d+)-(\d+)(?::(-?\d+))?$").expect("valid regex"));

/// Errors produced while parsing a layout string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LayoutError {
    /// A token did not match any known field syntax.
    #[error("Unrecognized layout token '{0}'")]
    UnknownToken(String),

    /// A span was malformed (end before start or unparseable offset).
    #[error("Invalid byte range in token '{0}'")]
    InvalidRange(String),

    /// A field exceeds the maximum permitted width.
    #[error("Field '{token}' is {width} bytes wide; at most {max} allowed")]
    FieldTooWide {
        /// Offending token.
        token: String,
        /// Declared width.
        width: usize,
        /// Maximum allowed width.
        max: usize,
    },

    /// A match value does not fit inside its declared span.
    #[error("Match value in '{0}' is longer than its byte range")]
    ValueTooLong(String),

    /// The layout has no `m:` type code.
    #[error("Layout must declare exactly one type code (m:)")]
    MissingTypeCode,

    /// A singleton field was declared more than once.
    #[error("Layout declares '{0}' more than once")]
    Duplicate(&'static str),

    /// The layout declares neither identifiers nor data.
    #[error("Layout must declare at least one identifier or data field")]
    NoFields,
}

/// Inclusive byte range inside an advertisement payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldSpan {
    /// First byte offset.
    pub start: usize,
    /// Last byte offset (inclusive).
    pub end: usize,
}

impl FieldSpan {
    /// Number of bytes covered.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.end - self.start + 1
    }
}

impl fmt::Display for FieldSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A fixed byte sequence that must appear at a given span.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchField {
    /// Where the value lives.
    pub span: FieldSpan,
    /// Expected bytes, most significant first as written in the layout.
    pub value: Vec<u8>,
}

impl MatchField {
    /// Expected value as an integer.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.value
            .iter()
            .take(8)
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }
}

/// An identifier extraction rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentifierField {
    /// Where the identifier lives.
    pub span: FieldSpan,
    /// Bytes were transmitted least significant first.
    pub little_endian: bool,
    /// The field may be shorter than its span when the payload ends early.
    pub variable_length: bool,
}

/// A numeric data field extraction rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataField {
    /// Where the field lives.
    pub span: FieldSpan,
    /// Bytes were transmitted least significant first.
    pub little_endian: bool,
}

/// Calibrated power extraction rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PowerField {
    /// Where the signed power byte(s) live.
    pub span: FieldSpan,
    /// Added to the decoded value. Eddystone reports power at 0 m, so -41 brings it to 1 m.
    pub correction: i32,
}

/// A parsed beacon layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutDescriptor {
    name: Option<String>,
    type_code: MatchField,
    service: Option<MatchField>,
    identifiers: Vec<IdentifierField>,
    data_fields: Vec<DataField>,
    power: Option<PowerField>,
    extra_frame: bool,
    hardware_assist_manufacturers: Vec<u16>,
    children: Vec<LayoutDescriptor>,
}

impl LayoutDescriptor {
    /// Parses a layout string.
    ///
    /// # Errors
    ///
    /// Returns a [`LayoutError`] naming the first offending token.
    pub fn parse(layout: &str) -> Result<Self, LayoutError> {
        let mut type_code = None;
        let mut service = None;
        let mut power = None;
        let mut identifiers = Vec::new();
        let mut data_fields = Vec::new();
        let mut extra_frame = false;

        for token in layout.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if token == "x" {
                extra_frame = true;
            } else if let Some(caps) = IDENTIFIER_PATTERN.captures(token) {
                let span = parse_span(token, &caps[1], &caps[2])?;
                check_width(token, span, MAX_IDENTIFIER_BYTES)?;
                let flags = &caps[3];
                identifiers.push(IdentifierField {
                    span,
                    little_endian: flags.contains('l'),
                    variable_length: flags.contains('v'),
                });
            } else if let Some(caps) = MATCHING_PATTERN.captures(token) {
                if type_code.is_some() {
                    return Err(LayoutError::Duplicate("m"));
                }
                let span = parse_span(token, &caps[1], &caps[2])?;
                type_code = Some(parse_match(token, span, &caps[3])?);
            } else if let Some(caps) = SERVICE_PATTERN.captures(token) {
                if service.is_some() {
                    return Err(LayoutError::Duplicate("s"));
                }
                let span = parse_span(token, &caps[1], &caps[2])?;
                service = Some(parse_match(token, span, &caps[3])?);
            } else if let Some(caps) = DATA_PATTERN.captures(token) {
                let span = parse_span(token, &caps[1], &caps[2])?;
                check_width(token, span, MAX_DATA_BYTES)?;
                data_fields.push(DataField {
                    span,
                    little_endian: caps[3].contains('l'),
                });
            } else if let Some(caps) = POWER_PATTERN.captures(token) {
                if power.is_some() {
                    return Err(LayoutError::Duplicate("p"));
                }
                let span = parse_span(token, &caps[1], &caps[2])?;
                check_width(token, span, 4)?;
                let correction = match caps.get(3) {
                    Some(m) => m
                        .as_str()
                        .parse()
                        .map_err(|_| LayoutError::InvalidRange(token.to_string()))?,
                    None => 0,
                };
                power = Some(PowerField { span, correction });
            } else {
                return Err(LayoutError::UnknownToken(token.to_string()));
            }
        }

        let type_code = type_code.ok_or(LayoutError::MissingTypeCode)?;
        if identifiers.is_empty() && data_fields.is_empty() {
            return Err(LayoutError::NoFields);
        }

        Ok(Self {
            name: None,
            type_code,
            service,
            identifiers,
            data_fields,
            power,
            extra_frame,
            hardware_assist_manufacturers: Vec::new(),
            children: Vec::new(),
        })
    }

    /// AltBeacon layout with hardware assist for its manufacturer.
    #[must_use]
    pub fn altbeacon() -> Self {
        Self::builtin(ALTBEACON_LAYOUT, "altbeacon")
            .with_hardware_assist_manufacturers(vec![ALTBEACON_MANUFACTURER])
    }

    /// iBeacon layout with hardware assist for Apple.
    #[must_use]
    pub fn ibeacon() -> Self {
        Self::builtin(IBEACON_LAYOUT, "ibeacon")
            .with_hardware_assist_manufacturers(vec![APPLE_MANUFACTURER])
    }

    /// Eddystone UID layout with the telemetry frame attached as a child.
    #[must_use]
    pub fn eddystone_uid() -> Self {
        Self::builtin(EDDYSTONE_UID_LAYOUT, "eddystone-uid").with_child_layout(Self::eddystone_tlm())
    }

    /// Eddystone URL layout.
    #[must_use]
    pub fn eddystone_url() -> Self {
        Self::builtin(EDDYSTONE_URL_LAYOUT, "eddystone-url")
    }

    /// Eddystone telemetry layout.
    #[must_use]
    pub fn eddystone_tlm() -> Self {
        Self::builtin(EDDYSTONE_TLM_LAYOUT, "eddystone-tlm")
    }

    /// URI beacon layout.
    #[must_use]
    pub fn uri_beacon() -> Self {
        Self::builtin(URI_BEACON_LAYOUT, "uri-beacon")
    }

    /// Looks up a built-in layout by its short name.
    #[must_use]
    pub fn named(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "altbeacon" => Some(Self::altbeacon()),
            "ibeacon" => Some(Self::ibeacon()),
            "eddystone-uid" => Some(Self::eddystone_uid()),
            "eddystone-url" => Some(Self::eddystone_url()),
            "eddystone-tlm" => Some(Self::eddystone_tlm()),
            "uri-beacon" => Some(Self::uri_beacon()),
            _ => None,
        }
    }

    #[allow(clippy::expect_used)]
    fn builtin(layout: &str, name: &str) -> Self {
        Self::parse(layout)
            .expect("built-in layout strings are valid")
            .with_name(name)
    }

    /// Sets a human readable name used as the layout id.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Restricts manufacturer data matches to these manufacturer codes.
    #[must_use]
    pub fn with_hardware_assist_manufacturers(mut self, manufacturers: Vec<u16>) -> Self {
        self.hardware_assist_manufacturers = manufacturers;
        self
    }

    /// Appends an identifier rule.
    #[must_use]
    pub fn with_identifier(mut self, field: IdentifierField) -> Self {
        self.identifiers.push(field);
        self
    }

    /// Appends a data field rule.
    #[must_use]
    pub fn with_data_field(mut self, field: DataField) -> Self {
        self.data_fields.push(field);
        self
    }

    /// Attaches an auxiliary layout whose data frames merge into this beacon.
    #[must_use]
    pub fn with_child_layout(mut self, child: Self) -> Self {
        self.children.push(child);
        self
    }

    /// Stable identifier for this layout: its name, or the normalized string.
    #[must_use]
    pub fn id(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.to_string())
    }

    /// Optional human readable name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Type code rule.
    #[must_use]
    pub const fn type_code(&self) -> &MatchField {
        &self.type_code
    }

    /// Service UUID rule, present for service data layouts.
    #[must_use]
    pub const fn service(&self) -> Option<&MatchField> {
        self.service.as_ref()
    }

    /// Identifier rules in declaration order.
    #[must_use]
    pub fn identifiers(&self) -> &[IdentifierField] {
        &self.identifiers
    }

    /// Data field rules in declaration order.
    #[must_use]
    pub fn data_fields(&self) -> &[DataField] {
        &self.data_fields
    }

    /// Power rule.
    #[must_use]
    pub const fn power(&self) -> Option<&PowerField> {
        self.power.as_ref()
    }

    /// Whether this layout describes an auxiliary frame (`x`).
    #[must_use]
    pub const fn is_extra_frame(&self) -> bool {
        self.extra_frame
    }

    /// Manufacturer codes accepted when hardware assist is enforced.
    #[must_use]
    pub fn hardware_assist_manufacturers(&self) -> &[u16] {
        &self.hardware_assist_manufacturers
    }

    /// Auxiliary child layouts.
    #[must_use]
    pub fn children(&self) -> &[Self] {
        &self.children
    }

    /// Beacons of this layout can be assembled from several frames.
    #[must_use]
    pub fn is_multi_frame(&self) -> bool {
        self.extra_frame || !self.children.is_empty()
    }

    /// This layout and all of its children, depth first.
    #[must_use]
    pub fn flatten(&self) -> Vec<&Self> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.flatten());
        }
        out
    }
}

/// Renders the normalized form: `x`, `s`, `m`, identifiers, `p`, then data.
impl fmt::Display for LayoutDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens = Vec::new();
        if self.extra_frame {
            tokens.push("x".to_string());
        }
        if let Some(service) = &self.service {
            tokens.push(format!("s:{}={}", service.span, encode_hex(&service.value)));
        }
        tokens.push(format!(
            "m:{}={}",
            self.type_code.span,
            encode_hex(&self.type_code.value)
        ));
        for id in &self.identifiers {
            let mut token = format!("i:{}", id.span);
            if id.little_endian {
                token.push('l');
            }
            if id.variable_length {
                token.push('v');
            }
            tokens.push(token);
        }
        if let Some(power) = &self.power {
            if power.correction == 0 {
                tokens.push(format!("p:{}", power.span));
            } else {
                tokens.push(format!("p:{}:{}", power.span, power.correction));
            }
        }
        for data in &self.data_fields {
            let suffix = if data.little_endian { "l" } else { "" };
            tokens.push(format!("d:{}{suffix}", data.span));
        }
        f.write_str(&tokens.join(","))
    }
}

impl FromStr for LayoutDescriptor {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for LayoutDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LayoutDescriptor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn parse_span(token: &str, start: &str, end: &str) -> Result<FieldSpan, LayoutError> {
    let start: usize = start
        .parse()
        .map_err(|_| LayoutError::InvalidRange(token.to_string()))?;
    let end: usize = end
        .parse()
        .map_err(|_| LayoutError::InvalidRange(token.to_string()))?;
    if end < start {
        return Err(LayoutError::InvalidRange(token.to_string()));
    }
    Ok(FieldSpan { start, end })
}

fn check_width(token: &str, span: FieldSpan, max: usize) -> Result<(), LayoutError> {
    if span.width() > max {
        return Err(LayoutError::FieldTooWide {
            token: token.to_string(),
            width: span.width(),
            max,
        });
    }
    Ok(())
}

fn parse_match(token: &str, span: FieldSpan, hex: &str) -> Result<MatchField, LayoutError> {
    if hex.len() > span.width() * 2 {
        return Err(LayoutError::ValueTooLong(token.to_string()));
    }
    let padded = format!("{hex:0>width$}", width = span.width() * 2);
    let value = decode_hex(&padded).ok_or_else(|| LayoutError::UnknownToken(token.to_string()))?;
    Ok(MatchField { span, value })
}
