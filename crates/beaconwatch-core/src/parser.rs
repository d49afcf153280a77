//! Matching raw advertisements against registered layouts.
//!
//! [`AdvertisementParser`] holds the active layouts in registration order
//! and returns the first [`Sighting`] any of them produces. A packet that no
//! layout understands, including a truncated one, yields `None`.

use tracing::trace;

use crate::advertisement::{Advertisement, Pdu, AD_TYPE_MANUFACTURER_DATA, AD_TYPE_SERVICE_DATA};
use crate::identifier::{decode_hex, Identifier};
use crate::layout::{FieldSpan, LayoutDescriptor};
use crate::sighting::Sighting;

/// One received radio packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// Transmitter MAC address.
    pub address: String,
    /// Received signal strength in dBm.
    pub rssi: i32,
    /// Advertisement bytes, scan response appended.
    pub data: Vec<u8>,
    /// Monotonic receive time in milliseconds.
    pub timestamp_ms: i64,
}

impl RawPacket {
    /// Creates a packet.
    #[must_use]
    pub fn new(address: impl Into<String>, rssi: i32, data: Vec<u8>, timestamp_ms: i64) -> Self {
        Self {
            address: address.into(),
            rssi,
            data,
            timestamp_ms,
        }
    }

    /// Creates a packet from hex encoded bytes, as relayed by scanner bridges.
    ///
    /// Returns `None` unless `data_hex` is a non-empty, even length hex string.
    #[must_use]
    pub fn from_hex(
        address: impl Into<String>,
        rssi: i32,
        data_hex: &str,
        timestamp_ms: i64,
    ) -> Option<Self> {
        let hex = data_hex.trim();
        if hex.is_empty() || hex.len() % 2 != 0 {
            return None;
        }
        let data = decode_hex(hex)?;
        Some(Self::new(address, rssi, data, timestamp_ms))
    }
}

/// Registered layouts plus matching rules.
#[derive(Debug, Clone, Default)]
pub struct AdvertisementParser {
    layouts: Vec<LayoutDescriptor>,
    enforce_hardware_assist: bool,
}

impl AdvertisementParser {
    /// Creates a parser over `layouts`.
    #[must_use]
    pub fn new(layouts: Vec<LayoutDescriptor>) -> Self {
        Self {
            layouts,
            enforce_hardware_assist: false,
        }
    }

    /// Only accept manufacturer data from each layout's declared manufacturers.
    #[must_use]
    pub const fn with_hardware_assist(mut self, enforce: bool) -> Self {
        self.enforce_hardware_assist = enforce;
        self
    }

    /// Top-level layouts in registration order.
    #[must_use]
    pub fn layouts(&self) -> &[LayoutDescriptor] {
        &self.layouts
    }

    /// Adds a layout, replacing one with the same id.
    pub fn register(&mut self, layout: LayoutDescriptor) {
        let id = layout.id();
        if let Some(existing) = self.layouts.iter_mut().find(|l| l.id() == id) {
            *existing = layout;
        } else {
            self.layouts.push(layout);
        }
    }

    /// Removes the layout with `id`. Returns whether one was removed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.layouts.len();
        self.layouts.retain(|l| l.id() != id);
        before != self.layouts.len()
    }

    /// Whether any registered layout carries auxiliary child layouts.
    #[must_use]
    pub fn has_extra_data_layouts(&self) -> bool {
        self.layouts.iter().any(|l| !l.children().is_empty())
    }

    /// Whether the merger should key transmitters by service UUID as well.
    ///
    /// Child layouts share their parent's entry, so keying by service is
    /// only safe when none are registered.
    #[must_use]
    pub fn matches_beacons_by_service(&self) -> bool {
        !self.has_extra_data_layouts()
    }

    /// Tries every layout (children after their parent) and returns the first match.
    #[must_use]
    pub fn parse(&self, packet: &RawPacket) -> Option<Sighting> {
        let advert = Advertisement::parse(&packet.data);
        self.layouts.iter().find_map(|parent| {
            let multi_frame = parent.is_multi_frame();
            parent
                .flatten()
                .into_iter()
                .find_map(|layout| self.parse_advertisement(layout, &advert, packet, multi_frame))
        })
    }

    /// Tries a single layout.
    #[must_use]
    pub fn parse_with(&self, layout: &LayoutDescriptor, packet: &RawPacket) -> Option<Sighting> {
        let advert = Advertisement::parse(&packet.data);
        self.parse_advertisement(layout, &advert, packet, layout.is_multi_frame())
    }

    fn parse_advertisement(
        &self,
        layout: &LayoutDescriptor,
        advert: &Advertisement,
        packet: &RawPacket,
        multi_frame: bool,
    ) -> Option<Sighting> {
        let bytes = packet.data.as_slice();
        let expected_type = if layout.service().is_some() {
            AD_TYPE_SERVICE_DATA
        } else {
            AD_TYPE_MANUFACTURER_DATA
        };

        advert
            .pdus()
            .iter()
            .filter(|pdu| pdu.pdu_type == expected_type)
            .find_map(|pdu| {
                let mut sighting = self.extract(layout, pdu, bytes, packet, multi_frame)?;
                sighting.set_name(advert.local_name(bytes));
                Some(sighting)
            })
    }

    fn extract(
        &self,
        layout: &LayoutDescriptor,
        pdu: &Pdu,
        bytes: &[u8],
        packet: &RawPacket,
        multi_frame: bool,
    ) -> Option<Sighting> {
        let payload = pdu.payload(bytes);

        let manufacturer = if pdu.pdu_type == AD_TYPE_MANUFACTURER_DATA && payload.len() >= 2 {
            u16::from_le_bytes([payload[0], payload[1]])
        } else {
            0
        };
        if self.enforce_hardware_assist
            && pdu.pdu_type == AD_TYPE_MANUFACTURER_DATA
            && !layout.hardware_assist_manufacturers().is_empty()
            && !layout.hardware_assist_manufacturers().contains(&manufacturer)
        {
            return None;
        }

        // Matching bytes first; a mismatch is the common case.
        let type_code = layout.type_code();
        if slice(payload, type_code.span)? != type_code.value.as_slice() {
            return None;
        }

        let service_uuid = match layout.service() {
            Some(service) => {
                // UUIDs travel little-endian.
                let on_air = slice(payload, service.span)?;
                if !on_air.iter().rev().eq(service.value.iter()) {
                    return None;
                }
                u16::try_from(service.as_u64()).ok()
            }
            None => None,
        };

        let mut identifiers = Vec::with_capacity(layout.identifiers().len());
        for field in layout.identifiers() {
            let raw = if field.variable_length {
                if field.span.start >= payload.len() {
                    trace!(layout = %layout.id(), "Variable identifier starts past end of payload");
                    return None;
                }
                &payload[field.span.start..=field.span.end.min(payload.len() - 1)]
            } else if let Some(raw) = slice(payload, field.span) {
                raw
            } else {
                trace!(
                    layout = %layout.id(),
                    declared = pdu.declared_length,
                    "Payload too short for identifier field"
                );
                return None;
            };
            identifiers.push(Identifier::from_bytes(raw, field.little_endian));
        }

        let mut data_fields = Vec::with_capacity(layout.data_fields().len());
        for field in layout.data_fields() {
            let raw = slice(payload, field.span)?;
            data_fields.push(read_unsigned(raw, field.little_endian));
        }

        let tx_power = match layout.power() {
            Some(power) => read_signed(slice(payload, power.span)?).saturating_add(power.correction),
            None => 0,
        };

        Some(
            Sighting::builder()
                .identifiers(identifiers)
                .data_fields(data_fields)
                .rssi(packet.rssi)
                .tx_power(tx_power)
                .hardware_address(packet.address.clone())
                .layout_id(layout.id())
                .type_code(type_code.as_u64())
                .manufacturer(manufacturer)
                .service_uuid(service_uuid)
                .multi_frame(multi_frame)
                .timestamp_ms(packet.timestamp_ms)
                .build(),
        )
    }
}

fn slice(payload: &[u8], span: FieldSpan) -> Option<&[u8]> {
    payload.get(span.start..=span.end)
}

fn read_unsigned(raw: &[u8], little_endian: bool) -> u64 {
    let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
    if little_endian {
        raw.iter().rev().fold(0, fold)
    } else {
        raw.iter().fold(0, fold)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn read_signed(raw: &[u8]) -> i32 {
    let bits = raw.len() * 8;
    let value = read_unsigned(raw, false) as i64;
    let shift = 64 - bits;
    ((value << shift) >> shift) as i32
}
