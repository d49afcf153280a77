//! Splitting raw advertisement bytes into AD structures.
//!
//! A BLE advertisement is a run of `[length][type][payload...]` records.
//! The first 31 bytes are the advertising packet proper; anything after
//! that is the scan response and is split the same way.

/// Flags record.
pub const AD_TYPE_FLAGS: u8 = 0x01;
/// Complete local name record.
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
/// 16-bit service data record.
pub const AD_TYPE_SERVICE_DATA: u8 = 0x16;
/// Manufacturer specific data record.
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xff;

const ADVERTISEMENT_LENGTH: usize = 31;

/// One AD structure. `start` and `end` index the payload (after the type byte)
/// inside the original buffer, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pdu {
    /// AD type byte.
    pub pdu_type: u8,
    /// Length byte as transmitted (type plus payload).
    pub declared_length: u8,
    /// Offset of the first payload byte.
    pub start: usize,
    /// Offset of the last payload byte, clamped to the buffer.
    pub end: usize,
}

impl Pdu {
    /// Reads the structure starting at `offset`.
    ///
    /// Returns `None` when the buffer ends, the length byte is zero, or the
    /// structure has no payload byte inside the buffer.
    #[must_use]
    pub fn parse(bytes: &[u8], offset: usize) -> Option<Self> {
        if bytes.len().saturating_sub(offset) < 2 {
            return None;
        }
        let declared_length = bytes[offset];
        if declared_length == 0 {
            return None;
        }
        let pdu_type = bytes[offset + 1];
        let start = offset + 2;
        if start >= bytes.len() {
            return None;
        }
        let end = (offset + usize::from(declared_length)).min(bytes.len() - 1);
        Some(Self {
            pdu_type,
            declared_length,
            start,
            end,
        })
    }

    /// Payload bytes of this structure.
    #[must_use]
    pub fn payload<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        &bytes[self.start..=self.end]
    }

    /// Payload bytes the length byte promised but the buffer did not contain.
    #[must_use]
    pub fn truncated_by(&self) -> usize {
        let declared_end = self.start + usize::from(self.declared_length) - 2;
        declared_end.saturating_sub(self.end)
    }
}

/// All AD structures found in an advertisement and its scan response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pdus: Vec<Pdu>,
}

impl Advertisement {
    /// Splits `bytes` into AD structures.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Self {
        let advert_end = bytes.len().min(ADVERTISEMENT_LENGTH);
        let mut pdus = split(&bytes[..advert_end], 0);
        if bytes.len() > ADVERTISEMENT_LENGTH {
            pdus.extend(split(bytes, ADVERTISEMENT_LENGTH));
        }
        Self { pdus }
    }

    /// Structures in transmission order.
    #[must_use]
    pub fn pdus(&self) -> &[Pdu] {
        &self.pdus
    }

    /// The complete local name, if one was advertised.
    #[must_use]
    pub fn local_name(&self, bytes: &[u8]) -> Option<String> {
        self.pdus
            .iter()
            .find(|p| p.pdu_type == AD_TYPE_COMPLETE_LOCAL_NAME)
            .map(|p| String::from_utf8_lossy(p.payload(bytes)).into_owned())
    }
}

fn split(bytes: &[u8], mut offset: usize) -> Vec<Pdu> {
    let mut pdus = Vec::new();
    while let Some(pdu) = Pdu::parse(bytes, offset) {
        offset += usize::from(pdu.declared_length) + 1;
        pdus.push(pdu);
    }
    pdus
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags_then_manufacturer_data() {
        let bytes = [0x02, 0x01, 0x06, 0x05, 0xff, 0x18, 0x01, 0xbe, 0xac];
        let advert = Advertisement::parse(&bytes);
        assert_eq!(advert.pdus().len(), 2);
        assert_eq!(advert.pdus()[0].pdu_type, AD_TYPE_FLAGS);
        let mfg = advert.pdus()[1];
        assert_eq!(mfg.pdu_type, AD_TYPE_MANUFACTURER_DATA);
        assert_eq!(mfg.payload(&bytes), &[0x18, 0x01, 0xbe, 0xac]);
    }

    #[test]
    fn test_zero_length_terminates() {
        let bytes = [0x02, 0x01, 0x06, 0x00, 0x05, 0xff, 0x01, 0x02, 0x03];
        assert_eq!(Advertisement::parse(&bytes).pdus().len(), 1);
    }

    #[test]
    fn test_truncated_structure_is_clamped() {
        let bytes = [0x1a, 0xff, 0x18, 0x01];
        let pdu = Pdu::parse(&bytes, 0).unwrap();
        assert_eq!(pdu.end, 3);
        assert_eq!(pdu.truncated_by(), 23);
    }

    #[test]
    fn test_too_short_buffers() {
        assert!(Pdu::parse(&[], 0).is_none());
        assert!(Pdu::parse(&[0x01], 0).is_none());
        assert!(Pdu::parse(&[0x01, 0xff], 0).is_none());
    }

    #[test]
    fn test_scan_response_is_parsed_separately() {
        let mut bytes = vec![0u8; 31];
        bytes[0] = 0x02;
        bytes[1] = AD_TYPE_FLAGS;
        bytes[2] = 0x06;
        bytes.extend_from_slice(&[0x04, AD_TYPE_COMPLETE_LOCAL_NAME, b'a', b'b', b'c']);
        let advert = Advertisement::parse(&bytes);
        assert_eq!(advert.pdus().len(), 2);
        assert_eq!(advert.local_name(&bytes).as_deref(), Some("abc"));
    }
}
