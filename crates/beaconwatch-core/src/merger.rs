//! Folding auxiliary frames into their primary beacon.
//!
//! Some beacons alternate between an identifying frame and a data-only frame
//! (Eddystone UID and TLM, for example). [`ExtraDataTracker`] remembers the
//! primary sightings per transmitter and copies the latest auxiliary data onto
//! them, so downstream stages only ever see whole beacons.

use std::collections::HashMap;

use tracing::trace;

use crate::sighting::{Sighting, SightingKey};

/// Per-transmitter memory of primary sightings.
#[derive(Debug, Default)]
pub struct ExtraDataTracker {
    match_by_service_uuid: bool,
    hardware_equality: bool,
    beacons_by_transmitter: HashMap<String, Vec<(SightingKey, Sighting)>>,
}

impl ExtraDataTracker {
    /// Creates a tracker.
    ///
    /// `match_by_service_uuid` distinguishes several services sharing one
    /// transmitter address. Turn it off when auxiliary layouts are registered
    /// as children so their frames land on the parent's entry.
    #[must_use]
    pub fn new(match_by_service_uuid: bool, hardware_equality: bool) -> Self {
        Self {
            match_by_service_uuid,
            hardware_equality,
            beacons_by_transmitter: HashMap::new(),
        }
    }

    /// Whether transmitters are keyed by address and service UUID.
    #[must_use]
    pub const fn matches_by_service_uuid(&self) -> bool {
        self.match_by_service_uuid
    }

    /// Merges `sighting` with what is already known about its transmitter.
    ///
    /// Returns `None` for auxiliary frames (their data has been folded into
    /// the stored primaries) and the possibly enriched sighting otherwise.
    pub fn track(&mut self, mut sighting: Sighting) -> Option<Sighting> {
        // Identifier-less frames never reach ranging or monitoring.
        if sighting.is_extra_beacon_data() {
            let transmitter = self.transmitter_key(&sighting);
            if let Some(tracked) = self.beacons_by_transmitter.get_mut(&transmitter) {
                trace!(
                    address = sighting.hardware_address(),
                    primaries = tracked.len(),
                    "Folding auxiliary frame into tracked beacons"
                );
                for (_, primary) in tracked.iter_mut() {
                    primary.set_rssi(sighting.rssi());
                    primary.set_extra_data_fields(sighting.data_fields().to_vec());
                }
            }
            return None;
        }

        if !sighting.is_multi_frame() && sighting.service_uuid().is_none() {
            return Some(sighting);
        }

        let transmitter = self.transmitter_key(&sighting);
        let tracked = self.beacons_by_transmitter.entry(transmitter).or_default();

        if let Some((_, first)) = tracked.first() {
            sighting.set_extra_data_fields(first.extra_data_fields().to_vec());
        }
        let key = sighting.key(self.hardware_equality);
        match tracked.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = sighting.clone(),
            None => tracked.push((key, sighting.clone())),
        }
        Some(sighting)
    }

    /// Forgets every transmitter.
    pub fn clear(&mut self) {
        self.beacons_by_transmitter.clear();
    }

    /// Number of transmitters remembered.
    #[must_use]
    pub fn transmitter_count(&self) -> usize {
        self.beacons_by_transmitter.len()
    }

    fn transmitter_key(&self, sighting: &Sighting) -> String {
        let address = sighting.hardware_address().to_ascii_uppercase();
        match (self.match_by_service_uuid, sighting.service_uuid()) {
            (true, Some(uuid)) => format!("{address}{uuid:04x}"),
            _ => address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier;

    const ADDRESS: &str = "00:11:22:33:44:55";

    fn primary(instance: u16, rssi: i32) -> Sighting {
        Sighting::builder()
            .identifier(Identifier::from_int(1))
            .identifier(Identifier::from_int(instance))
            .hardware_address(ADDRESS)
            .service_uuid(Some(0xfeaa))
            .multi_frame(true)
            .rssi(rssi)
            .build()
    }

    fn telemetry(fields: Vec<u64>, rssi: i32) -> Sighting {
        Sighting::builder()
            .data_fields(fields)
            .hardware_address(ADDRESS)
            .service_uuid(Some(0xfeaa))
            .multi_frame(true)
            .rssi(rssi)
            .build()
    }

    #[test]
    fn test_single_frame_beacons_pass_through() {
        let mut tracker = ExtraDataTracker::new(false, false);
        let plain = Sighting::builder()
            .identifier(Identifier::from_int(1))
            .hardware_address(ADDRESS)
            .build();
        assert!(tracker.track(plain).is_some());
        assert_eq!(tracker.transmitter_count(), 0);
    }

    #[test]
    fn test_auxiliary_frame_is_consumed() {
        let mut tracker = ExtraDataTracker::new(false, false);
        assert!(tracker.track(primary(7, -60)).is_some());
        assert!(tracker.track(telemetry(vec![0, 3000], -65)).is_none());
    }

    #[test]
    fn test_auxiliary_data_carries_forward() {
        let mut tracker = ExtraDataTracker::new(false, false);
        tracker.track(primary(7, -60));
        tracker.track(telemetry(vec![0, 3000, 21], -65));

        let merged = tracker.track(primary(7, -58)).unwrap();
        assert_eq!(merged.extra_data_fields(), &[0, 3000, 21]);
        assert_eq!(merged.rssi(), -58);

        tracker.track(telemetry(vec![0, 2900, 22], -66));
        let merged = tracker.track(primary(7, -57)).unwrap();
        assert_eq!(merged.extra_data_fields(), &[0, 2900, 22]);
    }

    #[test]
    fn test_auxiliary_before_primary_is_dropped() {
        let mut tracker = ExtraDataTracker::new(false, false);
        assert!(tracker.track(telemetry(vec![1], -65)).is_none());
        let first = tracker.track(primary(7, -60)).unwrap();
        assert!(first.extra_data_fields().is_empty());
    }

    #[test]
    fn test_single_frame_data_only_sighting_is_consumed() {
        let mut tracker = ExtraDataTracker::new(false, false);
        let data_only = Sighting::builder()
            .data_fields(vec![0x1234])
            .hardware_address(ADDRESS)
            .build();
        assert!(tracker.track(data_only).is_none());
        assert_eq!(tracker.transmitter_count(), 0);
    }

    #[test]
    fn test_auxiliary_frames_alone_do_not_grow_tracker() {
        let mut tracker = ExtraDataTracker::new(false, false);
        for rssi in -70..-60 {
            assert!(tracker.track(telemetry(vec![1], rssi)).is_none());
        }
        assert_eq!(tracker.transmitter_count(), 0);
    }

    #[test]
    fn test_service_uuid_keying_separates_services() {
        let mut tracker = ExtraDataTracker::new(true, false);
        tracker.track(primary(7, -60));
        let other = Sighting::builder()
            .identifier(Identifier::from_int(9))
            .hardware_address(ADDRESS)
            .service_uuid(Some(0xfed8))
            .build();
        tracker.track(other);
        assert_eq!(tracker.transmitter_count(), 2);
        assert!(tracker.matches_by_service_uuid());

        tracker.clear();
        assert_eq!(tracker.transmitter_count(), 0);
    }
}
