//! Per-region ranging aggregation.
//!
//! While a region is ranged, every matching sighting is fed into its
//! [`RangeState`]. At the end of each scan cycle the state is finalized:
//! beacons seen this cycle get their filtered RSSI and counts committed and
//! are reported; beacons whose filter still holds live samples are kept for
//! the next cycle; the rest are forgotten.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::trace;

use crate::filter::{FilterStrategy, RssiFilter};
use crate::sighting::{Sighting, SightingKey};

/// How long a cached beacon keeps being reported without new packets.
pub const DEFAULT_MAX_TRACKING_AGE_MS: i64 = 5_000;

/// RSSI value that some receivers report when they have no measurement.
pub const NO_MEASUREMENT_RSSI: i32 = 127;

/// Ranging behaviour shared by every ranged region.
#[derive(Debug, Clone, PartialEq)]
pub struct RangingConfig {
    /// Filter applied to each beacon's RSSI.
    pub filter: FilterStrategy,
    /// Keep reporting beacons for `max_tracking_age_ms` after their last packet.
    pub use_tracking_cache: bool,
    /// Tracking cache lifetime.
    pub max_tracking_age_ms: i64,
    /// Treat the same identifiers from different addresses as different beacons.
    pub hardware_equality: bool,
}

impl Default for RangingConfig {
    fn default() -> Self {
        Self {
            filter: FilterStrategy::default(),
            use_tracking_cache: false,
            max_tracking_age_ms: DEFAULT_MAX_TRACKING_AGE_MS,
            hardware_equality: false,
        }
    }
}

#[derive(Debug)]
struct RangedBeacon {
    sighting: Sighting,
    tracked: bool,
    last_tracked_ms: i64,
    filter: Box<dyn RssiFilter>,
    packet_count: u32,
    first_cycle_detection_ms: Option<i64>,
    last_cycle_detection_ms: i64,
}

impl RangedBeacon {
    fn new(sighting: Sighting, filter: Box<dyn RssiFilter>, now_ms: i64) -> Self {
        let mut beacon = Self {
            sighting: sighting.clone(),
            tracked: false,
            last_tracked_ms: now_ms,
            filter,
            packet_count: 0,
            first_cycle_detection_ms: None,
            last_cycle_detection_ms: 0,
        };
        beacon.update(sighting, now_ms);
        beacon
    }

    fn update(&mut self, sighting: Sighting, now_ms: i64) {
        self.packet_count += 1;
        self.first_cycle_detection_ms
            .get_or_insert(sighting.first_cycle_detection_ms());
        self.last_cycle_detection_ms = sighting.last_cycle_detection_ms();

        let rssi = sighting.rssi();
        self.sighting = sighting;
        if rssi != NO_MEASUREMENT_RSSI {
            self.tracked = true;
            self.last_tracked_ms = now_ms;
            self.filter.add_sample(rssi, now_ms);
        }
    }

    fn commit(&mut self, now_ms: i64) {
        let filtered = if self.filter.has_samples(now_ms) {
            Some((
                self.filter.current_value(now_ms),
                self.filter.sample_count(),
            ))
        } else {
            trace!("No measurements available to calculate running average");
            None
        };
        self.sighting.commit_cycle(
            filtered,
            self.packet_count,
            self.first_cycle_detection_ms
                .unwrap_or(self.last_cycle_detection_ms),
            self.last_cycle_detection_ms,
        );
        self.packet_count = 0;
        self.first_cycle_detection_ms = None;
        self.last_cycle_detection_ms = 0;
    }

    const fn is_expired(&self, now_ms: i64, max_tracking_age_ms: i64) -> bool {
        now_ms - self.last_tracked_ms > max_tracking_age_ms
    }
}

/// Beacons accumulated for one ranged region.
#[derive(Debug)]
pub struct RangeState {
    config: RangingConfig,
    beacons: Mutex<HashMap<SightingKey, RangedBeacon>>,
}

impl RangeState {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new(config: RangingConfig) -> Self {
        Self {
            config,
            beacons: Mutex::new(HashMap::new()),
        }
    }

    /// Records one sighting for this cycle.
    pub fn add_beacon(&self, sighting: Sighting, now_ms: i64) {
        let key = sighting.key(self.config.hardware_equality);
        let mut beacons = self.beacons.lock().unwrap_or_else(PoisonError::into_inner);
        match beacons.get_mut(&key) {
            Some(existing) => existing.update(sighting, now_ms),
            None => {
                trace!(key = ?key.identifiers(), "Ranging a new beacon");
                let filter = self.config.filter.build();
                beacons.insert(key, RangedBeacon::new(sighting, filter, now_ms));
            }
        }
    }

    /// Closes the current cycle and returns the beacons to report.
    ///
    /// The map is rebuilt and swapped in, so sightings added after this call
    /// accumulate into the next cycle.
    pub fn finalize_beacons(&self, now_ms: i64) -> Vec<Sighting> {
        let mut beacons = self.beacons.lock().unwrap_or_else(PoisonError::into_inner);
        let mut retained = HashMap::with_capacity(beacons.len());
        let mut finalized = Vec::new();

        for (key, mut beacon) in beacons.drain() {
            if beacon.tracked {
                beacon.commit(now_ms);
                if beacon.filter.has_samples(now_ms) {
                    finalized.push((key.clone(), beacon.sighting.clone()));
                }
            }

            // Beacons with live samples carry over; only seen ones are reported.
            if beacon.filter.has_samples(now_ms) {
                if !self.config.use_tracking_cache
                    || beacon.is_expired(now_ms, self.config.max_tracking_age_ms)
                {
                    beacon.tracked = false;
                }
                retained.insert(key, beacon);
            } else {
                trace!(key = ?key.identifiers(), "Dropping beacon with no live measurements");
            }
        }

        *beacons = retained;
        finalized.sort_by(|a, b| a.0.cmp(&b.0)); // stable report order
        finalized.into_iter().map(|(_, s)| s).collect()
    }

    /// Beacons currently held, reported or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.beacons
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier;

    fn sighting(minor: u16, rssi: i32, ts: i64) -> Sighting {
        Sighting::builder()
            .identifier(Identifier::from_int(1))
            .identifier(Identifier::from_int(minor))
            .hardware_address("00:11:22:33:44:55")
            .rssi(rssi)
            .tx_power(-59)
            .timestamp_ms(ts)
            .build()
    }

    fn config(filter: FilterStrategy, cache: bool) -> RangingConfig {
        RangingConfig {
            filter,
            use_tracking_cache: cache,
            ..RangingConfig::default()
        }
    }

    #[test]
    fn test_finalize_commits_counts_and_average() {
        let state = RangeState::new(RangingConfig::default());
        state.add_beacon(sighting(2, -60, 100), 100);
        state.add_beacon(sighting(2, -70, 200), 200);
        state.add_beacon(sighting(2, -80, 300), 300);

        let out = state.finalize_beacons(1_000);
        assert_eq!(out.len(), 1);
        let beacon = &out[0];
        assert_eq!(beacon.packet_count(), 3);
        assert_eq!(beacon.measurement_count(), 3);
        assert_eq!(beacon.first_cycle_detection_ms(), 100);
        assert_eq!(beacon.last_cycle_detection_ms(), 300);
        assert!((beacon.running_average_rssi().unwrap() + 70.0).abs() < f64::EPSILON);
        assert_eq!(beacon.rssi(), -80);
    }

    #[test]
    fn test_finalize_twice_without_input_reports_nothing_new() {
        let state = RangeState::new(RangingConfig::default());
        state.add_beacon(sighting(2, -60, 0), 0);
        assert_eq!(state.finalize_beacons(100).len(), 1);
        assert!(state.finalize_beacons(200).is_empty());
        assert_eq!(state.len(), 1, "beacon with live samples is retained");
        assert!(state.finalize_beacons(300).is_empty());
    }

    #[test]
    fn test_retained_beacon_is_dropped_when_samples_expire() {
        let state = RangeState::new(config(
            FilterStrategy::RunningAverage { expiration_ms: 1_000 },
            false,
        ));
        state.add_beacon(sighting(2, -60, 0), 0);
        state.finalize_beacons(100);
        assert_eq!(state.len(), 1);
        state.finalize_beacons(1_000);
        assert!(state.is_empty());
    }

    #[test]
    fn test_tracking_cache_keeps_reporting_until_expired() {
        let state = RangeState::new(config(FilterStrategy::Arma { speed: 0.1 }, true));
        state.add_beacon(sighting(2, -60, 0), 0);
        assert_eq!(state.finalize_beacons(1_000).len(), 1);
        assert_eq!(state.finalize_beacons(5_000).len(), 1);
        assert_eq!(
            state.finalize_beacons(5_001).len(),
            1,
            "reported once more in the cycle the cache expires"
        );
        assert_eq!(state.finalize_beacons(6_000).len(), 0);
        assert_eq!(state.len(), 1, "ARMA filter keeps the beacon warm");
    }

    #[test]
    fn test_cached_beacon_reports_zero_packets() {
        let state = RangeState::new(config(FilterStrategy::Arma { speed: 0.1 }, true));
        state.add_beacon(sighting(2, -60, 0), 0);
        state.finalize_beacons(1_000);
        let out = state.finalize_beacons(2_000);
        assert_eq!(out[0].packet_count(), 0);
    }

    #[test]
    fn test_sentinel_rssi_is_not_a_measurement() {
        let state = RangeState::new(RangingConfig::default());
        state.add_beacon(sighting(2, NO_MEASUREMENT_RSSI, 0), 0);
        assert!(state.finalize_beacons(100).is_empty());
        assert!(state.is_empty());
    }

    #[test]
    fn test_distinct_beacons_are_reported_in_key_order() {
        let state = RangeState::new(RangingConfig::default());
        state.add_beacon(sighting(3, -60, 0), 0);
        state.add_beacon(sighting(2, -60, 0), 0);
        let out = state.finalize_beacons(100);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].identifier(1).unwrap().to_int(), Some(2));
        assert_eq!(out[1].identifier(1).unwrap().to_int(), Some(3));
    }

    #[test]
    fn test_hardware_equality_splits_by_address() {
        let state = RangeState::new(RangingConfig {
            hardware_equality: true,
            ..RangingConfig::default()
        });
        state.add_beacon(sighting(2, -60, 0), 0);
        let other = Sighting::builder()
            .identifier(Identifier::from_int(1))
            .identifier(Identifier::from_int(2))
            .hardware_address("00:11:22:33:44:66")
            .rssi(-61)
            .build();
        state.add_beacon(other, 0);
        assert_eq!(state.finalize_beacons(100).len(), 2);
    }

    #[test]
    fn test_state_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RangeState>();
    }
}
