//! The beacon engine.
//!
//! [`BeaconEngine`] owns every stage of the packet path and all per-region
//! state. Packets may be fed from many threads at once; cycle boundaries are
//! driven by whoever owns the scan schedule through
//! [`on_cycle_end`](BeaconEngine::on_cycle_end).
//!
//! ```text
//! RawPacket -> parser -> merger -> monitoring (entries)
//!                                -> ranged regions (accumulate)
//! cycle end -> monitoring (exits) -> ranged regions (finalize + distance)
//! ```
//!
//! Events are collected while locks are held and delivered to the
//! [`EventSink`] only after every lock has been released.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::distance::{DistanceEstimator, ModelSpecificDistanceCalculator};
use crate::distinct::DistinctPacketDetector;
use crate::error::{BeaconError, Result};
use crate::events::{BeaconEvent, EventSink, NullSink};
use crate::layout::LayoutDescriptor;
use crate::merger::ExtraDataTracker;
use crate::monitoring::{MonitoringStatus, RegionState, RegionTransition};
use crate::parser::{AdvertisementParser, RawPacket};
use crate::ranging::{RangeState, RangingConfig};
use crate::region::RegionCriteria;
use crate::sighting::Sighting;
use crate::stats::{DetectionSample, DetectionStats, DEFAULT_SAMPLE_INTERVAL_MS};
use crate::storage::MonitoringStore;

/// A monitored region with its current state.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct MonitoredRegion {
    /// Region criteria.
    #[schema(value_type = Object)]
    pub region: RegionCriteria,
    /// Current occupancy.
    pub state: RegionState,
    /// Subscriber for this region's events.
    pub target: String,
    /// Last matching sighting on the engine clock.
    pub last_seen_ms: Option<i64>,
}

/// Ranging result for one region in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RangingUpdate {
    /// Ranged region.
    pub region: RegionCriteria,
    /// Beacons reported this cycle, in identifier order.
    pub beacons: Vec<Sighting>,
}

/// What one cycle end produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// One entry per ranged region.
    pub ranging: Vec<RangingUpdate>,
    /// Regions vacated at this cycle end.
    pub exits: Vec<RegionTransition>,
}

impl CycleReport {
    /// Beacons reported across every ranged region.
    #[must_use]
    pub fn beacon_count(&self) -> usize {
        self.ranging.iter().map(|u| u.beacons.len()).sum()
    }
}

/// Packet counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct PacketCounters {
    /// Packets handed to the engine.
    pub packets_processed: u64,
    /// Packets recognised by some layout.
    pub beacon_packets: u64,
    /// Packets no layout recognised.
    pub non_beacon_packets: u64,
}

/// Builder for [`BeaconEngine`].
pub struct BeaconEngineBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn MonitoringStore>>,
    sink: Arc<dyn EventSink>,
    forward_non_beacon_packets: bool,
    collect_detection_stats: bool,
}

impl BeaconEngineBuilder {
    /// Uses `clock` for every timing decision.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Persists monitoring state in `store`.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn MonitoringStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Delivers events to `sink`.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Emits [`BeaconEvent::NonBeaconPacket`] for unrecognised packets.
    #[must_use]
    pub const fn forward_non_beacon_packets(mut self, enabled: bool) -> Self {
        self.forward_non_beacon_packets = enabled;
        self
    }

    /// Samples detection counts per interval.
    #[must_use]
    pub const fn collect_detection_stats(mut self, enabled: bool) -> Self {
        self.collect_detection_stats = enabled;
        self
    }

    /// Builds the engine and restores persisted monitoring state.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured layout does not parse.
    pub fn build(self) -> Result<BeaconEngine> {
        let parser = self.config.build_parser()?;
        let hardware_equality = self.config.parser.hardware_equality;
        let tracker = ExtraDataTracker::new(parser.matches_beacons_by_service(), hardware_equality);

        let mut monitoring = MonitoringStatus::new(self.config.monitoring_config(), self.store);
        let restored = monitoring.restore(self.clock.wall_time(), self.clock.now_millis());
        if restored > 0 {
            info!(restored, "Resumed monitoring from persisted state");
        }

        info!(
            layouts = parser.layouts().len(),
            hardware_equality,
            "Beacon engine ready"
        );

        Ok(BeaconEngine {
            parser: RwLock::new(parser),
            tracker: Mutex::new(tracker),
            ranged: Mutex::new(HashMap::new()),
            monitoring: Mutex::new(monitoring),
            ranging_config: self.config.ranging_config(),
            distance: distance_estimator(&self.config),
            stats: Mutex::new(DetectionStats::new(
                self.collect_detection_stats,
                DEFAULT_SAMPLE_INTERVAL_MS,
            )),
            distinct: Mutex::new(DistinctPacketDetector::new()),
            duplicates_seen: AtomicBool::new(false),
            simulated: Mutex::new(Vec::new()),
            sink: self.sink,
            forward_non_beacon_packets: AtomicBool::new(self.forward_non_beacon_packets),
            packets_processed: AtomicU64::new(0),
            beacon_packets: AtomicU64::new(0),
            non_beacon_packets: AtomicU64::new(0),
            hardware_equality,
            clock: self.clock,
        })
    }
}

fn distance_estimator(config: &Config) -> DistanceEstimator {
    let model = config.device_model();
    let calculator = match &config.distance.table_path {
        Some(path) => ModelSpecificDistanceCalculator::from_file(path, model.clone())
            .or_else(|e| {
                warn!(path = %path.display(), error = %e, "Falling back to built-in distance table");
                ModelSpecificDistanceCalculator::with_builtin_table(model)
            }),
        None => ModelSpecificDistanceCalculator::with_builtin_table(model),
    };
    match calculator {
        Ok(calculator) => {
            debug!(
                selected = ?calculator.selected_model().map(ToString::to_string),
                "Distance model selected"
            );
            DistanceEstimator::new(Arc::new(calculator))
        }
        Err(e) => {
            warn!(error = %e, "Distance estimation disabled");
            DistanceEstimator::disabled()
        }
    }
}

/// Parses packets and maintains ranging and monitoring state.
pub struct BeaconEngine {
    parser: RwLock<AdvertisementParser>,
    tracker: Mutex<ExtraDataTracker>,
    ranged: Mutex<HashMap<String, (RegionCriteria, Arc<RangeState>)>>,
    monitoring: Mutex<MonitoringStatus>,
    ranging_config: RangingConfig,
    distance: DistanceEstimator,
    stats: Mutex<DetectionStats>,
    distinct: Mutex<DistinctPacketDetector>,
    duplicates_seen: AtomicBool,
    simulated: Mutex<Vec<Sighting>>,
    sink: Arc<dyn EventSink>,
    forward_non_beacon_packets: AtomicBool,
    packets_processed: AtomicU64,
    beacon_packets: AtomicU64,
    non_beacon_packets: AtomicU64,
    hardware_equality: bool,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for BeaconEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeaconEngine")
            .field("ranging_config", &self.ranging_config)
            .field("hardware_equality", &self.hardware_equality)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl BeaconEngine {
    /// Starts building an engine from `config`.
    #[must_use]
    pub fn builder(config: Config) -> BeaconEngineBuilder {
        BeaconEngineBuilder {
            config,
            clock: Arc::new(SystemClock),
            store: None,
            sink: Arc::new(NullSink),
            forward_non_beacon_packets: false,
            collect_detection_stats: true,
        }
    }

    // =========================================================================
    // PACKET PATH
    // =========================================================================

    /// Runs one packet through the whole pipeline.
    ///
    /// Returns the sighting that reached ranging and monitoring, or `None`
    /// when the packet was not a beacon or was an auxiliary frame.
    pub fn process_packet(&self, packet: &RawPacket) -> Option<Sighting> {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);

        if !self.duplicates_seen.load(Ordering::Relaxed)
            && !self
                .distinct
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_packet_distinct(&packet.address, &packet.data)
        {
            debug!("Duplicate packets detected within one scan; scan restarts are unnecessary");
            self.duplicates_seen.store(true, Ordering::Relaxed);
        }

        let parsed = self
            .parser
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .parse(packet);

        let Some(sighting) = parsed else {
            self.non_beacon_packets.fetch_add(1, Ordering::Relaxed);
            if self.forward_non_beacon_packets.load(Ordering::Relaxed) {
                self.sink.deliver(BeaconEvent::NonBeaconPacket {
                    address: packet.address.clone(),
                    rssi: packet.rssi,
                    data: packet.data.clone(),
                });
            }
            return None;
        };

        self.beacon_packets.fetch_add(1, Ordering::Relaxed);
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .log(self.clock.now_millis());
        self.process_sighting(sighting)
    }

    /// Feeds an already parsed sighting to the merger, monitoring and ranging.
    pub fn process_sighting(&self, sighting: Sighting) -> Option<Sighting> {
        let sighting = self
            .tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .track(sighting)?;

        let now_ms = self.clock.now_millis();
        let transitions = self
            .monitoring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update_newly_inside(&sighting, now_ms);

        let matching: Vec<Arc<RangeState>> = self
            .ranged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(region, _)| region.matches(&sighting))
            .map(|(_, state)| Arc::clone(state))
            .collect();
        for state in matching {
            state.add_beacon(sighting.clone(), now_ms);
        }

        for transition in transitions {
            info!(region = %transition.region.unique_id(), "Entered region");
            self.deliver_transition(transition);
        }
        Some(sighting)
    }

    /// Closes the current scan cycle.
    ///
    /// Injects simulated beacons, vacates silent regions, flushes queued
    /// monitoring state to the store, and finalizes every ranged region. Call this only after every packet of the cycle has been
    /// processed.
    pub fn on_cycle_end(&self) -> CycleReport {
        let simulated = self
            .simulated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for sighting in simulated {
            self.process_sighting(sighting);
        }

        self.distinct
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let now_ms = self.clock.now_millis();
        let (exits, pending) = {
            let mut monitoring = self.monitoring.lock().unwrap_or_else(PoisonError::into_inner);
            let exits = monitoring.update_newly_outside(now_ms);
            (exits, monitoring.take_pending_write(now_ms, self.clock.wall_time()))
        };
        // Store I/O happens after the monitoring lock is released.
        if let Some(write) = pending {
            write.apply();
        }

        let mut ranged: Vec<(RegionCriteria, Arc<RangeState>)> = self
            .ranged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|(region, state)| (region.clone(), Arc::clone(state)))
            .collect();
        ranged.sort_by(|a, b| a.0.unique_id().cmp(b.0.unique_id()));

        let ranging: Vec<RangingUpdate> = ranged
            .into_iter()
            .map(|(region, state)| {
                let mut beacons = state.finalize_beacons(now_ms);
                for beacon in &mut beacons {
                    let distance = beacon
                        .running_average_rssi()
                        .and_then(|rssi| self.distance.estimate_checked(beacon.tx_power(), rssi));
                    beacon.set_distance(distance);
                }
                RangingUpdate { region, beacons }
            })
            .collect();

        for transition in &exits {
            info!(region = %transition.region.unique_id(), "Exited region");
            self.deliver_transition(transition.clone());
        }
        for update in &ranging {
            self.sink.deliver(BeaconEvent::Ranging {
                region: update.region.clone(),
                beacons: update.beacons.clone(),
            });
        }

        CycleReport { ranging, exits }
    }

    fn deliver_transition(&self, transition: RegionTransition) {
        let RegionTransition {
            region,
            state,
            target,
        } = transition;
        let edge = match state {
            RegionState::Inside => BeaconEvent::RegionEntered {
                region: region.clone(),
                target: target.clone(),
            },
            RegionState::Outside => BeaconEvent::RegionExited {
                region: region.clone(),
                target: target.clone(),
            },
        };
        self.sink.deliver(edge);
        self.sink.deliver(BeaconEvent::RegionStateChanged {
            region,
            state,
            target,
        });
    }

    // =========================================================================
    // RANGING
    // =========================================================================

    /// Starts ranging `region`.
    ///
    /// Restarting a region with the same id and identifiers keeps its
    /// accumulated beacons; different identifiers start fresh.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::InvalidRegion`] for invalid criteria.
    pub fn start_ranging(&self, region: RegionCriteria) -> Result<()> {
        region.validate()?;
        let mut ranged = self.ranged.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((existing, _)) = ranged.get(region.unique_id()) {
            if existing.has_same_identifiers(&region) {
                debug!(region = %region.unique_id(), "Already ranging region");
                return Ok(());
            }
        }
        info!(region = %region, "Start ranging");
        let state = Arc::new(RangeState::new(self.ranging_config.clone()));
        ranged.insert(region.unique_id().to_string(), (region, state));
        Ok(())
    }

    /// Stops ranging the region with `unique_id`.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::RegionNotFound`] if it was not being ranged.
    pub fn stop_ranging(&self, unique_id: &str) -> Result<()> {
        let removed = self
            .ranged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(unique_id);
        match removed {
            Some(_) => {
                info!(region = %unique_id, "Stop ranging");
                Ok(())
            }
            None => Err(BeaconError::RegionNotFound(unique_id.to_string())),
        }
    }

    /// Regions being ranged, ordered by id.
    #[must_use]
    pub fn ranged_regions(&self) -> Vec<RegionCriteria> {
        let mut regions: Vec<_> = self
            .ranged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|(region, _)| region.clone())
            .collect();
        regions.sort_by(|a, b| a.unique_id().cmp(b.unique_id()));
        regions
    }

    // =========================================================================
    // MONITORING
    // =========================================================================

    /// Starts monitoring `region` on behalf of `target`.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::InvalidRegion`] for invalid criteria.
    pub fn start_monitoring(&self, region: RegionCriteria, target: impl Into<String>) -> Result<()> {
        region.validate()?;
        info!(region = %region, "Start monitoring");
        self.monitoring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_region(region, target);
        Ok(())
    }

    /// Stops monitoring the region with `unique_id`.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::RegionNotFound`] if it was not being monitored.
    pub fn stop_monitoring(&self, unique_id: &str) -> Result<()> {
        let removed = self
            .monitoring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_region(unique_id);
        if removed {
            info!(region = %unique_id, "Stop monitoring");
            Ok(())
        } else {
            Err(BeaconError::RegionNotFound(unique_id.to_string()))
        }
    }

    /// Monitored regions with their states, in the order they were added.
    #[must_use]
    pub fn monitored_regions(&self) -> Vec<MonitoredRegion> {
        self.monitoring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .regions()
            .iter()
            .map(|(region, state)| MonitoredRegion {
                region: region.clone(),
                state: state.state(),
                target: state.target().to_string(),
                last_seen_ms: state.last_seen_ms(),
            })
            .collect()
    }

    /// Current state of one monitored region.
    #[must_use]
    pub fn region_state(&self, unique_id: &str) -> Option<RegionState> {
        self.monitoring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state_of(unique_id)
            .map(crate::monitoring::RegionMonitoringState::state)
    }

    /// Overrides a region's state without emitting events, adding it if unknown.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::InvalidRegion`] for invalid criteria.
    pub fn force_region_state(&self, region: RegionCriteria, state: Option<RegionState>) -> Result<()> {
        region.validate()?;
        debug!(region = %region.unique_id(), ?state, "Forcing region state");
        self.monitoring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update_local_state(region, state, self.clock.now_millis());
        Ok(())
    }

    /// Turns monitoring persistence on or off.
    pub fn set_persistence_enabled(&self, enabled: bool) {
        let mut monitoring = self.monitoring.lock().unwrap_or_else(PoisonError::into_inner);
        if enabled {
            monitoring.start_status_preservation();
        } else {
            monitoring.stop_status_preservation();
        }
    }

    /// Whether monitoring state is persisted.
    #[must_use]
    pub fn is_persistence_enabled(&self) -> bool {
        self.monitoring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_persistence_enabled()
    }

    // =========================================================================
    // LAYOUTS
    // =========================================================================

    /// Registers a layout, replacing one with the same id.
    pub fn register_layout(&self, layout: LayoutDescriptor) {
        let mut parser = self.parser.write().unwrap_or_else(PoisonError::into_inner);
        info!(layout = %layout.id(), "Registering layout");
        parser.register(layout);
        self.refresh_tracker(&parser);
    }

    /// Removes a layout by id. Returns `false` if none matched.
    pub fn remove_layout(&self, id: &str) -> bool {
        let mut parser = self.parser.write().unwrap_or_else(PoisonError::into_inner);
        let removed = parser.remove(id);
        if removed {
            info!(layout = %id, "Removed layout");
            self.refresh_tracker(&parser);
        }
        removed
    }

    /// Registered layouts in match order.
    #[must_use]
    pub fn layouts(&self) -> Vec<LayoutDescriptor> {
        self.parser
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .layouts()
            .to_vec()
    }

    fn refresh_tracker(&self, parser: &AdvertisementParser) {
        let by_service = parser.matches_beacons_by_service();
        let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        if tracker.matches_by_service_uuid() != by_service {
            *tracker = ExtraDataTracker::new(by_service, self.hardware_equality);
        }
    }

    // =========================================================================
    // DIAGNOSTICS
    // =========================================================================

    /// Replaces the sightings injected at every cycle end.
    pub fn set_simulated_beacons(&self, beacons: Vec<Sighting>) {
        if !beacons.is_empty() {
            warn!(count = beacons.len(), "Simulated beacons enabled");
        }
        *self.simulated.lock().unwrap_or_else(PoisonError::into_inner) = beacons;
    }

    /// Emits [`BeaconEvent::NonBeaconPacket`] for unrecognised packets.
    pub fn set_forward_non_beacon_packets(&self, enabled: bool) {
        self.forward_non_beacon_packets
            .store(enabled, Ordering::Relaxed);
    }

    /// Whether the radio reports repeated packets within one scan.
    ///
    /// Once `true`, restarting scans to see new packets is unnecessary.
    #[must_use]
    pub fn distinct_packets_detected_per_scan(&self) -> bool {
        self.duplicates_seen.load(Ordering::Relaxed)
    }

    /// Detection samples, oldest first.
    #[must_use]
    pub fn detection_samples(&self) -> Vec<DetectionSample> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .samples()
            .to_vec()
    }

    /// Engine time of the most recent beacon detection.
    #[must_use]
    pub fn last_detection_ms(&self) -> Option<i64> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_detection_ms()
    }

    /// Packet counters since startup.
    #[must_use]
    pub fn counters(&self) -> PacketCounters {
        PacketCounters {
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            beacon_packets: self.beacon_packets.load(Ordering::Relaxed),
            non_beacon_packets: self.non_beacon_packets.load(Ordering::Relaxed),
        }
    }

    /// Current engine time.
    #[must_use]
    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }
}
