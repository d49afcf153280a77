//! Region monitoring.
//!
//! Each monitored region carries a two-state machine: it flips to inside the
//! moment a matching beacon is seen and flips back to outside once no match
//! has been seen for the exit period. [`MonitoringStatus`] owns all of the
//! machines, reports the transitions, and persists the set so a restart does
//! not replay entries for regions the process was already inside.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::region::RegionCriteria;
use crate::sighting::Sighting;
use crate::storage::{MonitoringSnapshot, MonitoringStore, PersistedRegion};

/// Target used when a region is monitored without naming a subscriber.
pub const DEFAULT_TARGET: &str = "default";
/// Silence after which an occupied region is considered vacated.
pub const DEFAULT_EXIT_PERIOD_MS: i64 = 10_000;
/// Larger monitored sets are not persisted.
pub const MAX_REGIONS_FOR_STATUS_PRESERVATION: usize = 50;
/// Persisted state older than this is ignored on startup.
pub const MAX_STATUS_PRESERVATION_AGE: Duration = Duration::from_secs(15 * 60);

const TOUCH_INTERVAL_MS: i64 = 1_000;

/// Occupancy of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RegionState {
    /// At least one matching beacon was seen within the exit period.
    Inside,
    /// No matching beacon within the exit period.
    Outside,
}

/// State machine for one monitored region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionMonitoringState {
    inside: bool,
    last_seen_ms: Option<i64>,
    target: String,
}

impl RegionMonitoringState {
    /// A region that starts outside.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            inside: false,
            last_seen_ms: None,
            target: target.into(),
        }
    }

    /// Records a matching sighting. Returns `true` when this flips the region inside.
    pub fn mark_inside(&mut self, now_ms: i64) -> bool {
        self.last_seen_ms = Some(now_ms);
        if self.inside {
            false
        } else {
            self.inside = true;
            true
        }
    }

    /// Forces the region outside and forgets the last sighting.
    pub fn mark_outside(&mut self) {
        self.inside = false;
        self.last_seen_ms = None;
    }

    /// Flips an occupied region outside once `exit_period_ms` has passed
    /// without a sighting. Returns `true` on that transition.
    pub fn mark_outside_if_expired(&mut self, exit_period_ms: i64, now_ms: i64) -> bool {
        match self.last_seen_ms {
            Some(last_seen) if self.inside && now_ms - last_seen >= exit_period_ms => {
                self.mark_outside();
                true
            }
            _ => false,
        }
    }

    /// Whether the region is occupied.
    #[must_use]
    pub const fn is_inside(&self) -> bool {
        self.inside
    }

    /// Current state as an enum.
    #[must_use]
    pub const fn state(&self) -> RegionState {
        if self.inside {
            RegionState::Inside
        } else {
            RegionState::Outside
        }
    }

    /// Time of the last matching sighting.
    #[must_use]
    pub const fn last_seen_ms(&self) -> Option<i64> {
        self.last_seen_ms
    }

    /// Subscriber for this region's events.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }
}

/// A state change to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionTransition {
    /// Region that changed.
    pub region: RegionCriteria,
    /// New state.
    pub state: RegionState,
    /// Subscriber for this region.
    pub target: String,
}

/// Monitoring behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringConfig {
    /// Silence after which an occupied region is vacated.
    pub exit_period_ms: i64,
    /// Persist state across restarts.
    pub persistence_enabled: bool,
    /// Skip persistence above this many regions.
    pub max_persisted_regions: usize,
    /// Ignore persisted state older than this.
    pub max_restore_age: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            exit_period_ms: DEFAULT_EXIT_PERIOD_MS,
            persistence_enabled: true,
            max_persisted_regions: MAX_REGIONS_FOR_STATUS_PRESERVATION,
            max_restore_age: MAX_STATUS_PRESERVATION_AGE,
        }
    }
}

/// All monitored regions and their state machines.
#[derive(Debug)]
pub struct MonitoringStatus {
    config: MonitoringConfig,
    store: Option<Arc<dyn MonitoringStore>>,
    regions: Vec<(RegionCriteria, RegionMonitoringState)>,
    last_touch_ms: Option<i64>,
    dirty: bool,
    touch_requested: bool,
}

/// Store I/O deferred out of the packet path.
///
/// Built while the status is locked and applied after the lock is released.
#[derive(Debug)]
pub struct PendingWrite {
    store: Arc<dyn MonitoringStore>,
    action: WriteAction,
}

#[derive(Debug)]
enum WriteAction {
    Save(MonitoringSnapshot),
    Delete,
    Touch(SystemTime),
}

impl PendingWrite {
    /// Performs the write. Failures are logged and dropped.
    pub fn apply(self) {
        let result = match &self.action {
            WriteAction::Save(snapshot) => self.store.save(snapshot),
            WriteAction::Delete => self.store.delete(),
            WriteAction::Touch(wall_now) => self.store.touch(*wall_now),
        };
        if let Err(e) = result {
            warn!(error = %e, action = self.action.name(), "Failed to persist monitoring state");
        }
    }
}

impl WriteAction {
    const fn name(&self) -> &'static str {
        match self {
            Self::Save(_) => "save",
            Self::Delete => "delete",
            Self::Touch(_) => "touch",
        }
    }
}

impl MonitoringStatus {
    /// Creates an empty status. Call [`restore`](Self::restore) to load persisted state.
    #[must_use]
    pub fn new(config: MonitoringConfig, store: Option<Arc<dyn MonitoringStore>>) -> Self {
        Self {
            config,
            store,
            regions: Vec::new(),
            last_touch_ms: None,
            dirty: false,
            touch_requested: false,
        }
    }

    /// Loads persisted regions if they are recent enough.
    ///
    /// Regions that were inside are re-marked inside at `now_ms`, so they stay
    /// occupied for a full exit period without replaying an entry event.
    /// Returns how many regions were restored.
    pub fn restore(&mut self, wall_now: SystemTime, now_ms: i64) -> usize {
        let Some(store) = self.store.clone().filter(|_| self.config.persistence_enabled) else {
            return 0;
        };

        let modified = match store.last_modified() {
            Ok(Some(modified)) => modified,
            Ok(None) => return 0,
            Err(e) => {
                warn!(error = %e, "Cannot read monitoring state age");
                return 0;
            }
        };
        let age = wall_now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age > self.config.max_restore_age {
            debug!(age_secs = age.as_secs(), "Monitoring state too old to restore");
            return 0;
        }

        let snapshot = match store.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return 0,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable monitoring state");
                if let Err(e) = store.delete() {
                    warn!(error = %e, "Failed to delete unreadable monitoring state");
                }
                return 0;
            }
        };

        let mut restored = 0;
        for persisted in snapshot.regions {
            if let Err(e) = persisted.region.validate() {
                warn!(error = %e, "Skipping invalid persisted region");
                continue;
            }
            let mut state = RegionMonitoringState {
                inside: false,
                last_seen_ms: persisted.last_seen_ms,
                target: persisted.target,
            };
            if persisted.inside {
                state.mark_inside(now_ms);
            }
            self.upsert(persisted.region, state);
            restored += 1;
        }
        info!(restored, "Restored monitoring state");
        restored
    }

    /// Starts monitoring `region`.
    ///
    /// Re-adding a region with the same id and identifiers keeps its current
    /// state; different identifiers replace it with a fresh outside state.
    pub fn add_region(&mut self, region: RegionCriteria, target: impl Into<String>) {
        if let Some((existing, _)) = self.find(region.unique_id()) {
            if existing.has_same_identifiers(&region) {
                debug!(region = %region, "Region already monitored with same identifiers");
                return;
            }
        }
        self.upsert(region, RegionMonitoringState::new(target));
        self.save();
    }

    /// Stops monitoring the region with `unique_id`.
    pub fn remove_region(&mut self, unique_id: &str) -> bool {
        let before = self.regions.len();
        self.regions.retain(|(r, _)| r.unique_id() != unique_id);
        let removed = before != self.regions.len();
        if removed {
            self.save();
        }
        removed
    }

    /// Marks every region matching `sighting` inside and returns the entries.
    ///
    /// Runs on the packet path, so nothing is written here. The change is
    /// picked up by the next [`take_pending_write`](Self::take_pending_write).
    pub fn update_newly_inside(&mut self, sighting: &Sighting, now_ms: i64) -> Vec<RegionTransition> {
        let mut transitions = Vec::new();
        let mut matched = false;
        for (region, state) in &mut self.regions {
            if region.matches(sighting) {
                matched = true;
                if state.mark_inside(now_ms) {
                    transitions.push(RegionTransition {
                        region: region.clone(),
                        state: RegionState::Inside,
                        target: state.target.clone(),
                    });
                }
            }
        }

        if !transitions.is_empty() {
            self.dirty = true;
        } else if matched {
            self.touch_requested = true;
        }
        transitions
    }

    /// Vacates every occupied region whose exit period has elapsed.
    ///
    /// When nothing changes the stored state's timestamp is refreshed instead,
    /// so a quiet but running process keeps its snapshot fresh. Like
    /// [`update_newly_inside`](Self::update_newly_inside) this only queues the
    /// write.
    pub fn update_newly_outside(&mut self, now_ms: i64) -> Vec<RegionTransition> {
        let exit_period_ms = self.config.exit_period_ms;
        let transitions: Vec<_> = self
            .regions
            .iter_mut()
            .filter_map(|(region, state)| {
                state
                    .mark_outside_if_expired(exit_period_ms, now_ms)
                    .then(|| RegionTransition {
                        region: region.clone(),
                        state: RegionState::Outside,
                        target: state.target.clone(),
                    })
            })
            .collect();
        if !transitions.is_empty() {
            self.dirty = true;
        } else if !self.regions.is_empty() {
            self.touch_requested = true;
        }
        transitions
    }

    /// Drains the write queued by the packet path and the exit sweep.
    ///
    /// A full snapshot wins over a timestamp refresh. Returns `None` when
    /// nothing is queued or persistence is off.
    pub fn take_pending_write(&mut self, now_ms: i64, wall_now: SystemTime) -> Option<PendingWrite> {
        let dirty = std::mem::take(&mut self.dirty);
        let touch = std::mem::take(&mut self.touch_requested);
        if dirty {
            self.pending_save()
        } else if touch {
            self.pending_touch(now_ms, wall_now)
        } else {
            None
        }
    }

    /// Overrides a region's state without emitting an event.
    ///
    /// Unknown regions are added under the default target first. With `None`
    /// the region is only registered and keeps whatever state it had.
    pub fn update_local_state(
        &mut self,
        region: RegionCriteria,
        state: Option<RegionState>,
        now_ms: i64,
    ) {
        if self.find(region.unique_id()).is_none() {
            self.upsert(region.clone(), RegionMonitoringState::new(DEFAULT_TARGET));
        }
        if let Some((_, machine)) = self
            .regions
            .iter_mut()
            .find(|(r, _)| r.unique_id() == region.unique_id())
        {
            match state {
                Some(RegionState::Inside) => {
                    machine.mark_inside(now_ms);
                }
                Some(RegionState::Outside) => machine.mark_outside(),
                None => {}
            }
        }
        self.save();
    }

    /// State of one region.
    #[must_use]
    pub fn state_of(&self, unique_id: &str) -> Option<&RegionMonitoringState> {
        self.find(unique_id).map(|(_, state)| state)
    }

    /// Criteria of one region.
    #[must_use]
    pub fn region(&self, unique_id: &str) -> Option<&RegionCriteria> {
        self.find(unique_id).map(|(region, _)| region)
    }

    /// All monitored regions in insertion order.
    #[must_use]
    pub fn regions(&self) -> &[(RegionCriteria, RegionMonitoringState)] {
        &self.regions
    }

    /// Number of monitored regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether nothing is monitored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Whether state is being persisted.
    #[must_use]
    pub const fn is_persistence_enabled(&self) -> bool {
        self.config.persistence_enabled
    }

    /// Turns persistence on and saves the current state immediately.
    pub fn start_status_preservation(&mut self) {
        self.config.persistence_enabled = true;
        self.save();
    }

    /// Turns persistence off and deletes any stored state.
    pub fn stop_status_preservation(&mut self) {
        self.config.persistence_enabled = false;
        if let Some(store) = &self.store {
            if let Err(e) = store.delete() {
                warn!(error = %e, "Failed to delete monitoring state");
            }
        }
    }

    /// Forgets every region and deletes stored state.
    pub fn clear(&mut self) {
        self.regions.clear();
        if let Some(store) = &self.store {
            if let Err(e) = store.delete() {
                warn!(error = %e, "Failed to delete monitoring state");
            }
        }
    }

    fn find(&self, unique_id: &str) -> Option<&(RegionCriteria, RegionMonitoringState)> {
        self.regions.iter().find(|(r, _)| r.unique_id() == unique_id)
    }

    fn upsert(&mut self, region: RegionCriteria, state: RegionMonitoringState) {
        match self
            .regions
            .iter_mut()
            .find(|(r, _)| r.unique_id() == region.unique_id())
        {
            Some(entry) => *entry = (region, state),
            None => self.regions.push((region, state)),
        }
    }

    fn save(&mut self) {
        self.dirty = false;
        if let Some(write) = self.pending_save() {
            write.apply();
        }
    }

    fn pending_save(&self) -> Option<PendingWrite> {
        let store = self.store.as_ref().filter(|_| self.config.persistence_enabled)?;
        if self.regions.len() > self.config.max_persisted_regions {
            warn!(
                regions = self.regions.len(),
                max = self.config.max_persisted_regions,
                "Too many regions being monitored; not persisting region state"
            );
            return Some(PendingWrite {
                store: Arc::clone(store),
                action: WriteAction::Delete,
            });
        }

        let snapshot = MonitoringSnapshot::new(
            self.regions
                .iter()
                .map(|(region, state)| PersistedRegion {
                    region: region.clone(),
                    inside: state.inside,
                    last_seen_ms: state.last_seen_ms,
                    target: state.target.clone(),
                })
                .collect(),
        );
        Some(PendingWrite {
            store: Arc::clone(store),
            action: WriteAction::Save(snapshot),
        })
    }

    fn pending_touch(&mut self, now_ms: i64, wall_now: SystemTime) -> Option<PendingWrite> {
        let store = self.store.as_ref().filter(|_| self.config.persistence_enabled)?;
        // At most one refresh per interval.
        if self
            .last_touch_ms
            .is_some_and(|last| now_ms - last < TOUCH_INTERVAL_MS)
        {
            return None;
        }
        self.last_touch_ms = Some(now_ms);
        Some(PendingWrite {
            store: Arc::clone(store),
            action: WriteAction::Touch(wall_now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier;
    use crate::storage::MemoryMonitoringStore;

    fn region(id: &str, major: u16) -> RegionCriteria {
        RegionCriteria::new(id, vec![None, Some(Identifier::from_int(major))]).unwrap()
    }

    fn beacon(major: u16) -> Sighting {
        Sighting::builder()
            .identifier(Identifier::from_int(1))
            .identifier(Identifier::from_int(major))
            .hardware_address("00:11:22:33:44:55")
            .build()
    }

    fn status_with_store() -> (MonitoringStatus, Arc<MemoryMonitoringStore>) {
        let store = Arc::new(MemoryMonitoringStore::new());
        let status = MonitoringStatus::new(
            MonitoringConfig::default(),
            Some(store.clone() as Arc<dyn MonitoringStore>),
        );
        (status, store)
    }

    #[test]
    fn test_state_machine_transitions() {
        let mut state = RegionMonitoringState::new(DEFAULT_TARGET);
        assert!(!state.is_inside());
        assert!(!state.mark_outside_if_expired(10, 1_000), "never seen");
        assert!(state.mark_inside(0));
        assert!(!state.mark_inside(5), "already inside");
        assert_eq!(state.last_seen_ms(), Some(5));
        assert!(!state.mark_outside_if_expired(10, 14));
        assert!(state.mark_outside_if_expired(10, 15), "boundary counts as expired");
        assert_eq!(state.state(), RegionState::Outside);
        assert_eq!(state.last_seen_ms(), None);
    }

    #[test]
    fn test_entry_fires_once_while_inside() {
        let (mut status, _) = status_with_store();
        status.add_region(region("lobby", 2), DEFAULT_TARGET);

        let first = status.update_newly_inside(&beacon(2), 0);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].state, RegionState::Inside);
        for t in 1..10 {
            assert!(status.update_newly_inside(&beacon(2), t * 100).is_empty());
        }
        assert!(status.update_newly_inside(&beacon(3), 2_000).is_empty());
    }

    #[test]
    fn test_exit_after_silence() {
        let (mut status, _) = status_with_store();
        status.add_region(region("lobby", 2), "kiosk");
        status.update_newly_inside(&beacon(2), 0);

        assert!(status.update_newly_outside(9_999).is_empty());
        let exits = status.update_newly_outside(10_000);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].state, RegionState::Outside);
        assert_eq!(exits[0].target, "kiosk");
        assert!(status.update_newly_outside(20_000).is_empty());
    }

    #[test]
    fn test_wildcard_region_tracks_any_beacon() {
        let (mut status, _) = status_with_store();
        status.add_region(RegionCriteria::any("all").unwrap(), DEFAULT_TARGET);
        assert_eq!(status.update_newly_inside(&beacon(9), 0).len(), 1);
    }

    #[test]
    fn test_readding_same_identifiers_keeps_state() {
        let (mut status, _) = status_with_store();
        status.add_region(region("lobby", 2), DEFAULT_TARGET);
        status.update_newly_inside(&beacon(2), 0);

        status.add_region(region("lobby", 2), DEFAULT_TARGET);
        assert!(status.state_of("lobby").unwrap().is_inside());

        status.add_region(region("lobby", 3), DEFAULT_TARGET);
        assert!(!status.state_of("lobby").unwrap().is_inside());
        assert_eq!(status.len(), 1);
    }

    #[test]
    fn test_update_local_state_emits_nothing_and_adds_unknown_regions() {
        let (mut status, _) = status_with_store();
        status.update_local_state(region("door", 5), Some(RegionState::Inside), 100);
        assert!(status.state_of("door").unwrap().is_inside());
        assert!(status.update_newly_inside(&beacon(5), 200).is_empty());
        status.update_local_state(region("door", 5), None, 250);
        assert!(status.state_of("door").unwrap().is_inside());
        status.update_local_state(region("door", 5), Some(RegionState::Outside), 300);
        assert!(!status.state_of("door").unwrap().is_inside());
    }

    #[test]
    fn test_transitions_are_persisted_when_flushed() {
        let (mut status, store) = status_with_store();
        status.add_region(region("lobby", 2), DEFAULT_TARGET);
        status.update_newly_inside(&beacon(2), 42);
        assert!(!store.load().unwrap().unwrap().regions[0].inside);

        status.take_pending_write(42, SystemTime::now()).unwrap().apply();
        assert!(status.take_pending_write(43, SystemTime::now()).is_none());
        let snapshot = store.load().unwrap().unwrap();
        assert_eq!(snapshot.regions.len(), 1);
        assert!(snapshot.regions[0].inside);
        assert_eq!(snapshot.regions[0].last_seen_ms, Some(42));
    }

    #[test]
    fn test_quiet_cycles_only_refresh_timestamp() {
        let (mut status, store) = status_with_store();
        status.add_region(region("lobby", 2), DEFAULT_TARGET);
        status.update_newly_inside(&beacon(2), 0);
        status.take_pending_write(0, SystemTime::now()).unwrap().apply();

        let refreshed = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        status.update_newly_inside(&beacon(2), 100);
        status.take_pending_write(100, refreshed).unwrap().apply();
        assert_eq!(store.last_modified().unwrap(), Some(refreshed));

        assert!(status.update_newly_outside(500).is_empty());
        assert!(status.take_pending_write(500, SystemTime::now()).is_none());

        assert_eq!(status.update_newly_outside(10_100).len(), 1);
        status.take_pending_write(10_100, SystemTime::now()).unwrap().apply();
        assert!(!store.load().unwrap().unwrap().regions[0].inside);
    }

    #[test]
    fn test_restore_keeps_inside_without_new_entry() {
        let (mut status, store) = status_with_store();
        status.add_region(region("lobby", 2), DEFAULT_TARGET);
        status.update_newly_inside(&beacon(2), 0);
        status.take_pending_write(0, SystemTime::now()).unwrap().apply();

        let mut restarted = MonitoringStatus::new(
            MonitoringConfig::default(),
            Some(store as Arc<dyn MonitoringStore>),
        );
        assert_eq!(restarted.restore(SystemTime::now(), 5), 1);
        assert!(restarted.state_of("lobby").unwrap().is_inside());
        assert_eq!(restarted.state_of("lobby").unwrap().last_seen_ms(), Some(5));
        assert!(restarted.update_newly_inside(&beacon(2), 10).is_empty());
    }

    #[test]
    fn test_stale_state_is_not_restored() {
        let (mut status, store) = status_with_store();
        status.add_region(region("lobby", 2), DEFAULT_TARGET);

        let mut restarted = MonitoringStatus::new(
            MonitoringConfig::default(),
            Some(store as Arc<dyn MonitoringStore>),
        );
        let later = SystemTime::now() + MAX_STATUS_PRESERVATION_AGE + Duration::from_secs(60);
        assert_eq!(restarted.restore(later, 0), 0);
        assert!(restarted.is_empty());
    }

    #[test]
    fn test_too_many_regions_are_not_persisted() {
        let store = Arc::new(MemoryMonitoringStore::new());
        let mut status = MonitoringStatus::new(
            MonitoringConfig {
                max_persisted_regions: 2,
                ..MonitoringConfig::default()
            },
            Some(store.clone() as Arc<dyn MonitoringStore>),
        );
        status.add_region(region("a", 1), DEFAULT_TARGET);
        status.add_region(region("b", 2), DEFAULT_TARGET);
        assert!(store.load().unwrap().is_some());
        status.add_region(region("c", 3), DEFAULT_TARGET);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_disabling_persistence_deletes_state() {
        let (mut status, store) = status_with_store();
        status.add_region(region("lobby", 2), DEFAULT_TARGET);
        assert!(store.load().unwrap().is_some());

        status.stop_status_preservation();
        assert!(store.load().unwrap().is_none());
        status.add_region(region("hall", 3), DEFAULT_TARGET);
        assert!(store.load().unwrap().is_none());

        status.start_status_preservation();
        assert_eq!(store.load().unwrap().unwrap().regions.len(), 2);
    }

    #[test]
    fn test_remove_and_clear() {
        let (mut status, store) = status_with_store();
        status.add_region(region("a", 1), DEFAULT_TARGET);
        status.add_region(region("b", 2), DEFAULT_TARGET);
        assert!(status.remove_region("a"));
        assert!(!status.remove_region("a"));
        assert_eq!(store.load().unwrap().unwrap().regions.len(), 1);
        status.clear();
        assert!(status.is_empty());
        assert!(store.load().unwrap().is_none());
    }
}
