//! Application state shared across handlers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use beaconwatch_core::{
    BeaconEngine, BeaconEvent, Config, EventSink, FileMonitoringStore, ScanPipeline, Sighting,
};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;

/// Events kept for `GET /api/events`.
pub const EVENT_HISTORY: usize = 256;

/// An event as received, with arrival metadata.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    /// Monotonic sequence number starting at 1.
    pub sequence: u64,
    /// Arrival time.
    pub received_at_utc: DateTime<Utc>,
    /// The event itself.
    pub event: BeaconEvent,
}

/// Latest ranging result for one region.
#[derive(Debug, Clone)]
pub struct RangingSnapshot {
    /// Beacons reported in the most recent cycle.
    pub beacons: Vec<Sighting>,
    /// When that cycle ended.
    pub updated_at_utc: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct EventLogInner {
    next_sequence: u64,
    recent: VecDeque<RecordedEvent>,
    ranging: BTreeMap<String, RangingSnapshot>,
}

/// Event sink that remembers recent events and the latest ranging results.
#[derive(Debug, Default)]
pub struct EventLog {
    inner: Mutex<EventLogInner>,
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent events, oldest first, at most `limit`.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<RecordedEvent> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = inner.recent.len().saturating_sub(limit);
        inner.recent.iter().skip(skip).cloned().collect()
    }

    /// Latest ranging result for a region.
    #[must_use]
    pub fn ranging(&self, unique_id: &str) -> Option<RangingSnapshot> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ranging
            .get(unique_id)
            .cloned()
    }

    /// Forgets the ranging result of a region that is no longer ranged.
    pub fn forget_ranging(&self, unique_id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ranging
            .remove(unique_id);
    }
}

impl EventSink for EventLog {
    fn deliver(&self, event: BeaconEvent) {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let BeaconEvent::Ranging { region, beacons } = &event {
            inner.ranging.insert(
                region.unique_id().to_string(),
                RangingSnapshot {
                    beacons: beacons.clone(),
                    updated_at_utc: now,
                },
            );
        }
        inner.next_sequence += 1;
        let sequence = inner.next_sequence;
        inner.recent.push_back(RecordedEvent {
            sequence,
            received_at_utc: now,
            event,
        });
        while inner.recent.len() > EVENT_HISTORY {
            inner.recent.pop_front();
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

/// Handlers take the state under this name.
pub type SharedState = AppState;

struct AppStateInner {
    config: RwLock<Config>,
    pipeline: ScanPipeline,
    events: Arc<EventLog>,
}

impl AppState {
    /// Builds the engine and worker pool described by `config`.
    ///
    /// The state file is always attached so persistence can be switched on
    /// at runtime; nothing is written while it is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if a layout is invalid or no state directory is known.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let events = Arc::new(EventLog::new());
        let path = config.state_path()?;
        info!(
            path = %path.display(),
            enabled = config.monitoring.persistence_enabled,
            "Monitoring state file"
        );
        let engine = BeaconEngine::builder(config.clone())
            .sink(events.clone())
            .store(Arc::new(FileMonitoringStore::new(path)))
            .build()
            .context("Failed to build beacon engine")?;
        let pipeline = ScanPipeline::new(Arc::new(engine), config.server.worker_threads);

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config: RwLock::new(config),
                pipeline,
                events,
            }),
        })
    }

    /// Get read access to config.
    pub async fn config(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.inner.config.read().await
    }

    /// The packet worker pool.
    #[must_use]
    pub fn pipeline(&self) -> &ScanPipeline {
        &self.inner.pipeline
    }

    /// The engine behind the pool.
    #[must_use]
    pub fn engine(&self) -> &BeaconEngine {
        self.inner.pipeline.engine()
    }

    /// Recent events and ranging results.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beaconwatch_core::RegionCriteria;

    fn entered(id: &str) -> BeaconEvent {
        BeaconEvent::RegionEntered {
            region: RegionCriteria::any(id).unwrap(),
            target: "default".into(),
        }
    }

    #[test]
    fn test_event_log_is_bounded_and_sequenced() {
        let log = EventLog::new();
        for _ in 0..(EVENT_HISTORY + 10) {
            log.deliver(entered("lobby"));
        }
        let recent = log.recent(usize::MAX);
        assert_eq!(recent.len(), EVENT_HISTORY);
        assert_eq!(recent[0].sequence, 11);
        assert_eq!(log.recent(2).len(), 2);
        assert_eq!(log.recent(2)[1].sequence, (EVENT_HISTORY + 10) as u64);
    }

    #[test]
    fn test_event_log_keeps_latest_ranging() {
        let log = EventLog::new();
        log.deliver(BeaconEvent::Ranging {
            region: RegionCriteria::any("all").unwrap(),
            beacons: Vec::new(),
        });
        assert!(log.ranging("all").is_some());
        log.forget_ranging("all");
        assert!(log.ranging("all").is_none());
    }

    #[tokio::test]
    async fn test_state_without_persistence() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.monitoring.persistence_enabled = false;
        config.monitoring.state_path = Some(dir.path().join("state.json"));
        config.server.worker_threads = 2;
        let state = AppState::new(config).unwrap();
        assert_eq!(state.pipeline().workers(), 2);
        assert!(!state.engine().is_persistence_enabled());
        assert_eq!(state.config().await.server.worker_threads, 2);

        state
            .engine()
            .start_monitoring(RegionCriteria::any("lobby").unwrap(), "default")
            .unwrap();
        assert!(!dir.path().join("state.json").exists());
        state.engine().set_persistence_enabled(true);
        assert!(dir.path().join("state.json").exists());
    }
}
