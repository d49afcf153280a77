//! Events delivered to subscribers.
//!
//! The engine never calls back into user code while holding its own locks:
//! it collects [`BeaconEvent`]s and hands them to an [`EventSink`] once the
//! relevant state has been updated.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

pub use crate::monitoring::RegionState;
use crate::region::RegionCriteria;
use crate::sighting::Sighting;

/// Something subscribers may want to know about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BeaconEvent {
    /// End-of-cycle ranging result for one region.
    Ranging {
        /// Ranged region.
        region: RegionCriteria,
        /// Beacons reported this cycle.
        beacons: Vec<Sighting>,
    },
    /// A monitored region became occupied.
    RegionEntered {
        /// Region that changed.
        region: RegionCriteria,
        /// Subscriber for this region.
        target: String,
    },
    /// A monitored region was vacated.
    RegionExited {
        /// Region that changed.
        region: RegionCriteria,
        /// Subscriber for this region.
        target: String,
    },
    /// Follows every entry or exit with the resulting state.
    RegionStateChanged {
        /// Region that changed.
        region: RegionCriteria,
        /// New state.
        state: RegionState,
        /// Subscriber for this region.
        target: String,
    },
    /// A packet that no layout recognised.
    NonBeaconPacket {
        /// Transmitter address.
        address: String,
        /// Signal strength.
        rssi: i32,
        /// Raw advertisement bytes.
        data: Vec<u8>,
    },
}

impl BeaconEvent {
    /// Short name of the variant, as used in the serialized `type` tag.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ranging { .. } => "ranging",
            Self::RegionEntered { .. } => "region_entered",
            Self::RegionExited { .. } => "region_exited",
            Self::RegionStateChanged { .. } => "region_state_changed",
            Self::NonBeaconPacket { .. } => "non_beacon_packet",
        }
    }
}

/// Receives events from the engine.
pub trait EventSink: Send + Sync {
    /// Handles one event. Called from worker threads; must not block for long.
    fn deliver(&self, event: BeaconEvent);
}

impl<F> EventSink for F
where
    F: Fn(BeaconEvent) + Send + Sync,
{
    fn deliver(&self, event: BeaconEvent) {
        self(event);
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn deliver(&self, _event: BeaconEvent) {}
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<BeaconEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiving half.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BeaconEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: BeaconEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped; discarding event");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<BeaconEvent>>,
}

impl CollectingSink {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything collected so far.
    pub fn take(&self) -> Vec<BeaconEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl EventSink for CollectingSink {
    fn deliver(&self, event: BeaconEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
