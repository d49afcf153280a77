//! # beaconwatch-core
//!
//! Core logic for the beaconwatch Bluetooth beacon monitoring service.
//!
//! This crate provides:
//! - Declarative beacon layouts and a packet parser driven by them
//! - Merging of auxiliary frames (telemetry) into their primary beacon
//! - Per-region ranging with smoothed RSSI and distance estimates
//! - Debounced region monitoring that survives restarts
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`identifier`] - Opaque beacon identifiers and their string forms
//! - [`layout`] - The layout mini-language and well-known beacon formats
//! - [`advertisement`] - Scanning raw packets for length-prefixed records
//! - [`parser`] - Turning raw packets into [`Sighting`]s
//! - [`sighting`] - One beacon observation and its identity key
//! - [`merger`] - Folding auxiliary frames into primary sightings
//! - [`filter`] - RSSI smoothing strategies
//! - [`distance`] - Curve-fitted distance estimation per receiver model
//! - [`region`] - Region matching criteria
//! - [`ranging`] - Per-cycle ranging aggregation
//! - [`monitoring`] - Region enter/exit state machines
//! - [`storage`] - Persisting monitoring state as JSON
//! - [`events`] - Output events and sinks
//! - [`engine`] - The session object wiring every stage together
//! - [`pipeline`] - Async worker pool feeding the engine
//! - [`stats`] / [`distinct`] - Detection diagnostics
//! - [`clock`] - Injectable time sources
//! - [`config`] - Configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod advertisement;
pub mod clock;
pub mod config;
pub mod distance;
pub mod distinct;
pub mod engine;
pub mod error;
pub mod events;
pub mod filter;
pub mod identifier;
pub mod layout;
pub mod merger;
pub mod monitoring;
pub mod parser;
pub mod pipeline;
pub mod ranging;
pub mod region;
pub mod sighting;
pub mod stats;
pub mod storage;

// Re-export primary types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError};
pub use distance::{DeviceModel, DistanceCalculator, DistanceEstimator};
pub use engine::{BeaconEngine, BeaconEngineBuilder, CycleReport, MonitoredRegion, PacketCounters};
pub use error::{BeaconError, Error, Result};
pub use events::{BeaconEvent, ChannelSink, EventSink, NullSink};
pub use filter::{FilterStrategy, RssiFilter};
pub use identifier::{Identifier, IdentifierError};
pub use layout::{LayoutDescriptor, LayoutError};
pub use monitoring::{MonitoringStatus, RegionState};
pub use parser::{AdvertisementParser, RawPacket};
pub use pipeline::ScanPipeline;
pub use ranging::{RangeState, RangingConfig};
pub use region::{is_valid_mac_address, RegionCriteria, RegionError};
pub use sighting::{Sighting, SightingKey};
pub use storage::{FileMonitoringStore, MonitoringSnapshot, MonitoringStore, StorageError};
