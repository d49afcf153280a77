//! Beacon sightings.
//!
//! A [`Sighting`] is one beacon as seen by the parser, later enriched by the
//! merger (auxiliary data) and the ranging aggregator (averaged RSSI, counts,
//! distance). Two sightings are the same beacon when their identifiers match;
//! [`SightingKey`] optionally folds in the hardware address as well.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::identifier::Identifier;

/// Map key describing beacon identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SightingKey {
    identifiers: Vec<Identifier>,
    address: Option<String>,
}

impl SightingKey {
    /// Identifiers that make up this key.
    #[must_use]
    pub fn identifiers(&self) -> &[Identifier] {
        &self.identifiers
    }
}

/// One parsed beacon plus everything later stages attach to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sighting {
    identifiers: Vec<Identifier>,
    data_fields: Vec<u64>,
    extra_data_fields: Vec<u64>,
    rssi: i32,
    tx_power: i32,
    hardware_address: String,
    name: Option<String>,
    layout_id: String,
    type_code: u64,
    manufacturer: u16,
    service_uuid: Option<u16>,
    multi_frame: bool,
    running_average_rssi: Option<f64>,
    measurement_count: u32,
    packet_count: u32,
    first_cycle_detection_ms: i64,
    last_cycle_detection_ms: i64,
    distance: Option<f64>,
}

impl Sighting {
    /// Starts building a sighting by hand, for simulated beacons and tests.
    #[must_use]
    pub fn builder() -> SightingBuilder {
        SightingBuilder::default()
    }

    /// Identity key, including the address when `hardware_equality` is set.
    #[must_use]
    pub fn key(&self, hardware_equality: bool) -> SightingKey {
        SightingKey {
            identifiers: self.identifiers.clone(),
            address: hardware_equality.then(|| self.hardware_address.to_ascii_uppercase()),
        }
    }

    /// Ordered identifiers.
    #[must_use]
    pub fn identifiers(&self) -> &[Identifier] {
        &self.identifiers
    }

    /// Identifier at `index`, if present.
    #[must_use]
    pub fn identifier(&self, index: usize) -> Option<&Identifier> {
        self.identifiers.get(index)
    }

    /// Numeric data fields in layout order.
    #[must_use]
    pub fn data_fields(&self) -> &[u64] {
        &self.data_fields
    }

    /// Data fields merged in from an auxiliary frame.
    #[must_use]
    pub fn extra_data_fields(&self) -> &[u64] {
        &self.extra_data_fields
    }

    /// Signal strength of the packet that produced this sighting.
    #[must_use]
    pub const fn rssi(&self) -> i32 {
        self.rssi
    }

    /// Calibrated power at one metre.
    #[must_use]
    pub const fn tx_power(&self) -> i32 {
        self.tx_power
    }

    /// Transmitter MAC address.
    #[must_use]
    pub fn hardware_address(&self) -> &str {
        &self.hardware_address
    }

    /// Advertised local name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Id of the layout that matched.
    #[must_use]
    pub fn layout_id(&self) -> &str {
        &self.layout_id
    }

    /// Type code matched by the layout.
    #[must_use]
    pub const fn beacon_type_code(&self) -> u64 {
        self.type_code
    }

    /// Manufacturer code for manufacturer data beacons, zero otherwise.
    #[must_use]
    pub const fn manufacturer(&self) -> u16 {
        self.manufacturer
    }

    /// 16-bit service UUID for service data beacons.
    #[must_use]
    pub const fn service_uuid(&self) -> Option<u16> {
        self.service_uuid
    }

    /// Whether this beacon's layout spans several frames.
    #[must_use]
    pub const fn is_multi_frame(&self) -> bool {
        self.multi_frame
    }

    /// An auxiliary frame carries data but no identifiers.
    #[must_use]
    pub fn is_extra_beacon_data(&self) -> bool {
        self.identifiers.is_empty() && !self.data_fields.is_empty()
    }

    /// Filtered RSSI produced by the last completed cycle.
    #[must_use]
    pub const fn running_average_rssi(&self) -> Option<f64> {
        self.running_average_rssi
    }

    /// Samples the filter used for the last cycle.
    #[must_use]
    pub const fn measurement_count(&self) -> u32 {
        self.measurement_count
    }

    /// Packets received during the last cycle.
    #[must_use]
    pub const fn packet_count(&self) -> u32 {
        self.packet_count
    }

    /// First detection time within the last cycle.
    #[must_use]
    pub const fn first_cycle_detection_ms(&self) -> i64 {
        self.first_cycle_detection_ms
    }

    /// Last detection time within the last cycle.
    #[must_use]
    pub const fn last_cycle_detection_ms(&self) -> i64 {
        self.last_cycle_detection_ms
    }

    /// Estimated distance in metres, if a calibration was available.
    #[must_use]
    pub const fn distance(&self) -> Option<f64> {
        self.distance
    }

    pub(crate) fn set_rssi(&mut self, rssi: i32) {
        self.rssi = rssi;
    }

    pub(crate) fn set_extra_data_fields(&mut self, fields: Vec<u64>) {
        self.extra_data_fields = fields;
    }

    pub(crate) fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub(crate) fn set_distance(&mut self, distance: Option<f64>) {
        self.distance = distance;
    }

    pub(crate) fn commit_cycle(
        &mut self,
        filtered: Option<(f64, u32)>,
        packet_count: u32,
        first_cycle_detection_ms: i64,
        last_cycle_detection_ms: i64,
    ) {
        if let Some((rssi, count)) = filtered {
            self.running_average_rssi = Some(rssi);
            self.measurement_count = count;
        }
        self.packet_count = packet_count;
        self.first_cycle_detection_ms = first_cycle_detection_ms;
        self.last_cycle_detection_ms = last_cycle_detection_ms;
    }
}

impl PartialEq for Sighting {
    fn eq(&self, other: &Self) -> bool {
        self.identifiers == other.identifiers
    }
}

impl Eq for Sighting {}

impl Hash for Sighting {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifiers.hash(state);
    }
}

/// Builder for hand-made sightings.
#[derive(Debug, Clone, Default)]
pub struct SightingBuilder {
    identifiers: Vec<Identifier>,
    data_fields: Vec<u64>,
    rssi: i32,
    tx_power: i32,
    hardware_address: String,
    name: Option<String>,
    layout_id: String,
    type_code: u64,
    manufacturer: u16,
    service_uuid: Option<u16>,
    multi_frame: bool,
    timestamp_ms: i64,
}

impl SightingBuilder {
    /// Appends an identifier.
    #[must_use]
    pub fn identifier(mut self, id: Identifier) -> Self {
        self.identifiers.push(id);
        self
    }

    /// Replaces all identifiers.
    #[must_use]
    pub fn identifiers(mut self, ids: Vec<Identifier>) -> Self {
        self.identifiers = ids;
        self
    }

    /// Replaces the data fields.
    #[must_use]
    pub fn data_fields(mut self, fields: Vec<u64>) -> Self {
        self.data_fields = fields;
        self
    }

    /// Sets the packet RSSI.
    #[must_use]
    pub const fn rssi(mut self, rssi: i32) -> Self {
        self.rssi = rssi;
        self
    }

    /// Sets the calibrated power.
    #[must_use]
    pub const fn tx_power(mut self, tx_power: i32) -> Self {
        self.tx_power = tx_power;
        self
    }

    /// Sets the transmitter address.
    #[must_use]
    pub fn hardware_address(mut self, address: impl Into<String>) -> Self {
        self.hardware_address = address.into();
        self
    }

    /// Sets the advertised name.
    #[must_use]
    pub fn name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    /// Sets the originating layout id.
    #[must_use]
    pub fn layout_id(mut self, layout_id: impl Into<String>) -> Self {
        self.layout_id = layout_id.into();
        self
    }

    /// Sets the matched type code.
    #[must_use]
    pub const fn type_code(mut self, type_code: u64) -> Self {
        self.type_code = type_code;
        self
    }

    /// Sets the manufacturer code.
    #[must_use]
    pub const fn manufacturer(mut self, manufacturer: u16) -> Self {
        self.manufacturer = manufacturer;
        self
    }

    /// Sets the service UUID.
    #[must_use]
    pub const fn service_uuid(mut self, service_uuid: Option<u16>) -> Self {
        self.service_uuid = service_uuid;
        self
    }

    /// Marks the beacon as assembled from several frames.
    #[must_use]
    pub const fn multi_frame(mut self, multi_frame: bool) -> Self {
        self.multi_frame = multi_frame;
        self
    }

    /// Sets the detection time used for both cycle timestamps.
    #[must_use]
    pub const fn timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Finishes the sighting.
    #[must_use]
    pub fn build(self) -> Sighting {
        Sighting {
            identifiers: self.identifiers,
            data_fields: self.data_fields,
            extra_data_fields: Vec::new(),
            rssi: self.rssi,
            tx_power: self.tx_power,
            hardware_address: self.hardware_address,
            name: self.name,
            layout_id: self.layout_id,
            type_code: self.type_code,
            manufacturer: self.manufacturer,
            service_uuid: self.service_uuid,
            multi_frame: self.multi_frame,
            running_average_rssi: None,
            measurement_count: 0,
            packet_count: 1,
            first_cycle_detection_ms: self.timestamp_ms,
            last_cycle_detection_ms: self.timestamp_ms,
            distance: None,
        }
    }
}
