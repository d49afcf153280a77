//! Region criteria.
//!
//! A region names a set of beacons by identifier prefix. Each identifier
//! slot is either a concrete value or a wildcard (`None`); an optional MAC
//! address further pins the region to one transmitter. Regions are keyed by
//! their unique id, so two criteria with the same id are the same region.

use std::fmt;
use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifier::Identifier;
use crate::sighting::Sighting;

static MAC_ADDRESS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("valid regex"));

/// Errors building region criteria.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegionError {
    /// The unique id was empty.
    #[error("Region unique id cannot be empty")]
    EmptyId,

    /// The address is not a colon separated MAC address.
    #[error("Invalid Bluetooth address '{0}'. Expected format XX:XX:XX:XX:XX:XX")]
    InvalidAddress(String),
}

/// Returns `true` when `address` is six colon separated hex octets.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_PATTERN.is_match(address)
}

/// A named beacon filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionCriteria {
    unique_id: String,
    #[serde(default)]
    identifiers: Vec<Option<Identifier>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bluetooth_address: Option<String>,
}

impl RegionCriteria {
    /// Creates a region from identifier slots.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::EmptyId`] for a blank id.
    pub fn new(
        unique_id: impl Into<String>,
        identifiers: Vec<Option<Identifier>>,
    ) -> Result<Self, RegionError> {
        let unique_id = unique_id.into();
        if unique_id.trim().is_empty() {
            return Err(RegionError::EmptyId);
        }
        Ok(Self {
            unique_id,
            identifiers,
            bluetooth_address: None,
        })
    }

    /// A region that matches every beacon.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::EmptyId`] for a blank id.
    pub fn any(unique_id: impl Into<String>) -> Result<Self, RegionError> {
        Self::new(unique_id, Vec::new())
    }

    /// Pins the region to one transmitter.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::InvalidAddress`] if `address` is not a MAC address.
    pub fn with_address(mut self, address: impl Into<String>) -> Result<Self, RegionError> {
        let address = address.into();
        if !is_valid_mac_address(&address) {
            return Err(RegionError::InvalidAddress(address));
        }
        self.bluetooth_address = Some(address);
        Ok(self)
    }

    /// Checks invariants after deserialization.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), RegionError> {
        if self.unique_id.trim().is_empty() {
            return Err(RegionError::EmptyId);
        }
        if let Some(address) = &self.bluetooth_address {
            if !is_valid_mac_address(address) {
                return Err(RegionError::InvalidAddress(address.clone()));
            }
        }
        Ok(())
    }

    /// Region key.
    #[must_use]
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Identifier slots; `None` matches anything.
    #[must_use]
    pub fn identifiers(&self) -> &[Option<Identifier>] {
        &self.identifiers
    }

    /// Identifier slot at `index`, `None` when absent or a wildcard.
    #[must_use]
    pub fn identifier(&self, index: usize) -> Option<&Identifier> {
        self.identifiers.get(index).and_then(Option::as_ref)
    }

    /// Required transmitter address.
    #[must_use]
    pub fn bluetooth_address(&self) -> Option<&str> {
        self.bluetooth_address.as_deref()
    }

    /// Whether `sighting` falls inside this region.
    ///
    /// Every concrete slot must be present on the sighting with an equal
    /// value. A beacon with more identifiers than the region still matches.
    #[must_use]
    pub fn matches(&self, sighting: &Sighting) -> bool {
        let identifiers_match = self.identifiers.iter().enumerate().all(|(i, slot)| match slot {
            None => true,
            Some(expected) => sighting.identifier(i) == Some(expected),
        });
        if !identifiers_match {
            return false;
        }
        self.bluetooth_address
            .as_deref()
            .map_or(true, |addr| addr.eq_ignore_ascii_case(sighting.hardware_address()))
    }

    /// Same identifier slots and address, ignoring the unique id.
    #[must_use]
    pub fn has_same_identifiers(&self, other: &Self) -> bool {
        self.identifiers == other.identifiers
            && match (&self.bluetooth_address, &other.bluetooth_address) {
                (None, None) => true,
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                _ => false,
            }
    }
}

impl PartialEq for RegionCriteria {
    fn eq(&self, other: &Self) -> bool {
        self.unique_id == other.unique_id
    }
}

impl Eq for RegionCriteria {}

impl Hash for RegionCriteria {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique_id.hash(state);
    }
}

impl fmt::Display for RegionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.unique_id)?;
        for (i, slot) in self.identifiers.iter().enumerate() {
            match slot {
                Some(id) => write!(f, " id{}: {id}", i + 1)?,
                None => write!(f, " id{}: *", i + 1)?,
            }
        }
        if let Some(address) = &self.bluetooth_address {
            write!(f, " mac: {address}")?;
        }
        Ok(())
    }
}
