//! Duplicate packet detection within one scan cycle.
//!
//! Some radios report every advertisement, others report each unique packet
//! once per scan. Counting distinct packets per cycle tells the two apart.

use std::collections::HashSet;

use tracing::warn;

/// Tracked packets per cycle before the detector gives up.
pub const MAX_PACKETS_TO_TRACK: usize = 1_000;

/// Remembers which (address, payload) pairs were seen this cycle.
#[derive(Debug, Default)]
pub struct DistinctPacketDetector {
    seen: HashSet<(String, Vec<u8>)>,
    limit_warned: bool,
}

impl DistinctPacketDetector {
    /// Creates an empty detector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time a packet is seen this cycle.
    ///
    /// Once [`MAX_PACKETS_TO_TRACK`] packets are held every packet counts as distinct.
    pub fn is_packet_distinct(&mut self, address: &str, data: &[u8]) -> bool {
        // Past the cap every packet counts as new.
        if self.seen.len() >= MAX_PACKETS_TO_TRACK {
            if !self.limit_warned {
                warn!(limit = MAX_PACKETS_TO_TRACK, "Distinct packet detector limit reached");
                self.limit_warned = true;
            }
            return true;
        }
        self.seen
            .insert((address.to_ascii_uppercase(), data.to_vec()))
    }

    /// Packets held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Starts a new cycle.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.limit_warned = false;
    }
}
