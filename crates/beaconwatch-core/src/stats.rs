//! Detection statistics.
//!
//! Counts beacon detections in fixed sampling intervals so operators can see
//! how often beacons are heard and how long the longest silence was.

use serde::Serialize;
use utoipa::ToSchema;

/// Default length of one sampling interval.
pub const DEFAULT_SAMPLE_INTERVAL_MS: i64 = 60_000;
/// Oldest samples are discarded past this count.
pub const MAX_SAMPLES: usize = 100;

/// Detections within one sampling interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct DetectionSample {
    /// Interval start.
    pub sample_start_ms: i64,
    /// Interval end, absent for the running interval.
    pub sample_stop_ms: Option<i64>,
    /// Detections in the interval.
    pub detection_count: u64,
    /// Longest gap between consecutive detections.
    pub max_millis_between_detections: i64,
    /// First detection in the interval.
    pub first_detection_ms: Option<i64>,
    /// Latest detection in the interval.
    pub last_detection_ms: Option<i64>,
}

impl DetectionSample {
    const fn starting_at(now_ms: i64) -> Self {
        Self {
            sample_start_ms: now_ms,
            sample_stop_ms: None,
            detection_count: 0,
            max_millis_between_detections: 0,
            first_detection_ms: None,
            last_detection_ms: None,
        }
    }
}

/// Rolling detection statistics.
#[derive(Debug, Clone)]
pub struct DetectionStats {
    enabled: bool,
    sample_interval_ms: i64,
    samples: Vec<DetectionSample>,
    last_detection_ms: Option<i64>,
}

impl Default for DetectionStats {
    fn default() -> Self {
        Self::new(true, DEFAULT_SAMPLE_INTERVAL_MS)
    }
}

impl DetectionStats {
    /// Creates statistics with the given interval. A non-positive interval
    /// keeps a single sample forever.
    #[must_use]
    pub const fn new(enabled: bool, sample_interval_ms: i64) -> Self {
        Self {
            enabled,
            sample_interval_ms,
            samples: Vec::new(),
            last_detection_ms: None,
        }
    }

    /// Records one detection.
    pub fn log(&mut self, now_ms: i64) {
        self.last_detection_ms = Some(now_ms);
        if !self.enabled {
            return;
        }

        let roll = match self.samples.last() {
            None => true,
            Some(current) => {
                self.sample_interval_ms > 0
                    && now_ms - current.sample_start_ms > self.sample_interval_ms
            }
        };
        if roll {
            self.new_sample_interval(now_ms);
        }

        if let Some(sample) = self.samples.last_mut() {
            sample.detection_count += 1;
            sample.first_detection_ms.get_or_insert(now_ms);
            if let Some(last) = sample.last_detection_ms {
                sample.max_millis_between_detections =
                    sample.max_millis_between_detections.max(now_ms - last);
            }
            sample.last_detection_ms = Some(now_ms);
        }
    }

    /// Closes the running sample and starts a new one.
    pub fn new_sample_interval(&mut self, now_ms: i64) {
        if let Some(current) = self.samples.last_mut() {
            current.sample_stop_ms = Some(now_ms);
        }
        self.samples.push(DetectionSample::starting_at(now_ms));
        if self.samples.len() > MAX_SAMPLES {
            let excess = self.samples.len() - MAX_SAMPLES;
            self.samples.drain(..excess);
        }
    }

    /// Samples, oldest first.
    #[must_use]
    pub fn samples(&self) -> &[DetectionSample] {
        &self.samples
    }

    /// Time of the most recent detection, tracked even when sampling is off.
    #[must_use]
    pub const fn last_detection_ms(&self) -> Option<i64> {
        self.last_detection_ms
    }

    /// Turns sampling on or off.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Drops all samples.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_detections_and_gaps() {
        let mut stats = DetectionStats::new(true, 1_000);
        stats.log(0);
        stats.log(100);
        stats.log(400);
        let sample = &stats.samples()[0];
        assert_eq!(sample.detection_count, 3);
        assert_eq!(sample.max_millis_between_detections, 300);
        assert_eq!(sample.first_detection_ms, Some(0));
        assert_eq!(sample.last_detection_ms, Some(400));
    }

    #[test]
    fn test_rolls_over_after_interval() {
        let mut stats = DetectionStats::new(true, 1_000);
        stats.log(0);
        stats.log(1_001);
        assert_eq!(stats.samples().len(), 2);
        assert_eq!(stats.samples()[0].sample_stop_ms, Some(1_001));
        assert_eq!(stats.samples()[1].detection_count, 1);
    }

    #[test]
    fn test_disabled_stats_only_track_last_detection() {
        let mut stats = DetectionStats::new(false, 1_000);
        stats.log(50);
        assert!(stats.samples().is_empty());
        assert_eq!(stats.last_detection_ms(), Some(50));
    }

    #[test]
    fn test_sample_history_is_bounded() {
        let mut stats = DetectionStats::new(true, 1);
        for t in 0..(MAX_SAMPLES as i64 + 20) {
            stats.log(t * 10);
        }
        assert_eq!(stats.samples().len(), MAX_SAMPLES);
        stats.clear();
        assert!(stats.samples().is_empty());
    }
}
