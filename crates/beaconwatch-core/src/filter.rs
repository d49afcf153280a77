//! RSSI smoothing filters.
//!
//! Every ranged beacon owns one filter instance. The strategy is chosen by
//! configuration through [`FilterStrategy`] and never changes while a beacon
//! is being tracked.

use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Default ARMA smoothing factor.
pub const DEFAULT_ARMA_SPEED: f64 = 0.1;
/// Default lifetime of a running-average sample.
pub const DEFAULT_SAMPLE_EXPIRATION_MS: i64 = 20_000;

/// A per-beacon RSSI filter.
///
/// Time is passed in explicitly so the filters stay deterministic under test.
pub trait RssiFilter: Send + fmt::Debug {
    /// Records one RSSI reading.
    fn add_sample(&mut self, rssi: i32, now_ms: i64);

    /// Whether the filter holds enough live data to produce a value.
    fn has_samples(&mut self, now_ms: i64) -> bool;

    /// Filtered RSSI. Only meaningful when [`has_samples`](Self::has_samples) is true.
    fn current_value(&mut self, now_ms: i64) -> f64;

    /// Number of samples contributing to the current value.
    fn sample_count(&self) -> u32;
}

/// Filter selection, as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterStrategy {
    /// Exponential smoothing.
    Arma {
        /// Fraction of the error corrected per sample, in `(0, 1]`.
        speed: f64,
    },
    /// Trimmed mean over a sliding time window.
    RunningAverage {
        /// Samples older than this are discarded.
        expiration_ms: i64,
    },
}

impl Default for FilterStrategy {
    fn default() -> Self {
        Self::RunningAverage {
            expiration_ms: DEFAULT_SAMPLE_EXPIRATION_MS,
        }
    }
}

impl FilterStrategy {
    /// Creates a fresh filter for a newly tracked beacon.
    #[must_use]
    pub fn build(&self) -> Box<dyn RssiFilter> {
        match *self {
            Self::Arma { speed } => Box::new(ArmaFilter::new(speed)),
            Self::RunningAverage { expiration_ms } => {
                Box::new(RunningAverageFilter::new(expiration_ms))
            }
        }
    }
}

/// Auto-regressive moving average: `value -= speed * (value - rssi)`.
#[derive(Debug, Clone)]
pub struct ArmaFilter {
    speed: f64,
    value: Option<f64>,
}

impl ArmaFilter {
    /// Creates a filter with the given smoothing factor.
    #[must_use]
    pub const fn new(speed: f64) -> Self {
        Self { speed, value: None }
    }
}

impl RssiFilter for ArmaFilter {
    fn add_sample(&mut self, rssi: i32, _now_ms: i64) {
        let rssi = f64::from(rssi);
        self.value = Some(match self.value {
            None => rssi,
            Some(value) => value - self.speed * (value - rssi),
        });
    }

    fn has_samples(&mut self, _now_ms: i64) -> bool {
        self.value.is_some()
    }

    fn current_value(&mut self, _now_ms: i64) -> f64 {
        self.value.unwrap_or_default()
    }

    fn sample_count(&self) -> u32 {
        0
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    rssi: i32,
    timestamp_ms: i64,
}

/// Trimmed mean of the samples seen within the expiration window.
///
/// With more than two samples the lowest and highest ~10% are dropped
/// before averaging.
#[derive(Debug, Clone)]
pub struct RunningAverageFilter {
    expiration_ms: i64,
    samples: Vec<Sample>,
}

impl RunningAverageFilter {
    /// Creates a filter that forgets samples after `expiration_ms`.
    #[must_use]
    pub const fn new(expiration_ms: i64) -> Self {
        Self {
            expiration_ms,
            samples: Vec::new(),
        }
    }

    // Expired samples are dropped lazily, on read.
    fn prune(&mut self, now_ms: i64) {
        let expiration_ms = self.expiration_ms;
        self.samples
            .retain(|s| now_ms - s.timestamp_ms < expiration_ms);
    }
}

impl RssiFilter for RunningAverageFilter {
    fn add_sample(&mut self, rssi: i32, now_ms: i64) {
        self.samples.push(Sample {
            rssi,
            timestamp_ms: now_ms,
        });
    }

    fn has_samples(&mut self, now_ms: i64) -> bool {
        self.prune(now_ms);
        !self.samples.is_empty()
    }

    #[allow(clippy::cast_precision_loss)]
    fn current_value(&mut self, now_ms: i64) -> f64 {
        self.prune(now_ms);
        let mut sorted: Vec<i32> = self.samples.iter().map(|s| s.rssi).collect();
        sorted.sort_unstable();

        let size = sorted.len();
        if size == 0 {
            return 0.0;
        }
        // Trim the bottom 10% plus one and the top 10% plus one.
        let (start, end) = if size > 2 {
            (size / 10 + 1, size - size / 10 - 2)
        } else {
            (0, size - 1)
        };

        let window = &sorted[start..=end];
        let sum: f64 = window.iter().map(|r| f64::from(*r)).sum();
        sum / window.len() as f64
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sample_count(&self) -> u32 {
        self.samples.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arma_first_sample_initializes() {
        let mut filter = ArmaFilter::new(DEFAULT_ARMA_SPEED);
        assert!(!filter.has_samples(0));
        filter.add_sample(-70, 0);
        assert!(filter.has_samples(0));
        assert!((filter.current_value(0) + 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_arma_moves_toward_new_samples() {
        let mut filter = ArmaFilter::new(0.1);
        filter.add_sample(-70, 0);
        filter.add_sample(-60, 1);
        assert!((filter.current_value(1) + 69.0).abs() < 1e-9);
        filter.add_sample(-60, 2);
        assert!((filter.current_value(2) + 68.1).abs() < 1e-9);
        assert_eq!(filter.sample_count(), 0);
    }

    #[test]
    fn test_running_average_trims_outliers() {
        let mut filter = RunningAverageFilter::new(DEFAULT_SAMPLE_EXPIRATION_MS);
        for rssi in -90..=-50 {
            filter.add_sample(rssi, 0);
        }
        assert!((filter.current_value(0) + 70.0).abs() < f64::EPSILON);
        assert_eq!(filter.sample_count(), 41);
    }

    #[test]
    fn test_running_average_five_samples_drops_extremes() {
        let mut filter = RunningAverageFilter::new(DEFAULT_SAMPLE_EXPIRATION_MS);
        for rssi in [-50, -90, -70, -60, -80] {
            filter.add_sample(rssi, 0);
        }
        assert!((filter.current_value(0) + 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_running_average_small_sets_use_every_sample() {
        let mut filter = RunningAverageFilter::new(DEFAULT_SAMPLE_EXPIRATION_MS);
        filter.add_sample(-60, 0);
        assert!((filter.current_value(0) + 60.0).abs() < f64::EPSILON);
        filter.add_sample(-70, 0);
        assert!((filter.current_value(0) + 65.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_running_average_three_samples_drops_extremes() {
        let mut filter = RunningAverageFilter::new(DEFAULT_SAMPLE_EXPIRATION_MS);
        for rssi in [-40, -70, -100] {
            filter.add_sample(rssi, 0);
        }
        assert!((filter.current_value(0) + 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_running_average_expires_old_samples() {
        let mut filter = RunningAverageFilter::new(1_000);
        filter.add_sample(-90, 0);
        filter.add_sample(-60, 500);
        assert!(filter.has_samples(999));
        assert!((filter.current_value(1_000) + 60.0).abs() < f64::EPSILON);
        assert_eq!(filter.sample_count(), 1);
        assert!(!filter.has_samples(1_500));
    }

    #[test]
    fn test_strategy_serde_is_tagged() {
        let strategy: FilterStrategy =
            serde_json::from_str(r#"{"kind":"arma","speed":0.2}"#).unwrap();
        assert_eq!(strategy, FilterStrategy::Arma { speed: 0.2 });
        assert!(matches!(
            FilterStrategy::default(),
            FilterStrategy::RunningAverage {
                expiration_ms: DEFAULT_SAMPLE_EXPIRATION_MS
            }
        ));
    }

    #[test]
    fn test_strategy_builds_matching_filter() {
        let mut filter = FilterStrategy::Arma { speed: 0.5 }.build();
        filter.add_sample(-80, 0);
        filter.add_sample(-60, 0);
        assert!((filter.current_value(0) + 70.0).abs() < 1e-9);
    }
}
