//! Distance estimation from filtered RSSI.
//!
//! Receivers differ in how they report signal strength, so the curve that
//! maps an RSSI to metres is fitted per device model. A calibration table
//! lists the known models; [`ModelSpecificDistanceCalculator`] picks the
//! entry that best matches the configured receiver and falls back to the
//! table's default entry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use utoipa::ToSchema;

/// Calibration table compiled into the library.
pub const BUILTIN_MODEL_TABLE: &str = include_str!("model_distance_calculations.json");

/// Errors loading a calibration table.
#[derive(Debug, Error)]
pub enum DistanceError {
    /// The table file could not be read.
    #[error("Failed to read distance table {}: {source}", path.display())]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The table was not valid JSON in the expected shape.
    #[error("Failed to parse distance table: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Receiver identity used to select a calibration curve.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeviceModel {
    /// OS version string.
    #[serde(default)]
    pub version: String,
    /// Build number string.
    #[serde(default)]
    pub build_number: String,
    /// Model name.
    #[serde(default)]
    pub model: String,
    /// Manufacturer name, compared case-insensitively.
    #[serde(default)]
    pub manufacturer: String,
}

impl DeviceModel {
    /// How closely `other` matches this model, from 0 to 4.
    ///
    /// Each level requires all previous ones: manufacturer, then model,
    /// then build number, then version.
    #[must_use]
    pub fn match_score(&self, other: &Self) -> u8 {
        if !self.manufacturer.eq_ignore_ascii_case(&other.manufacturer) {
            return 0;
        }
        if self.model != other.model {
            return 1;
        }
        if self.build_number != other.build_number {
            return 2;
        }
        if self.version != other.version {
            return 3;
        }
        4
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{}",
            self.manufacturer, self.model, self.build_number, self.version
        )
    }
}

/// Converts a calibrated power and a measured RSSI into metres.
pub trait DistanceCalculator: Send + Sync + fmt::Debug {
    /// Estimated distance in metres, or a negative value when no estimate is possible.
    fn calculate_distance(&self, tx_power: i32, rssi: f64) -> f64;
}

/// `c1 * (rssi / tx)^c2 + c3`, with `(rssi / tx)^10` close to the beacon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurveFittedDistanceCalculator {
    coefficient1: f64,
    coefficient2: f64,
    coefficient3: f64,
}

impl CurveFittedDistanceCalculator {
    /// Creates a calculator from fitted coefficients.
    #[must_use]
    pub const fn new(coefficient1: f64, coefficient2: f64, coefficient3: f64) -> Self {
        Self {
            coefficient1,
            coefficient2,
            coefficient3,
        }
    }
}

impl DistanceCalculator for CurveFittedDistanceCalculator {
    fn calculate_distance(&self, tx_power: i32, rssi: f64) -> f64 {
        if rssi.abs() < f64::EPSILON || tx_power == 0 {
            return -1.0;
        }
        let ratio = rssi / f64::from(tx_power);
        if ratio < 1.0 {
            ratio.powi(10)
        } else {
            self.coefficient1 * ratio.powf(self.coefficient2) + self.coefficient3
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelTable {
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    coefficient1: f64,
    coefficient2: f64,
    coefficient3: f64,
    #[serde(flatten)]
    model: DeviceModel,
    #[serde(default)]
    default: bool,
}

/// Picks a curve from a calibration table for one receiver model.
#[derive(Debug, Clone)]
pub struct ModelSpecificDistanceCalculator {
    requested: DeviceModel,
    selected: Option<(DeviceModel, CurveFittedDistanceCalculator)>,
}

impl ModelSpecificDistanceCalculator {
    /// Uses the table compiled into the library.
    ///
    /// # Errors
    ///
    /// Returns an error only if the built-in table is malformed.
    pub fn with_builtin_table(requested: DeviceModel) -> Result<Self, DistanceError> {
        Self::from_json(BUILTIN_MODEL_TABLE, requested)
    }

    /// Reads a table from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path, requested: DeviceModel) -> Result<Self, DistanceError> {
        let content = std::fs::read_to_string(path).map_err(|source| DistanceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content, requested)
    }

    /// Parses a table and selects the best entry for `requested`.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON does not match the table shape.
    pub fn from_json(json: &str, requested: DeviceModel) -> Result<Self, DistanceError> {
        let table: ModelTable = serde_json::from_str(json)?;

        let mut best: Option<&ModelEntry> = None;
        let mut best_score = 0;
        for entry in &table.models {
            let score = requested.match_score(&entry.model);
            if score > best_score {
                best_score = score;
                best = Some(entry);
            }
        }
        let chosen = best.or_else(|| table.models.iter().find(|e| e.default));

        let selected = chosen.map(|entry| {
            (
                entry.model.clone(),
                CurveFittedDistanceCalculator::new(
                    entry.coefficient1,
                    entry.coefficient2,
                    entry.coefficient3,
                ),
            )
        });
        match &selected {
            Some((model, _)) => debug!(requested = %requested, selected = %model, score = best_score, "Selected distance model"),
            None => warn!(requested = %requested, "No distance model matches and the table has no default"),
        }

        Ok(Self {
            requested,
            selected,
        })
    }

    /// Model the caller asked for.
    #[must_use]
    pub const fn requested_model(&self) -> &DeviceModel {
        &self.requested
    }

    /// Table entry in use, if any.
    #[must_use]
    pub fn selected_model(&self) -> Option<&DeviceModel> {
        self.selected.as_ref().map(|(model, _)| model)
    }
}

impl DistanceCalculator for ModelSpecificDistanceCalculator {
    fn calculate_distance(&self, tx_power: i32, rssi: f64) -> f64 {
        self.selected
            .as_ref()
            .map_or(-1.0, |(_, curve)| curve.calculate_distance(tx_power, rssi))
    }
}

/// Shared handle to whichever calculator is configured.
#[derive(Debug, Clone, Default)]
pub struct DistanceEstimator {
    calculator: Option<Arc<dyn DistanceCalculator>>,
}

impl DistanceEstimator {
    /// Wraps a calculator.
    #[must_use]
    pub fn new(calculator: Arc<dyn DistanceCalculator>) -> Self {
        Self {
            calculator: Some(calculator),
        }
    }

    /// An estimator that always reports "unknown".
    #[must_use]
    pub const fn disabled() -> Self {
        Self { calculator: None }
    }

    /// Distance in metres, or `-1.0` without a calculator.
    #[must_use]
    pub fn estimate(&self, tx_power: i32, rssi: f64) -> f64 {
        self.calculator
            .as_ref()
            .map_or(-1.0, |c| c.calculate_distance(tx_power, rssi))
    }

    /// Like [`estimate`](Self::estimate) but `None` for negative results.
    #[must_use]
    pub fn estimate_checked(&self, tx_power: i32, rssi: f64) -> Option<f64> {
        let distance = self.estimate(tx_power, rssi);
        (distance >= 0.0).then_some(distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(manufacturer: &str, model: &str, build: &str, version: &str) -> DeviceModel {
        DeviceModel {
            version: version.into(),
            build_number: build.into(),
            model: model.into(),
            manufacturer: manufacturer.into(),
        }
    }

    #[test]
    fn test_match_score_levels() {
        let nexus4 = model("LGE", "Nexus 4", "KOT49H", "4.4.2");
        assert_eq!(nexus4.match_score(&model("lge", "Nexus 4", "KOT49H", "4.4.2")), 4);
        assert_eq!(nexus4.match_score(&model("LGE", "Nexus 4", "KOT49H", "5.0")), 3);
        assert_eq!(nexus4.match_score(&model("LGE", "Nexus 4", "OTHER", "4.4.2")), 2);
        assert_eq!(nexus4.match_score(&model("LGE", "Nexus 5", "KOT49H", "4.4.2")), 1);
        assert_eq!(nexus4.match_score(&model("Samsung", "Nexus 4", "KOT49H", "4.4.2")), 0);
    }

    #[test]
    fn test_curve_near_field_uses_tenth_power() {
        let curve = CurveFittedDistanceCalculator::new(0.42093, 6.9476, 0.54992);
        let d = curve.calculate_distance(-59, -50.0);
        assert!((d - (50.0f64 / 59.0).powi(10)).abs() < 1e-12);
        assert!(d < 1.0);
    }

    #[test]
    fn test_curve_far_field_uses_coefficients() {
        let curve = CurveFittedDistanceCalculator::new(0.42093, 6.9476, 0.54992);
        let d = curve.calculate_distance(-59, -59.0);
        assert!((d - (0.42093 + 0.54992)).abs() < 1e-9);
        assert!(curve.calculate_distance(-59, -80.0) > d);
    }

    #[test]
    fn test_zero_rssi_is_unknown() {
        let curve = CurveFittedDistanceCalculator::new(1.0, 1.0, 0.0);
        assert!((curve.calculate_distance(-59, 0.0) + 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_selects_exact_model() {
        let calc = ModelSpecificDistanceCalculator::with_builtin_table(model(
            "LGE", "Nexus 4", "KOT49H", "4.4.2",
        ))
        .unwrap();
        assert_eq!(calc.selected_model().unwrap().model, "Nexus 4");
    }

    #[test]
    fn test_first_entry_wins_ties() {
        let calc = ModelSpecificDistanceCalculator::with_builtin_table(model("LGE", "Pixel", "", ""))
            .unwrap();
        assert_eq!(calc.selected_model().unwrap().model, "Nexus 4");
    }

    #[test]
    fn test_falls_back_to_default_entry() {
        let calc =
            ModelSpecificDistanceCalculator::with_builtin_table(model("Acme", "Phone", "1", "1"))
                .unwrap();
        assert_eq!(calc.selected_model().unwrap().model, "Nexus 5");
        assert!(calc.calculate_distance(-59, -70.0) > 0.0);
    }

    #[test]
    fn test_table_without_default_reports_unknown() {
        let json = r#"{"models":[{"coefficient1":1.0,"coefficient2":2.0,"coefficient3":0.0,
            "version":"1","build_number":"1","model":"A","manufacturer":"B"}]}"#;
        let calc = ModelSpecificDistanceCalculator::from_json(json, model("Z", "", "", "")).unwrap();
        assert!(calc.selected_model().is_none());
        assert!((calc.calculate_distance(-59, -70.0) + 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_malformed_table_is_an_error() {
        assert!(matches!(
            ModelSpecificDistanceCalculator::from_json("{", DeviceModel::default()),
            Err(DistanceError::Parse(_))
        ));
    }

    #[test]
    fn test_estimator_without_calculator() {
        let estimator = DistanceEstimator::disabled();
        assert!((estimator.estimate(-59, -70.0) + 1.0).abs() < f64::EPSILON);
        assert!(estimator.estimate_checked(-59, -70.0).is_none());

        let estimator = DistanceEstimator::new(Arc::new(CurveFittedDistanceCalculator::new(
            1.0, 1.0, 0.0,
        )));
        assert_eq!(estimator.estimate_checked(-50, -100.0), Some(2.0));
    }
}
