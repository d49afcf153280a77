//! Application configuration management.
//!
//! Configuration is read from an optional TOML file layered with environment
//! overrides of the form `BEACONWATCH__SECTION__KEY`, for example
//! `BEACONWATCH__RANGING__FILTER=arma`. Every section and field has a default,
//! so an empty or missing file yields a working setup that recognises
//! AltBeacon packets.
//!
//! ```toml
//! [parser]
//! layouts = ["altbeacon", "m:2-3=0215,i:4-19,i:20-21,i:22-23,p:24-24"]
//!
//! [ranging]
//! filter = "arma"
//! arma_speed = 0.1
//!
//! [monitoring]
//! exit_period_ms = 10000
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::distance::DeviceModel;
use crate::filter::{FilterStrategy, DEFAULT_ARMA_SPEED, DEFAULT_SAMPLE_EXPIRATION_MS};
use crate::layout::{LayoutDescriptor, LayoutError};
use crate::monitoring::{
    MonitoringConfig, DEFAULT_EXIT_PERIOD_MS, MAX_REGIONS_FOR_STATUS_PRESERVATION,
    MAX_STATUS_PRESERVATION_AGE,
};
use crate::parser::AdvertisementParser;
use crate::ranging::{RangingConfig, DEFAULT_MAX_TRACKING_AGE_MS};
use crate::storage::MONITORING_STATE_FILE;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "BEACONWATCH";

const APP_NAME: &str = "beaconwatch";

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file exists but could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    ReadError {
        /// File being read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// File being written.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Layered sources could not be merged or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// Serializing to TOML failed.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// One field holds an unusable value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong.
        message: String,
    },

    /// Several fields hold unusable values.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),

    /// No platform configuration directory could be determined.
    #[error("Cannot determine config directory")]
    NoConfigDirectory,
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Layouts and identity rules.
    pub parser: ParserSettings,
    /// Ranging filter and cache.
    pub ranging: RangingSettings,
    /// Monitoring debounce and persistence.
    pub monitoring: MonitoringSettings,
    /// Distance calibration.
    pub distance: DistanceSettings,
    /// HTTP adapter.
    pub server: ServerSettings,
}

/// `[parser]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserSettings {
    /// Well-known layout names or layout strings, tried in order.
    pub layouts: Vec<String>,
    /// Include the transmitter address in beacon identity.
    pub hardware_equality: bool,
    /// Only accept manufacturer data from a layout's listed manufacturers.
    pub enforce_hardware_assist: bool,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            layouts: vec!["altbeacon".to_string()],
            hardware_equality: false,
            enforce_hardware_assist: false,
        }
    }
}

/// RSSI filter selection in `[ranging]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    /// Trimmed mean over a sliding window.
    #[default]
    RunningAverage,
    /// Exponential smoothing.
    Arma,
}

/// `[ranging]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangingSettings {
    /// Which filter smooths RSSI.
    pub filter: FilterKind,
    /// ARMA correction speed.
    pub arma_speed: f64,
    /// Running average window.
    pub sample_expiration_ms: u64,
    /// Keep reporting recently seen beacons for `max_tracking_age_ms`.
    pub use_tracking_cache: bool,
    /// Tracking cache lifetime.
    pub max_tracking_age_ms: u64,
}

impl Default for RangingSettings {
    fn default() -> Self {
        Self {
            filter: FilterKind::RunningAverage,
            arma_speed: DEFAULT_ARMA_SPEED,
            sample_expiration_ms: DEFAULT_SAMPLE_EXPIRATION_MS.unsigned_abs(),
            use_tracking_cache: false,
            max_tracking_age_ms: DEFAULT_MAX_TRACKING_AGE_MS.unsigned_abs(),
        }
    }
}

/// `[monitoring]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    /// Silence before an occupied region is vacated.
    pub exit_period_ms: u64,
    /// Persist region state across restarts.
    pub persistence_enabled: bool,
    /// Larger monitored sets are not persisted.
    pub max_persisted_regions: usize,
    /// Persisted state older than this is ignored.
    pub max_restore_age_secs: u64,
    /// State file; defaults to the platform data directory.
    pub state_path: Option<PathBuf>,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            exit_period_ms: DEFAULT_EXIT_PERIOD_MS.unsigned_abs(),
            persistence_enabled: true,
            max_persisted_regions: MAX_REGIONS_FOR_STATUS_PRESERVATION,
            max_restore_age_secs: MAX_STATUS_PRESERVATION_AGE.as_secs(),
            state_path: None,
        }
    }
}

/// `[distance]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceSettings {
    /// Receiver manufacturer.
    pub manufacturer: String,
    /// Receiver model.
    pub model: String,
    /// Receiver build number.
    pub build_number: String,
    /// Receiver OS version.
    pub version: String,
    /// Calibration table replacing the embedded one.
    pub table_path: Option<PathBuf>,
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listen address.
    pub bind_address: String,
    /// Internal cycle ticker period; 0 leaves cycles to `POST /api/cycle`.
    pub cycle_period_ms: u64,
    /// Packet workers; 0 uses every available CPU.
    pub worker_threads: usize,
    /// JSON file logging instead of pretty console output.
    pub production: bool,
    /// Where production logs roll over; a platform default when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            cycle_period_ms: 1_100,
            worker_threads: 0,
            production: false,
            log_dir: None,
        }
    }
}

impl Config {
    /// Loads from the default path, tolerating a missing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or the environment holds malformed values.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        Self::load_from(&path, false)
    }

    /// Loads from `path` layered with environment overrides.
    ///
    /// With `required` set, a missing file is an error rather than defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] for a missing required file and
    /// [`ConfigError::Load`] for malformed content.
    pub fn load_from(path: &Path, required: bool) -> Result<Self, ConfigError> {
        Self::load_with_environment(path, required, environment())
    }

    fn load_with_environment(
        path: &Path,
        required: bool,
        env: config::Environment,
    ) -> Result<Self, ConfigError> {
        if required && !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        debug!(path = %path.display(), "Loading configuration");

        let loaded: Self = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(env)
            .build()?
            .try_deserialize()?;
        Ok(loaded)
    }

    /// Writes the configuration to the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::default_path()?)
    }

    /// Writes the configuration as TOML to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default configuration file location.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDirectory`] when no home directory is known.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        // On the gateway: /etc/beaconwatch/config.toml
        // For development: ~/.config/beaconwatch/config.toml
        #[cfg(target_os = "linux")]
        {
            Ok(PathBuf::from("/etc/beaconwatch/config.toml"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let dirs = directories::ProjectDirs::from("", "", APP_NAME)
                .ok_or(ConfigError::NoConfigDirectory)?;
            Ok(dirs.config_dir().join("config.toml"))
        }
    }

    /// Checks every field and reports all problems at once.
    ///
    /// # Errors
    ///
    /// Returns a single [`ConfigError::ValidationError`] or, for several
    /// problems, [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.parser.layouts.is_empty() {
            errors.push(ConfigError::invalid(
                "parser.layouts",
                "at least one layout is required",
            ));
        }
        for (i, layout) in self.parser.layouts.iter().enumerate() {
            if let Err(e) = parse_layout_entry(layout) {
                errors.push(ConfigError::invalid(
                    &format!("parser.layouts[{i}]"),
                    e.to_string(),
                ));
            }
        }

        let speed = self.ranging.arma_speed;
        if !(speed > 0.0 && speed <= 1.0) {
            errors.push(ConfigError::invalid(
                "ranging.arma_speed",
                format!("must be in (0, 1], got {speed}"),
            ));
        }
        if self.ranging.sample_expiration_ms == 0 {
            errors.push(ConfigError::invalid(
                "ranging.sample_expiration_ms",
                "must be greater than zero",
            ));
        }
        if self.ranging.use_tracking_cache && self.ranging.max_tracking_age_ms == 0 {
            errors.push(ConfigError::invalid(
                "ranging.max_tracking_age_ms",
                "must be greater than zero when the tracking cache is enabled",
            ));
        }
        if self.monitoring.exit_period_ms == 0 {
            errors.push(ConfigError::invalid(
                "monitoring.exit_period_ms",
                "must be greater than zero",
            ));
        }
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ConfigError::invalid(
                "server.bind_address",
                format!("'{}' is not a socket address", self.server.bind_address),
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Builds a parser holding the configured layouts.
    ///
    /// # Errors
    ///
    /// Returns the first layout that fails to parse.
    pub fn build_parser(&self) -> Result<AdvertisementParser, ConfigError> {
        let layouts = self
            .parser
            .layouts
            .iter()
            .enumerate()
            .map(|(i, layout)| {
                parse_layout_entry(layout).map_err(|e| {
                    ConfigError::invalid(&format!("parser.layouts[{i}]"), e.to_string())
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AdvertisementParser::new(layouts)
            .with_hardware_assist(self.parser.enforce_hardware_assist))
    }

    /// Filter strategy for newly ranged beacons.
    #[must_use]
    pub fn filter_strategy(&self) -> FilterStrategy {
        match self.ranging.filter {
            FilterKind::Arma => FilterStrategy::Arma {
                speed: self.ranging.arma_speed,
            },
            FilterKind::RunningAverage => FilterStrategy::RunningAverage {
                expiration_ms: millis(self.ranging.sample_expiration_ms),
            },
        }
    }

    /// Ranging behaviour derived from `[ranging]` and `[parser]`.
    #[must_use]
    pub fn ranging_config(&self) -> RangingConfig {
        RangingConfig {
            filter: self.filter_strategy(),
            use_tracking_cache: self.ranging.use_tracking_cache,
            max_tracking_age_ms: millis(self.ranging.max_tracking_age_ms),
            hardware_equality: self.parser.hardware_equality,
        }
    }

    /// Monitoring behaviour derived from `[monitoring]`.
    #[must_use]
    pub fn monitoring_config(&self) -> MonitoringConfig {
        MonitoringConfig {
            exit_period_ms: millis(self.monitoring.exit_period_ms),
            persistence_enabled: self.monitoring.persistence_enabled,
            max_persisted_regions: self.monitoring.max_persisted_regions,
            max_restore_age: Duration::from_secs(self.monitoring.max_restore_age_secs),
        }
    }

    /// Receiver model used to pick a distance curve.
    #[must_use]
    pub fn device_model(&self) -> DeviceModel {
        DeviceModel {
            version: self.distance.version.clone(),
            build_number: self.distance.build_number.clone(),
            model: self.distance.model.clone(),
            manufacturer: self.distance.manufacturer.clone(),
        }
    }

    /// Monitoring state file, configured or platform default.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDirectory`] when no data directory is known.
    pub fn state_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.monitoring.state_path {
            return Ok(path.clone());
        }
        #[cfg(target_os = "linux")]
        {
            Ok(PathBuf::from("/var/lib/beaconwatch").join(MONITORING_STATE_FILE))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let dirs = directories::ProjectDirs::from("", "", APP_NAME)
                .ok_or(ConfigError::NoConfigDirectory)?;
            Ok(dirs.data_dir().join(MONITORING_STATE_FILE))
        }
    }
}

/// Resolves a `[parser] layouts` entry: a built-in name such as `ibeacon`
/// or a layout string.
///
/// # Errors
///
/// Returns the parse error for entries that are neither.
pub fn parse_layout_entry(entry: &str) -> Result<LayoutDescriptor, LayoutError> {
    LayoutDescriptor::named(entry.trim()).map_or_else(|| LayoutDescriptor::parse(entry), Ok)
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

fn millis(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env() -> config::Environment {
        environment().source(Some(HashMap::new()))
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.parser.layouts, vec!["altbeacon".to_string()]);
        assert_eq!(config.monitoring.exit_period_ms, 10_000);
        assert_eq!(config.monitoring.max_restore_age_secs, 900);
        assert_eq!(config.ranging.max_tracking_age_ms, 5_000);
    }

    #[test]
    fn test_missing_optional_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        let config = Config::load_with_environment(&path, false, no_env()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_missing_required_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        let err = Config::load_with_environment(&path, true, no_env()).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[ranging]\nfilter = \"arma\"\narma_speed = 0.25\n\n[monitoring]\nexit_period_ms = 3000\n",
        )
        .unwrap();

        let config = Config::load_with_environment(&path, true, no_env()).unwrap();
        assert_eq!(config.ranging.filter, FilterKind::Arma);
        assert_eq!(config.filter_strategy(), FilterStrategy::Arma { speed: 0.25 });
        assert_eq!(config.monitoring_config().exit_period_ms, 3_000);
        assert!(config.monitoring.persistence_enabled);
        assert_eq!(config.parser, ParserSettings::default());
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\ncycle_period_ms = 500\n").unwrap();

        let env = environment().source(Some(HashMap::from([
            (
                "BEACONWATCH__SERVER__CYCLE_PERIOD_MS".to_string(),
                "2000".to_string(),
            ),
            (
                "BEACONWATCH__PARSER__HARDWARE_EQUALITY".to_string(),
                "true".to_string(),
            ),
        ])));
        let config = Config::load_with_environment(&path, true, env).unwrap();
        assert_eq!(config.server.cycle_period_ms, 2_000);
        assert!(config.parser.hardware_equality);
        assert!(config.ranging_config().hardware_equality);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.distance.manufacturer = "LGE".into();
        config.distance.model = "Nexus 5".into();
        config.monitoring.state_path = Some(dir.path().join("state.json"));
        config.save_to(&path).unwrap();

        let reloaded = Config::load_with_environment(&path, true, no_env()).unwrap();
        assert_eq!(reloaded, config);
        assert_eq!(reloaded.device_model().model, "Nexus 5");
        assert_eq!(reloaded.state_path().unwrap(), dir.path().join("state.json"));
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let mut config = Config::default();
        config.parser.layouts.push("i:4-19".into());
        config.ranging.arma_speed = 0.0;
        config.monitoring.exit_period_ms = 0;
        config.server.bind_address = "not an address".into();

        match config.validate().unwrap_err() {
            ConfigError::MultipleValidationErrors(errors) => {
                assert_eq!(errors.len(), 4);
                assert!(errors[0].to_string().starts_with("parser.layouts[1]"));
            }
            other => panic!("expected multiple errors, got {other}"),
        }
    }

    #[test]
    fn test_single_problem_is_not_wrapped() {
        let mut config = Config::default();
        config.ranging.arma_speed = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "ranging.arma_speed"
        ));
    }

    #[test]
    fn test_build_parser_uses_layouts_in_order() {
        let mut config = Config::default();
        config.parser.layouts = vec![
            "ibeacon".to_string(),
            crate::layout::ALTBEACON_LAYOUT.to_string(),
        ];
        let parser = config.build_parser().unwrap();
        assert_eq!(parser.layouts().len(), 2);
        assert_eq!(parser.layouts()[0].id(), "ibeacon");
        assert_eq!(parser.layouts()[1].name(), None);

        config.parser.layouts.push("garbage".into());
        assert!(config.build_parser().is_err());
    }

    #[test]
    fn test_running_average_strategy_uses_window() {
        let mut config = Config::default();
        config.ranging.sample_expiration_ms = 5_000;
        assert_eq!(
            config.filter_strategy(),
            FilterStrategy::RunningAverage {
                expiration_ms: 5_000
            }
        );
    }
}
