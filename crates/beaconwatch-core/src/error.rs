//! Unified error types for the beaconwatch core library.
//!
//! [`BeaconError`] covers every failure that can cross the library boundary.
//! Modules keep their own narrow error types ([`LayoutError`](crate::layout::LayoutError),
//! [`RegionError`](crate::region::RegionError), [`StorageError`](crate::storage::StorageError),
//! [`ConfigError`](crate::config::ConfigError)) and convert into this type with `?`.
//!
//! Malformed radio payloads never become errors. The parser simply reports
//! "no beacon" for them, so nothing in this module describes a bad packet.
//!
//! # Example
//!
//! ```rust
//! use beaconwatch_core::error::{BeaconError, Result};
//! use beaconwatch_core::layout::LayoutDescriptor;
//!
//! fn register(layout: &str) -> Result<LayoutDescriptor> {
//!     Ok(LayoutDescriptor::parse(layout)?)
//! }
//!
//! assert!(register("i:4-19").is_err());
//! ```

use std::path::PathBuf;

use thiserror::Error;

/// The unified error type for all beaconwatch operations.
#[derive(Debug, Error)]
pub enum BeaconError {
    // =========================================================================
    // LAYOUT & IDENTIFIER ERRORS
    // =========================================================================
    /// A beacon layout string could not be parsed.
    #[error("Invalid beacon layout: {0}")]
    InvalidLayout(#[from] crate::layout::LayoutError),

    /// An identifier string could not be parsed.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(#[from] crate::identifier::IdentifierError),

    // =========================================================================
    // REGION ERRORS
    // =========================================================================
    /// Region criteria were rejected.
    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    /// No region with this unique id is being ranged or monitored.
    #[error("Region not found: '{0}'")]
    RegionNotFound(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// Monitoring state could not be saved or read.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // =========================================================================
    // LIFECYCLE ERRORS
    // =========================================================================
    /// The scan pipeline has been shut down and accepts no more work.
    #[error("Scan pipeline is shut down")]
    PipelineClosed,
}

/// A specialized [`Result`] type for beaconwatch operations.
pub type Result<T> = std::result::Result<T, BeaconError>;

/// Short alias for [`BeaconError`].
pub type Error = BeaconError;

impl BeaconError {
    /// Returns `true` if this error came from bad caller input.
    #[inline]
    #[must_use]
    pub const fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidLayout(_) | Self::InvalidIdentifier(_) | Self::InvalidRegion(_)
        )
    }

    /// Returns `true` if a layout string was rejected.
    #[inline]
    #[must_use]
    pub const fn is_layout_error(&self) -> bool {
        matches!(self, Self::InvalidLayout(_))
    }

    /// Returns `true` if monitoring state could not be stored or read.
    #[inline]
    #[must_use]
    pub const fn is_storage_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_))
    }

    /// Returns `true` if retrying the same call later may succeed.
    ///
    /// Input and configuration errors will fail the same way again.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidLayout(_) | Self::InvalidIdentifier(_) | Self::InvalidRegion(_) => 400,
            Self::RegionNotFound(_) | Self::ConfigNotFound(_) => 404,
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,
            Self::PersistenceError(_) | Self::IoError(_) => 500,
            Self::PipelineClosed => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidLayout(_) => "INVALID_LAYOUT",
            Self::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
            Self::InvalidRegion(_) => "INVALID_REGION",
            Self::RegionNotFound(_) => "REGION_NOT_FOUND",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
            Self::PipelineClosed => "PIPELINE_CLOSED",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::region::RegionError> for BeaconError {
    fn from(err: crate::region::RegionError) -> Self {
        Self::InvalidRegion(err.to_string())
    }
}

impl From<crate::storage::StorageError> for BeaconError {
    fn from(err: crate::storage::StorageError) -> Self {
        use crate::storage::StorageError;
        match err {
            StorageError::Io { path, source } => {
                Self::PersistenceError(format!("{}: {source}", path.display()))
            }
            StorageError::Corrupt { path, message } => {
                Self::PersistenceError(format!("Corrupt state file {}: {message}", path.display()))
            }
            StorageError::Serialize(e) => Self::PersistenceError(e.to_string()),
        }
    }
}

impl From<crate::config::ConfigError> for BeaconError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::ReadError { path, source } => {
                Self::PersistenceError(format!("Failed to read {}: {source}", path.display()))
            }
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {}: {source}", path.display()))
            }
            ConfigError::Load(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
            ConfigError::NoConfigDirectory => {
                Self::ConfigNotFound(PathBuf::from("<no config directory>"))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutError;
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_input_error_classification() {
        assert!(BeaconError::InvalidLayout(LayoutError::MissingTypeCode).is_input_error());
        assert!(BeaconError::InvalidRegion("bad".into()).is_input_error());
        assert!(!BeaconError::PipelineClosed.is_input_error());
    }

    #[test]
    fn test_io_error_classification() {
        assert!(BeaconError::PersistenceError("disk full".into()).is_io_error());
        assert!(BeaconError::IoError(IoErr::new(ErrorKind::NotFound, "test")).is_io_error());
        assert!(!BeaconError::RegionNotFound("r".into()).is_io_error());
    }

    #[test]
    fn test_layout_and_storage_classification() {
        let layout = BeaconError::InvalidLayout(LayoutError::MissingTypeCode);
        assert!(layout.is_layout_error());
        assert!(!layout.is_recoverable());

        let storage = BeaconError::PersistenceError("read-only filesystem".into());
        assert!(storage.is_storage_error());
        assert!(storage.is_recoverable());
        assert!(!BeaconError::PipelineClosed.is_recoverable());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(
            BeaconError::InvalidLayout(LayoutError::NoFields).http_status_code(),
            400
        );
        assert_eq!(
            BeaconError::RegionNotFound("lobby".into()).http_status_code(),
            404
        );
        assert_eq!(
            BeaconError::ConfigValidationError("x".into()).http_status_code(),
            422
        );
        assert_eq!(
            BeaconError::PersistenceError("x".into()).http_status_code(),
            500
        );
        assert_eq!(BeaconError::PipelineClosed.http_status_code(), 503);
    }

    #[test]
    fn test_error_codes_are_screaming_snake_case() {
        let errors = [
            BeaconError::InvalidLayout(LayoutError::NoFields),
            BeaconError::RegionNotFound("x".into()),
            BeaconError::ConfigParseError("x".into()),
            BeaconError::PipelineClosed,
        ];
        for err in errors {
            let code = err.error_code();
            assert!(code.chars().all(|c| c.is_ascii_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_layout_error_converts_with_question_mark() {
        fn parse() -> Result<crate::layout::LayoutDescriptor> {
            Ok(crate::layout::LayoutDescriptor::parse("d:1-2")?)
        }
        let err = parse().unwrap_err();
        assert_eq!(err.error_code(), "INVALID_LAYOUT");
        assert!(err.to_string().contains("type code"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BeaconError>();
    }
}
