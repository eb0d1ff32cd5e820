//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! everything that can go wrong during a wavelength scan, from configuration and file
//! problems to instrument faults.
//!
//! ## Error Hierarchy
//!
//! The variants fall into two groups:
//!
//! - **Recoverable** (`OutOfRange`, `OutOfCalibrationRange`, `DataLoss`): reported and
//!   logged, but a scan carries on. An out-of-band wavelength keeps the previous filter or
//!   grating, a point outside the calibration curve is persisted without power, and a
//!   lossy burst is dropped.
//! - **Faults** (`DeviceNotConnected`, `Transport`, `Timeout`, `Io`, `Csv`, ...): the scan
//!   session moves to `Faulted`, rows already written stay on disk, and the error is handed
//!   back to the caller.
//!
//! Precondition failures (`NotConnected`, `InvalidRange`, `Configuration`) refuse the
//! operation before any state changes.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::scan::bands::BandAxis;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid scan range: start={start} nm, stop={stop} nm, step={step} nm")]
    InvalidRange { start: f64, stop: f64, step: f64 },

    #[error("Instruments not connected: {}", .missing.join(", "))]
    NotConnected { missing: Vec<String> },

    #[error("{device} not connected")]
    DeviceNotConnected { device: String },

    #[error("{device} transport error: {message}")]
    Transport { device: String, message: String },

    #[error("{device} did not answer within {after:?}")]
    Timeout { device: String, after: Duration },

    #[error("{wavelength} nm is outside the configured {axis} bands")]
    OutOfRange { axis: BandAxis, wavelength: f64 },

    #[error("{wavelength} nm is outside the calibration curve ({low}-{high} nm)")]
    OutOfCalibrationRange { wavelength: f64, low: f64, high: f64 },

    #[error("Sample loss detected at {wavelength} nm")]
    DataLoss { wavelength: f64 },

    #[error("Malformed lock-in payload: {0}")]
    BurstParse(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("No free file name for '{base}' in {}", .directory.display())]
    NamingExhausted { base: String, directory: PathBuf },

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Whether a scan may continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DaqError::OutOfRange { .. }
                | DaqError::OutOfCalibrationRange { .. }
                | DaqError::DataLoss { .. }
        )
    }

    pub(crate) fn transport(device: &str, message: impl Into<String>) -> Self {
        DaqError::Transport {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn not_connected(device: &str) -> Self {
        DaqError::DeviceNotConnected {
            device: device.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::OutOfRange {
            axis: BandAxis::Grating,
            wavelength: 1801.0,
        };
        assert_eq!(
            err.to_string(),
            "1801 nm is outside the configured grating bands"
        );

        let err = DaqError::NotConnected {
            missing: vec!["monochromator".into(), "filter wheel".into()],
        };
        assert_eq!(
            err.to_string(),
            "Instruments not connected: monochromator, filter wheel"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(DaqError::DataLoss { wavelength: 500.0 }.is_recoverable());
        assert!(DaqError::OutOfCalibrationRange {
            wavelength: 300.0,
            low: 400.0,
            high: 500.0
        }
        .is_recoverable());
        assert!(!DaqError::not_connected("monochromator").is_recoverable());
        assert!(!DaqError::transport("lock-in", "broken pipe").is_recoverable());
    }
}
