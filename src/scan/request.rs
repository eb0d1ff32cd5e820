//! Immutable description of what to measure.
//!
//! A `ScanRequest` carries everything the operator chooses for one run: where the data
//! goes, which reference diode (if any) is measured and the list of bands. A band with a
//! `wheel_position` is part of a composite scan and moves the external filter wheel
//! before it starts.
//!
//! ```toml
//! user = "alice"
//! experiment = "P3HT_PCBM"
//! file_name = "device1"
//! reference = "silicon"   # optional: silicon | ingaas
//! write_manifest = true
//!
//! [[bands]]
//! id = "f1"
//! wheel_position = 1
//! start = 350.0
//! stop = 650.0
//! step = 5.0
//! amplification = 1e6
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::calibration::ReferenceDiode;
use crate::error::{AppResult, DaqError};
use crate::naming::{filter_label, measurement_file_name};
use crate::scan::job::ScanJob;
use crate::storage::ManifestEntry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandScan {
    pub id: String,
    /// External filter wheel slot; `None` for a single-range scan.
    #[serde(default)]
    pub wheel_position: Option<u8>,
    /// Cut-on wavelength of the filter in that slot, `None` for the open slot.
    #[serde(default)]
    pub cuton_nm: Option<f64>,
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    pub amplification: f64,
}

impl BandScan {
    pub fn job(&self) -> AppResult<ScanJob> {
        ScanJob::build(self.start, self.stop, self.step)
    }

    /// Band for manifest column `fN`, measured with wheel slot `N`.
    pub fn from_manifest(entry: &ManifestEntry) -> AppResult<Self> {
        let wheel_position = entry
            .id
            .strip_prefix('f')
            .and_then(|n| n.parse::<u8>().ok())
            .ok_or_else(|| {
                DaqError::Configuration(format!(
                    "manifest column '{}' is not of the form f<slot>",
                    entry.id
                ))
            })?;
        Ok(Self {
            id: entry.id.clone(),
            wheel_position: Some(wheel_position),
            cuton_nm: None,
            start: entry.start,
            stop: entry.stop,
            step: entry.step,
            amplification: entry.amplification,
        })
    }

    pub fn manifest_entry(&self) -> ManifestEntry {
        ManifestEntry {
            id: self.id.clone(),
            start: self.start,
            stop: self.stop,
            step: self.step,
            amplification: self.amplification,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub user: String,
    pub experiment: String,
    pub file_name: String,
    #[serde(default)]
    pub reference: Option<ReferenceDiode>,
    /// Monochromator scan speed in nm/min; the configured default when absent.
    #[serde(default)]
    pub scan_speed: Option<f64>,
    #[serde(default)]
    pub write_manifest: bool,
    pub bands: Vec<BandScan>,
}

impl ScanRequest {
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        let request: ScanRequest = toml::from_str(content)
            .map_err(|e| DaqError::Configuration(format!("invalid scan request: {e}")))?;
        request.validate()?;
        Ok(request)
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|err| DaqError::Configuration(format!("{}: {err}", path.display())))
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.file_name.trim().is_empty() {
            return Err(DaqError::Configuration(
                "scan request needs a file name".to_string(),
            ));
        }
        if self.bands.is_empty() {
            return Err(DaqError::Configuration(
                "scan request has no bands".to_string(),
            ));
        }
        let mut ids = HashSet::new();
        for band in &self.bands {
            if !ids.insert(band.id.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "band id '{}' is used twice",
                    band.id
                )));
            }
            if !(band.amplification.is_finite() && band.amplification > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "band '{}' needs a positive amplification",
                    band.id
                )));
            }
            if band.wheel_position == Some(0) {
                return Err(DaqError::Configuration(format!(
                    "band '{}': filter wheel slots are 1-based",
                    band.id
                )));
            }
            band.job()?;
        }
        Ok(())
    }

    /// `{save_path}/{user}/{experiment}`
    pub fn output_dir(&self, save_path: &Path) -> PathBuf {
        save_path.join(&self.user).join(&self.experiment)
    }

    pub fn is_composite(&self) -> bool {
        self.bands.iter().any(|b| b.wheel_position.is_some())
    }

    /// Base name (before collision handling) of the data file for `band`.
    pub fn file_name_for(&self, band: &BandScan) -> String {
        let filter = band.wheel_position.map(|_| filter_label(band.cuton_nm));
        measurement_file_name(
            &self.file_name,
            band.start,
            band.stop,
            band.step,
            band.amplification,
            filter.as_deref(),
        )
    }

    /// Overwrites range and amplification of bands listed in a saved manifest.
    pub fn apply_manifest(&mut self, entries: &[ManifestEntry]) -> AppResult<()> {
        for entry in entries {
            if let Some(band) = self.bands.iter_mut().find(|b| b.id == entry.id) {
                band.start = entry.start;
                band.stop = entry.stop;
                band.step = entry.step;
                band.amplification = entry.amplification;
            } else {
                self.bands.push(BandScan::from_manifest(entry)?);
            }
        }
        self.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = r#"
user = "alice"
experiment = "P3HT"
file_name = "device1"
reference = "silicon"

[[bands]]
id = "f1"
wheel_position = 1
start = 350.0
stop = 650.0
step = 5.0
amplification = 1e6

[[bands]]
id = "f3"
wheel_position = 3
cuton_nm = 550.0
start = 600.0
stop = 1000.0
step = 10.0
amplification = 1e7
"#;

    #[test]
    fn parses_composite_request() {
        let request = ScanRequest::from_toml_str(REQUEST).unwrap();
        assert_eq!(request.reference, Some(ReferenceDiode::Silicon));
        assert!(request.is_composite());
        assert!(!request.write_manifest);
        assert_eq!(
            request.file_name_for(&request.bands[0]),
            "device1_noFilter_(350-650nm_5nm_1000000x)"
        );
        assert_eq!(
            request.file_name_for(&request.bands[1]),
            "device1_550Filter_(600-1000nm_10nm_10000000x)"
        );
        assert_eq!(
            request.output_dir(Path::new("/data")),
            PathBuf::from("/data/alice/P3HT")
        );
    }

    #[test]
    fn zero_step_is_refused_up_front() {
        let bad = REQUEST.replace("step = 10.0", "step = 0.0");
        assert!(matches!(
            ScanRequest::from_toml_str(&bad),
            Err(DaqError::InvalidRange { .. })
        ));
    }

    #[test]
    fn manifest_overrides_and_adds_bands() {
        let mut request = ScanRequest::from_toml_str(REQUEST).unwrap();
        request
            .apply_manifest(&[
                ManifestEntry {
                    id: "f1".into(),
                    start: 360.0,
                    stop: 600.0,
                    step: 2.0,
                    amplification: 1e5,
                },
                ManifestEntry {
                    id: "f5".into(),
                    start: 1000.0,
                    stop: 1400.0,
                    step: 10.0,
                    amplification: 1e8,
                },
            ])
            .unwrap();
        assert_eq!(request.bands[0].start, 360.0);
        assert_eq!(request.bands[2].wheel_position, Some(5));
    }
}
