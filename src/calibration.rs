//! Reference-diode calibration and optical power.
//!
//! A reference scan measures a calibrated photodiode instead of the sample. Its
//! photocurrent is converted to optical power with the diode's responsivity curve:
//!
//! ```text
//! P(λ) = I(λ) / R(λ)
//! ```
//!
//! `R(λ)` is taken directly from the curve when `λ` is one of its wavelengths and
//! linearly interpolated between the two bracketing points otherwise. Wavelengths outside
//! the curve are not extrapolated.
//!
//! Calibration tables are CSV files with the columns `Wavelength [nm]` and
//! `Responsivity [A/W]`, one row per wavelength.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::CalibrationSettings;
use crate::error::{AppResult, DaqError};
use crate::scan::aggregate::ScanRow;

/// Which calibrated photodiode a reference scan uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceDiode {
    Silicon,
    #[serde(alias = "InGaAs")]
    Ingaas,
}

impl ReferenceDiode {
    pub fn calibration_path(self, settings: &CalibrationSettings) -> &Path {
        match self {
            Self::Silicon => &settings.silicon,
            Self::Ingaas => &settings.ingaas,
        }
    }
}

impl fmt::Display for ReferenceDiode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Silicon => write!(f, "Si"),
            Self::Ingaas => write!(f, "InGaAs"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CalibrationRecord {
    #[serde(rename = "Wavelength [nm]")]
    wavelength: f64,
    #[serde(rename = "Responsivity [A/W]")]
    responsivity: f64,
}

/// Responsivity in A/W over wavelength in nm, sorted by wavelength.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationCurve {
    points: Vec<(f64, f64)>,
}

impl CalibrationCurve {
    pub fn from_points(mut points: Vec<(f64, f64)>) -> AppResult<Self> {
        if points.is_empty() {
            return Err(DaqError::Configuration(
                "calibration curve has no points".to_string(),
            ));
        }
        if let Some((wl, r)) = points
            .iter()
            .find(|(wl, r)| !wl.is_finite() || !r.is_finite() || *r <= 0.0)
        {
            return Err(DaqError::Configuration(format!(
                "invalid calibration point ({wl} nm, {r} A/W)"
            )));
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        if let Some(pair) = points.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(DaqError::Configuration(format!(
                "calibration curve lists {} nm twice",
                pair[0].0
            )));
        }
        Ok(Self { points })
    }

    pub fn load_csv(path: &Path) -> AppResult<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let points = reader
            .deserialize::<CalibrationRecord>()
            .map(|record| record.map(|r| (r.wavelength, r.responsivity)))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_points(points).map_err(|err| {
            DaqError::Configuration(format!("{}: {err}", path.display()))
        })
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// `(lowest, highest)` wavelength covered.
    pub fn domain(&self) -> (f64, f64) {
        // `from_points` guarantees at least one point.
        let low = self.points.first().map_or(f64::NAN, |p| p.0);
        let high = self.points.last().map_or(f64::NAN, |p| p.0);
        (low, high)
    }

    pub fn responsivity(&self, wavelength: f64) -> AppResult<f64> {
        let idx = self.points.partition_point(|p| p.0 < wavelength);
        if let Some(&(wl, r)) = self.points.get(idx) {
            if wl == wavelength {
                return Ok(r);
            }
            if idx > 0 {
                let (x0, y0) = self.points[idx - 1];
                let t = (wavelength - x0) / (wl - x0);
                return Ok(y0 * (1.0 - t) + r * t);
            }
        }
        let (low, high) = self.domain();
        Err(DaqError::OutOfCalibrationRange {
            wavelength,
            low,
            high,
        })
    }
}

/// Optical power in W for a reference-diode row.
pub fn power(row: &ScanRow, curve: &CalibrationCurve) -> AppResult<f64> {
    Ok(row.mean_current / curve.responsivity(row.wavelength)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn row(wavelength: f64, mean_current: f64) -> ScanRow {
        ScanRow {
            wavelength,
            mean_current,
            amplification: 1e6,
            mean_r: mean_current * 1e6,
            mean_frequency: 390.0,
            mean_phase: 0.0,
            power: None,
        }
    }

    fn curve() -> CalibrationCurve {
        CalibrationCurve::from_points(vec![(500.0, 0.3), (400.0, 0.2)]).unwrap()
    }

    #[test]
    fn interpolates_between_bracketing_points() {
        let curve = curve();
        assert!((curve.responsivity(450.0).unwrap() - 0.25).abs() < 1e-12);
        let p = power(&row(450.0, 0.1), &curve).unwrap();
        assert!((p - 0.4).abs() < 1e-12);
    }

    #[test]
    fn exact_wavelength_uses_table_value() {
        let curve = curve();
        assert_eq!(curve.responsivity(400.0).unwrap(), 0.2);
        assert_eq!(curve.responsivity(500.0).unwrap(), 0.3);
    }

    #[test]
    fn no_extrapolation() {
        let curve = curve();
        let err = power(&row(300.0, 0.1), &curve).unwrap_err();
        assert!(matches!(
            err,
            DaqError::OutOfCalibrationRange { wavelength, low, high }
                if wavelength == 300.0 && low == 400.0 && high == 500.0
        ));
        assert!(curve.responsivity(500.1).is_err());
    }

    #[test]
    fn power_is_deterministic() {
        let curve = curve();
        let r = row(437.5, 3.3e-9);
        let a = power(&r, &curve).unwrap();
        let b = power(&r, &curve).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn loads_table_from_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Wavelength [nm],Responsivity [A/W]").unwrap();
        writeln!(file, "400,0.2").unwrap();
        writeln!(file, "500,0.3").unwrap();
        file.flush().unwrap();

        let curve = CalibrationCurve::load_csv(file.path()).unwrap();
        assert_eq!(curve.points(), &[(400.0, 0.2), (500.0, 0.3)]);
        assert_eq!(curve.domain(), (400.0, 500.0));
    }

    #[test]
    fn duplicate_wavelengths_are_rejected() {
        assert!(CalibrationCurve::from_points(vec![(400.0, 0.2), (400.0, 0.21)]).is_err());
        assert!(CalibrationCurve::from_points(vec![]).is_err());
    }
}
