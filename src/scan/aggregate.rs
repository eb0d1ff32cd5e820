//! Reduction of demodulator bursts into scan rows.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::instrument::lockin::Burst;

/// One persisted wavelength point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRow {
    pub wavelength: f64,
    /// Mean photocurrent in A: `sqrt(x² + y²) / amplification`.
    pub mean_current: f64,
    pub amplification: f64,
    /// Mean demodulator magnitude in V.
    pub mean_r: f64,
    pub mean_frequency: f64,
    pub mean_phase: f64,
    /// Optical power in W, only for reference-diode scans.
    pub power: Option<f64>,
}

/// What happened to one burst.
#[derive(Debug, Clone, PartialEq)]
pub enum Reduction {
    Row(ScanRow),
    /// The very first point of a measurement carries a start-up spike.
    DiscardedInitial,
    DataLoss,
    NoData,
}

/// Turns bursts into rows and tracks the point counter of one measurement.
///
/// The counter advances for every wavelength, whether or not a row came out of it.
#[derive(Debug, Clone)]
pub struct Aggregator {
    count: usize,
    amplification: f64,
}

impl Aggregator {
    pub fn new(amplification: f64) -> Self {
        Self::starting_at(0, amplification)
    }

    /// Resumes with `count` points already acquired.
    pub fn starting_at(count: usize, amplification: f64) -> Self {
        Self {
            count,
            amplification,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reduce(&mut self, wavelength: f64, burst: Option<&Burst>) -> Reduction {
        let reduction = match burst {
            None => Reduction::NoData,
            Some(burst) if burst.dataloss() => Reduction::DataLoss,
            Some(burst) if burst.is_empty() => Reduction::NoData,
            Some(_) if self.count == 0 => {
                debug!(wavelength, "Dropping first point of the measurement");
                Reduction::DiscardedInitial
            }
            Some(burst) => Reduction::Row(self.summarize(wavelength, burst)),
        };
        self.count += 1;
        reduction
    }

    fn summarize(&self, wavelength: f64, burst: &Burst) -> ScanRow {
        let n = burst.len() as f64;
        let mean_r = burst.magnitudes().sum::<f64>() / n;
        ScanRow {
            wavelength,
            mean_current: mean_r / self.amplification,
            amplification: self.amplification,
            mean_r,
            mean_frequency: burst.frequency().iter().sum::<f64>() / n,
            mean_phase: burst.phase().iter().sum::<f64>() / n,
            power: None,
        }
    }
}
