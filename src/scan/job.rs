//! Wavelength sequence generation.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// Upper bound on the number of points in one band.
pub const MAX_POINTS: usize = 1_000_000;

/// Ordered list of monochromator wavelengths for one band.
///
/// The first entry is a pre-roll point one step below `start`. It is acquired like any
/// other point so the lock-in sees a wavelength change before the first real point, and
/// its data is then thrown away by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    start: f64,
    stop: f64,
    step: f64,
    wavelengths: Vec<f64>,
}

impl ScanJob {
    /// Builds the sequence `start - step, start, start + step, ...` up to the last point
    /// not beyond `stop`.
    ///
    /// The number of steps is `(stop - start) / step` truncated toward zero, so a range
    /// that is not an integral number of steps ends short of `stop`. Sequences longer than
    /// [`MAX_POINTS`] are rejected as `InvalidRange`.
    pub fn build(start: f64, stop: f64, step: f64) -> AppResult<Self> {
        if step == 0.0 || !step.is_finite() || !start.is_finite() || !stop.is_finite() {
            return Err(DaqError::InvalidRange { start, stop, step });
        }

        let steps = ((stop - start) / step).trunc();
        // One point per step, plus the start and the pre-roll.
        if steps + 2.0 > MAX_POINTS as f64 {
            return Err(DaqError::InvalidRange { start, stop, step });
        }
        let number = steps as i64;
        let wavelengths = (-1..=number).map(|n| start + n as f64 * step).collect();

        Ok(Self {
            start,
            stop,
            step,
            wavelengths,
        })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn stop(&self) -> f64 {
        self.stop
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    pub fn len(&self) -> usize {
        self.wavelengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelengths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.wavelengths.iter().copied()
    }
}
