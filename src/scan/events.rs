//! Scan progress reporting and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::scan::aggregate::ScanRow;
use crate::scan::bands::SwitchAction;

/// Lifecycle of one band measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanState {
    Idle,
    Preparing,
    Scanning,
    Completed,
    Cancelled,
    Faulted,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Faulted)
    }
}

/// Why a wavelength produced no row.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    InitialTransient,
    DataLoss,
    NoData,
}

/// Published on the controller's broadcast channel for front ends.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    StateChanged(ScanState),
    Row(ScanRow),
    Switched(SwitchAction),
    PointSkipped { wavelength: f64, reason: SkipReason },
}

/// Shared stop flag, checked once per wavelength.
///
/// Cloning yields another handle to the same flag, so a Ctrl-C handler or a front end
/// can request a stop while the scan loop owns its own copy.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arms the flag after a run has ended.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Live plot data of the running scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlotSeries {
    pub wavelength: Vec<f64>,
    pub mean_r: Vec<f64>,
    pub log_mean_r: Vec<f64>,
    pub phase: Vec<f64>,
}

impl PlotSeries {
    pub fn push(&mut self, row: &ScanRow) {
        self.wavelength.push(row.wavelength);
        self.mean_r.push(row.mean_r);
        self.log_mean_r.push(row.mean_r.ln());
        self.phase.push(row.mean_phase);
    }

    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_shared_between_clones() {
        let stop = StopHandle::new();
        let remote = stop.clone();
        assert!(!stop.is_requested());
        remote.request();
        assert!(stop.is_requested());
        stop.reset();
        assert!(!remote.is_requested());
    }
}
