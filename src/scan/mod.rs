//! Wavelength scans: range expansion, band switching, aggregation and the scan loop.

pub mod aggregate;
pub mod bands;
pub mod controller;
pub mod events;
pub mod job;
pub mod request;

pub use controller::{Instruments, MeasurementController, RunReport, ScanReport};
pub use events::{ScanEvent, ScanState, StopHandle};
pub use request::{BandScan, ScanRequest};
