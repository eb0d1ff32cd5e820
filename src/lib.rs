//! Core library for the sEQE scan application.
//!
//! A scan steps a grating monochromator across a wavelength range, lets the internal
//! filter wheel and gratings follow the configured bands, and reduces one lock-in burst
//! per wavelength into a row of the output CSV. Composite scans additionally move an
//! external filter wheel between bands. Reference-diode scans convert photocurrent to
//! optical power with a responsivity curve.
//!
//! The command-line front end lives in `main.rs`; everything else is in this library so
//! that scans can be driven against mock instruments in tests.

pub mod calibration;
pub mod config;
pub mod error;
pub mod instrument;
pub mod naming;
pub mod scan;
pub mod storage;
