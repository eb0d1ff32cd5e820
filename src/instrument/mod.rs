//! Instrument drivers and the capability traits the scan controller uses.

pub mod bridge;
pub mod capabilities;
pub mod fw102c;
pub mod hrs300;
pub mod lockin;
pub mod mock;
pub mod serial_helper;

pub use capabilities::{FilterWheel, LockInDevice, Monochromator};
