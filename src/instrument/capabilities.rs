//! Capability traits consumed by the scan controller.
//!
//! The controller never talks to a wire protocol directly. Each instrument is reached
//! through one of these traits so that serial drivers, the lock-in bridge and the mock
//! instruments are interchangeable. All operations fail with
//! [`DaqError::DeviceNotConnected`](crate::error::DaqError::DeviceNotConnected) while the
//! instrument is not connected.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::instrument::lockin::{Burst, LockInParameters, LockInSession};

/// Grating monochromator with an internal filter wheel.
#[async_trait]
pub trait Monochromator: Send {
    fn is_connected(&self) -> bool;

    /// Greets the device and waits for homing to finish.
    async fn connect(&mut self) -> AppResult<bool>;

    async fn goto_wavelength(&mut self, nm: f64) -> AppResult<()>;
    async fn set_scan_speed(&mut self, nm_per_min: f64) -> AppResult<()>;
    async fn select_grating(&mut self, grating: u8) -> AppResult<()>;
    async fn select_filter(&mut self, filter: u8) -> AppResult<()>;
    async fn query_filter(&mut self) -> AppResult<u8>;
    async fn query_grating(&mut self) -> AppResult<u8>;

    /// Re-references the filter wheel, which currently sits at `start_position`.
    async fn initialize_filter(&mut self, start_position: u8) -> AppResult<()>;
}

/// Lock-in amplifier reached through its data server.
#[async_trait]
pub trait LockInDevice: Send {
    fn is_connected(&self) -> bool;

    async fn connect(&mut self, device_id: &str) -> AppResult<LockInSession>;
    async fn configure(&mut self, parameters: &LockInParameters) -> AppResult<()>;
    async fn subscribe(&mut self, path: &str) -> AppResult<()>;

    /// Collects demodulator samples for `duration`.
    ///
    /// `Ok(None)` means the server answered but had no samples for this device.
    async fn poll(&mut self, duration: Duration, timeout: Duration) -> AppResult<Option<Burst>>;

    async fn unsubscribe(&mut self, path: &str) -> AppResult<()>;
}

/// External motorized filter wheel, positions are 1-based.
#[async_trait]
pub trait FilterWheel: Send {
    fn is_connected(&self) -> bool;

    /// Opens the wheel; only succeeds when it reports the open position.
    async fn connect(&mut self) -> AppResult<bool>;

    async fn position(&mut self) -> AppResult<u8>;
    async fn set_position(&mut self, position: u8) -> AppResult<()>;
}
