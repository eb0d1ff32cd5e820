//! Mock Instrument Implementations
//!
//! Simulated monochromator, lock-in and filter wheel for tests and the `--simulate`
//! mode of the binary. All mocks use async-safe operations (tokio::time::sleep, not
//! std::thread::sleep).
//!
//! Each mock is `Clone` and clones share state, so a test can hand one copy to the
//! controller and keep another to inspect the call log or inject faults afterwards.
//!
//! # Available Mocks
//!
//! - `MockMonochromator` - tracks wavelength, grating and filter; can fail after N moves
//! - `MockLockIn` - produces synthetic demodulator payloads in the data server's shape
//! - `MockFilterWheel` - six-slot wheel

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::debug;

use crate::error::{AppResult, DaqError};
use crate::instrument::capabilities::{FilterWheel, LockInDevice, Monochromator};
use crate::instrument::lockin::{Burst, LockInParameters, LockInSession};
use crate::scan::events::StopHandle;

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not hide the mock's state from the others.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// MockMonochromator
// =============================================================================

#[derive(Debug)]
struct MonochromatorState {
    connected: bool,
    wavelength: f64,
    grating: u8,
    filter: u8,
    scan_speed: f64,
    moves: usize,
    fail_after_moves: Option<usize>,
    call_log: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MockMonochromator {
    state: Arc<Mutex<MonochromatorState>>,
}

impl Default for MockMonochromator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMonochromator {
    /// Disconnected, filter 1, grating 1.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MonochromatorState {
                connected: false,
                wavelength: 0.0,
                grating: 1,
                filter: 1,
                scan_speed: 0.0,
                moves: 0,
                fail_after_moves: None,
                call_log: Vec::new(),
            })),
        }
    }

    pub fn connected() -> Self {
        let mock = Self::new();
        lock(&mock.state).connected = true;
        mock
    }

    pub fn with_position(self, filter: u8, grating: u8) -> Self {
        {
            let mut state = lock(&self.state);
            state.filter = filter;
            state.grating = grating;
        }
        self
    }

    /// Wavelength moves after the first `moves` fail as if the serial port was lost.
    pub fn fail_after_moves(self, moves: usize) -> Self {
        lock(&self.state).fail_after_moves = Some(moves);
        self
    }

    pub fn call_log(&self) -> Vec<String> {
        lock(&self.state).call_log.clone()
    }

    pub fn wavelength(&self) -> f64 {
        lock(&self.state).wavelength
    }

    pub fn filter(&self) -> u8 {
        lock(&self.state).filter
    }

    pub fn grating(&self) -> u8 {
        lock(&self.state).grating
    }

    fn checked(&self) -> AppResult<MutexGuard<'_, MonochromatorState>> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(DaqError::not_connected("monochromator"));
        }
        Ok(state)
    }
}

#[async_trait]
impl Monochromator for MockMonochromator {
    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    async fn connect(&mut self) -> AppResult<bool> {
        let mut state = lock(&self.state);
        state.connected = true;
        state.call_log.push("connect".to_string());
        Ok(true)
    }

    async fn goto_wavelength(&mut self, nm: f64) -> AppResult<()> {
        let mut state = self.checked()?;
        if state.fail_after_moves.is_some_and(|limit| state.moves >= limit) {
            return Err(DaqError::transport("monochromator", "serial port lost"));
        }
        state.moves += 1;
        state.wavelength = nm;
        state.call_log.push(format!("goto {nm:.2}"));
        Ok(())
    }

    async fn set_scan_speed(&mut self, nm_per_min: f64) -> AppResult<()> {
        let mut state = self.checked()?;
        state.scan_speed = nm_per_min;
        state.call_log.push(format!("scan_speed {nm_per_min:.2}"));
        Ok(())
    }

    async fn select_grating(&mut self, grating: u8) -> AppResult<()> {
        let mut state = self.checked()?;
        state.grating = grating;
        state.call_log.push(format!("select_grating {grating}"));
        Ok(())
    }

    async fn select_filter(&mut self, filter: u8) -> AppResult<()> {
        let mut state = self.checked()?;
        state.filter = filter;
        state.call_log.push(format!("select_filter {filter}"));
        Ok(())
    }

    async fn query_filter(&mut self) -> AppResult<u8> {
        Ok(self.checked()?.filter)
    }

    async fn query_grating(&mut self) -> AppResult<u8> {
        Ok(self.checked()?.grating)
    }

    async fn initialize_filter(&mut self, start_position: u8) -> AppResult<()> {
        let mut state = self.checked()?;
        state.filter = 1;
        state
            .call_log
            .push(format!("initialize_filter {start_position}"));
        Ok(())
    }
}

// =============================================================================
// MockLockIn
// =============================================================================

/// Scripted result of one poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollOutcome {
    Data,
    DataLoss,
    Empty,
    Fault,
}

#[derive(Debug)]
struct LockInState {
    connected: bool,
    device: Option<String>,
    channel_index: u8,
    signal: f64,
    rate: f64,
    subscriptions: Vec<String>,
    configured: Vec<LockInParameters>,
    polls: Vec<Duration>,
    script: VecDeque<PollOutcome>,
    stop_after_polls: Option<(usize, StopHandle)>,
    simulate_timing: bool,
}

#[derive(Debug, Clone)]
pub struct MockLockIn {
    state: Arc<Mutex<LockInState>>,
}

impl Default for MockLockIn {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLockIn {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LockInState {
                connected: false,
                device: None,
                channel_index: 0,
                signal: 2.0e-3,
                rate: 100.0,
                subscriptions: Vec::new(),
                configured: Vec::new(),
                polls: Vec::new(),
                script: VecDeque::new(),
                stop_after_polls: None,
                simulate_timing: false,
            })),
        }
    }

    /// Outcomes for the next polls, in order; once used up every poll returns data.
    pub fn with_script(self, outcomes: impl IntoIterator<Item = PollOutcome>) -> Self {
        lock(&self.state).script.extend(outcomes);
        self
    }

    /// Requests `stop` while serving poll number `polls` (1-based).
    pub fn stop_after_polls(self, polls: usize, stop: StopHandle) -> Self {
        lock(&self.state).stop_after_polls = Some((polls, stop));
        self
    }

    /// Sleep for the requested poll duration, as the real server does.
    pub fn with_real_timing(self) -> Self {
        lock(&self.state).simulate_timing = true;
        self
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.state).subscriptions.clone()
    }

    pub fn configured(&self) -> Vec<LockInParameters> {
        lock(&self.state).configured.clone()
    }

    /// Durations of all polls served so far.
    pub fn polls(&self) -> Vec<Duration> {
        lock(&self.state).polls.clone()
    }

    fn payload(device: &str, channel_index: u8, signal: f64, samples: usize, dataloss: bool) -> Value {
        let phase: f64 = 0.3;
        let n = samples.max(1);
        json!({
            device: {"demods": {channel_index.to_string(): {"sample": {
                "x": vec![signal * phase.cos(); n],
                "y": vec![signal * phase.sin(); n],
                "frequency": vec![390.0; n],
                "phase": vec![phase.to_degrees(); n],
                "time": {"dataloss": dataloss},
            }}}}
        })
    }
}

#[async_trait]
impl LockInDevice for MockLockIn {
    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    async fn connect(&mut self, device_id: &str) -> AppResult<LockInSession> {
        let mut state = lock(&self.state);
        state.connected = true;
        state.device = Some(device_id.to_string());
        Ok(LockInSession::new(device_id))
    }

    async fn configure(&mut self, parameters: &LockInParameters) -> AppResult<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(DaqError::not_connected("lock-in"));
        }
        state.channel_index = parameters.channel.saturating_sub(1);
        state.rate = parameters.rate;
        state.configured.push(parameters.clone());
        Ok(())
    }

    async fn subscribe(&mut self, path: &str) -> AppResult<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(DaqError::not_connected("lock-in"));
        }
        state.subscriptions.push(path.to_string());
        Ok(())
    }

    async fn poll(&mut self, duration: Duration, _timeout: Duration) -> AppResult<Option<Burst>> {
        let (payload, device, channel_index, delay) = {
            let mut state = lock(&self.state);
            let Some(device) = state.device.clone() else {
                return Err(DaqError::not_connected("lock-in"));
            };
            state.polls.push(duration);
            let served = state.polls.len();
            if let Some((limit, stop)) = &state.stop_after_polls {
                if served >= *limit {
                    stop.request();
                }
            }

            let outcome = state.script.pop_front().unwrap_or(PollOutcome::Data);
            let samples = (duration.as_secs_f64() * state.rate).round() as usize;
            let payload = match outcome {
                PollOutcome::Fault => {
                    return Err(DaqError::transport("lock-in", "data server connection lost"))
                }
                PollOutcome::Empty => json!({}),
                PollOutcome::Data | PollOutcome::DataLoss => Self::payload(
                    &device,
                    state.channel_index,
                    state.signal,
                    samples,
                    outcome == PollOutcome::DataLoss,
                ),
            };
            let delay = state.simulate_timing.then_some(duration);
            (payload, device, state.channel_index, delay)
        };

        if let Some(delay) = delay {
            sleep(delay).await;
        }
        debug!(device = %device, "MockLockIn: served poll");
        Burst::from_payload(&payload, &device, channel_index)
    }

    async fn unsubscribe(&mut self, path: &str) -> AppResult<()> {
        let mut state = lock(&self.state);
        state.subscriptions.retain(|p| p != path);
        Ok(())
    }
}

// =============================================================================
// MockFilterWheel
// =============================================================================

#[derive(Debug)]
struct FilterWheelState {
    connected: bool,
    position: u8,
    call_log: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MockFilterWheel {
    state: Arc<Mutex<FilterWheelState>>,
}

impl Default for MockFilterWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFilterWheel {
    /// Disconnected, in the open position.
    pub fn new() -> Self {
        Self::at_position(1)
    }

    pub fn at_position(position: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(FilterWheelState {
                connected: false,
                position,
                call_log: Vec::new(),
            })),
        }
    }

    pub fn connected() -> Self {
        let mock = Self::new();
        lock(&mock.state).connected = true;
        mock
    }

    pub fn call_log(&self) -> Vec<String> {
        lock(&self.state).call_log.clone()
    }

    pub fn current(&self) -> u8 {
        lock(&self.state).position
    }
}

#[async_trait]
impl FilterWheel for MockFilterWheel {
    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    async fn connect(&mut self) -> AppResult<bool> {
        let mut state = lock(&self.state);
        state.connected = state.position == 1;
        Ok(state.connected)
    }

    async fn position(&mut self) -> AppResult<u8> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(DaqError::not_connected("filter wheel"));
        }
        Ok(state.position)
    }

    async fn set_position(&mut self, position: u8) -> AppResult<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(DaqError::not_connected("filter wheel"));
        }
        if !(1..=6).contains(&position) {
            return Err(DaqError::Configuration(format!(
                "filter wheel position {position} outside 1..=6"
            )));
        }
        state.position = position;
        state.call_log.push(format!("set_position {position}"));
        Ok(())
    }
}
