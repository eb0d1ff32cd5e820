//! The scan orchestrator.
//!
//! `MeasurementController` owns the three instruments for the lifetime of the program.
//! Each band measurement borrows them into a short-lived [`ScanSession`], which drives
//! the per-wavelength loop:
//!
//! 1. stop requested? -> `Cancelled`
//! 2. monochromator filter and grating for this wavelength, discarding a settle burst
//!    after any switch
//! 3. move to the wavelength
//! 4. poll one burst of `burst_factor × time constant` (retried if the server has no
//!    samples yet)
//! 5. aggregate, compute power for reference scans, append + flush the row
//!
//! A transport fault anywhere in the loop moves the session to `Faulted`; the lock-in
//! subscription is released on every exit path and rows already written stay on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::calibration::{self, CalibrationCurve};
use crate::config::{AcquisitionSettings, Settings};
use crate::error::{AppResult, DaqError};
use crate::instrument::capabilities::{FilterWheel, LockInDevice, Monochromator};
use crate::instrument::fw102c::OPEN_POSITION;
use crate::instrument::lockin::{Burst, LockInParameters, LockInSession};
use crate::naming::FileNamingResolver;
use crate::scan::aggregate::{Aggregator, Reduction};
use crate::scan::bands::{BandAxis, RangeSwitchPolicy, SwitchAction};
use crate::scan::events::{PlotSeries, ScanEvent, ScanState, SkipReason, StopHandle};
use crate::scan::job::ScanJob;
use crate::scan::request::{BandScan, ScanRequest};
use crate::storage::{self, ManifestEntry, ScanWriter};

const EVENT_CAPACITY: usize = 1024;

/// The instrument set a controller drives.
pub struct Instruments {
    pub monochromator: Box<dyn Monochromator>,
    pub lockin: Box<dyn LockInDevice>,
    pub filter_wheel: Box<dyn FilterWheel>,
}

impl Instruments {
    pub fn new(
        monochromator: impl Monochromator + 'static,
        lockin: impl LockInDevice + 'static,
        filter_wheel: impl FilterWheel + 'static,
    ) -> Self {
        Self {
            monochromator: Box::new(monochromator),
            lockin: Box::new(lockin),
            filter_wheel: Box::new(filter_wheel),
        }
    }
}

/// Positions the controller believes the hardware is in during a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentState {
    pub current_filter: u8,
    pub current_grating: u8,
    pub amplification: f64,
}

/// Outcome of one band.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub band_id: String,
    pub path: PathBuf,
    pub state: ScanState,
    pub rows: usize,
    pub skipped: usize,
    pub out_of_range: usize,
    pub plot: PlotSeries,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
}

/// Outcome of a whole request.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: ScanState,
    pub bands: Vec<ScanReport>,
    pub manifest: Vec<ManifestEntry>,
    pub manifest_path: Option<PathBuf>,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
}

impl RunReport {
    pub fn rows(&self) -> usize {
        self.bands.iter().map(|b| b.rows).sum()
    }
}

pub struct MeasurementController {
    settings: Settings,
    save_path: PathBuf,
    instruments: Instruments,
    policy: RangeSwitchPolicy,
    lockin_session: Option<LockInSession>,
    stop: StopHandle,
    state: ScanState,
    events: broadcast::Sender<ScanEvent>,
}

impl MeasurementController {
    /// `save_path` is the data root; files go to `{save_path}/{user}/{experiment}`.
    pub fn new(settings: Settings, save_path: impl Into<PathBuf>, instruments: Instruments) -> AppResult<Self> {
        settings.validate()?;
        let policy = RangeSwitchPolicy::from_settings(&settings.bands, &settings.acquisition)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            settings,
            save_path: save_path.into(),
            instruments,
            policy,
            lockin_session: None,
            stop: StopHandle::new(),
            state: ScanState::Idle,
            events,
        })
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Direct access for manual instrument control between scans.
    pub fn instruments_mut(&mut self) -> &mut Instruments {
        &mut self.instruments
    }

    /// Connects all instruments; fails with `NotConnected` if any of them refuses.
    pub async fn connect_all(&mut self, lockin_device: &str) -> AppResult<()> {
        if !self.instruments.monochromator.connect().await? {
            warn!("Monochromator connection could not be established");
        }
        let session = self.instruments.lockin.connect(lockin_device).await?;
        self.lockin_session = Some(session);
        if !self.instruments.filter_wheel.connect().await? {
            warn!("Filter wheel connection could not be established");
        }
        self.ensure_connected()
    }

    fn ensure_connected(&self) -> AppResult<()> {
        let mut missing = Vec::new();
        if !self.instruments.monochromator.is_connected() {
            missing.push("monochromator".to_string());
        }
        if !self.instruments.lockin.is_connected() || self.lockin_session.is_none() {
            missing.push("lock-in".to_string());
        }
        if !self.instruments.filter_wheel.is_connected() {
            missing.push("filter wheel".to_string());
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DaqError::NotConnected { missing })
        }
    }

    fn set_state(&mut self, state: ScanState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Scan state changed");
        }
        self.state = state;
        let _ = self.events.send(ScanEvent::StateChanged(state));
    }

    /// Measures every band of `request` in order.
    ///
    /// Bands with a wheel position move the external filter wheel first. After the last
    /// band both filter wheels go back to their open position. A stop request ends the
    /// run after the current wavelength. A stop requested before `run` is called (for
    /// example while `connect_all` homes the monochromator) cancels the run before its
    /// first band; the flag is cleared once the run has ended.
    pub async fn run(&mut self, request: &ScanRequest) -> AppResult<RunReport> {
        let result = self.run_bands(request).await;
        self.stop.reset();
        result
    }

    async fn run_bands(&mut self, request: &ScanRequest) -> AppResult<RunReport> {
        request.validate()?;
        self.ensure_connected()?;
        let calibration = match request.reference {
            Some(diode) => {
                let path = diode.calibration_path(&self.settings.calibration);
                info!(reference = %diode, "Loading calibration from '{}'", path.display());
                Some(CalibrationCurve::load_csv(path)?)
            }
            None => None,
        };

        let started = Local::now();
        let mut bands = Vec::with_capacity(request.bands.len());
        let mut manifest = Vec::with_capacity(request.bands.len());

        for band in &request.bands {
            if self.stop.is_requested() {
                break;
            }
            if let Some(position) = band.wheel_position {
                info!(band = %band.id, position, "Moving external filter wheel");
                if let Err(err) = self.instruments.filter_wheel.set_position(position).await {
                    error!(band = %band.id, "Filter wheel move failed: {err}");
                    self.set_state(ScanState::Faulted);
                    return Err(err);
                }
            }
            manifest.push(band.manifest_entry());
            let report = self.measure_band(request, band, calibration.as_ref()).await?;
            bands.push(report);
        }

        let cancelled = self.stop.is_requested()
            || bands.iter().any(|b| b.state == ScanState::Cancelled);
        let state = if cancelled {
            info!("Measurement stopped");
            ScanState::Cancelled
        } else {
            if let Err(err) = self.return_to_open().await {
                self.set_state(ScanState::Faulted);
                return Err(err);
            }
            info!("Finished measurement");
            ScanState::Completed
        };

        let manifest_path = if request.write_manifest && !manifest.is_empty() {
            let resolver =
                FileNamingResolver::new(request.output_dir(&self.save_path)).with_extension("csv");
            let name = resolver.resolve(&format!("{}_parameters", request.file_name))?;
            let path = resolver.path_for(&name);
            storage::write_manifest(&path, &manifest)?;
            Some(path)
        } else {
            None
        };

        self.set_state(state);
        Ok(RunReport {
            state,
            bands,
            manifest,
            manifest_path,
            started,
            finished: Local::now(),
        })
    }

    async fn return_to_open(&mut self) -> AppResult<()> {
        self.instruments
            .filter_wheel
            .set_position(OPEN_POSITION)
            .await?;
        info!("Moving to open filter");
        self.instruments.monochromator.select_filter(1).await?;
        Ok(())
    }

    /// Measures a single band: lock-in gain, scan speed, output file, then the scan loop.
    pub async fn measure_band(
        &mut self,
        request: &ScanRequest,
        band: &BandScan,
        calibration: Option<&CalibrationCurve>,
    ) -> AppResult<ScanReport> {
        self.ensure_connected()?;
        let job = band.job()?;
        self.set_state(ScanState::Preparing);

        match self.prepare_and_scan(request, band, job, calibration).await {
            Ok(report) => {
                self.set_state(report.state);
                Ok(report)
            }
            Err(err) => {
                error!(band = %band.id, "Measurement aborted: {err}");
                self.set_state(ScanState::Faulted);
                Err(err)
            }
        }
    }

    async fn prepare_and_scan(
        &mut self,
        request: &ScanRequest,
        band: &BandScan,
        job: ScanJob,
        calibration: Option<&CalibrationCurve>,
    ) -> AppResult<ScanReport> {
        let started = Local::now();
        let parameters = LockInParameters::from_settings(&self.settings.lockin, band.amplification);
        self.instruments.lockin.configure(&parameters).await?;
        let speed = request
            .scan_speed
            .unwrap_or(self.settings.monochromator.scan_speed_nm_per_min);
        self.instruments.monochromator.set_scan_speed(speed).await?;

        let path = self.output_path(request, band)?;
        let writer = ScanWriter::create(&path, calibration.is_some())?;

        let instrument = InstrumentState {
            current_filter: self.instruments.monochromator.query_filter().await?,
            current_grating: self.instruments.monochromator.query_grating().await?,
            amplification: band.amplification,
        };
        let sample_path = self
            .lockin_session
            .as_ref()
            .ok_or_else(|| DaqError::not_connected("lock-in"))?
            .sample_path(self.settings.lockin.channel);
        self.instruments.lockin.subscribe(&sample_path).await?;
        self.set_state(ScanState::Scanning);
        info!(band = %band.id, points = job.len(), "Scanning {}-{} nm", job.start(), job.stop());

        let mut session = ScanSession {
            band_id: &band.id,
            monochromator: self.instruments.monochromator.as_mut(),
            lockin: self.instruments.lockin.as_mut(),
            policy: &self.policy,
            acquisition: &self.settings.acquisition,
            time_constant: self.settings.lockin.time_constant(),
            events: &self.events,
            stop: &self.stop,
            calibration,
            aggregator: Aggregator::new(band.amplification),
            writer,
            instrument,
            plot: PlotSeries::default(),
            skipped: 0,
            out_of_range: 0,
        };

        let outcome = session.scan(&job).await;
        let released = session.lockin.unsubscribe(&sample_path).await;

        let state = match (outcome, released) {
            (Ok(state), Ok(())) => state,
            (Ok(_), Err(err)) => return Err(err),
            (Err(err), Err(release_err)) => {
                warn!("Unsubscribe after fault failed: {release_err}");
                return Err(err);
            }
            (Err(err), Ok(())) => return Err(err),
        };

        Ok(ScanReport {
            band_id: band.id.clone(),
            path,
            state,
            rows: session.writer.rows(),
            skipped: session.skipped,
            out_of_range: session.out_of_range,
            plot: session.plot,
            started,
            finished: Local::now(),
        })
    }

    fn output_path(&self, request: &ScanRequest, band: &BandScan) -> AppResult<PathBuf> {
        let dir = request.output_dir(&self.save_path);
        info!("Saving data to: {}", dir.display());
        fs::create_dir_all(&dir)?;
        let resolver = FileNamingResolver::new(&dir).with_extension("csv");
        let name = resolver.resolve(&request.file_name_for(band))?;
        Ok(resolver.path_for(&name))
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }
}

/// Borrowed view of the instruments for one band.
struct ScanSession<'a> {
    band_id: &'a str,
    monochromator: &'a mut dyn Monochromator,
    lockin: &'a mut dyn LockInDevice,
    policy: &'a RangeSwitchPolicy,
    acquisition: &'a AcquisitionSettings,
    time_constant: Duration,
    events: &'a broadcast::Sender<ScanEvent>,
    stop: &'a StopHandle,
    calibration: Option<&'a CalibrationCurve>,
    aggregator: Aggregator,
    writer: ScanWriter,
    instrument: InstrumentState,
    plot: PlotSeries,
    skipped: usize,
    out_of_range: usize,
}

impl ScanSession<'_> {
    async fn scan(&mut self, job: &ScanJob) -> AppResult<ScanState> {
        for wavelength in job.iter() {
            if self.stop.is_requested() {
                info!(band = %self.band_id, wavelength, "Stop requested");
                return Ok(ScanState::Cancelled);
            }
            if let Err(err) = self.measure_point(wavelength).await {
                error!(band = %self.band_id, wavelength, "Scan aborted: {err}");
                return Err(err);
            }
        }
        Ok(ScanState::Completed)
    }

    async fn measure_point(&mut self, wavelength: f64) -> AppResult<()> {
        self.switch_if_needed(BandAxis::Filter, wavelength).await?;
        self.switch_if_needed(BandAxis::Grating, wavelength).await?;

        self.monochromator.goto_wavelength(wavelength).await?;

        let burst = self.acquire(wavelength).await?;
        match self.aggregator.reduce(wavelength, burst.as_ref()) {
            Reduction::Row(mut row) => {
                if let Some(curve) = self.calibration {
                    match calibration::power(&row, curve) {
                        Ok(power) => row.power = Some(power),
                        Err(err) if err.is_recoverable() => {
                            warn!(band = %self.band_id, wavelength, "{err}; row kept without power");
                        }
                        Err(err) => return Err(err),
                    }
                }
                self.writer.append(&row)?;
                self.plot.push(&row);
                let _ = self.events.send(ScanEvent::Row(row));
            }
            Reduction::DiscardedInitial => self.skip(wavelength, SkipReason::InitialTransient),
            Reduction::DataLoss => {
                warn!(band = %self.band_id, "{}; point skipped", DaqError::DataLoss { wavelength });
                self.skip(wavelength, SkipReason::DataLoss);
            }
            Reduction::NoData => {
                warn!(band = %self.band_id, wavelength, "No lock-in data; point skipped");
                self.skip(wavelength, SkipReason::NoData);
            }
        }
        Ok(())
    }

    fn skip(&mut self, wavelength: f64, reason: SkipReason) {
        if reason != SkipReason::InitialTransient {
            self.skipped += 1;
        }
        let _ = self
            .events
            .send(ScanEvent::PointSkipped { wavelength, reason });
    }

    async fn switch_if_needed(&mut self, axis: BandAxis, wavelength: f64) -> AppResult<()> {
        let current = match axis {
            BandAxis::Filter => self.instrument.current_filter,
            BandAxis::Grating => self.instrument.current_grating,
        };
        let (action, out_of_range) = self
            .policy
            .evaluate(axis, wavelength, current, &mut *self.monochromator, self.time_constant)
            .await?;
        if out_of_range.is_some() {
            self.out_of_range += 1;
        }

        if let SwitchAction::Switched { to, settle, .. } = action {
            match axis {
                BandAxis::Filter => self.instrument.current_filter = to,
                BandAxis::Grating => self.instrument.current_grating = to,
            }
            let _ = self.events.send(ScanEvent::Switched(action));
            // Settling transient: acquired and thrown away.
            self.lockin
                .poll(settle, self.acquisition.poll_timeout())
                .await?;
            debug!(%axis, wavelength, ?settle, "Discarded settle burst");
        }
        Ok(())
    }

    /// One burst, polling again while the server has no samples for the device.
    async fn acquire(&mut self, wavelength: f64) -> AppResult<Option<Burst>> {
        let duration = self.time_constant * self.acquisition.burst_factor;
        let timeout = self.acquisition.poll_timeout();
        let mut attempt = 0;
        loop {
            let burst = self.lockin.poll(duration, timeout).await?;
            if burst.is_some() || attempt >= self.acquisition.poll_retries {
                return Ok(burst);
            }
            attempt += 1;
            debug!(wavelength, attempt, "Empty poll, retrying");
        }
    }
}
