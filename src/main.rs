//! CLI entry point for seqe_daq
//!
//! Provides command-line access to:
//! - Wavelength scans described by a TOML request (single range or composite)
//! - Manual monochromator and filter wheel control
//! - The per-workstation device record
//!
//! # Usage
//!
//! ```bash
//! seqe_daq scan --request requests/device1.toml
//! seqe_daq scan --request requests/device1.toml --manifest data/alice/P3HT/device1_parameters.csv
//! seqe_daq --simulate scan --request requests/device1.toml --save-path /tmp/seqe
//! seqe_daq mono goto 532.5
//! seqe_daq wheel 3
//! ```
//!
//! Log output is controlled by `RUST_LOG`, falling back to `application.log_level`.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use seqe_daq::config::{DeviceRecord, Settings};
use seqe_daq::error::AppResult;
use seqe_daq::instrument::bridge::BridgeLockIn;
use seqe_daq::instrument::mock::{MockFilterWheel, MockLockIn, MockMonochromator};
use seqe_daq::instrument::{FilterWheel, LockInDevice, Monochromator};
use seqe_daq::scan::{Instruments, MeasurementController, ScanEvent, ScanRequest};
use seqe_daq::storage;

const SIMULATED_LOCKIN: &str = "dev0000";

#[derive(Parser)]
#[command(name = "seqe_daq")]
#[command(about = "sEQE wavelength scans with monochromator, lock-in and filter wheel", long_about = None)]
struct Cli {
    /// Configuration file (default: config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use simulated instruments instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scan described by a request file
    Scan {
        /// TOML scan request
        #[arg(long)]
        request: PathBuf,

        /// Saved parameter manifest overriding band ranges and amplifications
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Data root, overriding the device record
        #[arg(long)]
        save_path: Option<PathBuf>,
    },

    /// Manual monochromator control
    Mono {
        #[command(subcommand)]
        action: MonoAction,
    },

    /// Move the external filter wheel
    Wheel {
        /// Slot, 1-based
        position: u8,
    },

    /// Show the device record, creating it interactively if missing
    Devices {
        /// Discard the stored record and ask again
        #[arg(long)]
        reset: bool,
    },
}

#[derive(Subcommand)]
enum MonoAction {
    /// Move to a wavelength in nm
    Goto { nm: f64 },
    /// Set the scan speed in nm/min
    Speed { nm_per_min: f64 },
    /// Select a grating
    Grating { grating: u8 },
    /// Select a filter of the internal wheel
    Filter { filter: u8 },
    /// Re-reference the internal filter wheel from its current position
    InitFilter { start_position: u8 },
    /// Print current filter and grating
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&settings.application.log_level);

    match cli.command {
        Commands::Scan {
            request,
            manifest,
            save_path,
        } => run_scan(settings, cli.simulate, &request, manifest.as_deref(), save_path).await,
        Commands::Mono { action } => run_mono(&settings, cli.simulate, action).await,
        Commands::Wheel { position } => run_wheel(&settings, cli.simulate, position).await,
        Commands::Devices { reset } => show_devices(&settings, reset),
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn prompt(question: &str) -> io::Result<String> {
    print!("{question}");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().to_string())
}

fn device_record(settings: &Settings, simulate: bool) -> Result<DeviceRecord> {
    if simulate {
        return Ok(DeviceRecord {
            lockin_device: SIMULATED_LOCKIN.to_string(),
            filter_port: "sim".to_string(),
            mono_port: "sim".to_string(),
            save_path: PathBuf::from("data"),
        });
    }
    DeviceRecord::load_or_create(&settings.devices.record_path, prompt)
        .context("reading device record")
}

#[cfg(feature = "instrument_serial")]
fn open_serial(
    settings: &Settings,
    record: &DeviceRecord,
) -> AppResult<(Box<dyn Monochromator>, Box<dyn FilterWheel>)> {
    use seqe_daq::instrument::fw102c::Fw102c;
    use seqe_daq::instrument::hrs300::Hrs300;

    let monochromator = Hrs300::open(&record.mono_port, &settings.monochromator)?;
    let filter_wheel = Fw102c::open(&record.filter_port, &settings.filter_wheel)?;
    Ok((Box::new(monochromator), Box::new(filter_wheel)))
}

#[cfg(not(feature = "instrument_serial"))]
fn open_serial(
    _settings: &Settings,
    _record: &DeviceRecord,
) -> AppResult<(Box<dyn Monochromator>, Box<dyn FilterWheel>)> {
    Err(seqe_daq::error::DaqError::FeatureNotEnabled(
        "instrument_serial".to_string(),
    ))
}

fn serial_instruments(
    settings: &Settings,
    record: &DeviceRecord,
    simulate: bool,
) -> AppResult<(Box<dyn Monochromator>, Box<dyn FilterWheel>)> {
    if simulate {
        return Ok((
            Box::new(MockMonochromator::new()),
            Box::new(MockFilterWheel::new()),
        ));
    }
    open_serial(settings, record)
}

async fn open_instruments(
    settings: &Settings,
    record: &DeviceRecord,
    simulate: bool,
) -> AppResult<Instruments> {
    let (monochromator, filter_wheel) = serial_instruments(settings, record, simulate)?;
    let lockin: Box<dyn LockInDevice> = if simulate {
        info!("Using simulated instruments");
        Box::new(MockLockIn::new().with_real_timing())
    } else {
        Box::new(BridgeLockIn::open(&settings.lockin).await?)
    };
    Ok(Instruments {
        monochromator,
        lockin,
        filter_wheel,
    })
}

async fn run_scan(
    settings: Settings,
    simulate: bool,
    request_path: &Path,
    manifest: Option<&Path>,
    save_path: Option<PathBuf>,
) -> Result<()> {
    let mut request = ScanRequest::load(request_path)?;
    if let Some(manifest) = manifest {
        request.apply_manifest(&storage::load_manifest(manifest)?)?;
        info!("Applied parameters from '{}'", manifest.display());
    }

    let record = device_record(&settings, simulate)?;
    let save_path = save_path.unwrap_or_else(|| record.save_path.clone());
    let instruments = open_instruments(&settings, &record, simulate).await?;
    let mut controller = MeasurementController::new(settings, save_path, instruments)?;
    controller.connect_all(&record.lockin_device).await?;

    let stop = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Stop requested; finishing the current wavelength");
            stop.request();
        }
    });

    let mut events = controller.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ScanEvent::Row(row)) => info!(
                    "{:>8.2} nm  R = {:.4e} V  I = {:.4e} A  phase = {:.2}",
                    row.wavelength, row.mean_r, row.mean_current, row.mean_phase
                ),
                Ok(ScanEvent::PointSkipped { wavelength, reason }) => {
                    info!("{wavelength:>8.2} nm  skipped ({reason:?})");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!("Progress display missed {missed} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let report = controller.run(&request).await?;
    println!();
    println!("Scan {:?}: {} rows", report.state, report.rows());
    for band in &report.bands {
        println!(
            "  {:<6} {:>5} rows  {:>3} skipped  -> {}",
            band.band_id,
            band.rows,
            band.skipped,
            band.path.display()
        );
    }
    if let Some(path) = &report.manifest_path {
        println!("  parameters -> {}", path.display());
    }
    Ok(())
}

async fn run_mono(settings: &Settings, simulate: bool, action: MonoAction) -> Result<()> {
    let record = device_record(settings, simulate)?;
    let (mut mono, _) = serial_instruments(settings, &record, simulate)?;
    if !mono.connect().await? {
        bail!("monochromator did not answer");
    }
    match action {
        MonoAction::Goto { nm } => mono.goto_wavelength(nm).await?,
        MonoAction::Speed { nm_per_min } => mono.set_scan_speed(nm_per_min).await?,
        MonoAction::Grating { grating } => mono.select_grating(grating).await?,
        MonoAction::Filter { filter } => mono.select_filter(filter).await?,
        MonoAction::InitFilter { start_position } => mono.initialize_filter(start_position).await?,
        MonoAction::Status => {
            let filter = mono.query_filter().await?;
            let grating = mono.query_grating().await?;
            println!("filter {filter}, grating {grating}");
        }
    }
    Ok(())
}

async fn run_wheel(settings: &Settings, simulate: bool, position: u8) -> Result<()> {
    let record = device_record(settings, simulate)?;
    let (_, mut wheel) = serial_instruments(settings, &record, simulate)?;
    if !wheel.connect().await? {
        bail!("filter wheel is not in the open position; move it to slot 1 first");
    }
    wheel.set_position(position).await?;
    println!("filter wheel at {}", wheel.position().await?);
    Ok(())
}

fn show_devices(settings: &Settings, reset: bool) -> Result<()> {
    let path = &settings.devices.record_path;
    if reset && path.exists() {
        std::fs::remove_file(path)?;
    }
    let record = DeviceRecord::load_or_create(path, prompt)?;
    println!("lock-in       {}", record.lockin_device);
    println!("filter wheel  {}", record.filter_port);
    println!("monochromator {}", record.mono_port);
    println!("save path     {}", record.save_path.display());
    Ok(())
}
