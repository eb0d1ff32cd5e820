//! Configuration System using Figment
//!
//! Strongly-typed settings for the scan application. Configuration is layered:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. A TOML file (`config/default.toml` unless another path is given)
//! 3. Environment variables prefixed with `SEQE_`, nested keys separated by `__`
//!
//! ```text
//! SEQE_APPLICATION__LOG_LEVEL=debug
//! SEQE_LOCKIN__TIME_CONSTANT_S=0.1
//! SEQE_ACQUISITION__POLL_RETRIES=5
//! ```
//!
//! The instrument/port record (`DeviceRecord`) is deliberately kept outside of the
//! layered settings: it is a single comma-separated line that is written once per
//! workstation, interactively, and reused on every run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AppResult, DaqError};
use crate::scan::bands::{BandAxis, BandTable, WavelengthBand};

/// Default location of the layered configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Longest accepted lock-in time constant, in seconds.
pub const MAX_TIME_CONSTANT_S: f64 = 1000.0;

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationSettings,
    #[serde(default)]
    pub devices: DeviceSettings,
    #[serde(default)]
    pub monochromator: MonochromatorSettings,
    #[serde(default)]
    pub filter_wheel: FilterWheelSettings,
    #[serde(default)]
    pub lockin: LockInSettings,
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
    #[serde(default)]
    pub bands: BandSettings,
    #[serde(default)]
    pub calibration: CalibrationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// One-line `device,filter_port,mono_port,save_path` record.
    pub record_path: PathBuf,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            record_path: PathBuf::from("pathsNdevices_config.txt"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonochromatorSettings {
    pub baud_rate: u32,
    /// The first `HELLO` homes the gratings and filter wheel, which takes a while.
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub scan_speed_nm_per_min: f64,
}

impl Default for MonochromatorSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            connect_timeout_secs: 65,
            command_timeout_secs: 40,
            scan_speed_nm_per_min: 500.0,
        }
    }
}

impl MonochromatorSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterWheelSettings {
    pub baud_rate: u32,
    pub slots: u8,
    pub command_timeout_ms: u64,
}

impl Default for FilterWheelSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            slots: 6,
            command_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInSettings {
    /// Address of the JSON-lines bridge in front of the vendor data server.
    pub bridge_addr: String,
    /// Demodulator/input channel, 1-based.
    pub channel: u8,
    pub time_constant_s: f64,
    /// Demodulator data transfer rate in Sa/s.
    pub rate: f64,
    pub lowpass_order: u8,
    /// Signal input range in V.
    pub input_range: f64,
    pub diff: bool,
    pub ac: bool,
    pub imp50: bool,
    /// 50 Ohm on the reference input attenuates the chopper controller signal.
    pub imp50_reference: bool,
    pub connect_timeout_secs: u64,
}

impl Default for LockInSettings {
    fn default() -> Self {
        Self {
            bridge_addr: "127.0.0.1:8765".to_string(),
            channel: 1,
            time_constant_s: 0.3,
            rate: 100.0,
            lowpass_order: 3,
            input_range: 2.0,
            diff: true,
            ac: false,
            imp50: false,
            imp50_reference: true,
            connect_timeout_secs: 10,
        }
    }
}

impl LockInSettings {
    pub fn time_constant(&self) -> Duration {
        Duration::from_secs_f64(self.time_constant_s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Burst length per point, in time constants.
    pub burst_factor: u32,
    /// Discarded acquisition after a monochromator filter change, in time constants.
    pub filter_settle_factor: u32,
    /// Discarded acquisition after a grating change, in time constants.
    pub grating_settle_factor: u32,
    pub poll_timeout_ms: u64,
    /// Extra polls when the data server returns nothing for the device.
    pub poll_retries: u32,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            burst_factor: 5,
            filter_settle_factor: 5,
            grating_settle_factor: 5,
            poll_timeout_ms: 500,
            poll_retries: 3,
        }
    }
}

impl AcquisitionSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Wavelength band tables for the monochromator filter wheel and gratings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandSettings {
    pub filters: Vec<WavelengthBand>,
    pub gratings: Vec<WavelengthBand>,
}

impl Default for BandSettings {
    fn default() -> Self {
        Self {
            filters: vec![
                WavelengthBand::half_open(200.0, 350.0, 2),
                WavelengthBand::half_open(350.0, 650.0, 3),
                WavelengthBand::half_open(650.0, 985.0, 4),
                WavelengthBand::closed(985.0, 1800.0, 5),
            ],
            gratings: vec![
                WavelengthBand::half_open(350.0, 550.0, 1),
                WavelengthBand::half_open(550.0, 1300.0, 2),
                WavelengthBand::closed(1300.0, 1800.0, 3),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Silicon reference diode responsivity table.
    pub silicon: PathBuf,
    /// InGaAs reference diode responsivity table.
    pub ingaas: PathBuf,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            silicon: PathBuf::from("calibration/FDS100-CAL.csv"),
            ingaas: PathBuf::from("calibration/FGA21-CAL.csv"),
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file and `SEQE_` environment variables.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SEQE_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML string on top of the defaults. Used by tests and tools.
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(content))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks that parsing alone cannot catch.
    pub fn validate(&self) -> AppResult<()> {
        let tc = self.lockin.time_constant_s;
        if !(tc > 0.0 && tc <= MAX_TIME_CONSTANT_S) {
            return Err(DaqError::Configuration(format!(
                "lock-in time constant must be in (0, {MAX_TIME_CONSTANT_S}] s, got {tc}"
            )));
        }
        if self.lockin.channel == 0 {
            return Err(DaqError::Configuration(
                "lock-in channel is 1-based".to_string(),
            ));
        }
        if self.acquisition.burst_factor == 0 {
            return Err(DaqError::Configuration(
                "acquisition.burst_factor must be at least 1".to_string(),
            ));
        }
        if self.filter_wheel.slots == 0 {
            return Err(DaqError::Configuration(
                "filter_wheel.slots must be at least 1".to_string(),
            ));
        }
        BandTable::new(BandAxis::Filter, self.bands.filters.clone())?;
        BandTable::new(BandAxis::Grating, self.bands.gratings.clone())?;
        Ok(())
    }
}

/// Instrument identifiers and data location for this workstation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Lock-in device id on the data server, e.g. `dev2000`.
    pub lockin_device: String,
    /// Serial port of the external (Thorlabs) filter wheel.
    pub filter_port: String,
    /// Serial port of the monochromator.
    pub mono_port: String,
    /// Root directory for measurement data.
    pub save_path: PathBuf,
}

impl DeviceRecord {
    /// Parses `device,filter_port,mono_port,save_path`.
    pub fn parse(line: &str) -> AppResult<Self> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).splitn(4, ',').collect();
        if fields.len() != 4 || fields.iter().any(|f| f.trim().is_empty()) {
            return Err(DaqError::Configuration(format!(
                "device record needs four non-empty fields (device,filter_port,mono_port,save_path), got '{}'",
                line.trim()
            )));
        }
        Ok(Self {
            lockin_device: fields[0].trim().to_string(),
            filter_port: fields[1].trim().to_string(),
            mono_port: fields[2].trim().to_string(),
            save_path: PathBuf::from(fields[3].trim()),
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{},{},{},{}",
            self.lockin_device,
            self.filter_port,
            self.mono_port,
            self.save_path.display()
        )
    }

    /// Reads the record if present.
    ///
    /// A record with an empty field is unusable; the file is removed so that the next
    /// run recreates it, and the parse error is returned.
    pub fn load(path: &Path) -> AppResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        match Self::parse(&content) {
            Ok(record) => {
                info!(
                    device = %record.lockin_device,
                    filter_port = %record.filter_port,
                    mono_port = %record.mono_port,
                    save_path = %record.save_path.display(),
                    "Loaded device record from {}",
                    path.display()
                );
                Ok(Some(record))
            }
            Err(err) => {
                warn!(
                    "Invalid device record in {}; removing it so it can be recreated",
                    path.display()
                );
                fs::remove_file(path)?;
                Err(err)
            }
        }
    }

    /// Loads the record, or asks for its fields and writes it for the next run.
    ///
    /// `prompt` receives a question and returns the operator's answer.
    pub fn load_or_create<F>(path: &Path, mut prompt: F) -> AppResult<Self>
    where
        F: FnMut(&str) -> io::Result<String>,
    {
        if let Some(record) = Self::load(path)? {
            return Ok(record);
        }

        let prefix = Self::port_prefix();
        let lockin_device =
            prompt("Which lock-in device is used? Type the device id, e.g. dev2000: ")?;
        let filter_port = format!(
            "{}{}",
            prefix,
            prompt("Which port number is used by the external filter wheel? Type a number: ")?
                .trim()
        );
        let mono_port = format!(
            "{}{}",
            prefix,
            prompt("Which port number is used by the monochromator? Type a number: ")?.trim()
        );
        let save_path =
            prompt("Where do you want to save your data? Absolute path of the folder: ")?;

        let record = Self::parse(&format!(
            "{},{},{},{}",
            lockin_device.trim(),
            filter_port,
            mono_port,
            save_path.trim()
        ))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, record.to_line())?;
        info!("Device record written to {}", path.display());
        Ok(record)
    }

    /// Serial port name prefix for the host operating system.
    pub fn port_prefix() -> &'static str {
        if cfg!(target_os = "linux") {
            "/dev/ttyUSB"
        } else if cfg!(target_os = "windows") {
            "COM"
        } else {
            "/dev/tty"
        }
    }
}
