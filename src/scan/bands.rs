//! Filter and grating selection by wavelength band.
//!
//! Each axis (monochromator filter wheel, grating turret) has an ordered table of
//! wavelength bands. Boundary semantics are kept per band exactly as configured: most
//! bands are half-open `[low, high)` and the last one is usually closed `[low, high]`.
//! The first band that contains a wavelength wins.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{AcquisitionSettings, BandSettings};
use crate::error::{AppResult, DaqError};
use crate::instrument::capabilities::Monochromator;

/// Which monochromator element a band table drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandAxis {
    Filter,
    Grating,
}

impl fmt::Display for BandAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filter => write!(f, "filter"),
            Self::Grating => write!(f, "grating"),
        }
    }
}

/// A wavelength interval mapped to a filter or grating position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WavelengthBand {
    pub low: f64,
    pub high: f64,
    pub position: u8,
    /// `true` for a closed upper bound `[low, high]`.
    #[serde(default)]
    pub include_high: bool,
}

impl WavelengthBand {
    /// `[low, high)`
    pub fn half_open(low: f64, high: f64, position: u8) -> Self {
        Self {
            low,
            high,
            position,
            include_high: false,
        }
    }

    /// `[low, high]`
    pub fn closed(low: f64, high: f64, position: u8) -> Self {
        Self {
            low,
            high,
            position,
            include_high: true,
        }
    }

    pub fn contains(&self, wavelength: f64) -> bool {
        if self.include_high {
            self.low <= wavelength && wavelength <= self.high
        } else {
            self.low <= wavelength && wavelength < self.high
        }
    }
}

impl fmt::Display for WavelengthBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let close = if self.include_high { ']' } else { ')' };
        write!(
            f,
            "[{}, {}{} -> {}",
            self.low, self.high, close, self.position
        )
    }
}

/// Ordered, contiguous, non-overlapping bands for one axis.
#[derive(Debug, Clone, PartialEq)]
pub struct BandTable {
    axis: BandAxis,
    bands: Vec<WavelengthBand>,
}

impl BandTable {
    pub fn new(axis: BandAxis, bands: Vec<WavelengthBand>) -> AppResult<Self> {
        if bands.is_empty() {
            return Err(DaqError::Configuration(format!(
                "{axis} band table is empty"
            )));
        }
        for band in &bands {
            if !(band.low.is_finite() && band.high.is_finite() && band.low < band.high) {
                return Err(DaqError::Configuration(format!(
                    "{axis} band {band} has an empty or invalid interval"
                )));
            }
        }
        for pair in bands.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if prev.high > next.low {
                return Err(DaqError::Configuration(format!(
                    "{axis} bands {prev} and {next} overlap or are out of order"
                )));
            }
            if prev.high < next.low {
                return Err(DaqError::Configuration(format!(
                    "{axis} bands {prev} and {next} leave a gap"
                )));
            }
        }
        Ok(Self { axis, bands })
    }

    pub fn axis(&self) -> BandAxis {
        self.axis
    }

    pub fn bands(&self) -> &[WavelengthBand] {
        &self.bands
    }

    /// Position of the first band containing `wavelength`.
    pub fn resolve(&self, wavelength: f64) -> AppResult<u8> {
        self.bands
            .iter()
            .find(|band| band.contains(wavelength))
            .map(|band| band.position)
            .ok_or(DaqError::OutOfRange {
                axis: self.axis,
                wavelength,
            })
    }
}

/// Outcome of [`RangeSwitchPolicy::apply_if_changed`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SwitchAction {
    Unchanged,
    /// The element moved; the next `settle` worth of acquisition must be discarded.
    Switched {
        axis: BandAxis,
        from: u8,
        to: u8,
        settle: Duration,
    },
}

/// Decides filter and grating positions for a wavelength and issues the switch commands.
#[derive(Debug, Clone)]
pub struct RangeSwitchPolicy {
    filters: BandTable,
    gratings: BandTable,
    filter_settle_factor: u32,
    grating_settle_factor: u32,
}

impl RangeSwitchPolicy {
    pub fn new(filters: BandTable, gratings: BandTable) -> Self {
        Self {
            filters,
            gratings,
            filter_settle_factor: 5,
            grating_settle_factor: 5,
        }
    }

    pub fn from_settings(
        bands: &BandSettings,
        acquisition: &AcquisitionSettings,
    ) -> AppResult<Self> {
        Ok(Self::new(
            BandTable::new(BandAxis::Filter, bands.filters.clone())?,
            BandTable::new(BandAxis::Grating, bands.gratings.clone())?,
        )
        .with_filter_settle_factor(acquisition.filter_settle_factor)
        .with_grating_settle_factor(acquisition.grating_settle_factor))
    }

    pub fn with_filter_settle_factor(mut self, factor: u32) -> Self {
        self.filter_settle_factor = factor;
        self
    }

    pub fn with_grating_settle_factor(mut self, factor: u32) -> Self {
        self.grating_settle_factor = factor;
        self
    }

    pub fn table(&self, axis: BandAxis) -> &BandTable {
        match axis {
            BandAxis::Filter => &self.filters,
            BandAxis::Grating => &self.gratings,
        }
    }

    pub fn resolve_filter(&self, wavelength: f64) -> AppResult<u8> {
        self.filters.resolve(wavelength)
    }

    pub fn resolve_grating(&self, wavelength: f64) -> AppResult<u8> {
        self.gratings.resolve(wavelength)
    }

    pub fn resolve(&self, axis: BandAxis, wavelength: f64) -> AppResult<u8> {
        self.table(axis).resolve(wavelength)
    }

    /// Length of the discarded acquisition after switching `axis`.
    pub fn settle_duration(&self, axis: BandAxis, time_constant: Duration) -> Duration {
        let factor = match axis {
            BandAxis::Filter => self.filter_settle_factor,
            BandAxis::Grating => self.grating_settle_factor,
        };
        time_constant * factor
    }

    /// Sends a switch command only when `desired` differs from `current`.
    pub async fn apply_if_changed(
        &self,
        axis: BandAxis,
        current: u8,
        desired: u8,
        monochromator: &mut dyn Monochromator,
        time_constant: Duration,
    ) -> AppResult<SwitchAction> {
        if desired == current {
            return Ok(SwitchAction::Unchanged);
        }

        match axis {
            BandAxis::Filter => monochromator.select_filter(desired).await?,
            BandAxis::Grating => monochromator.select_grating(desired).await?,
        }
        info!(%axis, from = current, to = desired, "Switched monochromator {axis}");

        Ok(SwitchAction::Switched {
            axis,
            from: current,
            to: desired,
            settle: self.settle_duration(axis, time_constant),
        })
    }

    /// Resolves and applies `axis` for `wavelength`.
    ///
    /// A wavelength outside the table is logged and the element stays where it is; the
    /// error is returned alongside so callers can report it.
    pub async fn evaluate(
        &self,
        axis: BandAxis,
        wavelength: f64,
        current: u8,
        monochromator: &mut dyn Monochromator,
        time_constant: Duration,
    ) -> AppResult<(SwitchAction, Option<DaqError>)> {
        match self.resolve(axis, wavelength) {
            Ok(desired) => {
                let action = self
                    .apply_if_changed(axis, current, desired, monochromator, time_constant)
                    .await?;
                Ok((action, None))
            }
            Err(err) if err.is_recoverable() => {
                warn!(%axis, wavelength, position = current, "{err}; keeping current position");
                Ok((SwitchAction::Unchanged, Some(err)))
            }
            Err(err) => Err(err),
        }
    }
}
