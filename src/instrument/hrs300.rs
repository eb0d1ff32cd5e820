//! Princeton Instruments HRS-300 monochromator driver
//!
//! Protocol Overview:
//! - ASCII commands terminated by `\r`
//! - Every command is acknowledged by a line ending in `ok\r\n`; progress chatter may
//!   precede it
//! - Queries answer on the acknowledgement line: `?filter` -> `3  ok\r\n`. A bare
//!   `ok\r\n` to `?filter` means the wheel sits between positions (reported as 0)
//! - `HELLO` homes gratings and filter wheel and can take the better part of a minute
//!
//! The HRS-300 filter wheel also has manual controls on the front panel, so a scan
//! reads filter and grating back at the start of every band instead of trusting the
//! positions it last commanded.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::config::MonochromatorSettings;
use crate::error::{AppResult, DaqError};
use crate::instrument::capabilities::Monochromator;
use crate::instrument::serial_helper::LineTransport;

const DEVICE: &str = "monochromator";
const ACK: &str = "ok\r\n";
/// Filter position the wheel is driven back from before `FHOME`.
const FILTER_HOME_OFFSET: u8 = 8;

pub struct Hrs300<S> {
    transport: LineTransport<S>,
    connected: bool,
    connect_timeout: Duration,
    command_timeout: Duration,
}

#[cfg(feature = "instrument_serial")]
impl Hrs300<tokio_serial::SerialStream> {
    /// Opens the serial port; [`Monochromator::connect`] must still be called.
    pub fn open(port_path: &str, settings: &MonochromatorSettings) -> AppResult<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(port_path, settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DaqError::transport(DEVICE, format!("failed to open serial port {port_path}: {e}"))
            })?;
        Ok(Self::new(port, settings))
    }
}

impl<S> Hrs300<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, settings: &MonochromatorSettings) -> Self {
        Self {
            transport: LineTransport::new(DEVICE, stream),
            connected: false,
            connect_timeout: settings.connect_timeout(),
            command_timeout: settings.command_timeout(),
        }
    }

    async fn command(&mut self, command: &str) -> AppResult<String> {
        if !self.connected {
            return Err(DaqError::not_connected(DEVICE));
        }
        self.transport.write_command(command).await?;
        self.transport
            .read_line_ending_with(ACK, self.command_timeout)
            .await
    }
}

/// Extracts the position number from a `<n>  ok\r\n` reply.
///
/// `bare_ok_means` is the value of a reply without a number, if that is allowed.
pub fn parse_position(reply: &str, bare_ok_means: Option<u8>) -> AppResult<u8> {
    let body = reply
        .trim_end()
        .strip_suffix("ok")
        .ok_or_else(|| DaqError::Instrument(format!("unexpected monochromator reply {reply:?}")))?;

    match body.split_whitespace().last() {
        Some(token) => token.parse::<u8>().map_err(|_| {
            DaqError::Instrument(format!("unexpected monochromator reply {reply:?}"))
        }),
        None => bare_ok_means.ok_or_else(|| {
            DaqError::Instrument(format!("monochromator reply {reply:?} carries no position"))
        }),
    }
}

#[async_trait]
impl<S> Monochromator for Hrs300<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> AppResult<bool> {
        self.transport.write_command("HELLO").await?;
        match self
            .transport
            .read_line_ending_with(ACK, self.connect_timeout)
            .await
        {
            Ok(_) => {
                self.connected = true;
                info!("Connection to monochromator established");
            }
            Err(DaqError::Timeout { after, .. }) => {
                warn!("Monochromator did not acknowledge HELLO within {:?}", after);
                self.connected = false;
            }
            Err(err) => return Err(err),
        }
        Ok(self.connected)
    }

    async fn goto_wavelength(&mut self, nm: f64) -> AppResult<()> {
        self.command(&format!("{nm:.2} GOTO")).await?;
        Ok(())
    }

    async fn set_scan_speed(&mut self, nm_per_min: f64) -> AppResult<()> {
        self.command(&format!("{nm_per_min:.2} NM/MIN")).await?;
        info!("Monochromator scan speed set to {nm_per_min} nm/min");
        Ok(())
    }

    async fn select_grating(&mut self, grating: u8) -> AppResult<()> {
        info!("Moving to grating {grating}");
        self.command(&format!("{grating} grating")).await?;
        Ok(())
    }

    async fn select_filter(&mut self, filter: u8) -> AppResult<()> {
        info!("Moving to monochromator filter {filter}");
        self.command(&format!("{filter} FILTER")).await?;
        Ok(())
    }

    async fn query_filter(&mut self) -> AppResult<u8> {
        let reply = self.command("?filter").await?;
        parse_position(&reply, Some(0))
    }

    async fn query_grating(&mut self) -> AppResult<u8> {
        let reply = self.command("?grating").await?;
        parse_position(&reply, None)
    }

    async fn initialize_filter(&mut self, start_position: u8) -> AppResult<()> {
        if !self.connected {
            return Err(DaqError::not_connected(DEVICE));
        }
        let diff = FILTER_HOME_OFFSET.checked_sub(start_position).ok_or_else(|| {
            DaqError::Configuration(format!(
                "filter start position {start_position} exceeds {FILTER_HOME_OFFSET}"
            ))
        })?;
        info!("Initializing monochromator filter wheel");
        self.transport.write_command(&format!("{diff} FILTER")).await?;
        self.transport.write_command("FHOME").await?;
        self.transport
            .read_line_ending_with(ACK, self.command_timeout)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn settings() -> MonochromatorSettings {
        MonochromatorSettings {
            connect_timeout_secs: 1,
            command_timeout_secs: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_position() {
        assert_eq!(parse_position("?filter 3  ok\r\n", Some(0)).unwrap(), 3);
        assert_eq!(parse_position("2  ok\r\n", None).unwrap(), 2);
        assert_eq!(parse_position("ok\r\n", Some(0)).unwrap(), 0);
        assert!(parse_position("ok\r\n", None).is_err());
        assert!(parse_position("error\r\n", Some(0)).is_err());
    }

    #[tokio::test]
    async fn commands_are_refused_before_connect() {
        let mut mono = Hrs300::new(Builder::new().build(), &settings());
        let err = mono.goto_wavelength(500.0).await.unwrap_err();
        assert!(matches!(err, DaqError::DeviceNotConnected { .. }));
    }

    #[tokio::test]
    async fn wavelength_and_query_round_trip() {
        let mock = Builder::new()
            .write(b"HELLO\r")
            .read(b"ok\r\n")
            .write(b"532.50 GOTO\r")
            .read(b"  ok\r\n")
            .write(b"?grating\r")
            .read(b" 2  ok\r\n")
            .write(b"4 FILTER\r")
            .read(b"ok\r\n")
            .build();
        let mut mono = Hrs300::new(mock, &settings());

        assert!(mono.connect().await.unwrap());
        mono.goto_wavelength(532.5).await.unwrap();
        assert_eq!(mono.query_grating().await.unwrap(), 2);
        mono.select_filter(4).await.unwrap();
    }

    #[tokio::test]
    async fn filter_initialization_offsets_from_eight() {
        let mock = Builder::new()
            .write(b"HELLO\r")
            .read(b"ok\r\n")
            .write(b"5 FILTER\r")
            .write(b"FHOME\r")
            .read(b"ok\r\n")
            .build();
        let mut mono = Hrs300::new(mock, &settings());

        mono.connect().await.unwrap();
        mono.initialize_filter(3).await.unwrap();
    }
}
