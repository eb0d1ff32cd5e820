//! Thorlabs FW102C motorized filter wheel driver
//!
//! Protocol Overview:
//! - Commands `pos=N` and `pos?`, terminated by `\r`
//! - The wheel echoes each command, prints any answer on its own `\r` terminated line,
//!   and finishes with a `> ` prompt
//! - Positions are 1-based; position 1 is the open slot

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::config::FilterWheelSettings;
use crate::error::{AppResult, DaqError};
use crate::instrument::capabilities::FilterWheel;
use crate::instrument::serial_helper::LineTransport;

const DEVICE: &str = "filter wheel";
const PROMPT: &[u8] = b"> ";
/// Slot without a filter.
pub const OPEN_POSITION: u8 = 1;

pub struct Fw102c<S> {
    transport: LineTransport<S>,
    connected: bool,
    slots: u8,
    timeout: Duration,
}

#[cfg(feature = "instrument_serial")]
impl Fw102c<tokio_serial::SerialStream> {
    pub fn open(port_path: &str, settings: &FilterWheelSettings) -> AppResult<Self> {
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

impl<S> Fw102c<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, settings: &FilterWheelSettings) -> Self {
        Self {
            transport: LineTransport::new(DEVICE, stream),
            connected: false,
            slots: settings.slots,
            timeout: Duration::from_millis(settings.command_timeout_ms),
        }
    }

    /// Sends `command` and returns the answer with the echo and prompt removed.
    async fn transaction(&mut self, command: &str) -> AppResult<String> {
        self.transport.write_command(command).await?;
        let raw = self.transport.read_until_marker(PROMPT, self.timeout).await?;
        let answer = raw
            .strip_prefix(command)
            .unwrap_or(&raw)
            .trim();
        Ok(answer.to_string())
    }

    async fn read_position(&mut self) -> AppResult<u8> {
        let answer = self.transaction("pos?").await?;
        answer.parse::<u8>().map_err(|_| {
            DaqError::Instrument(format!("unexpected filter wheel position reply {answer:?}"))
        })
    }
}

#[async_trait]
impl<S> FilterWheel for Fw102c<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> AppResult<bool> {
        let position = self.read_position().await?;
        self.connected = position == OPEN_POSITION;
        if self.connected {
            info!("Connection to filter wheel established");
        } else {
            warn!(
                position,
                "Filter wheel is not in the open position; please check its position manually"
            );
        }
        Ok(self.connected)
    }

    async fn position(&mut self) -> AppResult<u8> {
        if !self.connected {
            return Err(DaqError::not_connected(DEVICE));
        }
        self.read_position().await
    }

    async fn set_position(&mut self, position: u8) -> AppResult<()> {
        if !self.connected {
            return Err(DaqError::not_connected(DEVICE));
        }
        if !(1..=self.slots).contains(&position) {
            return Err(DaqError::Configuration(format!(
                "filter wheel position {position} outside 1..={}",
                self.slots
            )));
        }
        let answer = self.transaction(&format!("pos={position}")).await?;
        if !answer.is_empty() {
            return Err(DaqError::Instrument(format!(
                "filter wheel rejected pos={position}: {answer}"
            )));
        }
        info!("Filter wheel moved to position {position}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn connects_only_in_open_position() {
        let mock = Builder::new().write(b"pos?\r").read(b"pos?\r1\r> ").build();
        let mut wheel = Fw102c::new(mock, &FilterWheelSettings::default());
        assert!(wheel.connect().await.unwrap());

        let mock = Builder::new().write(b"pos?\r").read(b"pos?\r4\r> ").build();
        let mut wheel = Fw102c::new(mock, &FilterWheelSettings::default());
        assert!(!wheel.connect().await.unwrap());
        assert!(matches!(
            wheel.set_position(1).await,
            Err(DaqError::DeviceNotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn moves_and_reads_back() {
        let mock = Builder::new()
            .write(b"pos?\r")
            .read(b"pos?\r1\r> ")
            .write(b"pos=3\r")
            .read(b"pos=3\r> ")
            .write(b"pos?\r")
            .read(b"pos?\r3\r> ")
            .build();
        let mut wheel = Fw102c::new(mock, &FilterWheelSettings::default());

        wheel.connect().await.unwrap();
        wheel.set_position(3).await.unwrap();
        assert_eq!(wheel.position().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn rejects_positions_beyond_slot_count() {
        let mock = Builder::new().write(b"pos?\r").read(b"pos?\r1\r> ").build();
        let mut wheel = Fw102c::new(mock, &FilterWheelSettings::default());
        wheel.connect().await.unwrap();

        assert!(matches!(
            wheel.set_position(7).await,
            Err(DaqError::Configuration(_))
        ));
        assert!(wheel.set_position(0).await.is_err());
    }
}
