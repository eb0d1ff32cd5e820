//! Request/response helper for line-oriented ASCII instruments.
//!
//! Both serial instruments speak a half-duplex text protocol: a command terminated by
//! `\r`, then one or more reply lines ending with a known marker. [`LineTransport`]
//! wraps any async byte stream (a serial port in production, an in-memory mock in
//! tests) and adds the terminator, the marker search and a timeout.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use crate::error::{AppResult, DaqError};

/// Command terminator shared by the monochromator and filter wheel.
pub const TERMINATOR: &str = "\r";

pub struct LineTransport<S> {
    device: String,
    stream: BufReader<S>,
}

impl<S> LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(device: impl Into<String>, stream: S) -> Self {
        Self {
            device: device.into(),
            stream: BufReader::new(stream),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Writes `command` followed by the terminator.
    pub async fn write_command(&mut self, command: &str) -> AppResult<()> {
        let payload = format!("{command}{TERMINATOR}");
        self.stream
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| DaqError::transport(&self.device, format!("write '{command}': {e}")))?;
        self.stream
            .flush()
            .await
            .map_err(|e| DaqError::transport(&self.device, format!("flush: {e}")))?;
        debug!(device = %self.device, "Sent command: {}", command);
        Ok(())
    }

    /// Reads lines until one ends with `suffix` and returns that line.
    ///
    /// Intermediate lines are progress chatter and are only traced.
    pub async fn read_line_ending_with(&mut self, suffix: &str, timeout: Duration) -> AppResult<String> {
        let device = self.device.clone();
        let stream = &mut self.stream;
        let read = async move {
            let mut line = Vec::new();
            loop {
                line.clear();
                let n = stream
                    .read_until(b'\n', &mut line)
                    .await
                    .map_err(|e| DaqError::transport(&device, format!("read: {e}")))?;
                if n == 0 {
                    return Err(DaqError::transport(&device, "connection closed"));
                }
                let text = String::from_utf8_lossy(&line).into_owned();
                if text.ends_with(suffix) {
                    return Ok(text);
                }
                trace!(device = %device, "Waiting for '{}', got {:?}", suffix.trim(), text);
            }
        };
        with_timeout(&self.device, read, timeout).await
    }

    /// Reads raw bytes until the buffer ends with `marker` and returns everything before it.
    pub async fn read_until_marker(&mut self, marker: &[u8], timeout: Duration) -> AppResult<String> {
        let device = self.device.clone();
        let stream = &mut self.stream;
        let read = async move {
            let mut buffer = Vec::with_capacity(64);
            // One byte at a time so nothing after the marker is consumed.
            let mut chunk = [0u8; 1];
            while !buffer.ends_with(marker) {
                let n = stream
                    .read(&mut chunk)
                    .await
                    .map_err(|e| DaqError::transport(&device, format!("read: {e}")))?;
                if n == 0 {
                    return Err(DaqError::transport(&device, "connection closed"));
                }
                buffer.extend_from_slice(&chunk[..n]);
            }
            buffer.truncate(buffer.len() - marker.len());
            Ok(String::from_utf8_lossy(&buffer).into_owned())
        };
        with_timeout(&self.device, read, timeout).await
    }
}

async fn with_timeout<F>(device: &str, future: F, timeout: Duration) -> AppResult<String>
where
    F: std::future::Future<Output = AppResult<String>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => {
            if let Ok(reply) = &result {
                debug!(device = %device, "Received response: {:?}", reply);
            }
            result
        }
        Err(_) => Err(DaqError::Timeout {
            device: device.to_string(),
            after: timeout,
        }),
    }
}
