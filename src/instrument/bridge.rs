//! Lock-in access through a JSON-lines bridge.
//!
//! The vendor data server is only reachable through its own client library, so a small
//! bridge process owns that connection and exposes it as one JSON object per line:
//!
//! ```text
//! -> {"op":"subscribe","path":"/dev2000/demods/0/sample"}
//! <- {"ok":true}
//! -> {"op":"poll","duration_s":1.5,"timeout_ms":500}
//! <- {"ok":true,"data":{"dev2000":{"demods":{"0":{"sample":{...}}}}}}
//! ```
//!
//! Poll data keeps the server's nested shape and is checked by [`Burst::from_payload`].
//!
//! Replies carry no request id, so a request that times out leaves its answer in flight.
//! The connection is then out of step and the session is dropped; a new bridge
//! connection is needed.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::LockInSettings;
use crate::error::{AppResult, DaqError};
use crate::instrument::capabilities::LockInDevice;
use crate::instrument::lockin::{Burst, LockInParameters, LockInSession, NodeSetting};

const DEVICE: &str = "lock-in";

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Connect { device: &'a str },
    Set { settings: &'a [NodeSetting] },
    Flush,
    Subscribe { path: &'a str },
    Poll { duration_s: f64, timeout_ms: u64 },
    Unsubscribe { path: &'a str },
}

#[derive(Debug, Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

pub struct BridgeLockIn<S> {
    stream: BufReader<S>,
    session: Option<LockInSession>,
    channel: u8,
    request_timeout: Duration,
    out_of_step: bool,
}

impl BridgeLockIn<TcpStream> {
    /// Opens a TCP connection to the bridge at `settings.bridge_addr`.
    pub async fn open(settings: &LockInSettings) -> AppResult<Self> {
        let timeout = Duration::from_secs(settings.connect_timeout_secs);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&settings.bridge_addr))
            .await
            .map_err(|_| DaqError::Timeout {
                device: DEVICE.to_string(),
                after: timeout,
            })?
            .map_err(|e| {
                DaqError::transport(
                    DEVICE,
                    format!("cannot reach bridge at {}: {e}", settings.bridge_addr),
                )
            })?;
        Ok(Self::new(stream, settings))
    }
}

impl<S> BridgeLockIn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, settings: &LockInSettings) -> Self {
        Self {
            stream: BufReader::new(stream),
            session: None,
            channel: settings.channel,
            request_timeout: Duration::from_secs(settings.connect_timeout_secs),
            out_of_step: false,
        }
    }

    fn session(&self) -> AppResult<&LockInSession> {
        self.session
            .as_ref()
            .ok_or_else(|| DaqError::not_connected(DEVICE))
    }

    async fn request(&mut self, request: &Request<'_>, timeout: Duration) -> AppResult<Option<Value>> {
        if self.out_of_step {
            return Err(DaqError::not_connected(DEVICE));
        }
        let mut line = serde_json::to_string(request)
            .map_err(|e| DaqError::transport(DEVICE, format!("encode request: {e}")))?;
        line.push('\n');

        let stream = &mut self.stream;
        let exchange = async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await?;
            let mut reply = String::new();
            let n = stream.read_line(&mut reply).await?;
            Ok::<_, std::io::Error>((n, reply))
        };

        let (n, reply) = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result.map_err(|e| DaqError::transport(DEVICE, e.to_string()))?,
            Err(_) => {
                warn!(?timeout, "Bridge reply overdue; dropping the lock-in session");
                self.out_of_step = true;
                self.session = None;
                return Err(DaqError::Timeout {
                    device: DEVICE.to_string(),
                    after: timeout,
                });
            }
        };
        if n == 0 {
            return Err(DaqError::transport(DEVICE, "bridge closed the connection"));
        }

        let reply: Reply = serde_json::from_str(&reply)
            .map_err(|e| DaqError::transport(DEVICE, format!("invalid bridge reply: {e}")))?;
        if !reply.ok {
            return Err(DaqError::Instrument(
                reply
                    .error
                    .unwrap_or_else(|| "bridge reported an unspecified error".to_string()),
            ));
        }
        Ok(reply.data)
    }
}

#[async_trait]
impl<S> LockInDevice for BridgeLockIn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn connect(&mut self, device_id: &str) -> AppResult<LockInSession> {
        let timeout = self.request_timeout;
        self.request(&Request::Connect { device: device_id }, timeout)
            .await?;
        let session = LockInSession::new(device_id);
        self.session = Some(session.clone());
        info!(device = device_id, "Connection to lock-in established");
        Ok(session)
    }

    async fn configure(&mut self, parameters: &LockInParameters) -> AppResult<()> {
        let nodes = parameters.node_settings(&self.session()?.device);
        let timeout = self.request_timeout;
        self.request(&Request::Set { settings: &nodes }, timeout)
            .await?;
        self.request(&Request::Flush, timeout).await?;
        debug!(nodes = nodes.len(), amplification = parameters.amplification, "Lock-in configured");
        Ok(())
    }

    async fn subscribe(&mut self, path: &str) -> AppResult<()> {
        self.session()?;
        let timeout = self.request_timeout;
        self.request(&Request::Subscribe { path }, timeout).await?;
        debug!(path, "Subscribed");
        Ok(())
    }

    async fn poll(&mut self, duration: Duration, timeout: Duration) -> AppResult<Option<Burst>> {
        let device = self.session()?.device.clone();
        let request = Request::Poll {
            duration_s: duration.as_secs_f64(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        // The bridge blocks for the whole acquisition before answering.
        let wait = duration + timeout + self.request_timeout;
        let data = self.request(&request, wait).await?;
        match data {
            Some(payload) => {
                Burst::from_payload(&payload, &device, self.channel.saturating_sub(1))
            }
            None => Ok(None),
        }
    }

    async fn unsubscribe(&mut self, path: &str) -> AppResult<()> {
        self.session()?;
        let timeout = self.request_timeout;
        self.request(&Request::Unsubscribe { path }, timeout)
            .await?;
        debug!(path, "Unsubscribed");
        Ok(())
    }
}
