//! # Telemetry Polling
//!
//! Each backend exposes a small JSON API on a loopback port. A poll opens a
//! fresh TCP connection, writes the backend's request, reads until the
//! backend's [`EofHeuristic`] says the response is complete (or the read
//! timeout elapses), and reduces the response to one aggregate throughput.
//!
//! Nothing in here is fatal. Refused connections, timeouts and malformed
//! responses are all ordinary while a backend is starting up, and they all
//! collapse into [`ReadStatus::None`].

use serde::{Deserialize, Deserializer, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

pub mod eof;

pub use eof::EofHeuristic;

/// Outcome of a single telemetry poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadStatus {
    /// No data: not started, unreachable, or unparsable
    None,
    /// Valid response with positive throughput
    GotRead,
    /// Valid response whose aggregate throughput is zero
    ReadSpeedZero,
}

/// One poll result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub speed: f64,
    pub status: ReadStatus,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl TelemetrySample {
    pub fn none() -> Self {
        Self {
            speed: 0.0,
            status: ReadStatus::None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Classify a successfully parsed aggregate
    pub fn from_speed(speed: f64) -> Self {
        let status = if speed > 0.0 {
            ReadStatus::GotRead
        } else {
            ReadStatus::ReadSpeedZero
        };
        Self {
            speed,
            status,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Errors on the telemetry wire; never surfaced past [`TelemetryClient::poll`]
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to connect to telemetry port {port}: {source}")]
    Connect { port: u16, source: io::Error },

    #[error("Telemetry exchange timed out after {0:?}")]
    Timeout(Duration),

    #[error("Telemetry I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Telemetry response was empty")]
    Empty,

    #[error("Telemetry response exceeded {0} bytes")]
    TooLarge(usize),

    #[error("Failed to decode telemetry response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The backend-specific half of the telemetry protocol
pub trait TelemetryProtocol: Send + Sync {
    /// Bytes written to the API after connecting
    fn request(&self) -> Vec<u8>;

    /// How to tell that the response is complete
    fn eof(&self) -> EofHeuristic;

    /// Reduce a complete response to the sum of per-unit throughput
    fn aggregate(&self, response: &[u8]) -> Result<f64, TelemetryError>;
}

/// Deserialize a number that may be `null` or absent as zero
pub fn zero_if_null<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or_default())
}

/// Skip anything before the first `{`, e.g. HTTP response headers
pub fn json_body(response: &[u8]) -> &[u8] {
    match response.iter().position(|&b| b == b'{') {
        Some(start) => &response[start..],
        None => response,
    }
}

/// Client settings
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub host: String,
    pub connect_timeout: Duration,
    /// Upper bound on write plus read; a poll never blocks longer than
    /// `connect_timeout + read_timeout`
    pub read_timeout: Duration,
    pub max_response_bytes: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            host: crate::command::LOOPBACK.to_string(),
            connect_timeout: crate::defaults::TELEMETRY_CONNECT_TIMEOUT,
            read_timeout: crate::defaults::TELEMETRY_READ_TIMEOUT,
            max_response_bytes: 1024 * 1024,
        }
    }
}

/// Loopback telemetry client
#[derive(Debug, Clone, Default)]
pub struct TelemetryClient {
    config: TelemetryConfig,
}

impl TelemetryClient {
    pub fn new(config: TelemetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Poll `port` once and classify the result
    pub async fn poll<P>(&self, port: u16, protocol: &P) -> TelemetrySample
    where
        P: TelemetryProtocol + ?Sized,
    {
        let raw = match self.fetch(port, &protocol.request(), protocol.eof()).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("No telemetry from port {}: {}", port, e);
                return TelemetrySample::none();
            }
        };

        match protocol.aggregate(&raw) {
            Ok(speed) => {
                debug!("Telemetry from port {}: {}", port, speed);
                TelemetrySample::from_speed(speed)
            }
            Err(e) => {
                warn!("Discarding telemetry response from port {}: {}", port, e);
                TelemetrySample::none()
            }
        }
    }

    /// Send `request` and collect the raw response
    ///
    /// The connection is dropped, and therefore closed, on every return path,
    /// including when the caller abandons this future.
    pub async fn fetch(
        &self,
        port: u16,
        request: &[u8],
        eof: EofHeuristic,
    ) -> Result<Vec<u8>, TelemetryError> {
        let addr = format!("{}:{}", self.config.host, port);
        let mut stream = match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TelemetryError::Connect { port, source }),
            Err(_) => return Err(TelemetryError::Timeout(self.config.connect_timeout)),
        };
        stream.set_nodelay(true)?;

        let mut buf = Vec::with_capacity(4096);
        let exchange = Self::exchange(&mut stream, request, &mut buf, eof, self.config.max_response_bytes);
        let outcome = timeout(self.config.read_timeout, exchange).await;
        match outcome {
            Ok(result) => result?,
            // A backend that never produces the expected trailer still gets
            // its partial response parsed.
            Err(_) if !buf.is_empty() => {
                debug!(
                    "Telemetry read on port {} timed out with {} bytes, heuristic unmatched",
                    port,
                    buf.len()
                );
            }
            Err(_) => return Err(TelemetryError::Timeout(self.config.read_timeout)),
        }

        if buf.is_empty() {
            return Err(TelemetryError::Empty);
        }
        Ok(buf)
    }

    async fn exchange(
        stream: &mut TcpStream,
        request: &[u8],
        buf: &mut Vec<u8>,
        eof: EofHeuristic,
        limit: usize,
    ) -> Result<(), TelemetryError> {
        stream.write_all(request).await?;
        stream.flush().await?;

        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                // Peer closed; whatever arrived is the whole response
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
            if eof.is_complete(buf) {
                return Ok(());
            }
            if buf.len() > limit {
                return Err(TelemetryError::TooLarge(limit));
            }
        }
    }
}
