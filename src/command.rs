//! # Command Construction
//!
//! Pure helpers that turn session inputs into a backend command line. Nothing in
//! here touches the filesystem or spawns anything; the same inputs always
//! produce the same string.
//!
//! The shared grammar is
//!
//! ```text
//! <device flags> --server <host> --port <port> --user <address>.<worker> --telemetry=127.0.0.1:<api port> <extra>
//! ```
//!
//! Backends with a different grammar assemble their own line from
//! [`CommandLine`] and reuse [`BenchmarkWindow`] for duration policy.

use crate::setup::{Credentials, Endpoint};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Address every backend binds its telemetry API to
pub const LOOPBACK: &str = "127.0.0.1";

/// Space-separated command line accumulated token by token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    tokens: Vec<String>,
}

impl CommandLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a bare token such as `--nicehash`
    pub fn flag(mut self, flag: &str) -> Self {
        self.tokens.push(flag.to_string());
        self
    }

    /// Append `flag value` as two tokens
    pub fn arg(mut self, flag: &str, value: impl fmt::Display) -> Self {
        self.tokens.push(flag.to_string());
        self.tokens.push(value.to_string());
        self
    }

    /// Append `flag=value` as one token
    pub fn assign(mut self, flag: &str, value: impl fmt::Display) -> Self {
        self.tokens.push(format!("{}={}", flag, value));
        self
    }

    /// Append `flag` followed by each value as its own token
    pub fn list<I>(mut self, flag: &str, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: fmt::Display,
    {
        self.tokens.push(flag.to_string());
        self.tokens.extend(values.into_iter().map(|v| v.to_string()));
        self
    }

    /// Append caller-supplied text, one token per whitespace-separated word
    ///
    /// No quoting is understood.
    pub fn verbatim(mut self, text: &str) -> Self {
        self.tokens.extend(text.split_whitespace().map(str::to_string));
        self
    }

    /// Tokens exactly as they will reach the process, one per argument
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tokens.join(" "))
    }
}

/// Join device ids the way backends expect them on the command line
pub fn join_devices(device_ids: &[u32], separator: &str) -> String {
    device_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Build the common start command shared by stratum-style backends
///
/// `device_flag` precedes the space-separated device list (e.g. `--dev`).
/// Malformed endpoints have already degraded to empty host/port in
/// [`Endpoint::parse`], so this never fails.
pub fn build_start_command(
    device_flag: &str,
    endpoint: &Endpoint,
    credentials: &Credentials,
    device_ids: &[u32],
    extra_params: &str,
    api_port: u16,
) -> CommandLine {
    CommandLine::new()
        .list(device_flag, device_ids)
        .arg("--server", &endpoint.host)
        .arg("--port", &endpoint.port)
        .arg("--user", credentials.user())
        .assign("--telemetry", format!("{}:{}", LOOPBACK, api_port))
        .verbatim(extra_params)
}

/// Append the benchmark log artifact as `flag=path`
pub fn with_log_file(command: CommandLine, flag: &str, log_file: &Path) -> CommandLine {
    command.assign(flag, log_file.display())
}

/// How long a benchmark actually runs given what the caller asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchmarkWindow {
    /// `max(requested * factor, floor)`
    Scaled { factor: u32, floor: Duration },
    /// Ignore the request and always sample for this long
    Fixed(Duration),
}

impl Default for BenchmarkWindow {
    fn default() -> Self {
        BenchmarkWindow::Scaled {
            factor: crate::defaults::BENCHMARK_SCALE_FACTOR,
            floor: crate::defaults::BENCHMARK_MIN_DURATION,
        }
    }
}

impl BenchmarkWindow {
    /// Short requests are unreliable; the backend needs warm-up plus a stable
    /// sampling window.
    pub fn effective(&self, requested: Duration) -> Duration {
        match *self {
            BenchmarkWindow::Scaled { factor, floor } => {
                requested.saturating_mul(factor).max(floor)
            }
            BenchmarkWindow::Fixed(d) => d,
        }
    }
}
