//! # Backend Supervisor Library
//!
//! Uniform lifecycle, benchmark and telemetry supervision for external
//! compute-worker executables ("backends"). Each backend has its own command
//! line grammar, output format and telemetry API; this library hides those
//! differences behind one capability trait and drives every backend through
//! the same state machine.
//!
//! ## Supported Backends
//!
//! - **dstm** (`zm`): equihash on NVIDIA devices, JSON-line telemetry
//! - **xmrig-amd**: CryptoNight variants on AMD OpenCL devices, HTTP telemetry
//!
//! ## Architecture Overview
//!
//! - `command`: command-line assembly and benchmark duration rules
//! - `parser`: throughput samples from free-form backend output
//! - `aggregate`: samples to one benchmark figure, write-once sessions
//! - `telemetry`: one-shot TCP polls with per-backend end-of-message rules
//! - `process`: the seam between the lifecycle and real OS processes
//! - `lifecycle`: the per-instance state machine tying it all together
//! - `backend`: the `BackendVariant` trait and its implementations
//! - `results`: JSON report and streaming output for the binary
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use backend_supervisor::{
//!     backend::Dstm,
//!     setup::{BackendContext, Credentials, MiningSetup},
//!     BackendLifecycle, StopReason, TokioSupervisor,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = BackendContext {
//!         executable: "/opt/dstm/zm".into(),
//!         url: "equihash.eu.nicehash.com:3357".into(),
//!         credentials: Credentials::new("3Abc", "rig01"),
//!         setup: MiningSetup::uniform(&[0, 1], "equihash"),
//!         extra_params: String::new(),
//!         api_port: 4000,
//!         log_dir: "logs".into(),
//!     };
//!
//!     let lifecycle = BackendLifecycle::new(Dstm, TokioSupervisor::default());
//!     let report = lifecycle
//!         .run_benchmark(&ctx, "equihash", Duration::from_secs(60))
//!         .await?;
//!     println!("equihash: {} Sol/s", report.speed);
//!
//!     lifecycle.start(&ctx).await?;
//!     println!("{:?}", lifecycle.poll_telemetry().await.status());
//!     lifecycle.stop(StopReason::Requested).await;
//!     Ok(())
//! }
//! ```

/// Reduction of benchmark samples to a single figure
pub mod aggregate;

/// Backend capability trait and the concrete backends
///
/// Everything backend-specific lives here: command grammar, output markers,
/// telemetry request and response schema, dev fee and cooldown ceiling.
pub mod backend;

/// Command-line interface and configuration
///
/// Provides argument parsing using clap, including duration parsing with
/// human-readable formats (e.g., "10s", "5m").
pub mod cli;

pub mod command;

/// Errors returned by the lifecycle
pub mod error;

/// Per-instance state machine
///
/// Owns at most one process, serializes benchmarks, and enforces the restart
/// cooldown after abnormal exits.
pub mod lifecycle;

pub mod logging;

pub mod parser;

/// Process spawning abstraction
///
/// The `ProcessSupervisor` trait is the seam tests replace with an in-memory
/// implementation.
pub mod process;

/// Report and streaming output for the binary
pub mod results;

pub mod setup;

/// Telemetry client and per-backend wire protocol trait
pub mod telemetry;

pub mod utils;

// Re-export key types for convenient library usage

pub use aggregate::{AggregationPolicy, BenchmarkSession, ParsedSamples};
pub use backend::{BackendKind, BackendVariant, Dstm, XmrigAmd};
pub use error::LifecycleError;
pub use lifecycle::{
    BackendLifecycle, BenchmarkReport, LifecycleConfig, LifecycleState, PollOutcome, StopReason,
};
pub use process::{Launch, ProcessHandle, ProcessSupervisor, TokioSupervisor};
pub use results::ResultsManager;
pub use setup::BackendContext;
pub use telemetry::{ReadStatus, TelemetryClient, TelemetryConfig, TelemetrySample};

/// The current version of the backend supervisor
///
/// Populated from Cargo.toml and recorded in report output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Named constants for every tunable the library and binary fall back to.
pub mod defaults {
    use std::time::Duration;

    /// Benchmarks sample for this multiple of the requested duration
    pub const BENCHMARK_SCALE_FACTOR: u32 = 3;

    /// Floor for scaled benchmark windows
    pub const BENCHMARK_MIN_DURATION: Duration = Duration::from_secs(120);

    /// How often a benchmark wait drains output and checks for an exit
    pub const BENCHMARK_TICK: Duration = Duration::from_secs(1);

    /// First cooldown after an abnormal stop
    pub const MIN_COOLDOWN: Duration = Duration::from_secs(5);

    /// Cooldown ceiling unless a backend overrides it
    pub const MAX_COOLDOWN: Duration = Duration::from_secs(5 * 60);

    /// Backends refuse connections while starting; fail fast and retry on
    /// the next poll
    pub const TELEMETRY_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

    /// Upper bound on one request/response exchange
    pub const TELEMETRY_READ_TIMEOUT: Duration = Duration::from_secs(2);

    /// Interval between telemetry polls in `run` mode
    pub const TELEMETRY_INTERVAL: Duration = Duration::from_secs(5);

    /// How long to wait for a killed process to be reaped
    pub const KILL_TIMEOUT: Duration = Duration::from_secs(5);

    /// Undrained output lines kept per backend process
    pub const OUTPUT_BACKLOG: usize = 10_000;

    /// Default telemetry API port
    pub const API_PORT: u16 = 4000;

    /// Directory for benchmark log artifacts
    pub const LOG_DIR: &str = "logs";

    /// Default report file name
    pub const OUTPUT_FILE: &str = "backend_report.json";
}
