use crate::backend::BackendKind;
use crate::setup::{BackendContext, Credentials, MiningSetup};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Backend Supervisor - start, benchmark and monitor compute-worker backends
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,

    /// Verbose output (-v for debug, -vv for trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also write logs to this file
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a backend and poll its telemetry until interrupted
    Run(RunArgs),

    /// Measure a backend's throughput for one algorithm
    Benchmark(BenchmarkArgs),

    /// Poll an already running backend's telemetry API once
    Poll(PollArgs),
}

/// Which backend to drive and what to hand it
#[derive(clap::Args, Debug, Clone)]
pub struct BackendArgs {
    /// Backend type
    #[clap(short = 'b', long, value_enum, help_heading = "Backend Options")]
    pub backend: BackendKind,

    /// Path of the backend executable
    #[clap(short = 'e', long, help_heading = "Backend Options")]
    pub executable: PathBuf,

    /// Pool endpoint (host:port or scheme://host:port)
    #[clap(short = 'u', long)]
    pub url: String,

    /// Account address work is credited to
    #[clap(long)]
    pub address: String,

    /// Worker name appended to the address
    #[clap(short = 'w', long, default_value = "worker")]
    pub worker: String,

    /// Device ids (comma-separated)
    #[clap(short = 'd', long, value_delimiter = ',', num_args = 1.., required = true)]
    pub devices: Vec<u32>,

    /// Algorithm assigned to every selected device
    #[clap(short = 'a', long)]
    pub algorithm: String,

    /// Extra launch parameters passed to the backend verbatim
    #[clap(long, default_value = "", allow_hyphen_values = true)]
    pub extra_params: String,

    /// Loopback port the backend exposes telemetry on
    #[clap(short = 'p', long, default_value_t = crate::defaults::API_PORT)]
    pub api_port: u16,

    /// Directory for benchmark log files
    #[clap(long, default_value = crate::defaults::LOG_DIR)]
    pub log_dir: PathBuf,

    /// OpenCL platform index (xmrig-amd only)
    #[clap(long, default_value_t = 0)]
    pub opencl_platform: u32,
}

impl BackendArgs {
    /// Validate the arguments and build the context handed to the backend
    pub fn context(&self) -> Result<BackendContext> {
        crate::utils::validate_api_port(self.api_port)?;
        crate::utils::validate_devices(&self.devices)?;
        if self.url.trim().is_empty() {
            anyhow::bail!("Pool URL cannot be empty");
        }

        // Backends run from their own directory, so relative paths are
        // resolved against ours first
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        Ok(BackendContext {
            executable: cwd.join(&self.executable),
            url: self.url.clone(),
            credentials: Credentials::new(self.address.clone(), self.worker.clone()),
            setup: MiningSetup::uniform(&self.devices, &self.algorithm),
            extra_params: self.extra_params.clone(),
            api_port: self.api_port,
            log_dir: cwd.join(&self.log_dir),
        })
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    #[clap(flatten)]
    pub backend: BackendArgs,

    /// Interval between telemetry polls
    #[clap(long, value_parser = parse_duration, default_value = "5s")]
    pub interval: Duration,

    /// Stop after this long instead of waiting for Ctrl-C
    #[clap(long, value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// JSON-lines file receiving every telemetry sample
    #[clap(long)]
    pub streaming_output: Option<PathBuf>,

    /// Output file for the run summary (JSON format)
    #[clap(short = 'o', long)]
    pub output_file: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct BenchmarkArgs {
    #[clap(flatten)]
    pub backend: BackendArgs,

    /// Requested benchmark time; the backend may scale or replace it
    #[clap(short = 't', long, value_parser = parse_duration, default_value = "60s")]
    pub time: Duration,

    /// Output file for the report (JSON format)
    #[clap(short = 'o', long, default_value = crate::defaults::OUTPUT_FILE)]
    pub output_file: PathBuf,

    /// Previously recorded result, kept when a run yields no samples
    #[clap(long)]
    pub previous: Option<f64>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct PollArgs {
    /// Backend type
    #[clap(short = 'b', long, value_enum)]
    pub backend: BackendKind,

    /// Telemetry port of the running backend
    #[clap(short = 'p', long, default_value_t = crate::defaults::API_PORT)]
    pub api_port: u16,

    /// Upper bound on the request/response exchange
    #[clap(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// OpenCL platform index (xmrig-amd only)
    #[clap(long, default_value_t = 0)]
    pub opencl_platform: u32,
}

/// Settings recorded alongside a benchmark report
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BenchmarkConfiguration {
    pub backend: BackendKind,
    pub algorithm: String,
    pub devices: Vec<u32>,
    pub requested: Duration,
    pub extra_params: String,
}

impl From<&BenchmarkArgs> for BenchmarkConfiguration {
    fn from(args: &BenchmarkArgs) -> Self {
        Self {
            backend: args.backend.backend,
            algorithm: args.backend.algorithm.clone(),
            devices: args.backend.devices.clone(),
            requested: args.time,
            extra_params: args.backend.extra_params.clone(),
        }
    }
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    // (number, seconds per unit, units per second)
    let (num_str, scale, divisor) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 1.0, 1000.0)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1.0, 1.0)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60.0, 1.0)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3600.0, 1.0)
    } else {
        (s, 1.0, 1.0)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", num_str));
    }

    Duration::try_from_secs_f64(num * scale / divisor)
        .map_err(|e| format!("Invalid duration {}: {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1.5m").unwrap(), Duration::from_secs(90));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_benchmark_command() {
        let args = Args::try_parse_from([
            "backend-supervisor",
            "-v",
            "benchmark",
            "-b",
            "dstm",
            "-e",
            "/opt/dstm/zm",
            "-u",
            "equihash.eu.nicehash.com:3357",
            "--address",
            "3Abc",
            "-d",
            "0,2",
            "-a",
            "equihash",
            "--extra-params",
            "--intensity 5",
            "-t",
            "2m",
        ])
        .unwrap();
        assert_eq!(args.verbose, 1);

        let Command::Benchmark(bench) = args.command else {
            panic!("expected benchmark subcommand");
        };
        assert_eq!(bench.backend.backend, BackendKind::Dstm);
        assert_eq!(bench.backend.devices, vec![0, 2]);
        assert_eq!(bench.time, Duration::from_secs(120));
        assert_eq!(bench.backend.extra_params, "--intensity 5");
        assert_eq!(bench.output_file, PathBuf::from(crate::defaults::OUTPUT_FILE));

        let ctx = bench.backend.context().unwrap();
        assert_eq!(ctx.credentials.user(), "3Abc.worker");
        assert_eq!(ctx.setup.device_ids(), vec![0, 2]);
        assert_eq!(ctx.setup.algorithm(), Some("equihash"));
        assert_eq!(ctx.api_port, crate::defaults::API_PORT);
        assert!(ctx.executable.is_absolute());
        assert!(ctx.log_dir.is_absolute());

        let config = BenchmarkConfiguration::from(&bench);
        assert_eq!(config.requested, Duration::from_secs(120));
    }

    #[test]
    fn test_parse_poll_command() {
        let args = Args::try_parse_from([
            "backend-supervisor",
            "poll",
            "-b",
            "xmrig-amd",
            "-p",
            "4100",
        ])
        .unwrap();
        let Command::Poll(poll) = args.command else {
            panic!("expected poll subcommand");
        };
        assert_eq!(poll.backend, BackendKind::XmrigAmd);
        assert_eq!(poll.api_port, 4100);
        assert!(poll.timeout.is_none());
    }

    #[test]
    fn test_devices_required() {
        let result = Args::try_parse_from([
            "backend-supervisor",
            "run",
            "-b",
            "dstm",
            "-e",
            "zm",
            "-u",
            "host:1",
            "--address",
            "a",
            "-a",
            "equihash",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_context_rejects_privileged_port() {
        let args = Args::try_parse_from([
            "backend-supervisor",
            "run",
            "-b",
            "dstm",
            "-e",
            "zm",
            "-u",
            "host:1",
            "--address",
            "a",
            "-d",
            "0",
            "-a",
            "equihash",
            "-p",
            "80",
        ])
        .unwrap();
        let Command::Run(run) = args.command else {
            panic!("expected run subcommand");
        };
        assert!(run.backend.context().is_err());
        assert_eq!(run.interval, crate::defaults::TELEMETRY_INTERVAL);
    }
}
