//! # Backend Variants
//!
//! Everything that differs between backend executables lives behind
//! [`BackendVariant`]: command grammar, how benchmark output is parsed and
//! reduced, the dev fee, and (through the [`TelemetryProtocol`] supertrait) the
//! telemetry request, response schema and end-of-message rule. The lifecycle
//! is generic over this trait and contains no backend-specific text.

use crate::aggregate::{AggregationPolicy, ParsedSamples};
use crate::command::{BenchmarkWindow, CommandLine};
use crate::setup::BackendContext;
use crate::telemetry::TelemetryProtocol;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod dstm;
pub mod xmrig;

pub use dstm::Dstm;
pub use xmrig::XmrigAmd;

/// Capability interface implemented once per backend executable
pub trait BackendVariant: TelemetryProtocol {
    /// Short tag used in logs and artifact names
    fn name(&self) -> &'static str;

    /// Command line for normal operation
    fn start_command(&self, ctx: &BackendContext) -> CommandLine;

    /// Command line for a dedicated benchmark run writing to `log_file`
    fn benchmark_command(&self, ctx: &BackendContext, log_file: &Path) -> CommandLine;

    /// Maps a requested benchmark duration to the one actually sampled
    fn benchmark_window(&self) -> BenchmarkWindow {
        BenchmarkWindow::default()
    }

    /// Extract samples from captured benchmark output
    fn parse_benchmark(&self, lines: &[String]) -> ParsedSamples;

    /// Fee-corrected mean by default, using [`dev_fee_percent`](Self::dev_fee_percent)
    fn aggregation(&self) -> AggregationPolicy {
        AggregationPolicy::FeeCorrectedMean {
            dev_fee_percent: self.dev_fee_percent(),
        }
    }

    /// Base unit of the reported throughput
    fn speed_unit(&self) -> &'static str {
        "H/s"
    }

    /// Percentage of time the backend mines for its own operator
    fn dev_fee_percent(&self) -> f64 {
        0.0
    }

    /// Ceiling for the restart cooldown after abnormal exits
    fn max_cooldown(&self) -> Duration {
        crate::defaults::MAX_COOLDOWN
    }

    /// Where a benchmark run writes its log artifact
    fn benchmark_log_path(&self, ctx: &BackendContext) -> PathBuf {
        ctx.log_dir.join(format!(
            "{}_bench_{}.log",
            self.name(),
            crate::utils::generate_run_id()
        ))
    }
}

/// Backends this crate knows how to drive
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// dstm's zm equihash miner
    #[clap(name = "dstm")]
    Dstm,

    /// xmrig built for AMD OpenCL devices
    #[clap(name = "xmrig-amd")]
    XmrigAmd,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Dstm => write!(f, "dstm"),
            BackendKind::XmrigAmd => write!(f, "xmrig-amd"),
        }
    }
}
