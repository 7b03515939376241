//! xmrig built for AMD OpenCL devices.
//!
//! xmrig prints rolling 10s/60s/15m averages on one line. The 60s figure is
//! the stable one but only appears after a minute of hashing, so benchmarks
//! run a fixed five minutes and fall back to the 10s figure only when no 60s
//! figure was ever printed. Telemetry is xmrig's HTTP summary endpoint read
//! over a raw socket.

use super::BackendVariant;
use crate::aggregate::{AggregationPolicy, ParsedSamples};
use crate::command::{join_devices, BenchmarkWindow, CommandLine};
use crate::parser::WindowPattern;
use crate::setup::BackendContext;
use crate::telemetry::{json_body, EofHeuristic, TelemetryError, TelemetryProtocol};
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

const LOOK_FOR_START: &str = "speed 10s/60s/15m";
const LOOK_FOR_END: &str = "n/a h/s max";
const BENCHMARK_TIME: Duration = Duration::from_secs(300);
const DONATE_LEVEL: u32 = 1;

fn speed_pattern() -> &'static WindowPattern {
    static PATTERN: OnceLock<WindowPattern> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Both markers are literals passed through regex::escape
        WindowPattern::new(LOOK_FOR_START, LOOK_FOR_END, 0, 1)
            .unwrap_or_else(|e| unreachable!("escaped literal pattern failed: {}", e))
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct XmrigAmd {
    /// OpenCL platform index the AMD devices live on
    pub opencl_platform: u32,
}

impl XmrigAmd {
    pub fn new(opencl_platform: u32) -> Self {
        Self { opencl_platform }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SummaryResponse {
    hashrate: Hashrate,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Hashrate {
    /// `[10s, 60s, 15m]`, `null` until the window fills
    total: Vec<Option<f64>>,
    threads: Vec<Vec<Option<f64>>>,
}

impl TelemetryProtocol for XmrigAmd {
    fn request(&self) -> Vec<u8> {
        b"GET /1/summary HTTP/1.1\r\nHost: 127.0.0.1\r\nAccept: application/json\r\n\r\n".to_vec()
    }

    fn eof(&self) -> EofHeuristic {
        EofHeuristic::BRACE_NEWLINE_BRACE
    }

    fn aggregate(&self, response: &[u8]) -> Result<f64, TelemetryError> {
        let resp: SummaryResponse = serde_json::from_slice(json_body(response))?;
        let hashrate = resp.hashrate;
        match hashrate.total.first() {
            Some(total) => Ok(total.unwrap_or_default()),
            None => Ok(hashrate
                .threads
                .iter()
                .filter_map(|t| t.first().copied().flatten())
                .sum()),
        }
    }
}

impl BackendVariant for XmrigAmd {
    fn name(&self) -> &'static str {
        "xmrig-amd"
    }

    fn start_command(&self, ctx: &BackendContext) -> CommandLine {
        CommandLine::new()
            .arg("-o", &ctx.url)
            .arg("-u", format!("{}:x", ctx.credentials.user()))
            .flag("--nicehash")
            .verbatim(&ctx.extra_params)
            .arg("--api-port", ctx.api_port)
            .assign("--donate-level", DONATE_LEVEL)
            .assign("--opencl-devices", join_devices(&ctx.setup.device_ids(), ","))
            .assign("--opencl-platform", self.opencl_platform)
    }

    fn benchmark_command(&self, ctx: &BackendContext, log_file: &Path) -> CommandLine {
        self.start_command(ctx)
            .arg("-l", log_file.display())
            .assign("--print-time", 2)
    }

    fn benchmark_window(&self) -> BenchmarkWindow {
        BenchmarkWindow::Fixed(BENCHMARK_TIME)
    }

    fn parse_benchmark(&self, lines: &[String]) -> ParsedSamples {
        ParsedSamples::Windows(speed_pattern().extract(lines))
    }

    fn aggregation(&self) -> AggregationPolicy {
        AggregationPolicy::Tiered
    }
}
