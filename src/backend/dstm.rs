//! dstm's zm: equihash on NVIDIA devices.
//!
//! Benchmark output carries lines like `GPU0  avg: 512.3 I/s: ...`; the
//! telemetry API answers `getstat` with one JSON object per line.

use super::BackendVariant;
use crate::aggregate::ParsedSamples;
use crate::command::{build_start_command, with_log_file, CommandLine};
use crate::parser::extract_samples;
use crate::setup::BackendContext;
use crate::telemetry::{json_body, zero_if_null, EofHeuristic, TelemetryError, TelemetryProtocol};
use serde::Deserialize;
use std::path::Path;

const DEV_FEE: f64 = 2.0;
const LOOK_FOR_START: &str = "avg: ";
const LOOK_FOR_END: &str = "i/s:";

#[derive(Debug, Clone, Copy, Default)]
pub struct Dstm;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DstmResponse {
    result: Vec<DstmGpuResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DstmGpuResult {
    #[serde(deserialize_with = "zero_if_null")]
    sol_ps: f64,
}

impl TelemetryProtocol for Dstm {
    fn request(&self) -> Vec<u8> {
        serde_json::json!({ "method": "getstat", "id": 1 })
            .to_string()
            .into_bytes()
    }

    fn eof(&self) -> EofHeuristic {
        EofHeuristic::BRACE_NEWLINE
    }

    fn aggregate(&self, response: &[u8]) -> Result<f64, TelemetryError> {
        let resp: DstmResponse = serde_json::from_slice(json_body(response))?;
        Ok(resp.result.iter().map(|gpu| gpu.sol_ps).sum())
    }
}

impl BackendVariant for Dstm {
    fn name(&self) -> &'static str {
        "dstm"
    }

    fn start_command(&self, ctx: &BackendContext) -> CommandLine {
        build_start_command(
            "--dev",
            &ctx.endpoint(),
            &ctx.credentials,
            &ctx.setup.device_ids(),
            &ctx.extra_params,
            ctx.api_port,
        )
    }

    fn benchmark_command(&self, ctx: &BackendContext, log_file: &Path) -> CommandLine {
        with_log_file(self.start_command(ctx), "--logfile", log_file)
    }

    fn parse_benchmark(&self, lines: &[String]) -> ParsedSamples {
        ParsedSamples::Single(extract_samples(lines, LOOK_FOR_START, LOOK_FOR_END).collect())
    }

    fn speed_unit(&self) -> &'static str {
        "Sol/s"
    }

    fn dev_fee_percent(&self) -> f64 {
        DEV_FEE
    }
}
