use crate::cli::BenchmarkConfiguration;
use crate::lifecycle::BenchmarkReport;
use crate::telemetry::{ReadStatus, TelemetrySample};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One benchmark with the settings it ran under
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkEntry {
    pub configuration: BenchmarkConfiguration,
    pub report: BenchmarkReport,
}

/// Counts of telemetry poll outcomes over a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub samples: usize,
    pub got_read: usize,
    pub read_speed_zero: usize,
    pub none: usize,
    /// Mean speed over samples with status `GOT_READ`
    pub average_speed: Option<f64>,
    pub peak_speed: Option<f64>,
}

impl TelemetrySummary {
    fn record(&mut self, sample: &TelemetrySample) {
        self.samples += 1;
        match sample.status {
            ReadStatus::GotRead => {
                let n = self.got_read as f64;
                self.average_speed =
                    Some((self.average_speed.unwrap_or(0.0) * n + sample.speed) / (n + 1.0));
                self.peak_speed = Some(self.peak_speed.map_or(sample.speed, |p| p.max(sample.speed)));
                self.got_read += 1;
            }
            ReadStatus::ReadSpeedZero => self.read_speed_zero += 1,
            ReadStatus::None => self.none += 1,
        }
    }
}

/// Host information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub supervisor_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            supervisor_version: crate::VERSION.to_string(),
        }
    }
}

/// Final report structure
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalReport {
    pub metadata: ReportMetadata,
    pub benchmarks: Vec<BenchmarkEntry>,
    pub telemetry: TelemetrySummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub total_benchmarks: usize,
    pub system_info: SystemInfo,
}

/// Line written to the streaming file for every telemetry sample
#[derive(Debug, Serialize)]
struct StreamRecord<'a> {
    backend: &'a str,
    #[serde(flatten)]
    sample: &'a TelemetrySample,
}

/// Collects benchmark reports and telemetry samples for output
pub struct ResultsManager {
    output_file: Option<PathBuf>,
    streaming_file: Option<PathBuf>,
    benchmarks: Vec<BenchmarkEntry>,
    telemetry: TelemetrySummary,
}

impl ResultsManager {
    /// Create a results manager; with no output file `finalize` writes nothing
    pub fn new(output_file: Option<&Path>) -> Self {
        Self {
            output_file: output_file.map(Path::to_path_buf),
            streaming_file: None,
            benchmarks: Vec::new(),
            telemetry: TelemetrySummary::default(),
        }
    }

    /// Stream every recorded sample to `streaming_file` as JSON lines
    pub fn enable_streaming<P: AsRef<Path>>(&mut self, streaming_file: P) -> Result<()> {
        let path = streaming_file.as_ref().to_path_buf();

        // Create/truncate the streaming file
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to create streaming file {}", path.display()))?;

        debug!("Enabled streaming to: {:?}", path);
        self.streaming_file = Some(path);
        Ok(())
    }

    pub fn add_benchmark(&mut self, configuration: BenchmarkConfiguration, report: BenchmarkReport) {
        info!(
            "Adding {} benchmark for {}",
            report.backend, report.algorithm
        );
        self.benchmarks.push(BenchmarkEntry {
            configuration,
            report,
        });
    }

    /// Count the sample and append it to the streaming file if enabled
    pub fn record_sample(&mut self, backend: &str, sample: &TelemetrySample) -> Result<()> {
        self.telemetry.record(sample);

        if let Some(ref streaming_file) = self.streaming_file {
            let mut file = OpenOptions::new().append(true).open(streaming_file)?;
            let json = serde_json::to_string(&StreamRecord { backend, sample })?;
            writeln!(file, "{}", json)?;
            file.flush()?;
        }
        Ok(())
    }

    pub fn benchmarks(&self) -> &[BenchmarkEntry] {
        &self.benchmarks
    }

    pub fn telemetry(&self) -> &TelemetrySummary {
        &self.telemetry
    }

    /// Write the consolidated report
    pub fn finalize(&self) -> Result<()> {
        let Some(ref output_file) = self.output_file else {
            return Ok(());
        };

        let report = FinalReport {
            metadata: ReportMetadata {
                version: crate::VERSION.to_string(),
                timestamp: chrono::Utc::now(),
                total_benchmarks: self.benchmarks.len(),
                system_info: SystemInfo::default(),
            },
            benchmarks: self.benchmarks.clone(),
            telemetry: self.telemetry.clone(),
        };

        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(output_file, json)
            .with_context(|| format!("Failed to write report {}", output_file.display()))?;

        info!("Results written to: {:?}", output_file);
        Ok(())
    }
}
