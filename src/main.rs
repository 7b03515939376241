//! # Backend Supervisor - Main Entry Point
//!
//! Command-line front end for the supervisor library. Three subcommands:
//!
//! - **run**: start a backend, poll its telemetry on an interval, restart it
//!   once the cooldown after a crash has lapsed, and stop it on Ctrl-C
//! - **benchmark**: measure throughput for one algorithm and write a JSON report
//! - **poll**: query an already running backend's telemetry API once
//!
//! ## Logging
//!
//! Console output goes through [`ColorizedFormatter`]. The filter comes from
//! `RUST_LOG` when set, otherwise from the number of `-v` flags. `--log-file`
//! adds a plain-text file layer written through a non-blocking appender.

use anyhow::{Context, Result};
use backend_supervisor::{
    backend::{BackendKind, BackendVariant, Dstm, XmrigAmd},
    cli::{Args, BenchmarkArgs, BenchmarkConfiguration, Command, PollArgs, RunArgs},
    lifecycle::{BackendLifecycle, LifecycleState, PollOutcome, StopReason},
    logging::{default_directive, ColorizedFormatter},
    process::TokioSupervisor,
    results::ResultsManager,
    telemetry::{TelemetryClient, TelemetryConfig, TelemetryProtocol, TelemetrySample},
    utils::{format_duration, format_speed},
    VERSION,
};
use clap::Parser;
use std::path::Path;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    // Dropping the guard flushes the file appender
    let _guard = init_logging(&args)?;

    info!("Starting Backend Supervisor {}", VERSION);

    match &args.command {
        Command::Run(run) => match run.backend.backend {
            BackendKind::Dstm => run_backend(Dstm, run).await,
            BackendKind::XmrigAmd => {
                run_backend(XmrigAmd::new(run.backend.opencl_platform), run).await
            }
        },
        Command::Benchmark(bench) => match bench.backend.backend {
            BackendKind::Dstm => benchmark_backend(Dstm, bench).await,
            BackendKind::XmrigAmd => {
                benchmark_backend(XmrigAmd::new(bench.backend.opencl_platform), bench).await
            }
        },
        Command::Poll(poll) => match poll.backend {
            BackendKind::Dstm => poll_backend(&Dstm, poll).await,
            BackendKind::XmrigAmd => poll_backend(&XmrigAmd::new(poll.opencl_platform), poll).await,
        },
    }
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(args.verbose)));

    let (file_layer, guard) = match &args.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Log file {} has no file name", path.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().event_format(ColorizedFormatter))
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Start the backend and keep it supervised until shutdown
async fn run_backend<V: BackendVariant>(variant: V, args: &RunArgs) -> Result<()> {
    let ctx = args.backend.context()?;
    if args.interval.is_zero() {
        anyhow::bail!("Poll interval must be greater than zero");
    }
    let name = variant.name();
    let unit = variant.speed_unit();
    let lifecycle = BackendLifecycle::new(variant, TokioSupervisor::default());

    let mut results = ResultsManager::new(args.output_file.as_deref());
    if let Some(ref streaming_file) = args.streaming_output {
        info!("Streaming telemetry samples to: {:?}", streaming_file);
        results.enable_streaming(streaming_file)?;
    }

    lifecycle
        .start(&ctx)
        .await
        .with_context(|| format!("Failed to start {}", name))?;

    let shutdown = async {
        match args.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Could not listen for Ctrl-C: {}", e);
                }
            }
        }
    };
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(args.interval);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down {}", name);
                break;
            }
            _ = ticker.tick() => {
                match lifecycle.poll_telemetry().await {
                    PollOutcome::Sample(sample) => {
                        info!("{:?}: {}", sample.status, format_speed(sample.speed, unit));
                        results.record_sample(name, &sample)?;
                    }
                    PollOutcome::NotRunning(state) => {
                        results.record_sample(name, &TelemetrySample::none())?;
                        restart_if_ready(&lifecycle, &ctx, state).await;
                    }
                }
            }
        }
    }

    lifecycle.stop(StopReason::Requested).await;
    results.finalize()?;
    Ok(())
}

async fn restart_if_ready<V: BackendVariant>(
    lifecycle: &BackendLifecycle<V, TokioSupervisor>,
    ctx: &backend_supervisor::BackendContext,
    state: LifecycleState,
) {
    match state {
        LifecycleState::CooldownWindow => {
            if let Some(remaining) = lifecycle.cooldown_remaining() {
                warn!("Backend down, restart possible in {}", format_duration(remaining));
            }
        }
        LifecycleState::Idle => {
            info!("Restarting backend");
            if let Err(e) = lifecycle.start(ctx).await {
                warn!("Restart failed: {}", e);
            }
        }
        other => warn!("Backend not running ({:?})", other),
    }
}

/// Benchmark one algorithm and write the report
async fn benchmark_backend<V: BackendVariant>(variant: V, args: &BenchmarkArgs) -> Result<()> {
    let ctx = args.backend.context()?;
    let unit = variant.speed_unit();
    let lifecycle = BackendLifecycle::new(variant, TokioSupervisor::default());
    if let Some(previous) = args.previous {
        lifecycle.set_last_benchmark(previous);
    }

    let effective = lifecycle.variant().benchmark_window().effective(args.time);
    info!(
        "Benchmarking {} on devices {:?} for {}",
        args.backend.algorithm,
        args.backend.devices,
        format_duration(effective)
    );

    let report = tokio::select! {
        report = lifecycle.run_benchmark(&ctx, &args.backend.algorithm, args.time) => report?,
        _ = tokio::signal::ctrl_c() => {
            lifecycle.stop(StopReason::Requested).await;
            anyhow::bail!("Benchmark interrupted");
        }
    };

    if report.updated {
        info!("{}: {}", report.algorithm, format_speed(report.speed, unit));
    } else {
        warn!(
            "{}: no samples, kept previous {}",
            report.algorithm,
            format_speed(report.speed, unit)
        );
    }

    let mut results = ResultsManager::new(Some(&args.output_file));
    results.add_benchmark(BenchmarkConfiguration::from(args), report);
    results.finalize()?;
    Ok(())
}

/// Poll a running backend once and print the sample as JSON
async fn poll_backend<P: TelemetryProtocol>(protocol: &P, args: &PollArgs) -> Result<()> {
    let mut config = TelemetryConfig::default();
    if let Some(timeout) = args.timeout {
        config.read_timeout = timeout;
    }

    let client = TelemetryClient::new(config);
    let sample = client.poll(args.api_port, protocol).await;
    println!("{}", serde_json::to_string_pretty(&sample)?);
    Ok(())
}
