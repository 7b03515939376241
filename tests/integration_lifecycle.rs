#![cfg(unix)]

use anyhow::Result;
use backend_supervisor::{
    aggregate::{AggregationPolicy, ParsedSamples},
    command::{BenchmarkWindow, CommandLine},
    setup::{Credentials, MiningSetup},
    telemetry::{EofHeuristic, TelemetryError, TelemetryProtocol},
    BackendContext, BackendLifecycle, BackendVariant, Dstm, LifecycleConfig, LifecycleError,
    LifecycleState, PollOutcome, ReadStatus, StopReason, TokioSupervisor,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// dstm with a one second benchmark window so runs finish quickly
struct QuickDstm;

impl TelemetryProtocol for QuickDstm {
    fn request(&self) -> Vec<u8> {
        Dstm.request()
    }

    fn eof(&self) -> EofHeuristic {
        Dstm.eof()
    }

    fn aggregate(&self, response: &[u8]) -> Result<f64, TelemetryError> {
        Dstm.aggregate(response)
    }
}

impl BackendVariant for QuickDstm {
    fn name(&self) -> &'static str {
        "dstm"
    }

    fn start_command(&self, ctx: &BackendContext) -> CommandLine {
        Dstm.start_command(ctx)
    }

    fn benchmark_command(&self, ctx: &BackendContext, log_file: &Path) -> CommandLine {
        Dstm.benchmark_command(ctx, log_file)
    }

    fn benchmark_window(&self) -> BenchmarkWindow {
        BenchmarkWindow::Fixed(Duration::from_secs(1))
    }

    fn parse_benchmark(&self, lines: &[String]) -> ParsedSamples {
        Dstm.parse_benchmark(lines)
    }

    fn aggregation(&self) -> AggregationPolicy {
        Dstm.aggregation()
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn context(executable: PathBuf, log_dir: &Path, api_port: u16) -> BackendContext {
    BackendContext {
        executable,
        url: "equihash.eu.nicehash.com:3357".into(),
        credentials: Credentials::new("3Abc", "rig01"),
        setup: MiningSetup::uniform(&[0, 1], "equihash"),
        extra_params: String::new(),
        api_port,
        log_dir: log_dir.to_path_buf(),
    }
}

fn lifecycle<V: BackendVariant>(variant: V) -> BackendLifecycle<V, TokioSupervisor> {
    let config = LifecycleConfig {
        tick: Duration::from_millis(100),
        ..LifecycleConfig::for_variant(&variant)
    };
    BackendLifecycle::with_config(variant, TokioSupervisor::default(), config)
}

/// Serve `response` to every connection after reading the request
async fn telemetry_stub(response: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 512];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response).await;
            });
        }
    });
    port
}

/// Dedicated benchmark where the backend writes its samples to the log file
#[tokio::test]
async fn dedicated_benchmark_prefers_log_file() -> Result<()> {
    let dir = TempDir::new()?;
    let script = write_script(
        dir.path(),
        "zm",
        r#"for arg in "$@"; do
  case "$arg" in
    --logfile=*) log="${arg#--logfile=}" ;;
  esac
done
echo "GPU0  avg: 1 I/s: 1"
if [ -n "$log" ]; then
  printf 'GPU0  avg: 10 I/s: 9\nGPU1  avg: 20 I/s: 9\n' > "$log"
fi
exec sleep 30"#,
    );
    let ctx = context(script, &dir.path().join("logs"), 4000);
    let lifecycle = lifecycle(QuickDstm);

    let report = lifecycle
        .run_benchmark(&ctx, "equihash", Duration::from_secs(60))
        .await?;

    assert!((report.speed - 14.7).abs() < 1e-9);
    assert!(report.dedicated);
    assert_eq!(report.effective, Duration::from_secs(1));
    // Consumed after parsing
    assert!(!report.log_file.as_ref().unwrap().exists());
    assert!(!lifecycle.has_process());
    assert_eq!(lifecycle.state(), LifecycleState::Idle);
    Ok(())
}

/// Log and executable paths containing spaces reach the backend intact
#[tokio::test]
async fn dedicated_benchmark_log_dir_with_spaces() -> Result<()> {
    let dir = TempDir::new()?;
    let install = dir.path().join("My Miner");
    std::fs::create_dir_all(&install)?;
    let script = write_script(
        &install,
        "zm",
        r#"for arg in "$@"; do
  case "$arg" in
    --logfile=*) log="${arg#--logfile=}" ;;
  esac
done
printf 'GPU0  avg: 10 I/s: 9\nGPU1  avg: 20 I/s: 9\n' > "$log"
exec sleep 30"#,
    );
    let ctx = context(script, &install.join("bench logs"), 4000);
    let lifecycle = lifecycle(QuickDstm);

    let report = lifecycle
        .run_benchmark(&ctx, "equihash", Duration::from_secs(60))
        .await?;

    assert!((report.speed - 14.7).abs() < 1e-9);
    assert_eq!(report.sample_count, 2);
    assert!(report
        .log_file
        .as_ref()
        .unwrap()
        .starts_with(install.join("bench logs")));
    Ok(())
}

/// Non-UTF-8 output neither breaks parsing nor kills the backend
#[tokio::test]
async fn dedicated_benchmark_survives_non_utf8_output() -> Result<()> {
    let dir = TempDir::new()?;
    let script = write_script(
        dir.path(),
        "zm",
        "echo 'GPU0  avg: 100 I/s: 1'\nprintf 'GPU0 temp 70\\260C\\n'\nsleep 0.2\necho 'GPU1  avg: 200 I/s: 1'\nexec sleep 30",
    );
    let ctx = context(script, &dir.path().join("logs"), 4000);
    let lifecycle = lifecycle(QuickDstm);

    let report = lifecycle
        .run_benchmark(&ctx, "equihash", Duration::from_secs(1))
        .await?;

    assert!((report.speed - 147.0).abs() < 1e-9);
    assert_eq!(report.sample_count, 2);
    assert_eq!(report.line_count, 3);
    assert_eq!(lifecycle.state(), LifecycleState::Idle);
    Ok(())
}

/// Without a log file the captured stdout is parsed instead
#[tokio::test]
async fn dedicated_benchmark_falls_back_to_stdout() -> Result<()> {
    let dir = TempDir::new()?;
    let script = write_script(
        dir.path(),
        "zm",
        "echo 'GPU0  avg: 100 I/s: 1'\necho 'GPU1  avg: 200 I/s: 1'\nexec sleep 30",
    );
    let ctx = context(script, &dir.path().join("logs"), 4000);
    let lifecycle = lifecycle(QuickDstm);

    let report = lifecycle
        .run_benchmark(&ctx, "equihash", Duration::from_secs(1))
        .await?;

    assert!((report.speed - 147.0).abs() < 1e-9);
    assert_eq!(report.sample_count, 2);
    Ok(())
}

#[tokio::test]
async fn run_poll_and_stop() -> Result<()> {
    let dir = TempDir::new()?;
    let port = telemetry_stub(b"{\"id\":1,\"result\":[{\"gpu_id\":0,\"sol_ps\":300.5},{\"gpu_id\":1,\"sol_ps\":299.5}]}\n").await;
    let script = write_script(dir.path(), "zm", "exec sleep 30");
    let ctx = context(script, dir.path(), port);
    let lifecycle = lifecycle(QuickDstm);

    lifecycle.start(&ctx).await?;
    assert_eq!(lifecycle.state(), LifecycleState::Running);

    let outcome = lifecycle.poll_telemetry().await;
    let sample = outcome.sample().expect("running backend should be polled");
    assert_eq!(sample.status, ReadStatus::GotRead);
    assert_eq!(sample.speed, 600.0);

    assert_eq!(lifecycle.stop(StopReason::Requested).await, Duration::ZERO);
    assert!(!lifecycle.has_process());

    let outcome = lifecycle.poll_telemetry().await;
    assert!(matches!(outcome, PollOutcome::NotRunning(LifecycleState::Idle)));
    assert_eq!(outcome.status(), ReadStatus::None);
    Ok(())
}

#[tokio::test]
async fn zero_speed_and_unreachable_telemetry() -> Result<()> {
    let dir = TempDir::new()?;
    let port = telemetry_stub(b"{\"result\":[{\"sol_ps\":0}]}\n").await;
    let script = write_script(dir.path(), "zm", "exec sleep 30");
    let lifecycle = lifecycle(QuickDstm);

    lifecycle.start(&context(script.clone(), dir.path(), port)).await?;
    assert_eq!(lifecycle.poll_telemetry().await.status(), ReadStatus::ReadSpeedZero);
    lifecycle.stop(StopReason::Requested).await;

    // Nothing listens on this port
    let closed = TcpListener::bind("127.0.0.1:0").await?.local_addr()?.port();
    lifecycle.start(&context(script, dir.path(), closed)).await?;
    assert_eq!(lifecycle.poll_telemetry().await.status(), ReadStatus::None);
    lifecycle.stop(StopReason::Requested).await;
    Ok(())
}

#[tokio::test]
async fn crash_enters_cooldown() -> Result<()> {
    let dir = TempDir::new()?;
    let script = write_script(dir.path(), "zm", "exit 3");
    let ctx = context(script, dir.path(), 4000);
    let lifecycle = lifecycle(QuickDstm);

    lifecycle.start(&ctx).await?;

    let mut exit = None;
    for _ in 0..100 {
        exit = lifecycle.check_process().await;
        if exit.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(exit.map(|e| e.code), Some(Some(3)));
    assert_eq!(lifecycle.state(), LifecycleState::CooldownWindow);
    assert!(lifecycle.cooldown_remaining().unwrap() <= Duration::from_secs(5));

    let err = lifecycle.start(&ctx).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InCooldown { .. }));
    Ok(())
}

#[tokio::test]
async fn missing_executable_fails_start() -> Result<()> {
    let dir = TempDir::new()?;
    let ctx = context(dir.path().join("does-not-exist"), dir.path(), 4000);
    let lifecycle = lifecycle(QuickDstm);

    let err = lifecycle.start(&ctx).await.unwrap_err();
    assert!(matches!(err, LifecycleError::StartFailed { .. }));
    assert!(!lifecycle.has_process());
    assert_eq!(lifecycle.state(), LifecycleState::CooldownWindow);
    Ok(())
}

#[tokio::test]
async fn stop_during_benchmark_kills_process() -> Result<()> {
    let dir = TempDir::new()?;
    let script = write_script(dir.path(), "zm", "exec sleep 30");
    let ctx = context(script, dir.path(), 4000);
    let lifecycle = BackendLifecycle::new(Dstm, TokioSupervisor::default());

    let (result, _) = tokio::join!(
        lifecycle.run_benchmark(&ctx, "equihash", Duration::from_secs(60)),
        async {
            while !lifecycle.has_process() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            lifecycle.stop(StopReason::Switching).await
        }
    );

    assert!(matches!(result, Err(LifecycleError::BenchmarkCancelled)));
    assert!(!lifecycle.has_process());
    assert_eq!(lifecycle.state(), LifecycleState::Idle);
    Ok(())
}
