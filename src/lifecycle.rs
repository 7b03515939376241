//! # Backend Lifecycle
//!
//! [`BackendLifecycle`] ties the pieces together for one backend instance. It
//! owns at most one process handle, runs at most one benchmark at a time, and
//! refuses to restart a backend that keeps crashing until a cooldown has
//! passed.
//!
//! ## States
//!
//! ```text
//! Idle -> Starting -> Running <-> Benchmarking
//!   ^                    |            |
//!   |                    v            v
//!   +-- CooldownWindow <- Stopping <--+
//! ```
//!
//! A benchmark requested while `Idle` launches a dedicated benchmark process
//! and tears it down afterwards; one requested while `Running` samples the
//! output of the process that is already running.
//!
//! ## Concurrency
//!
//! All methods take `&self`. State lives behind a `std::sync::Mutex` that is
//! never held across an await. Every installed handle comes with a watch
//! channel that flips to `true` when the handle is released, which is how
//! `stop` interrupts a benchmark wait or an in-flight telemetry poll.

use crate::aggregate::{AlreadyFinalized, BenchmarkSession};
use crate::backend::BackendVariant;
use crate::command::CommandLine;
use crate::error::LifecycleError;
use crate::process::{Launch, ProcessExit, ProcessHandle, ProcessSupervisor};
use crate::setup::BackendContext;
use crate::telemetry::{ReadStatus, TelemetryClient, TelemetryConfig, TelemetrySample};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Benchmarking,
    Stopping,
    CooldownWindow,
}

/// Why a backend is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Caller asked for it
    Requested,
    /// Caller is moving the devices to another backend or algorithm
    Switching,
    /// The process exited on its own
    Crash,
    /// The process could not be launched
    StartFailure,
}

impl StopReason {
    /// Abnormal stops impose a cooldown before the next start
    pub fn is_abnormal(&self) -> bool {
        matches!(self, StopReason::Crash | StopReason::StartFailure)
    }
}

/// Timing knobs for one lifecycle
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// First cooldown after an abnormal stop; doubles per consecutive one
    pub min_cooldown: Duration,
    /// Ceiling for the doubling
    pub max_cooldown: Duration,
    /// How often a benchmark wait drains output and checks for exit
    pub tick: Duration,
    pub telemetry: TelemetryConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            min_cooldown: crate::defaults::MIN_COOLDOWN,
            max_cooldown: crate::defaults::MAX_COOLDOWN,
            tick: crate::defaults::BENCHMARK_TICK,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl LifecycleConfig {
    pub fn for_variant<V: BackendVariant + ?Sized>(variant: &V) -> Self {
        Self {
            max_cooldown: variant.max_cooldown(),
            ..Default::default()
        }
    }
}

/// Result of [`BackendLifecycle::poll_telemetry`]
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Sample(TelemetrySample),
    /// No process to poll; nothing was sent
    NotRunning(LifecycleState),
}

impl PollOutcome {
    pub fn status(&self) -> ReadStatus {
        match self {
            PollOutcome::Sample(sample) => sample.status,
            PollOutcome::NotRunning(_) => ReadStatus::None,
        }
    }

    pub fn sample(&self) -> Option<&TelemetrySample> {
        match self {
            PollOutcome::Sample(sample) => Some(sample),
            PollOutcome::NotRunning(_) => None,
        }
    }
}

/// Outcome of a completed benchmark
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub backend: String,
    pub algorithm: String,
    pub requested: Duration,
    pub effective: Duration,
    pub speed: f64,
    /// False when the aggregator kept the previous value
    pub updated: bool,
    pub sample_count: usize,
    pub line_count: usize,
    /// Whether a dedicated process was launched for the run
    pub dedicated: bool,
    /// Log artifact the backend was told to write; removed once parsed
    pub log_file: Option<PathBuf>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

struct Inner {
    state: LifecycleState,
    handle: Option<Box<dyn ProcessHandle>>,
    /// Flips to `true` when `handle` is released
    release: Option<watch::Sender<bool>>,
    /// Bumped for every launch attempt; stale work compares against it
    generation: u64,
    api_port: Option<u16>,
    cooldown_until: Option<Instant>,
    next_cooldown: Duration,
    benchmark_active: bool,
    last_benchmark: f64,
    last_status: ReadStatus,
}

impl Inner {
    fn new(config: &LifecycleConfig) -> Self {
        Self {
            state: LifecycleState::Idle,
            handle: None,
            release: None,
            generation: 0,
            api_port: None,
            cooldown_until: None,
            next_cooldown: config.min_cooldown,
            benchmark_active: false,
            last_benchmark: 0.0,
            last_status: ReadStatus::None,
        }
    }

    /// Let an elapsed cooldown lapse into `Idle`
    fn refresh(&mut self, now: Instant) -> LifecycleState {
        if self.state == LifecycleState::CooldownWindow
            && self.cooldown_until.map_or(true, |until| now >= until)
        {
            self.state = LifecycleState::Idle;
            self.cooldown_until = None;
        }
        self.state
    }

    fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn install(
        &mut self,
        handle: Box<dyn ProcessHandle>,
        api_port: u16,
        state: LifecycleState,
    ) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.handle = Some(handle);
        self.release = Some(tx);
        self.api_port = Some(api_port);
        self.state = state;
        rx
    }

    /// Detach the handle and wake everyone waiting on it
    fn release_handle(&mut self) -> Option<Box<dyn ProcessHandle>> {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(true);
        }
        self.api_port = None;
        self.handle.take()
    }

    fn enter_cooldown(&mut self, reason: StopReason, config: &LifecycleConfig) -> Duration {
        let cooldown = if reason.is_abnormal() {
            let cooldown = self.next_cooldown.min(config.max_cooldown);
            self.next_cooldown = cooldown.saturating_mul(2).min(config.max_cooldown);
            cooldown
        } else {
            Duration::ZERO
        };
        self.cooldown_until = Some(Instant::now() + cooldown);
        self.state = LifecycleState::CooldownWindow;
        cooldown
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn released(rx: &mut watch::Receiver<bool>) {
    // A dropped sender also counts as released
    let _ = rx.wait_for(|released| *released).await;
}

/// Restores state if a start or benchmark future is dropped part-way
struct PendingGuard<'a> {
    inner: &'a Mutex<Inner>,
    generation: u64,
    /// Claimed a running process rather than launching one
    attached: bool,
    benchmark: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let orphan = {
            let mut inner = lock(self.inner);
            if self.benchmark {
                inner.benchmark_active = false;
            }
            if inner.generation != self.generation {
                None
            } else {
                match inner.state {
                    LifecycleState::Starting => {
                        inner.state = LifecycleState::Idle;
                        None
                    }
                    LifecycleState::Benchmarking if self.attached => {
                        inner.state = LifecycleState::Running;
                        None
                    }
                    LifecycleState::Benchmarking => {
                        inner.state = LifecycleState::Idle;
                        inner.release_handle()
                    }
                    _ => None,
                }
            }
        };
        if let Some(handle) = orphan {
            warn!("Benchmark abandoned, dropping process {:?}", handle.pid());
        }
    }
}

enum BenchmarkMode {
    Attached,
    Dedicated,
}

/// Lifecycle of one backend instance
pub struct BackendLifecycle<V, S> {
    variant: V,
    supervisor: S,
    telemetry: TelemetryClient,
    config: LifecycleConfig,
    inner: Mutex<Inner>,
}

impl<V, S> BackendLifecycle<V, S>
where
    V: BackendVariant,
    S: ProcessSupervisor,
{
    pub fn new(variant: V, supervisor: S) -> Self {
        let config = LifecycleConfig::for_variant(&variant);
        Self::with_config(variant, supervisor, config)
    }

    pub fn with_config(variant: V, supervisor: S, config: LifecycleConfig) -> Self {
        Self {
            telemetry: TelemetryClient::new(config.telemetry.clone()),
            inner: Mutex::new(Inner::new(&config)),
            variant,
            supervisor,
            config,
        }
    }

    pub fn variant(&self) -> &V {
        &self.variant
    }

    pub fn state(&self) -> LifecycleState {
        lock(&self.inner).refresh(Instant::now())
    }

    pub fn has_process(&self) -> bool {
        lock(&self.inner).handle.is_some()
    }

    /// Status of the most recent poll; `None` once the process is gone
    pub fn last_status(&self) -> ReadStatus {
        lock(&self.inner).last_status
    }

    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        match inner.refresh(now) {
            LifecycleState::CooldownWindow => Some(inner.cooldown_remaining(now)),
            _ => None,
        }
    }

    /// Most recent benchmark result; the fallback for a tiered no-op
    pub fn last_benchmark(&self) -> f64 {
        lock(&self.inner).last_benchmark
    }

    /// Seed the previous result, e.g. from a persisted value
    pub fn set_last_benchmark(&self, speed: f64) {
        lock(&self.inner).last_benchmark = speed;
    }

    /// Launch the backend for normal operation
    #[tracing::instrument(name = "backend", skip_all, fields(backend = %self.variant.name()))]
    pub async fn start(&self, ctx: &BackendContext) -> Result<(), LifecycleError> {
        let generation = {
            let mut inner = lock(&self.inner);
            let now = Instant::now();
            match inner.refresh(now) {
                LifecycleState::Idle => {}
                LifecycleState::CooldownWindow => {
                    return Err(LifecycleError::InCooldown {
                        remaining: inner.cooldown_remaining(now),
                    });
                }
                other => return Err(LifecycleError::AlreadyRunning(other)),
            }
            inner.state = LifecycleState::Starting;
            inner.generation += 1;
            inner.generation
        };
        let _pending = PendingGuard {
            inner: &self.inner,
            generation,
            attached: false,
            benchmark: false,
        };

        let command = self.variant.start_command(ctx);
        info!("Starting: {} {}", ctx.executable.display(), command);
        let launch = launch_in_place(ctx, &command);
        let handle = self.spawn(&launch, generation).await?;

        let orphan = {
            let mut inner = lock(&self.inner);
            if inner.generation != generation || inner.state != LifecycleState::Starting {
                Some(handle)
            } else {
                inner.install(handle, ctx.api_port, LifecycleState::Running);
                None
            }
        };
        if let Some(mut handle) = orphan {
            info!("Stopped while starting, killing process {:?}", handle.pid());
            if let Err(e) = handle.kill().await {
                warn!("Failed to kill process: {}", e);
            }
            return Err(LifecycleError::StartCancelled);
        }

        info!("Running, telemetry on port {}", ctx.api_port);
        Ok(())
    }

    /// Spawn through the supervisor; failure puts the lifecycle into cooldown
    async fn spawn(
        &self,
        launch: &Launch,
        generation: u64,
    ) -> Result<Box<dyn ProcessHandle>, LifecycleError> {
        match self.supervisor.spawn(launch).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                error!("Failed to start {}: {:#}", self.variant.name(), e);
                let mut inner = lock(&self.inner);
                if inner.generation == generation && inner.state == LifecycleState::Starting {
                    let cooldown = inner.enter_cooldown(StopReason::StartFailure, &self.config);
                    warn!("Cooling down for {:?}", cooldown);
                }
                Err(LifecycleError::StartFailed {
                    backend: self.variant.name(),
                    source: e,
                })
            }
        }
    }

    /// Terminate the process (if any) and enter the cooldown window
    ///
    /// Returns the cooldown imposed. No handle is owned afterwards.
    #[tracing::instrument(name = "backend", skip_all, fields(backend = %self.variant.name()))]
    pub async fn stop(&self, reason: StopReason) -> Duration {
        self.stop_generation(reason, None).await
    }

    /// Stop only if `expected` still names the current launch
    async fn stop_generation(&self, reason: StopReason, expected: Option<u64>) -> Duration {
        let handle = {
            let mut inner = lock(&self.inner);
            let now = Instant::now();
            if expected.map_or(false, |generation| generation != inner.generation) {
                return Duration::ZERO;
            }
            match inner.refresh(now) {
                LifecycleState::Idle | LifecycleState::Stopping => return Duration::ZERO,
                LifecycleState::CooldownWindow => return inner.cooldown_remaining(now),
                _ => {}
            }
            inner.state = LifecycleState::Stopping;
            inner.last_status = ReadStatus::None;
            inner.release_handle()
        };

        if let Some(mut handle) = handle {
            info!("Stopping process {:?} ({:?})", handle.pid(), reason);
            if let Err(e) = handle.kill().await {
                warn!("Failed to kill process {:?}: {}", handle.pid(), e);
            }
        }

        let cooldown = lock(&self.inner).enter_cooldown(reason, &self.config);
        if cooldown > Duration::ZERO {
            warn!("Stopped ({:?}), restart blocked for {:?}", reason, cooldown);
        } else {
            info!("Stopped ({:?})", reason);
        }
        cooldown
    }

    /// Detect an unexpected exit and route it through the crash stop path
    pub async fn check_process(&self) -> Option<ProcessExit> {
        let (generation, exit) = {
            let mut inner = lock(&self.inner);
            let generation = inner.generation;
            match inner.handle.as_mut().map(|handle| handle.try_exit()) {
                Some(Ok(Some(exit))) => (generation, exit),
                Some(Err(e)) => {
                    warn!("Could not query process state: {}", e);
                    return None;
                }
                _ => return None,
            }
        };
        error!(
            "{} exited unexpectedly (code {:?})",
            self.variant.name(),
            exit.code
        );
        self.stop_generation(StopReason::Crash, Some(generation)).await;
        Some(exit)
    }

    /// Poll the backend's telemetry API once
    ///
    /// Fails soft: with no process the outcome is `NotRunning` and nothing is
    /// sent. A stop issued while the poll is in flight abandons it.
    #[tracing::instrument(name = "backend", skip_all, fields(backend = %self.variant.name()))]
    pub async fn poll_telemetry(&self) -> PollOutcome {
        if self.check_process().await.is_some() {
            return PollOutcome::NotRunning(self.state());
        }

        let (port, mut release) = {
            let mut inner = lock(&self.inner);
            let state = inner.refresh(Instant::now());
            let port = inner.api_port;
            match (port, inner.release.as_ref()) {
                (Some(port), Some(tx)) if inner.handle.is_some() => (port, tx.subscribe()),
                _ => {
                    inner.last_status = ReadStatus::None;
                    return PollOutcome::NotRunning(state);
                }
            }
        };

        let sample = tokio::select! {
            sample = self.telemetry.poll(port, &self.variant) => Some(sample),
            _ = released(&mut release) => None,
        };

        let mut inner = lock(&self.inner);
        match sample {
            Some(sample) => {
                inner.last_status = sample.status;
                if sample.status == ReadStatus::GotRead {
                    inner.next_cooldown = self.config.min_cooldown;
                }
                PollOutcome::Sample(sample)
            }
            None => {
                debug!("Telemetry poll abandoned by stop");
                inner.last_status = ReadStatus::None;
                let state = inner.refresh(Instant::now());
                PollOutcome::NotRunning(state)
            }
        }
    }

    /// Measure throughput for `algorithm`
    ///
    /// Blocks for the variant's effective benchmark window. A stop interrupts
    /// the wait with [`LifecycleError::BenchmarkCancelled`]; an unexpected exit
    /// goes through the crash path and returns
    /// [`LifecycleError::ProcessExited`].
    #[tracing::instrument(name = "backend", skip_all, fields(backend = %self.variant.name()))]
    pub async fn run_benchmark(
        &self,
        ctx: &BackendContext,
        algorithm: &str,
        requested: Duration,
    ) -> Result<BenchmarkReport, LifecycleError> {
        let effective = self.variant.benchmark_window().effective(requested);

        let (mode, generation) = {
            let mut inner = lock(&self.inner);
            let now = Instant::now();
            if inner.benchmark_active {
                return Err(LifecycleError::BenchmarkAlreadyInProgress);
            }
            let claimed = match inner.refresh(now) {
                LifecycleState::Running => {
                    inner.state = LifecycleState::Benchmarking;
                    // Only output produced during the window counts
                    if let Some(handle) = inner.handle.as_mut() {
                        handle.drain_output();
                    }
                    (BenchmarkMode::Attached, inner.generation)
                }
                LifecycleState::Idle => {
                    inner.state = LifecycleState::Starting;
                    inner.generation += 1;
                    (BenchmarkMode::Dedicated, inner.generation)
                }
                LifecycleState::Benchmarking => {
                    return Err(LifecycleError::BenchmarkAlreadyInProgress)
                }
                LifecycleState::CooldownWindow => {
                    return Err(LifecycleError::InCooldown {
                        remaining: inner.cooldown_remaining(now),
                    })
                }
                other => return Err(LifecycleError::InvalidState(other)),
            };
            inner.benchmark_active = true;
            claimed
        };
        let dedicated = matches!(mode, BenchmarkMode::Dedicated);
        let _pending = PendingGuard {
            inner: &self.inner,
            generation,
            attached: !dedicated,
            benchmark: true,
        };

        let log_file = dedicated.then(|| self.variant.benchmark_log_path(ctx));
        let mut release = match &log_file {
            Some(log_file) => {
                self.launch_benchmark(ctx, log_file, generation).await?
            }
            None => {
                let inner = lock(&self.inner);
                match inner.release.as_ref() {
                    Some(tx) => tx.subscribe(),
                    None => return Err(LifecycleError::BenchmarkCancelled),
                }
            }
        };

        info!(
            "Benchmarking {} for {:?} ({})",
            algorithm,
            effective,
            if dedicated { "dedicated process" } else { "running process" }
        );

        let mut captured = Vec::new();
        let deadline = Instant::now() + effective;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::select! {
                _ = sleep(self.config.tick.min(deadline - now)) => {}
                _ = released(&mut release) => {
                    info!("Benchmark of {} cancelled", algorithm);
                    return Err(LifecycleError::BenchmarkCancelled);
                }
            }

            let exited = {
                let mut inner = lock(&self.inner);
                if inner.generation != generation {
                    return Err(LifecycleError::BenchmarkCancelled);
                }
                let Some(handle) = inner.handle.as_mut() else {
                    return Err(LifecycleError::BenchmarkCancelled);
                };
                captured.extend(handle.drain_output());
                handle.try_exit()
            };
            match exited {
                Ok(Some(exit)) => {
                    error!("Process exited during benchmark (code {:?})", exit.code);
                    self.stop_generation(StopReason::Crash, Some(generation)).await;
                    return Err(LifecycleError::ProcessExited { code: exit.code });
                }
                Ok(None) => {}
                Err(e) => warn!("Could not query process state: {}", e),
            }
        }

        {
            let mut inner = lock(&self.inner);
            if inner.generation != generation || inner.state != LifecycleState::Benchmarking {
                return Err(LifecycleError::BenchmarkCancelled);
            }
            if let Some(handle) = inner.handle.as_mut() {
                captured.extend(handle.drain_output());
            }
            if !dedicated {
                inner.state = LifecycleState::Running;
            }
        }
        if dedicated {
            self.stop_generation(StopReason::Requested, Some(generation)).await;
        }

        let lines = match &log_file {
            Some(path) => {
                let logged = read_log(path).await;
                remove_log(path).await;
                logged.unwrap_or(captured)
            }
            None => captured,
        };

        let mut session = BenchmarkSession::new(algorithm, effective);
        session.push_lines(lines);
        let samples = self.variant.parse_benchmark(session.lines());
        let previous = self.last_benchmark();
        let speed = session
            .finalize(&samples, self.variant.aggregation(), previous)
            .unwrap_or_else(|AlreadyFinalized(speed)| speed);
        if session.is_update() {
            self.set_last_benchmark(speed);
        } else {
            warn!("Benchmark produced no samples, keeping previous result {}", speed);
        }

        info!(
            "Benchmark of {} finished: {} from {} samples",
            algorithm,
            speed,
            session.sample_count()
        );
        Ok(BenchmarkReport {
            backend: self.variant.name().to_string(),
            algorithm: algorithm.to_string(),
            requested,
            effective,
            speed,
            updated: session.is_update(),
            sample_count: session.sample_count(),
            line_count: session.lines().len(),
            dedicated,
            log_file,
            timestamp: chrono::Utc::now(),
        })
    }

    /// Launch the dedicated benchmark process and install its handle
    async fn launch_benchmark(
        &self,
        ctx: &BackendContext,
        log_file: &std::path::Path,
        generation: u64,
    ) -> Result<watch::Receiver<bool>, LifecycleError> {
        if let Err(e) = tokio::fs::create_dir_all(&ctx.log_dir).await {
            warn!("Could not create log dir {}: {}", ctx.log_dir.display(), e);
        }
        let command = self.variant.benchmark_command(ctx, log_file);
        info!("Starting benchmark: {} {}", ctx.executable.display(), command);
        let launch = launch_in_place(ctx, &command);
        let handle = self.spawn(&launch, generation).await?;

        let orphan = {
            let mut inner = lock(&self.inner);
            if inner.generation != generation || inner.state != LifecycleState::Starting {
                Some(handle)
            } else {
                return Ok(inner.install(handle, ctx.api_port, LifecycleState::Benchmarking));
            }
        };
        if let Some(mut handle) = orphan {
            if let Err(e) = handle.kill().await {
                warn!("Failed to kill process: {}", e);
            }
        }
        Err(LifecycleError::BenchmarkCancelled)
    }
}

/// Backends expect to run from their own install directory
fn launch_in_place(ctx: &BackendContext, command: &CommandLine) -> Launch {
    let launch = Launch::new(&ctx.executable, command);
    match ctx.executable.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => launch.with_working_dir(dir),
        _ => launch,
    }
}

/// Lines of the benchmark log artifact, if it exists and has content
async fn read_log(path: &std::path::Path) -> Option<Vec<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) if !contents.trim().is_empty() => {
            debug!("Read benchmark log {}", path.display());
            Some(contents.lines().map(str::to_string).collect())
        }
        Ok(_) => {
            debug!("Benchmark log {} is empty, using captured output", path.display());
            None
        }
        Err(e) => {
            debug!("Benchmark log {} unavailable ({}), using captured output", path.display(), e);
            None
        }
    }
}

/// The log is consumed once parsed; its lines live on in the session
async fn remove_log(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed benchmark log {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove benchmark log {}: {}", path.display(), e),
    }
}
