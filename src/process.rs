//! # Process Supervision Seam
//!
//! The lifecycle never spawns anything itself. It asks a [`ProcessSupervisor`]
//! for a [`ProcessHandle`] and from then on only drains output, checks for
//! exit, and kills through that handle.
//!
//! [`TokioSupervisor`] is the stock implementation on `tokio::process`. Child
//! stdout and stderr are read line by line on background tasks for as long as
//! the pipes stay open, into a backlog capped at a fixed number of lines. When
//! nobody drains, the oldest lines are dropped. Children are spawned with
//! `kill_on_drop`, which means dropping a handle on any path terminates the
//! process.

use crate::command::CommandLine;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

/// What to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Launch {
    /// One argument per command line token; empty tokens are left out
    pub fn new(program: impl Into<PathBuf>, command: &CommandLine) -> Self {
        Self {
            program: program.into(),
            args: command
                .tokens()
                .iter()
                .filter(|token| !token.is_empty())
                .cloned()
                .collect(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A live process owned by exactly one lifecycle
#[async_trait]
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Output lines captured since the previous call, in arrival order
    fn drain_output(&mut self) -> Vec<String>;

    /// `Some` once the process has exited; never blocks
    fn try_exit(&mut self) -> io::Result<Option<ProcessExit>>;

    /// Terminate the process and wait for it to be reaped
    async fn kill(&mut self) -> io::Result<()>;
}

/// Spawns backend processes
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Returns once the OS confirms the launch, not once the backend is ready
    async fn spawn(&self, launch: &Launch) -> Result<Box<dyn ProcessHandle>>;
}

/// [`ProcessSupervisor`] backed by `tokio::process`
#[derive(Debug, Clone)]
pub struct TokioSupervisor {
    kill_timeout: Duration,
    output_backlog: usize,
}

impl Default for TokioSupervisor {
    fn default() -> Self {
        Self {
            kill_timeout: crate::defaults::KILL_TIMEOUT,
            output_backlog: crate::defaults::OUTPUT_BACKLOG,
        }
    }
}

impl TokioSupervisor {
    pub fn new(kill_timeout: Duration) -> Self {
        Self {
            kill_timeout,
            ..Self::default()
        }
    }

    /// Keep at most `lines` undrained output lines per process
    pub fn with_output_backlog(mut self, lines: usize) -> Self {
        self.output_backlog = lines.max(1);
        self
    }
}

#[async_trait]
impl ProcessSupervisor for TokioSupervisor {
    async fn spawn(&self, launch: &Launch) -> Result<Box<dyn ProcessHandle>> {
        debug!("Spawning {} {}", launch.program.display(), launch.args.join(" "));

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &launch.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", launch.program.display()))?;

        let output = Arc::new(OutputBacklog::new(self.output_backlog));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, output.clone()));
        }

        debug!("Spawned pid {:?}", child.id());
        Ok(Box::new(TokioProcessHandle {
            child,
            output,
            exit: None,
            kill_timeout: self.kill_timeout,
        }))
    }
}

/// Most recent output lines of one process, oldest dropped first
#[derive(Debug)]
struct OutputBacklog {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl OutputBacklog {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn drain(&self) -> Vec<String> {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.drain(..).collect()
    }
}

/// Copy lines into `output` until the stream closes
///
/// Bytes that are not UTF-8 are replaced rather than ending the read, so the
/// pipe keeps draining for as long as the child writes to it.
async fn forward_lines<R>(reader: R, output: Arc<OutputBacklog>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                output.push(line.trim_end_matches(&['\n', '\r'][..]).to_string());
            }
            Err(e) => {
                debug!("Stopped reading backend output: {}", e);
                break;
            }
        }
    }
}

struct TokioProcessHandle {
    child: Child,
    output: Arc<OutputBacklog>,
    exit: Option<ProcessExit>,
    kill_timeout: Duration,
}

#[async_trait]
impl ProcessHandle for TokioProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn drain_output(&mut self) -> Vec<String> {
        self.output.drain()
    }

    fn try_exit(&mut self) -> io::Result<Option<ProcessExit>> {
        if self.exit.is_none() {
            self.exit = self
                .child
                .try_wait()?
                .map(|status| ProcessExit { code: status.code() });
        }
        Ok(self.exit)
    }

    async fn kill(&mut self) -> io::Result<()> {
        if self.try_exit()?.is_some() {
            return Ok(());
        }
        self.child.start_kill()?;
        match timeout(self.kill_timeout, self.child.wait()).await {
            Ok(status) => {
                self.exit = Some(ProcessExit { code: status?.code() });
                Ok(())
            }
            Err(_) => {
                warn!(
                    "Process {:?} did not exit within {:?} of kill",
                    self.child.id(),
                    self.kill_timeout
                );
                Err(io::Error::new(io::ErrorKind::TimedOut, "kill timed out"))
            }
        }
    }
}
