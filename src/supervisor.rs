//! Supervised execution of a single external stage command.
//!
//! The supervisor spawns one process, collects stdout and stderr concurrently, and enforces two
//! limits while doing so: a wall-clock budget and a per-stream byte cap. Either breach kills the
//! process immediately (SIGKILL, no grace period) so a hung stage can never stall a job. The
//! supervisor never touches job state; the stage executor turns its result into events.

use crate::context::JobEnvironment;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// One external command together with its resource limits.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Executable to launch.
    pub program: PathBuf,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
    /// Complete environment of the child; the parent environment is not inherited.
    pub env: Arc<JobEnvironment>,
    /// Working directory of the child.
    pub working_dir: PathBuf,
    /// Wall-clock budget covering output collection and exit.
    pub timeout: Duration,
    /// Maximum bytes captured per stream.
    pub output_cap: usize,
    /// Human-readable label used in errors and logs.
    pub label: String,
}

/// Captured output of a successful invocation, trimmed of surrounding whitespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

/// Output stream of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Failures raised while supervising an external command.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The process could not be started (missing binary, permissions, bad working directory).
    #[error("{label} failed to start: {cause}")]
    SpawnFailed {
        /// Invocation label.
        label: String,
        /// Underlying spawn error.
        #[source]
        cause: std::io::Error,
    },
    /// The wall-clock budget expired and the process was killed.
    #[error("{label} timed out after {elapsed_ms}ms (timeout={budget_ms}ms)")]
    Timeout {
        /// Invocation label.
        label: String,
        /// Time spent before the process was killed.
        elapsed_ms: u64,
        /// Configured budget.
        budget_ms: u64,
    },
    /// One output stream exceeded the cap and the process was killed.
    #[error("{label} {stream} output exceeded limit of {limit} bytes")]
    OutputExceeded {
        /// Invocation label.
        label: String,
        /// Stream that crossed the cap.
        stream: OutputStream,
        /// Configured cap.
        limit: usize,
    },
    /// The process exited unsuccessfully.
    #[error("{label} exited with {}: {stderr}", describe_exit(.code))]
    NonZeroExit {
        /// Invocation label.
        label: String,
        /// Exit code, absent when the process was terminated by a signal.
        code: Option<i32>,
        /// Trimmed standard error.
        stderr: String,
    },
    /// Reading output or waiting for exit failed.
    #[error("{label} i/o failure: {source}")]
    Io {
        /// Invocation label.
        label: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "signal".to_string(),
    }
}

/// Executes invocations on behalf of the stage executor.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run the invocation to completion, returning captured output on a zero exit code.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, SupervisorError>;
}

/// Tokio-backed process supervisor.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    echo_output: bool,
}

impl Supervisor {
    /// Create a supervisor; `echo_output` mirrors every output chunk to `tracing` at debug level.
    pub const fn new(echo_output: bool) -> Self {
        Self { echo_output }
    }

    /// Spawn and supervise one invocation.
    pub async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, SupervisorError> {
        let label = invocation.label.as_str();
        let budget_ms = invocation.timeout.as_millis() as u64;
        tracing::debug!(
            label,
            program = %invocation.program.display(),
            args = invocation.args.len(),
            budget_ms,
            "Spawning stage command"
        );

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .env_clear()
            .envs(invocation.env.iter())
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|cause| SupervisorError::SpawnFailed {
            label: label.to_string(),
            cause,
        })?;

        let limits = CaptureLimits {
            cap: invocation.output_cap,
            label,
            echo: self.echo_output,
        };
        let outcome = tokio::time::timeout(invocation.timeout, collect(&mut child, limits)).await;

        match outcome {
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                terminate(&mut child, label).await;
                tracing::warn!(label, elapsed_ms, budget_ms, "Stage command timed out");
                Err(SupervisorError::Timeout {
                    label: label.to_string(),
                    elapsed_ms,
                    budget_ms,
                })
            }
            Ok(Err(CollectError::Exceeded(stream))) => {
                terminate(&mut child, label).await;
                tracing::warn!(label, %stream, limit = invocation.output_cap, "Stage output exceeded cap");
                Err(SupervisorError::OutputExceeded {
                    label: label.to_string(),
                    stream,
                    limit: invocation.output_cap,
                })
            }
            Ok(Err(CollectError::Io(source))) => {
                terminate(&mut child, label).await;
                Err(SupervisorError::Io {
                    label: label.to_string(),
                    source,
                })
            }
            Ok(Ok(captured)) => {
                let stdout = String::from_utf8_lossy(&captured.stdout).trim().to_string();
                let stderr = String::from_utf8_lossy(&captured.stderr).trim().to_string();
                tracing::debug!(
                    label,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    code = ?captured.status.code(),
                    "Stage command exited"
                );
                if captured.status.success() {
                    Ok(CommandOutput { stdout, stderr })
                } else {
                    Err(SupervisorError::NonZeroExit {
                        label: label.to_string(),
                        code: captured.status.code(),
                        stderr,
                    })
                }
            }
        }
    }
}

#[async_trait]
impl ProcessRunner for Supervisor {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, SupervisorError> {
        self.execute(invocation).await
    }
}

#[derive(Clone, Copy)]
struct CaptureLimits<'a> {
    cap: usize,
    label: &'a str,
    echo: bool,
}

struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    status: ExitStatus,
}

enum CollectError {
    Exceeded(OutputStream),
    Io(std::io::Error),
}

async fn collect(child: &mut Child, limits: CaptureLimits<'_>) -> Result<Captured, CollectError> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr) = tokio::try_join!(
        read_capped(stdout, OutputStream::Stdout, limits),
        read_capped(stderr, OutputStream::Stderr, limits),
    )?;
    let status = child.wait().await.map_err(CollectError::Io)?;
    Ok(Captured {
        stdout,
        stderr,
        status,
    })
}

async fn read_capped<R>(
    reader: Option<R>,
    stream: OutputStream,
    limits: CaptureLimits<'_>,
) -> Result<Vec<u8>, CollectError>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut captured = Vec::new();
    let mut buffer = [0_u8; READ_CHUNK_BYTES];
    loop {
        let read = reader.read(&mut buffer).await.map_err(CollectError::Io)?;
        if read == 0 {
            return Ok(captured);
        }
        let chunk = &buffer[..read];
        if limits.echo {
            tracing::debug!(
                label = limits.label,
                %stream,
                "{}",
                String::from_utf8_lossy(chunk).trim_end()
            );
        }
        captured.extend_from_slice(chunk);
        if captured.len() > limits.cap {
            return Err(CollectError::Exceeded(stream));
        }
    }
}

async fn terminate(child: &mut Child, label: &str) {
    if let Err(error) = child.kill().await {
        tracing::warn!(label, error = %error, "Failed to kill stage command");
    }
}
