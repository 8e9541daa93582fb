//! # Process Executor
//!
//! Spawns processes inside a host container and supervises attached runs.
//!
//! ## Attached Runs
//!
//! ```text
//! caller stdin  ──relay──► process stdin
//! process stdout ──relay──► caller stdout ┐
//! process stderr ──relay──► caller stderr ┴─ drained after exit, bounded
//! interrupt ──► kill (fire and forget)
//! ```
//!
//! The stdin relay is never awaited: a caller that keeps its stdin open
//! must not hold up exit. The output relays are joined after the process
//! exits, bounded by [`RELAY_DRAIN_TIMEOUT`].
//!
//! ## Exit Codes
//!
//! An attached run reports the child's own exit code. A process killed by
//! an interrupt reports [`FORCED_KILL_EXIT_CODE`](crate::constants::FORCED_KILL_EXIT_CODE)
//! as returned by the host.

use crate::constants::RELAY_DRAIN_TIMEOUT;
use crate::error::{Error, Result};
use crate::host::{ComputeHost, HostProcess, ProcessConfig, ProcessStdio};
use crate::spec::ProcessSpec;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Creates processes inside host containers.
pub struct ProcessExecutor {
    compute: Arc<dyn ComputeHost>,
}

impl ProcessExecutor {
    pub fn new(compute: Arc<dyn ComputeHost>) -> Self {
        Self { compute }
    }

    /// Starts `spec` inside `container_id`.
    ///
    /// Attached handles own the process's stdio pipes; detached processes are
    /// created without them.
    pub async fn run(
        &self,
        container_id: &str,
        spec: &ProcessSpec,
        detach: bool,
    ) -> Result<ProcessHandle> {
        spec.validate()?;

        let config = ProcessConfig {
            args: spec.args.clone(),
            env: spec.env.clone(),
            cwd: spec.cwd.clone(),
            user: Some(spec.user.username.clone()).filter(|u| !u.is_empty()),
            terminal: spec.terminal,
            console_size: spec.console_size.map(|c| (c.height, c.width)),
            create_stdio: !detach,
        };

        let process = self
            .compute
            .create_process(container_id, &config)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    Error::ContainerNotFound(container_id.to_string())
                } else {
                    Error::Host(e)
                }
            })?;
        let pid = process.pid();

        let stdio = if detach {
            None
        } else {
            Some(
                process
                    .take_stdio()
                    .ok_or(Error::StdioUnavailable { pid })?,
            )
        };

        info!(container_id, pid, detach, command = %spec.args[0], "Started process");
        Ok(ProcessHandle {
            container_id: container_id.to_string(),
            pid,
            process,
            stdio,
        })
    }
}

/// Standard streams of the caller an attached process is wired to.
pub struct CallerIo<I, O, E> {
    pub stdin: I,
    pub stdout: O,
    pub stderr: E,
}

impl CallerIo<tokio::io::Stdin, tokio::io::Stdout, tokio::io::Stderr> {
    /// The current process's own standard streams.
    pub fn std() -> Self {
        Self {
            stdin: tokio::io::stdin(),
            stdout: tokio::io::stdout(),
            stderr: tokio::io::stderr(),
        }
    }
}

/// A process started by [`ProcessExecutor::run`].
pub struct ProcessHandle {
    container_id: String,
    pid: u32,
    process: Arc<dyn HostProcess>,
    stdio: Option<ProcessStdio>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("container_id", &self.container_id)
            .field("pid", &self.pid)
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// True if the handle does not own the process's stdio.
    pub fn is_detached(&self) -> bool {
        self.stdio.is_none()
    }

    /// Exit code of the process.
    ///
    /// # Errors
    ///
    /// [`Error::ProcessNotExited`] while the process is still running.
    pub fn exit_code(&self) -> Result<i32> {
        self.process
            .exit_code()
            .ok_or(Error::ProcessNotExited { pid: self.pid })
    }

    /// Waits for the process to exit and returns its exit code.
    pub async fn wait(&self) -> Result<i32> {
        self.process.wait().await?;
        self.exit_code()
    }

    /// Forcefully terminates the process.
    pub async fn kill(&self) -> Result<()> {
        self.process.kill().await?;
        Ok(())
    }

    /// Relays stdio between the caller and the process until it exits, and
    /// returns its exit code.
    ///
    /// When `interrupt` completes, the process is killed. Output relays get
    /// [`RELAY_DRAIN_TIMEOUT`] after exit to flush; a relay still running
    /// then is abandoned with a warning.
    pub async fn attach<I, O, E, F>(mut self, io: CallerIo<I, O, E>, interrupt: F) -> Result<i32>
    where
        I: AsyncRead + Send + Unpin + 'static,
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let pid = self.pid;
        let ProcessStdio {
            stdin,
            stdout,
            stderr,
        } = self
            .stdio
            .take()
            .ok_or(Error::StdioUnavailable { pid })?;

        let stdin_relay = tokio::spawn(relay("stdin", io.stdin, stdin));
        let mut outputs = JoinSet::new();
        outputs.spawn(relay("stdout", stdout, io.stdout));
        outputs.spawn(relay("stderr", stderr, io.stderr));

        let process = self.process.clone();
        let forwarder = tokio::spawn(async move {
            interrupt.await;
            info!(pid, "Interrupt received, killing process");
            if let Err(err) = process.kill().await {
                warn!(pid, error = %err, "Failed to kill process on interrupt");
            }
        });

        let waited = self.process.wait().await;
        forwarder.abort();

        let drained = tokio::time::timeout(RELAY_DRAIN_TIMEOUT, async {
            while let Some(joined) = outputs.join_next().await {
                if let Err(err) = joined {
                    warn!(pid, error = %err, "Output relay task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                pid,
                timeout = ?RELAY_DRAIN_TIMEOUT,
                "Output relays did not drain before the timeout"
            );
            outputs.abort_all();
        }
        stdin_relay.abort();

        waited?;
        let code = self.exit_code()?;
        debug!(container_id = %self.container_id, pid, exit_code = code, "Process exited");
        Ok(code)
    }
}

/// Copies `from` into `to` until `from` is exhausted, then closes `to`.
async fn relay<R, W>(stream: &'static str, mut from: R, mut to: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match tokio::io::copy(&mut from, &mut to).await {
        Ok(n) => n,
        Err(err) => {
            debug!(stream, error = %err, "Relay stopped");
            0
        }
    };
    if let Err(err) = to.shutdown().await {
        debug!(stream, error = %err, "Closing relay destination failed");
    }
    copied
}

/// Completes on the first Ctrl-C (and Ctrl-Break on Windows). Never completes
/// if no handler can be installed.
pub async fn interrupt_signal() {
    #[cfg(windows)]
    {
        if let Ok(mut ctrl_break) = tokio::signal::windows::ctrl_break() {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_err() {
                        ctrl_break.recv().await;
                    }
                }
                _ = ctrl_break.recv() => {}
            }
            return;
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Cannot listen for interrupts");
        std::future::pending::<()>().await;
    }
}
