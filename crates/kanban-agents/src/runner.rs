use async_trait::async_trait;
use serde_json::Value;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::types::CommandSpec;

/// Callbacks the runner drives while a process streams output.
#[async_trait]
pub trait RunHooks: Send {
    /// A stdout line that decoded to a JSON object.
    async fn on_stdout_json(&mut self, value: Value);
    async fn on_stdout_text(&mut self, line: String);
    async fn on_stderr_text(&mut self, line: String);
    /// Called exactly once after the process has been reaped.
    async fn after_close(&mut self, exit: &RunExit);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub cancelled: bool,
}

impl RunExit {
    pub fn success(&self) -> bool {
        !self.cancelled && self.code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRunner {
    pub kill_grace: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_millis(5_000),
        }
    }
}

enum Next {
    Cancelled,
    Stdout(std::io::Result<Option<Vec<u8>>>),
    Stderr(std::io::Result<Option<Vec<u8>>>),
}

impl CommandRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Spawns `spec`, streams its output into `hooks` and reaps it.
    ///
    /// Cancelling `cancel` terminates the process group with SIGTERM and
    /// escalates to SIGKILL after `kill_grace`. Output still buffered in the
    /// pipes at that point is discarded.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        hooks: &mut dyn RunHooks,
    ) -> Result<RunExit, AgentError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| AgentError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        debug!(program = %spec.program, pid = ?child.id(), "agent process spawned");

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %err, "failed to write agent stdin");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let stdout = child.stdout.take().ok_or_else(|| AgentError::Runtime {
            message: "stdout pipe was not captured".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| AgentError::Runtime {
            message: "stderr pipe was not captured".to_string(),
        })?;
        let mut stdout = BufReader::new(stdout).split(b'\n');
        let mut stderr = BufReader::new(stderr).split(b'\n');
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut cancelled = false;

        while stdout_open || stderr_open {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Next::Cancelled,
                segment = stdout.next_segment(), if stdout_open => Next::Stdout(segment),
                segment = stderr.next_segment(), if stderr_open => Next::Stderr(segment),
            };

            match next {
                Next::Cancelled => {
                    cancelled = true;
                    break;
                }
                Next::Stdout(Ok(Some(bytes))) => {
                    if let Some(line) = decode_line(&bytes) {
                        match parse_json_object(&line) {
                            Some(value) => hooks.on_stdout_json(value).await,
                            None => hooks.on_stdout_text(line).await,
                        }
                    }
                }
                Next::Stderr(Ok(Some(bytes))) => {
                    if let Some(line) = decode_line(&bytes) {
                        hooks.on_stderr_text(line).await;
                    }
                }
                Next::Stdout(Ok(None)) => stdout_open = false,
                Next::Stderr(Ok(None)) => stderr_open = false,
                Next::Stdout(Err(err)) => {
                    warn!(error = %err, "agent stdout read failed");
                    stdout_open = false;
                }
                Next::Stderr(Err(err)) => {
                    warn!(error = %err, "agent stderr read failed");
                    stderr_open = false;
                }
            }
        }

        let waited = if cancelled {
            self.terminate(&mut child).await
        } else {
            let exited = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                status = child.wait() => Some(status),
            };
            match exited {
                Some(status) => status,
                None => {
                    cancelled = true;
                    self.terminate(&mut child).await
                }
            }
        };

        match waited {
            Ok(status) => {
                let exit = RunExit {
                    code: status.code(),
                    cancelled,
                };
                debug!(code = ?exit.code, cancelled, "agent process closed");
                hooks.after_close(&exit).await;
                Ok(exit)
            }
            Err(source) => {
                hooks
                    .after_close(&RunExit {
                        code: None,
                        cancelled,
                    })
                    .await;
                Err(AgentError::Io {
                    action: "waiting for the agent process",
                    source,
                })
            }
        }
    }

    async fn terminate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                signal_group(pid, nix::sys::signal::Signal::SIGTERM);
                if let Ok(status) = tokio::time::timeout(self.kill_grace, child.wait()).await {
                    return status;
                }
                warn!(pid, "agent ignored SIGTERM, sending SIGKILL");
                signal_group(pid, nix::sys::signal::Signal::SIGKILL);
            }
        }

        if let Err(err) = child.kill().await {
            debug!(error = %err, "kill after termination failed");
        }
        child.wait().await
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = nix::sys::signal::killpg(nix::unistd::Pid::from_raw(raw), signal) {
        debug!(pid, ?signal, error = %err, "killpg failed");
    }
}

fn decode_line(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let line = text.trim_end_matches('\r');
    if line.trim().is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

fn parse_json_object(line: &str) -> Option<Value> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .filter(Value::is_object)
}
