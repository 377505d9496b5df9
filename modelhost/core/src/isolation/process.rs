//! Process Contexts
//!
//! Runs the worker loop in a child process, normally the `modelhost-worker`
//! binary. Frames travel over the child's stdin and stdout; stderr is
//! inherited so the worker's logs land next to the parent's.
//!
//! The child is killed when its handle is terminated or dropped, and also
//! when the monitoring task goes away with the runtime.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;

use super::{ContextChannels, ContextHandle, ContextId, ContextLauncher, TransportError};

/// Environment variable carrying the context id into the worker
pub const CONTEXT_ID_ENV: &str = "MODELHOST_CONTEXT_ID";

/// Launches contexts as child processes
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    /// Launch `program` for every context
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Extra command-line arguments for the worker
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl ContextLauncher for ProcessLauncher {
    fn kind(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, id: ContextId) -> Result<ContextChannels, TransportError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(CONTEXT_ID_ENV, id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!(
                    "failed to spawn worker {}: {e}",
                    self.program.display()
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::ConnectionFailed("worker stdin was not captured".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::ConnectionFailed("worker stdout was not captured".to_string())
        })?;

        let pid = child.id();
        tracing::info!(context = %id, pid, program = %self.program.display(), "worker process spawned");

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (failure_tx, failure_rx) = oneshot::channel::<String>();

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => {
                        tracing::debug!(context = %id, "worker process exited");
                    }
                    Ok(status) => {
                        let reason = format!("worker process exited with {status}");
                        tracing::error!(context = %id, %reason, "worker process failed");
                        let _ = failure_tx.send(reason);
                    }
                    Err(e) => {
                        let _ = failure_tx.send(format!("failed to wait for worker process: {e}"));
                    }
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(context = %id, error = %e, "failed to kill worker process");
                    } else {
                        tracing::debug!(context = %id, "worker process killed");
                    }
                }
            }
        });

        Ok(ContextChannels {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            failure: failure_rx,
            handle: Box::new(ProcessHandle {
                kill: Some(kill_tx),
            }),
        })
    }
}

/// Kill switch for a worker process
///
/// Dropping the handle also kills the process.
struct ProcessHandle {
    kill: Option<oneshot::Sender<()>>,
}

impl ContextHandle for ProcessHandle {
    fn terminate(&mut self) {
        if let Some(tx) = self.kill.take() {
            let _ = tx.send(());
        }
    }
}
