//! Thread Contexts
//!
//! Runs the worker loop on a dedicated OS thread with its own single-threaded
//! tokio runtime. The coordinator side talks to it through an in-memory
//! duplex pipe carrying the same frames a child process would receive, so
//! nothing is shared with the thread except bytes.
//!
//! Terminating a thread context is cooperative. The shutdown signal is seen
//! at the worker's next `.await`, so an operation that blocks its thread
//! (CPU-bound inference without yield points) runs to completion first. Its
//! events are discarded, but the thread and the memory it holds are not
//! released before then. Use process isolation when work must be killable
//! mid-computation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::oneshot;

use super::{ContextChannels, ContextHandle, ContextId, ContextLauncher, TransportError};
use crate::executor::panic_message;
use crate::runtime::ModelRuntime;
use crate::worker;

/// Pipe buffer between the coordinator and the context thread
const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Launches contexts on dedicated threads
#[derive(Clone)]
pub struct ThreadLauncher {
    runtime: Arc<dyn ModelRuntime>,
}

impl ThreadLauncher {
    /// Serve `runtime` from each launched thread
    pub fn new(runtime: Arc<dyn ModelRuntime>) -> Self {
        Self { runtime }
    }
}

impl std::fmt::Debug for ThreadLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLauncher")
            .field("runtime", &self.runtime.name())
            .finish()
    }
}

#[async_trait]
impl ContextLauncher for ThreadLauncher {
    fn kind(&self) -> &'static str {
        "thread"
    }

    async fn launch(&self, id: ContextId) -> Result<ContextChannels, TransportError> {
        let (local, remote) = tokio::io::duplex(DUPLEX_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (failure_tx, failure_rx) = oneshot::channel::<String>();
        let runtime = Arc::clone(&self.runtime);

        std::thread::Builder::new()
            .name(format!("modelhost-ctx-{}", id.short()))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = failure_tx.send(format!("failed to start context runtime: {e}"));
                        return;
                    }
                };

                let outcome = rt.block_on(async move {
                    let (reader, writer) = tokio::io::split(remote);
                    let served = AssertUnwindSafe(worker::serve(reader, writer, runtime))
                        .catch_unwind();
                    tokio::select! {
                        outcome = served => Some(outcome),
                        _ = shutdown_rx => None,
                    }
                });

                let reason = match outcome {
                    None => {
                        tracing::debug!(context = %id, "context thread shut down");
                        return;
                    }
                    Some(Ok(Ok(()))) => {
                        tracing::debug!(context = %id, "context thread finished");
                        return;
                    }
                    Some(Ok(Err(e))) => format!("isolated context transport failed: {e}"),
                    Some(Err(panic)) => format!(
                        "isolated context panicked: {}",
                        panic_message(panic.as_ref())
                    ),
                };
                tracing::error!(context = %id, %reason, "context thread failed");
                let _ = failure_tx.send(reason);
            })
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("failed to spawn context thread: {e}"))
            })?;

        tracing::debug!(context = %id, "context thread launched");

        let (reader, writer) = tokio::io::split(local);
        Ok(ContextChannels {
            reader: Box::new(reader),
            writer: Box::new(writer),
            failure: failure_rx,
            handle: Box::new(ThreadHandle {
                shutdown: Some(shutdown_tx),
            }),
        })
    }
}

/// Shutdown switch for a context thread
///
/// Dropping the handle also stops the thread.
struct ThreadHandle {
    shutdown: Option<oneshot::Sender<()>>,
}

impl ContextHandle for ThreadHandle {
    fn terminate(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
