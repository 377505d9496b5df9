//! Isolated Context Adapter
//!
//! Drives one isolated context for a coordinator. Requests go out through a
//! writer task, events come back through a relay task that hands each one,
//! unchanged and in order, to an [`EventRouter`].
//!
//! Starting a context and loading the model are one step:
//! [`IsolatedAdapter::start`] resolves only after the context has reported
//! the outcome of the load.
//!
//! Requests are framed before they are queued, so one that cannot be framed
//! is refused by [`IsolatedAdapter::send`] and never reaches the writer.
//!
//! A context that dies (panic, non-zero exit, corrupt or truncated stream,
//! a request that can no longer be written) is reported to the router
//! exactly once through
//! [`EventRouter::on_context_failure`]. A context that is terminated on
//! purpose reports nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::frame::{encode, FrameReader, FrameWriter};
use super::{
    ContextChannels, ContextHandle, ContextId, ContextLauncher, ContextReader, ContextWriter,
    TransportError,
};
use crate::error::CoordinatorError;
use crate::protocol::{ExecutionRequest, ExecutorEvent};

/// Fallback reason when a context vanishes without saying why
const UNEXPLAINED_EXIT: &str = "isolated context exited unexpectedly";

/// A framed request waiting for the writer
struct Outgoing {
    operation: String,
    frame: Vec<u8>,
}

impl Outgoing {
    fn encode(request: &ExecutionRequest) -> Result<Self, TransportError> {
        Ok(Self {
            operation: request.operation.clone(),
            frame: encode(request)?,
        })
    }
}

/// Why the relay stopped
enum Lost {
    Closed,
    Stream(TransportError),
    Write(TransportError),
}

/// Receives what comes out of an isolated context
pub trait EventRouter: Send + Sync {
    /// One decoded event, in emission order
    fn on_message(&self, event: ExecutorEvent);

    /// The context is gone; called at most once per context
    fn on_context_failure(&self, reason: String);
}

/// Live connection to one isolated context
pub struct IsolatedAdapter {
    id: ContextId,
    kind: &'static str,
    requests: mpsc::UnboundedSender<Outgoing>,
    alive: Arc<AtomicBool>,
    terminated: bool,
    handle: Option<Box<dyn ContextHandle>>,
    tasks: Vec<JoinHandle<()>>,
}

impl IsolatedAdapter {
    /// Launch a context and load a model in it
    ///
    /// Progress and the terminal load event reach `router` before this
    /// returns. On failure the context is torn down and the same reason the
    /// router saw is returned as [`CoordinatorError::LoadFailed`].
    pub async fn start(
        launcher: &dyn ContextLauncher,
        load: ExecutionRequest,
        router: Arc<dyn EventRouter>,
        exit_grace: Duration,
    ) -> Result<Self, CoordinatorError> {
        let id = ContextId::new();
        let load = match Outgoing::encode(&load) {
            Ok(load) => load,
            Err(e) => {
                let reason = format!("failed to encode load request: {e}");
                router.on_context_failure(reason.clone());
                return Err(CoordinatorError::LoadFailed(reason));
            }
        };
        let ContextChannels {
            reader,
            writer,
            failure,
            handle,
        } = match launcher.launch(id).await {
            Ok(channels) => channels,
            Err(e) => {
                let reason = format!("failed to launch isolated context: {e}");
                tracing::error!(
                    context = %id,
                    kind = launcher.kind(),
                    error = %e,
                    "failed to launch isolated context"
                );
                router.on_context_failure(reason.clone());
                return Err(CoordinatorError::LoadFailed(reason));
            }
        };

        let alive = Arc::new(AtomicBool::new(true));
        let (requests, pending) = mpsc::unbounded_channel();
        let (load_tx, load_rx) = oneshot::channel();
        let (write_failed_tx, write_failed_rx) = oneshot::channel();

        // Queued before the pump starts so the load is always the first frame.
        // `pending` is alive here, so this cannot fail.
        let _ = requests.send(load);

        let relay_task = tokio::spawn(relay(
            id,
            reader,
            failure,
            router,
            Arc::clone(&alive),
            load_tx,
            write_failed_rx,
            exit_grace,
        ));
        let pump_task = tokio::spawn(pump(id, writer, pending, write_failed_tx));

        // Dropping `adapter` (including by cancelling this future) tears the context down
        let mut adapter = Self {
            id,
            kind: launcher.kind(),
            requests,
            alive,
            terminated: false,
            handle: Some(handle),
            tasks: vec![relay_task, pump_task],
        };
        tracing::info!(context = %id, kind = adapter.kind, "isolated context started");

        match load_rx.await {
            Ok(Ok(())) => Ok(adapter),
            Ok(Err(reason)) => {
                adapter.terminate();
                Err(CoordinatorError::LoadFailed(reason))
            }
            Err(_) => {
                adapter.terminate();
                Err(CoordinatorError::LoadFailed(UNEXPLAINED_EXIT.to_string()))
            }
        }
    }

    /// Identifier of the context
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Whether the context can still take requests
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.terminated && self.alive.load(Ordering::Acquire)
    }

    /// Hand a request to the context
    ///
    /// Returns once the request is queued for writing; its events arrive
    /// through the router.
    ///
    /// # Errors
    ///
    /// `InvalidState` after [`terminate`](Self::terminate), `SendFailed` if
    /// the context has died, `FrameTooLarge` if the request does not fit in
    /// a frame. A refused request leaves the context untouched.
    pub fn send(&self, request: ExecutionRequest) -> Result<(), TransportError> {
        if self.terminated {
            return Err(TransportError::InvalidState(format!(
                "isolated context {} was terminated",
                self.id
            )));
        }
        if !self.alive.load(Ordering::Acquire) {
            return Err(TransportError::SendFailed(format!(
                "isolated context {} is not running",
                self.id
            )));
        }
        let outgoing = Outgoing::encode(&request)?;
        self.requests.send(outgoing).map_err(|e| {
            TransportError::SendFailed(format!(
                "isolated context {} stopped accepting requests ({})",
                self.id, e.0.operation
            ))
        })
    }

    /// Hard-stop the context
    ///
    /// In-flight work is abandoned and nothing more reaches the router once
    /// this returns. Calling it again does nothing.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.alive.store(false, Ordering::Release);

        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut handle) = self.handle.take() {
            handle.terminate();
        }
        tracing::info!(context = %self.id, kind = self.kind, "isolated context terminated");
    }
}

impl Drop for IsolatedAdapter {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for IsolatedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedAdapter")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

/// Forward events from the context to the router until the stream ends
async fn relay(
    id: ContextId,
    reader: ContextReader,
    failure: oneshot::Receiver<String>,
    router: Arc<dyn EventRouter>,
    alive: Arc<AtomicBool>,
    load_tx: oneshot::Sender<Result<(), String>>,
    mut write_failed: oneshot::Receiver<TransportError>,
    exit_grace: Duration,
) {
    let mut reader = FrameReader::new(reader);
    let mut load_tx = Some(load_tx);
    let mut pump_running = true;

    let lost = loop {
        let read = tokio::select! {
            biased;
            failed = &mut write_failed, if pump_running => match failed {
                Ok(e) => break Lost::Write(e),
                Err(_) => {
                    pump_running = false;
                    continue;
                }
            },
            read = reader.read_frame::<ExecutorEvent>() => read,
        };
        match read {
            Ok(Some(event)) => {
                if !alive.load(Ordering::Acquire) {
                    return;
                }
                let load_outcome = match &event {
                    ExecutorEvent::Load => Some(Ok(())),
                    ExecutorEvent::Error(e) => Some(Err(e.message.clone())),
                    _ => None,
                };
                router.on_message(event);
                if let Some(outcome) = load_outcome {
                    if let Some(tx) = load_tx.take() {
                        let _ = tx.send(outcome);
                    }
                }
            }
            Ok(None) => break Lost::Closed,
            Err(e) => break Lost::Stream(e),
        }
    };

    if !alive.swap(false, Ordering::AcqRel) {
        return;
    }

    // A context that exited says why; prefer that over what the pipes saw
    let reason = match lost {
        Lost::Stream(e) => format!("isolated context stream failed: {e}"),
        Lost::Closed => exit_reason(failure, exit_grace)
            .await
            .unwrap_or_else(|| UNEXPLAINED_EXIT.to_string()),
        Lost::Write(e) => exit_reason(failure, exit_grace)
            .await
            .unwrap_or_else(|| format!("failed to write to isolated context: {e}")),
    };

    tracing::error!(context = %id, %reason, "isolated context lost");
    router.on_context_failure(reason.clone());
    if let Some(tx) = load_tx.take() {
        let _ = tx.send(Err(reason));
    }
}

/// The reason a context gave for exiting, if it gives one in time
async fn exit_reason(failure: oneshot::Receiver<String>, grace: Duration) -> Option<String> {
    tokio::time::timeout(grace, failure).await.ok()?.ok()
}

/// Write queued requests to the context
///
/// A failed write ends the pump and is handed to the relay, which reports
/// the context as lost.
async fn pump(
    id: ContextId,
    writer: ContextWriter,
    mut pending: mpsc::UnboundedReceiver<Outgoing>,
    write_failed: oneshot::Sender<TransportError>,
) {
    let mut writer = FrameWriter::new(writer);
    while let Some(request) = pending.recv().await {
        tracing::debug!(context = %id, operation = %request.operation, "sending request");
        if let Err(e) = writer.write_encoded(&request.frame).await {
            tracing::warn!(context = %id, operation = %request.operation, error = %e, "failed to write request");
            let _ = write_failed.send(e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::Category;
    use crate::isolation::ThreadLauncher;
    use crate::protocol::LoadPayload;
    use crate::runtime::EchoRuntime;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWrite, DuplexStream};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ExecutorEvent>>,
        failures: Mutex<Vec<String>>,
    }

    impl EventRouter for Recorder {
        fn on_message(&self, event: ExecutorEvent) {
            self.events.lock().push(event);
        }

        fn on_context_failure(&self, reason: String) {
            self.failures.lock().push(reason);
        }
    }

    fn load_request(category: Category) -> ExecutionRequest {
        ExecutionRequest::load(&LoadPayload::new("echo", category))
    }

    /// Launcher whose context answers every request with canned bytes, then
    /// dies with the given reason
    struct ScriptedLauncher {
        output: Vec<u8>,
        failure: Option<String>,
    }

    struct NoopHandle;

    impl ContextHandle for NoopHandle {
        fn terminate(&mut self) {}
    }

    #[async_trait]
    impl ContextLauncher for ScriptedLauncher {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn launch(&self, _id: ContextId) -> Result<ContextChannels, TransportError> {
            let (failure_tx, failure_rx) = oneshot::channel();
            if let Some(reason) = &self.failure {
                failure_tx.send(reason.clone()).unwrap();
            }
            Ok(ContextChannels {
                reader: Box::new(std::io::Cursor::new(self.output.clone())),
                writer: Box::new(tokio::io::sink()),
                failure: failure_rx,
                handle: Box::new(NoopHandle),
            })
        }
    }

    /// Writer whose pipe is already broken
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Launcher whose context keeps its output open but cannot be written to
    #[derive(Default)]
    struct DeafLauncher {
        outputs: Mutex<Vec<DuplexStream>>,
    }

    #[async_trait]
    impl ContextLauncher for DeafLauncher {
        fn kind(&self) -> &'static str {
            "deaf"
        }

        async fn launch(&self, _id: ContextId) -> Result<ContextChannels, TransportError> {
            let (ours, theirs) = tokio::io::duplex(64);
            self.outputs.lock().push(theirs);
            let (_failure_tx, failure_rx) = oneshot::channel();
            Ok(ContextChannels {
                reader: Box::new(ours),
                writer: Box::new(BrokenPipe),
                failure: failure_rx,
                handle: Box::new(NoopHandle),
            })
        }
    }

    struct FailingLauncher;

    #[async_trait]
    impl ContextLauncher for FailingLauncher {
        fn kind(&self) -> &'static str {
            "failing"
        }

        async fn launch(&self, _id: ContextId) -> Result<ContextChannels, TransportError> {
            Err(TransportError::ConnectionFailed("no slots".to_string()))
        }
    }

    #[tokio::test]
    async fn test_start_resolves_after_load() {
        let recorder = Arc::new(Recorder::default());
        let launcher = ThreadLauncher::new(Arc::new(EchoRuntime::new()));

        let adapter = IsolatedAdapter::start(
            &launcher,
            load_request(Category::ObjectDetection),
            recorder.clone(),
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        assert!(adapter.is_alive());
        assert_eq!(recorder.events.lock().last(), Some(&ExecutorEvent::Load));
        assert!(recorder.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn test_load_failure_is_returned_and_routed() {
        let recorder = Arc::new(Recorder::default());
        let launcher = ThreadLauncher::new(Arc::new(EchoRuntime::new()));
        let load = ExecutionRequest::load(&LoadPayload::new("", Category::Chat));

        let err = IsolatedAdapter::start(&launcher, load, recorder.clone(), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::LoadFailed(ref m) if m == "model name is empty"));
        assert_eq!(
            recorder.events.lock().as_slice(),
            &[ExecutorEvent::error("model name is empty")]
        );
        assert!(recorder.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn test_launch_failure_is_routed_once() {
        let recorder = Arc::new(Recorder::default());
        let err = IsolatedAdapter::start(
            &FailingLauncher,
            load_request(Category::Chat),
            recorder.clone(),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CoordinatorError::LoadFailed(_)));
        let failures = recorder.failures.lock().clone();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("no slots"));
    }

    #[tokio::test]
    async fn test_write_failure_is_routed_once() {
        let recorder = Arc::new(Recorder::default());
        let err = IsolatedAdapter::start(
            &DeafLauncher::default(),
            load_request(Category::Chat),
            recorder.clone(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

        assert!(
            matches!(err, CoordinatorError::LoadFailed(ref m) if m.starts_with("failed to write to isolated context")),
            "unexpected error: {err}"
        );
        assert!(recorder.events.lock().is_empty());
        assert_eq!(recorder.failures.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unframeable_request_is_refused() {
        let recorder = Arc::new(Recorder::default());
        let launcher = ThreadLauncher::new(Arc::new(EchoRuntime::new()));
        let adapter = IsolatedAdapter::start(
            &launcher,
            load_request(Category::ImageClassification),
            recorder.clone(),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        let loaded = recorder.events.lock().len();

        let image = "A".repeat(crate::isolation::frame::MAX_FRAME_SIZE);
        let err = adapter
            .send(ExecutionRequest::new("classify", json!({ "image": image })))
            .unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }), "{err}");
        assert!(adapter.is_alive());

        // The context never saw it and still serves the next request
        adapter
            .send(ExecutionRequest::new("classify", json!({"image": "aW1n"})))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.events.lock().len() == loaded {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(recorder.events.lock()[loaded], ExecutorEvent::Result(_)));
        assert!(recorder.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn test_context_death_during_load_uses_exit_reason() {
        let recorder = Arc::new(Recorder::default());
        let launcher = ScriptedLauncher {
            output: Vec::new(),
            failure: Some("worker process exited with exit status: 9".to_string()),
        };

        let err = IsolatedAdapter::start(
            &launcher,
            load_request(Category::Chat),
            recorder.clone(),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();

        assert!(
            matches!(err, CoordinatorError::LoadFailed(ref m) if m.contains("exit status: 9")),
            "unexpected error: {err}"
        );
        assert!(recorder.events.lock().is_empty());
        assert_eq!(recorder.failures.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_silent_exit_after_load_is_reported() {
        let recorder = Arc::new(Recorder::default());
        let launcher = ScriptedLauncher {
            output: crate::isolation::frame::encode(&ExecutorEvent::Load).unwrap(),
            failure: None,
        };

        let adapter = IsolatedAdapter::start(
            &launcher,
            load_request(Category::Chat),
            recorder.clone(),
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.failures.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(recorder.failures.lock().as_slice(), &[UNEXPLAINED_EXIT.to_string()]);
        assert!(!adapter.is_alive());
        assert!(adapter.send(ExecutionRequest::new("prompt", json!({}))).is_err());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_silent() {
        let recorder = Arc::new(Recorder::default());
        let launcher = ThreadLauncher::new(Arc::new(
            EchoRuntime::new().with_latency(Duration::from_millis(200)),
        ));
        let mut adapter = IsolatedAdapter::start(
            &launcher,
            load_request(Category::ImageClassification),
            recorder.clone(),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        let loaded = recorder.events.lock().len();

        adapter
            .send(ExecutionRequest::new("classify", json!({"image": "aW1n"})))
            .unwrap();
        adapter.terminate();
        adapter.terminate();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(recorder.events.lock().len(), loaded, "no events after terminate");
        assert!(recorder.failures.lock().is_empty());
        assert!(adapter.send(ExecutionRequest::new("classify", json!({}))).is_err());
    }
}
