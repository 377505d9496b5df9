//! Worker Loop
//!
//! The inside of an isolated context. Reads [`ExecutionRequest`] frames,
//! hands them to a [`TaskExecutor`], and writes every emitted event back as
//! a frame, in emission order.
//!
//! One executor lives for as long as the loop does. A `load` request
//! replaces it; any other request goes to the current one. Requests are
//! handled one at a time.
//!
//! An event too large for a frame does not end the loop. An oversized
//! result is answered with an `onError` for its operation instead.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::executor::{EventSink, TaskExecutor, NOT_LOADED};
use crate::isolation::frame::{encode, FrameReader, FrameWriter};
use crate::isolation::TransportError;
use crate::protocol::{ExecutionRequest, ExecutorEvent, LoadPayload};
use crate::runtime::ModelRuntime;

/// Serve the worker protocol until the request stream closes
///
/// # Errors
///
/// Returns an error when the stream is corrupt or can no longer be written.
/// Events too large for a frame are replaced or dropped, see [`Outbox`].
/// A request frame that fails to parse is answered with an `onError` event
/// instead.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    runtime: Arc<dyn ModelRuntime>,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(reader);
    let mut outbox = Outbox::new(FrameWriter::new(writer));
    let (tx, mut rx) = mpsc::unbounded_channel::<ExecutorEvent>();
    let sink: Arc<dyn EventSink> = Arc::new(tx);
    let mut executor: Option<TaskExecutor> = None;

    tracing::debug!(runtime = runtime.name(), "worker loop started");

    loop {
        let request = match reader.read_frame::<ExecutionRequest>().await {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!("request stream closed, worker loop exiting");
                return Ok(());
            }
            Err(TransportError::SerializationError(e)) => {
                tracing::warn!(error = %e, "malformed request frame");
                outbox
                    .send(ExecutorEvent::error(format!("malformed request: {e}")))
                    .await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(operation = %request.operation, "request received");
        outbox.reset();

        let handling = handle(&mut executor, request, &runtime, &sink);
        tokio::pin!(handling);
        loop {
            tokio::select! {
                biased;
                Some(event) = rx.recv() => outbox.send(event).await?,
                () = &mut handling => break,
            }
        }
        while let Ok(event) = rx.try_recv() {
            outbox.send(event).await?;
        }
    }
}

/// Frame writer that keeps oversized events from ending the loop
///
/// - `onResult`: replaced by an `onError` naming the operation, and the
///   `onDone` that follows it is skipped
/// - `onError`: replaced by a short error
/// - anything else: dropped with a warning
struct Outbox<W> {
    writer: FrameWriter<W>,
    result_dropped: bool,
}

impl<W: AsyncWrite + Unpin> Outbox<W> {
    fn new(writer: FrameWriter<W>) -> Self {
        Self {
            writer,
            result_dropped: false,
        }
    }

    /// Start a new request
    fn reset(&mut self) {
        self.result_dropped = false;
    }

    async fn send(&mut self, event: ExecutorEvent) -> Result<(), TransportError> {
        if self.result_dropped && matches!(event, ExecutorEvent::Done) {
            return Ok(());
        }

        let frame = match encode(&event) {
            Ok(frame) => frame,
            Err(TransportError::FrameTooLarge { size, max }) => {
                match self.replace_oversized(event, size, max) {
                    Some(replacement) => encode(&replacement)?,
                    None => return Ok(()),
                }
            }
            Err(e) => return Err(e),
        };
        self.writer.write_encoded(&frame).await
    }

    fn replace_oversized(&mut self, event: ExecutorEvent, size: usize, max: usize) -> Option<ExecutorEvent> {
        tracing::warn!(event = event.name(), size, max, "event too large for a frame");
        match event {
            ExecutorEvent::Result(result) => {
                self.result_dropped = true;
                Some(ExecutorEvent::error(format!(
                    "result of '{}' too large: {size} bytes (max: {max})",
                    result.operation
                )))
            }
            ExecutorEvent::Error(_) => Some(ExecutorEvent::error(format!(
                "error message too large: {size} bytes (max: {max})"
            ))),
            _ => None,
        }
    }
}

async fn handle(
    slot: &mut Option<TaskExecutor>,
    request: ExecutionRequest,
    runtime: &Arc<dyn ModelRuntime>,
    sink: &Arc<dyn EventSink>,
) {
    if request.is_load() {
        match serde_json::from_value::<LoadPayload>(request.payload) {
            Ok(spec) => {
                // Drop the previous model before loading the next
                *slot = None;
                let mut executor = TaskExecutor::new(Arc::clone(runtime), spec, Arc::clone(sink));
                let _ = executor.load().await;
                *slot = Some(executor);
            }
            Err(e) => sink.emit(ExecutorEvent::error(format!("invalid load payload: {e}"))),
        }
        return;
    }

    match slot {
        Some(executor) => {
            let _ = executor.run(&request).await;
        }
        None => sink.emit(ExecutorEvent::error(NOT_LOADED)),
    }
}
