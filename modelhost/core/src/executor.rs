//! Task Executor
//!
//! Owns one loaded model and performs operations against it. The executor's
//! only output is events pushed into an [`EventSink`]; it never returns
//! runtime errors to its caller and never lets a runtime panic escape.
//!
//! The same executor runs in both execution modes. In direct mode the
//! coordinator's own router is the sink; inside an isolated context the sink
//! is a channel drained by the worker loop onto the wire.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::category::CategoryDescriptor;
use crate::protocol::{ExecutionRequest, ExecutorEvent, LoadPayload};
use crate::runtime::{LoadedModel, ModelRuntime, ProgressReporter, UpdateReporter};

/// Message emitted for an operation issued before a successful load
pub const NOT_LOADED: &str = "model is not loaded";

/// Destination for executor events
pub trait EventSink: Send + Sync {
    /// Deliver one event
    fn emit(&self, event: ExecutorEvent);
}

impl EventSink for mpsc::UnboundedSender<ExecutorEvent> {
    fn emit(&self, event: ExecutorEvent) {
        if self.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }
}

/// Runs a model on behalf of one coordinator or one isolated context
pub struct TaskExecutor {
    runtime: Arc<dyn ModelRuntime>,
    spec: LoadPayload,
    descriptor: &'static CategoryDescriptor,
    sink: Arc<dyn EventSink>,
    model: Option<Box<dyn LoadedModel>>,
}

impl TaskExecutor {
    /// Create an executor for `spec`; nothing is loaded yet
    pub fn new(runtime: Arc<dyn ModelRuntime>, spec: LoadPayload, sink: Arc<dyn EventSink>) -> Self {
        let descriptor = spec.category.descriptor();
        Self {
            runtime,
            spec,
            descriptor,
            sink,
            model: None,
        }
    }

    /// Whether a model is loaded
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Model this executor serves
    #[must_use]
    pub fn spec(&self) -> &LoadPayload {
        &self.spec
    }

    /// Load the model
    ///
    /// Emits progress events, then exactly one of `onLoad` or `onError`.
    /// The returned error carries the same message as the emitted event.
    pub async fn load(&mut self) -> Result<(), String> {
        self.model = None;
        let reporter = ProgressReporter::new(&self.spec.model_name, Arc::clone(&self.sink));

        tracing::info!(
            model = %self.spec.model_name,
            category = %self.spec.category,
            runtime = self.runtime.name(),
            "loading model"
        );

        let outcome = AssertUnwindSafe(self.runtime.load(&self.spec, &reporter))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(model)) => {
                self.model = Some(model);
                tracing::info!(model = %self.spec.model_name, "model loaded");
                self.sink.emit(ExecutorEvent::Load);
                Ok(())
            }
            Ok(Err(err)) => Err(self.fail(format!("{err:#}"))),
            Err(panic) => Err(self.fail(panic_message(panic.as_ref()))),
        }
    }

    /// Run an operation against the loaded model
    ///
    /// Emits any partial updates the model streams, then exactly one of
    /// `onResult` or `onError`, followed by `onDone` after a result when the
    /// category signals completion.
    pub async fn run(&mut self, request: &ExecutionRequest) -> Result<(), String> {
        let Some(model) = &self.model else {
            return Err(self.fail(NOT_LOADED.to_string()));
        };

        let operation = request.operation.as_str();
        if !self.descriptor.accepts(operation) {
            return Err(self.fail(format!(
                "unsupported operation '{operation}' for category '{}'",
                self.descriptor.name
            )));
        }
        if let Some(field) = self.descriptor.missing_field(&request.payload) {
            return Err(self.fail(format!(
                "missing required field '{field}' for operation '{operation}'"
            )));
        }

        tracing::debug!(model = %self.spec.model_name, operation, "running operation");

        let updates = UpdateReporter::new(operation, Arc::clone(&self.sink));
        let outcome = AssertUnwindSafe(model.run(operation, request.payload.clone(), &updates))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => {
                self.complete(operation, result);
                Ok(())
            }
            Ok(Err(err)) => Err(self.fail(format!("{err:#}"))),
            Err(panic) => Err(self.fail(panic_message(panic.as_ref()))),
        }
    }

    /// Route a request to [`load`](Self::load) or [`run`](Self::run)
    pub async fn handle(&mut self, request: &ExecutionRequest) -> Result<(), String> {
        if request.is_load() {
            self.load().await
        } else {
            self.run(request).await
        }
    }

    fn complete(&self, operation: &str, result: Value) {
        self.sink.emit(ExecutorEvent::result(operation, result));
        if self.descriptor.emits_done {
            self.sink.emit(ExecutorEvent::Done);
        }
    }

    fn fail(&self, message: String) -> String {
        tracing::warn!(model = %self.spec.model_name, error = %message, "request failed");
        self.sink.emit(ExecutorEvent::error(message.clone()));
        message
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("spec", &self.spec)
            .field("runtime", &self.runtime.name())
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

/// Readable text for a caught panic payload
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
