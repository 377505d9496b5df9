//! Model Runtime Traits
//!
//! The inference capability consumed by the task executor. A runtime knows
//! how to turn a model identifier into a loaded model, and a loaded model
//! knows how to run operations. Everything model-family specific (which
//! graph to call, how to pre-process inputs) is decided inside
//! [`ModelRuntime::load`], which hands back a bound [`LoadedModel`] that is
//! used as-is for every later operation.
//!
//! Runtimes report failures with [`anyhow::Error`]; the executor converts
//! them (and panics) into error events, so implementations never need to
//! know about the event protocol beyond [`ProgressReporter`] and
//! [`UpdateReporter`].

pub mod echo;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::executor::EventSink;
use crate::protocol::{ExecutorEvent, LoadPayload, ProgressEvent, ProgressStatus};

pub use echo::EchoRuntime;

/// Loads models
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Load a model, reporting download progress through `progress`
    async fn load(
        &self,
        spec: &LoadPayload,
        progress: &ProgressReporter,
    ) -> anyhow::Result<Box<dyn LoadedModel>>;
}

/// A model ready to serve operations
#[async_trait]
pub trait LoadedModel: Send + Sync {
    /// Run one operation
    ///
    /// `operation` and `payload` have already been checked against the
    /// category descriptor. Partial output can be streamed through
    /// `updates` before the final value is returned.
    async fn run(
        &self,
        operation: &str,
        payload: Value,
        updates: &UpdateReporter,
    ) -> anyhow::Result<Value>;
}

/// Handle a runtime uses to emit load progress
#[derive(Clone)]
pub struct ProgressReporter {
    model: String,
    sink: Arc<dyn EventSink>,
}

impl ProgressReporter {
    /// Create a reporter for `model` emitting into `sink`
    pub fn new(model: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            model: model.into(),
            sink,
        }
    }

    /// Model this reporter speaks for
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Emit a progress event as-is
    ///
    /// `ready` is reserved for the coordinator and is dropped here.
    pub fn report(&self, event: ProgressEvent) {
        if event.status == ProgressStatus::Ready {
            tracing::warn!(model = %self.model, "runtime reported ready status, ignoring");
            return;
        }
        self.sink.emit(ExecutorEvent::progress(event));
    }

    /// A file is about to be fetched
    pub fn initiate(&self, file: &str) {
        self.report(ProgressEvent::new(ProgressStatus::Initiate, &self.model).with_file(file));
    }

    /// A file download started
    pub fn download(&self, file: &str) {
        self.report(ProgressEvent::new(ProgressStatus::Download, &self.model).with_file(file));
    }

    /// Bytes arrived for a file
    pub fn bytes(&self, file: &str, loaded: u64, total: u64) {
        self.report(
            ProgressEvent::new(ProgressStatus::Progress, &self.model)
                .with_file(file)
                .with_bytes(loaded, total),
        );
    }

    /// A file finished
    pub fn done(&self, file: &str) {
        self.report(ProgressEvent::new(ProgressStatus::Done, &self.model).with_file(file));
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Handle a loaded model uses to stream partial output of one operation
#[derive(Clone)]
pub struct UpdateReporter {
    operation: String,
    sink: Arc<dyn EventSink>,
}

impl UpdateReporter {
    /// Create a reporter for `operation` emitting into `sink`
    pub fn new(operation: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            operation: operation.into(),
            sink,
        }
    }

    /// Operation being reported on
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Emit one partial output
    pub fn send(&self, update: Value) {
        self.sink.emit(ExecutorEvent::update(&self.operation, update));
    }
}

impl std::fmt::Debug for UpdateReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateReporter")
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}
