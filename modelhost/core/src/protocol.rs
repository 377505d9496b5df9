//! Event Protocol
//!
//! The request and event types exchanged between a coordinator and a task
//! executor. Both execution modes use exactly these types: in direct mode
//! they are passed by value, across an isolated context they are framed as
//! JSON (see [`crate::isolation::frame`]).
//!
//! # Wire Shape
//!
//! ```text
//! Request:  { "event": "load" | <operation>, "payload": { ... } }
//! Response: { "event": "onProgressChange" | "onUpdate" | "onResult" | "onLoad" | "onError" | "onDone",
//!             "payload": { "progress"?, "operation"?, "update"?, "result"?, "error"? } }
//! ```
//!
//! # Ordering
//!
//! Events produced for one request are delivered in the order they were
//! emitted. A `load` produces any number of progress events followed by
//! exactly one of [`ExecutorEvent::Load`] or [`ExecutorEvent::Error`]. An
//! operation produces any number of [`ExecutorEvent::Update`]s, then exactly
//! one of [`ExecutorEvent::Result`] or [`ExecutorEvent::Error`], optionally
//! followed by [`ExecutorEvent::Done`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::category::Category;
use crate::device::DeviceHint;

/// Operation name of the load request
pub const LOAD_OPERATION: &str = "load";

// ============================================================================
// Requests
// ============================================================================

/// A request sent to a task executor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// `load` or a category operation name
    #[serde(rename = "event")]
    pub operation: String,
    /// Operation arguments, opaque to the transport
    #[serde(default)]
    pub payload: Value,
}

impl ExecutionRequest {
    /// Create a request for an operation
    pub fn new(operation: impl Into<String>, payload: Value) -> Self {
        Self {
            operation: operation.into(),
            payload,
        }
    }

    /// Create the load request for a model
    #[must_use]
    pub fn load(payload: &LoadPayload) -> Self {
        // String keys and plain enums only, so serialization cannot fail
        Self::new(
            LOAD_OPERATION,
            serde_json::to_value(payload).unwrap_or_default(),
        )
    }

    /// Whether this is a load request
    #[must_use]
    pub fn is_load(&self) -> bool {
        self.operation == LOAD_OPERATION
    }
}

/// Payload of the `load` request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadPayload {
    /// Model identifier understood by the runtime
    pub model_name: String,
    /// Category the model is loaded for
    pub category: Category,
    /// Device placement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceHint>,
}

impl LoadPayload {
    /// Build a load payload
    pub fn new(model_name: impl Into<String>, category: Category) -> Self {
        Self {
            model_name: model_name.into(),
            category,
            device: None,
        }
    }

    /// Set the device hint
    #[must_use]
    pub fn with_device(mut self, device: Option<DeviceHint>) -> Self {
        self.device = device;
        self
    }
}

// ============================================================================
// Events
// ============================================================================

/// Stage of a model load
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    /// A file is about to be fetched
    Initiate,
    /// A file download started
    Download,
    /// Bytes arrived for a file
    Progress,
    /// A file finished
    Done,
    /// The model is ready (emitted once per load, by the coordinator)
    Ready,
}

/// Load progress notification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Stage
    pub status: ProgressStatus,
    /// Model identifier
    pub name: String,
    /// File within the model, when the stage concerns one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Percentage, 0 to 100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Bytes received so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded: Option<u64>,
    /// Total bytes expected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl ProgressEvent {
    /// Progress event without file details
    pub fn new(status: ProgressStatus, name: impl Into<String>) -> Self {
        Self {
            status,
            name: name.into(),
            file: None,
            progress: None,
            loaded: None,
            total: None,
        }
    }

    /// The ready event the coordinator emits after a successful load
    pub fn ready(name: impl Into<String>) -> Self {
        Self::new(ProgressStatus::Ready, name)
    }

    /// Set the file name
    #[must_use]
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Set byte counts; the percentage is derived from them
    #[must_use]
    pub fn with_bytes(mut self, loaded: u64, total: u64) -> Self {
        self.loaded = Some(loaded);
        self.total = Some(total);
        if total > 0 {
            #[allow(clippy::cast_precision_loss)]
            let pct = (loaded as f64 / total as f64) * 100.0;
            self.progress = Some(pct.clamp(0.0, 100.0));
        }
        self
    }

}

/// Outcome of a completed operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    /// Operation that produced the result
    pub operation: String,
    /// Result value
    #[serde(rename = "result")]
    pub payload: Value,
}

/// Intermediate output of a running operation
///
/// Streamed partial output, such as the conversation so far while a chat
/// reply is being generated. Always precedes the operation's result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    /// Operation that is producing the update
    pub operation: String,
    /// Partial output, shaped by the runtime
    #[serde(rename = "update")]
    pub payload: Value,
}

/// Failure of a load or an operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Human-readable reason
    #[serde(rename = "error")]
    pub message: String,
}

impl ErrorEvent {
    /// Create an error event
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Everything a task executor can emit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ExecutorEvent {
    /// Load progress
    #[serde(rename = "onProgressChange")]
    Progress {
        /// The progress update
        progress: ProgressEvent,
    },
    /// Partial output of a running operation
    #[serde(rename = "onUpdate")]
    Update(UpdateEvent),
    /// Operation result
    #[serde(rename = "onResult")]
    Result(ResultEvent),
    /// Terminal success of a load
    #[serde(rename = "onLoad")]
    Load,
    /// Failure of the current request
    #[serde(rename = "onError")]
    Error(ErrorEvent),
    /// End of an operation's lifecycle
    #[serde(rename = "onDone")]
    Done,
}

impl ExecutorEvent {
    /// Wrap a progress update
    #[must_use]
    pub fn progress(progress: ProgressEvent) -> Self {
        Self::Progress { progress }
    }

    /// Wrap a partial output
    pub fn update(operation: impl Into<String>, payload: Value) -> Self {
        Self::Update(UpdateEvent {
            operation: operation.into(),
            payload,
        })
    }

    /// Wrap an operation result
    pub fn result(operation: impl Into<String>, payload: Value) -> Self {
        Self::Result(ResultEvent {
            operation: operation.into(),
            payload,
        })
    }

    /// Wrap an error message
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorEvent::new(message))
    }

    /// Wire name of the event
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "onProgressChange",
            Self::Update(_) => "onUpdate",
            Self::Result(_) => "onResult",
            Self::Load => "onLoad",
            Self::Error(_) => "onError",
            Self::Done => "onDone",
        }
    }

    /// Whether this event ends a load request
    #[must_use]
    pub fn ends_load(&self) -> bool {
        matches!(self, Self::Load | Self::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_wire_names() {
        let request = ExecutionRequest::new("classify", json!({"image": "aGk="}));
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire, json!({"event": "classify", "payload": {"image": "aGk="}}));
    }

    #[test]
    fn test_load_request_payload() {
        let payload = LoadPayload::new("Xenova/vit-base", Category::ImageClassification)
            .with_device(Some(DeviceHint::Single(Device::Webgpu)));
        let request = ExecutionRequest::load(&payload);

        assert!(request.is_load());
        assert_eq!(
            request.payload,
            json!({
                "modelName": "Xenova/vit-base",
                "category": "image-classification",
                "device": "webgpu"
            })
        );

        let back: LoadPayload = serde_json::from_value(request.payload).unwrap();
        assert_eq!(back, payload);

        let per_module: DeviceHint = "encoder_model=webgpu,decoder_model_merged=wasm".parse().unwrap();
        let request = ExecutionRequest::load(&LoadPayload::new("m", Category::Chat).with_device(Some(per_module)));
        assert_eq!(
            request.payload,
            json!({
                "modelName": "m",
                "category": "chat",
                "device": {"decoder_model_merged": "wasm", "encoder_model": "webgpu"}
            })
        );
        let request = ExecutionRequest::load(&LoadPayload::new("m", Category::Chat));
        assert_eq!(request.payload, json!({"modelName": "m", "category": "chat"}));
    }

    #[test]
    fn test_request_without_payload_defaults_to_null() {
        let request: ExecutionRequest = serde_json::from_str(r#"{"event":"load"}"#).unwrap();
        assert_eq!(request.payload, Value::Null);
    }

    #[test]
    fn test_event_wire_shapes() {
        let progress = ExecutorEvent::progress(
            ProgressEvent::new(ProgressStatus::Progress, "m")
                .with_file("model.onnx")
                .with_bytes(50, 200),
        );
        assert_eq!(
            serde_json::to_value(&progress).unwrap(),
            json!({
                "event": "onProgressChange",
                "payload": {"progress": {
                    "status": "progress",
                    "name": "m",
                    "file": "model.onnx",
                    "progress": 25.0,
                    "loaded": 50,
                    "total": 200
                }}
            })
        );

        assert_eq!(
            serde_json::to_value(ExecutorEvent::result("detect", json!([]))).unwrap(),
            json!({"event": "onResult", "payload": {"operation": "detect", "result": []}})
        );
        assert_eq!(
            serde_json::to_value(ExecutorEvent::error("boom")).unwrap(),
            json!({"event": "onError", "payload": {"error": "boom"}})
        );
        assert_eq!(
            serde_json::to_value(ExecutorEvent::Load).unwrap(),
            json!({"event": "onLoad"})
        );
        assert_eq!(
            serde_json::to_value(ExecutorEvent::update("prompt", json!({"text": "Hel"}))).unwrap(),
            json!({"event": "onUpdate", "payload": {"operation": "prompt", "update": {"text": "Hel"}}})
        );
    }

    #[test]
    fn test_unit_events_parse_without_payload() {
        let done: ExecutorEvent = serde_json::from_str(r#"{"event":"onDone"}"#).unwrap();
        assert_eq!(done, ExecutorEvent::Done);
        assert_eq!(done.name(), "onDone");
    }

    #[test]
    fn test_progress_is_clamped() {
        let event = ProgressEvent::new(ProgressStatus::Progress, "m").with_bytes(300, 200);
        assert_eq!(event.progress, Some(100.0));
        let event = ProgressEvent::new(ProgressStatus::Progress, "m").with_bytes(1, 0);
        assert_eq!(event.progress, None);
    }

    #[test]
    fn test_ends_load() {
        assert!(ExecutorEvent::Load.ends_load());
        assert!(ExecutorEvent::error("x").ends_load());
        assert!(!ExecutorEvent::Done.ends_load());
        assert!(!ExecutorEvent::progress(ProgressEvent::ready("m")).ends_load());
    }
}
