//! Echo Runtime
//!
//! A loopback runtime that downloads nothing and infers nothing. Loading
//! walks through the same progress stages a real model fetch would, and
//! every operation answers with a deterministic value derived from its
//! payload, shaped like the category's real result. Text replies are also
//! streamed word by word as the conversation so far.
//!
//! The worker binary serves this runtime, which makes it possible to
//! exercise the full transport path without model weights.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{LoadedModel, ModelRuntime, ProgressReporter, UpdateReporter};
use crate::category::{CategoryDescriptor, ResultKind};
use crate::protocol::LoadPayload;

/// Files the echo runtime pretends to fetch, with their sizes
const FILES: [(&str, u64); 2] = [("config.json", 512), ("model.onnx", 4096)];

/// Number of progress steps reported per file
const CHUNKS: u64 = 4;

/// Loopback [`ModelRuntime`]
#[derive(Debug, Clone, Default)]
pub struct EchoRuntime {
    latency: Duration,
}

impl EchoRuntime {
    /// Create an echo runtime that answers immediately
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation by `latency`
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl ModelRuntime for EchoRuntime {
    fn name(&self) -> &str {
        "echo"
    }

    async fn load(
        &self,
        spec: &LoadPayload,
        progress: &ProgressReporter,
    ) -> anyhow::Result<Box<dyn LoadedModel>> {
        if spec.model_name.trim().is_empty() {
            anyhow::bail!("model name is empty");
        }

        for (file, size) in FILES {
            progress.initiate(file);
            progress.download(file);
            for step in 1..=CHUNKS {
                progress.bytes(file, size * step / CHUNKS, size);
            }
            progress.done(file);
        }

        tracing::debug!(model = %spec.model_name, category = %spec.category, "echo model loaded");
        Ok(Box::new(EchoModel {
            descriptor: spec.category.descriptor(),
            latency: self.latency,
        }))
    }
}

struct EchoModel {
    descriptor: &'static CategoryDescriptor,
    latency: Duration,
}

#[async_trait]
impl LoadedModel for EchoModel {
    async fn run(
        &self,
        operation: &str,
        payload: Value,
        updates: &UpdateReporter,
    ) -> anyhow::Result<Value> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        tracing::trace!(operation, "echo run");

        let result = match self.descriptor.result_kind {
            ResultKind::Text => {
                let reply = format!("echo: {}", last_message(&payload));
                stream_reply(&payload, &reply, updates);
                json!({ "text": reply })
            }
            ResultKind::Transcript => {
                json!({ "text": format!("{} bytes of audio", field(&payload, "audio").len()) })
            }
            ResultKind::Answer => json!({ "answer": format!("echo: {}", field(&payload, "question")) }),
            ResultKind::Audio => json!({
                "text": field(&payload, "text"),
                "voice": payload.get("voice").cloned().unwrap_or(Value::Null),
                "samplingRate": 24_000,
            }),
            ResultKind::DepthMap => json!({ "width": 1, "height": 1, "depth": [0] }),
            ResultKind::Labels => json!([{ "label": "echo", "score": 1.0 }]),
            ResultKind::Detections => json!([]),
        };
        Ok(result)
    }
}

/// Emit the conversation so far after every word of `reply`
fn stream_reply(payload: &Value, reply: &str, updates: &UpdateReporter) {
    let history = payload
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut partial = String::with_capacity(reply.len());
    for word in reply.split_inclusive(' ') {
        partial.push_str(word);
        let mut messages = history.clone();
        messages.push(json!({ "role": "assistant", "content": partial }));
        updates.send(json!({ "messages": messages }));
    }
}

/// String field of a payload, empty when absent
fn field<'a>(payload: &'a Value, name: &str) -> &'a str {
    payload.get(name).and_then(Value::as_str).unwrap_or_default()
}

/// Content of the last message in a chat payload
fn last_message(payload: &Value) -> &str {
    payload
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.last())
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
}
