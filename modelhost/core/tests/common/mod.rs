//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use modelhost_core::{
    Callbacks, Category, Coordinator, CoordinatorConfig, CoordinatorEvent, LoadPayload,
    LoadedModel, ModelRuntime, ProgressReporter, UpdateReporter,
};

/// How long to wait for events from an isolated context
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Model name whose load fails with `boom`
pub const BROKEN_MODEL: &str = "broken";

/// Larger than any frame
pub const HUGE_BYTES: usize = 11 * 1024 * 1024;

/// Runtime whose behaviour is picked by the model name and the `text` field
///
/// - model `broken`: load fails with `boom`
/// - text `fail`: the operation fails
/// - text `panic`: the operation panics
/// - text `slow`: the operation takes 300ms
/// - text `spin`: the operation blocks its thread for 300ms
/// - text `stream`: two updates, `{"partial": "st"}` and
///   `{"partial": "stream"}`, before the result
/// - text `huge`: a result too large for a frame
/// - anything else: `{"spoken": <text>}`
#[derive(Debug, Default)]
pub struct ScriptedRuntime;

#[async_trait]
impl ModelRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn load(
        &self,
        spec: &LoadPayload,
        progress: &ProgressReporter,
    ) -> anyhow::Result<Box<dyn LoadedModel>> {
        progress.initiate("weights.bin");
        if spec.model_name == BROKEN_MODEL {
            anyhow::bail!("boom");
        }
        progress.bytes("weights.bin", 50, 100);
        progress.done("weights.bin");
        Ok(Box::new(ScriptedModel))
    }
}

struct ScriptedModel;

#[async_trait]
impl LoadedModel for ScriptedModel {
    async fn run(
        &self,
        _operation: &str,
        payload: Value,
        updates: &UpdateReporter,
    ) -> anyhow::Result<Value> {
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .or_else(|| payload.get("image").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        match text.as_str() {
            "fail" => anyhow::bail!("cannot process 'fail'"),
            "panic" => panic!("inference exploded"),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(json!({ "spoken": text }))
            }
            "spin" => {
                std::thread::sleep(Duration::from_millis(300));
                Ok(json!({ "spoken": text }))
            }
            "stream" => {
                updates.send(json!({ "partial": "st" }));
                updates.send(json!({ "partial": "stream" }));
                Ok(json!({ "spoken": text }))
            }
            "huge" => Ok(json!({ "spoken": "x".repeat(HUGE_BYTES) })),
            _ => Ok(json!({ "spoken": text })),
        }
    }
}

/// A coordinator over [`ScriptedRuntime`] reporting into a channel
pub fn scripted(
    model: &str,
    category: Category,
    isolated: bool,
) -> (Coordinator, UnboundedReceiver<CoordinatorEvent>) {
    let (callbacks, rx) = Callbacks::channel();
    let config = CoordinatorConfig::new(model, category).with_isolation(isolated);
    (
        Coordinator::new(config, Arc::new(ScriptedRuntime), callbacks),
        rx,
    )
}

/// Everything already delivered
pub fn drain(rx: &mut UnboundedReceiver<CoordinatorEvent>) -> Vec<CoordinatorEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

/// Events up to and including the first one matching `last`
pub async fn collect_until(
    rx: &mut UnboundedReceiver<CoordinatorEvent>,
    last: impl Fn(&CoordinatorEvent) -> bool,
) -> Vec<CoordinatorEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event channel closed");
        let done = last(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Whether an event ends an operation of a category that signals completion
pub fn ends_operation_with_done(event: &CoordinatorEvent) -> bool {
    matches!(event, CoordinatorEvent::Done | CoordinatorEvent::Error(_))
}

/// Whether an event ends an operation of a category without a completion signal
pub fn ends_operation(event: &CoordinatorEvent) -> bool {
    matches!(event, CoordinatorEvent::Result(_) | CoordinatorEvent::Error(_))
}
