//! Modelhost Core - Model Loading and Inference Coordination
//!
//! This crate hosts one machine-learning model per [`Coordinator`] and runs
//! inference operations against it. The model can run in the caller's own
//! task or inside an isolated context (a dedicated thread, or a worker
//! process), and the caller sees the same events in the same order either
//! way.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                             Caller                               │
//! │        load() / prompt() / classify() / ... / destroy()          │
//! │       ▲ onProgressChange onUpdate onResult onError onDone        │
//! └──────────────┼───────────────────────────────────────────────────┘
//!                │
//! ┌──────────────┼───────────────────────────────────────────────────┐
//! │         Coordinator  (state machine, epoch filter, callbacks)    │
//! │        ┌─────┴──────────────────────┐                            │
//! │        │ direct                     │ isolated                   │
//! │        ▼                            ▼                            │
//! │  ┌──────────────┐          ┌──────────────────┐   CRC32 frames   │
//! │  │ TaskExecutor │          │ IsolatedAdapter  │ ◀──────────────▶ │
//! │  └──────┬───────┘          └──────────────────┘                  │
//! └─────────┼────────────────────────────────────────────────────────┘
//!           │                              │ thread / process
//!           ▼                              ▼
//!    ┌──────────────┐          ┌──────────────────────────────┐
//!    │ ModelRuntime │          │ worker::serve ─▶ TaskExecutor │
//!    └──────────────┘          │               ─▶ ModelRuntime │
//!                              └──────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Coordinator`]: The façade callers load models and run operations through
//! - [`Callbacks`]: The record of functions a coordinator reports to
//! - [`CoordinatorState`]: `idle`, `loading`, `ready`, `busy` or `error`
//! - [`TaskExecutor`]: Loads a model and turns requests into events
//! - [`ExecutorEvent`]: The event protocol shared by both modes
//! - [`ModelRuntime`]: The seam to an actual inference engine
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use modelhost_core::{Callbacks, Category, Coordinator, CoordinatorConfig, EchoRuntime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let callbacks = Callbacks::new()
//!         .on_progress_change(|p| println!("{:?} {}", p.status, p.name))
//!         .on_result(|r| println!("{}", r.payload))
//!         .on_error(|e| eprintln!("{}", e.message));
//!
//!     let config = CoordinatorConfig::new("Xenova/vit-base-patch16-224", Category::ImageClassification);
//!     let mut coordinator = Coordinator::new(config, Arc::new(EchoRuntime::new()), callbacks);
//!
//!     coordinator.load().await?;
//!     coordinator.classify("https://example.com/cat.png").await?;
//!     coordinator.destroy();
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`category`]: Category registry, typed operations and chat messages
//! - [`config`]: Coordinator configuration (code, environment, TOML)
//! - [`coordinator`]: The coordinator, its states and callbacks
//! - [`device`]: Device placement hints
//! - [`error`]: Errors returned by coordinator calls
//! - [`executor`]: The task executor
//! - [`isolation`]: Isolated contexts and the adapter that talks to them
//! - [`protocol`]: Requests and events exchanged with an executor
//! - [`runtime`]: The model runtime trait and the echo runtime
//! - [`worker`]: The serving loop run inside an isolated context

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod category;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod executor;
pub mod isolation;
pub mod protocol;
pub mod runtime;
pub mod worker;

// Re-exports for convenience
pub use category::{Category, CategoryDescriptor, ChatMessage, Operation, ResultKind};
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigSource,
    CoordinatorConfig, IsolationMode, ResolvedConfig,
};
pub use coordinator::{Callbacks, Coordinator, CoordinatorEvent, CoordinatorState};
pub use device::{Device, DeviceHint};
pub use error::CoordinatorError;
pub use executor::{EventSink, TaskExecutor};
pub use protocol::{
    ErrorEvent, ExecutionRequest, ExecutorEvent, LoadPayload, ProgressEvent, ProgressStatus,
    ResultEvent, UpdateEvent,
};
pub use runtime::{EchoRuntime, LoadedModel, ModelRuntime, ProgressReporter, UpdateReporter};

// Isolation exports
pub use isolation::{
    ContextId, ContextLauncher, IsolatedAdapter, ProcessLauncher, ThreadLauncher, TransportError,
};
