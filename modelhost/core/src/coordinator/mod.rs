//! Coordinator
//!
//! The public façade over model loading and inference. A coordinator hosts
//! one model for one category and exposes the same API whether the model
//! runs in the caller's own task (direct mode) or inside an isolated
//! context (thread or process).
//!
//! # State Machine
//!
//! ```text
//!            load()                 onLoad
//!   Idle ──────────────▶ Loading ──────────────▶ Ready ◀──────┐
//!    ▲                      │                      │          │ onResult / onDone
//!    │                      │ onError    operation │          │
//!    │                      ▼                      ▼          │
//!    │       load()       Error ◀──── onError ──── Busy ──────┘
//!    │   ◀────────────────  │
//!    │                      └── operation (model still loaded) ──▶ Busy
//!    │
//!    └──────────── destroy() from anywhere (terminal)
//! ```
//!
//! # Policies
//!
//! - Operations before a successful load fail with
//!   [`CoordinatorError::NotReady`] and never reach the model.
//! - `load()` while loading fails with [`CoordinatorError::LoadInProgress`];
//!   while a model is loaded, with [`CoordinatorError::AlreadyLoaded`].
//! - A second operation while one is running fails with
//!   [`CoordinatorError::Busy`]. Nothing is queued.
//! - `destroy()` is idempotent; afterwards every call fails with
//!   [`CoordinatorError::Destroyed`] and no callback fires again.

pub mod callbacks;
mod dispatch;
pub mod state;

use std::sync::Arc;

use serde_json::Value;

pub use callbacks::{Callbacks, CoordinatorEvent};
pub use state::CoordinatorState;

use crate::category::{Category, ChatMessage, Operation};
use crate::config::{CoordinatorConfig, IsolationMode};
use crate::error::CoordinatorError;
use crate::executor::TaskExecutor;
use crate::isolation::{ContextLauncher, IsolatedAdapter, ProcessLauncher, ThreadLauncher};
use crate::protocol::{ExecutionRequest, ExecutorEvent};
use crate::runtime::ModelRuntime;
use dispatch::{Dispatcher, EpochRouter, Pending};

/// How the coordinator reaches a model
enum Backend {
    Direct(Arc<dyn ModelRuntime>),
    Isolated(Arc<dyn ContextLauncher>),
}

/// The loaded model, in whichever mode
enum Engine {
    Direct(TaskExecutor),
    Isolated(IsolatedAdapter),
}

/// Hosts one model and runs operations against it
pub struct Coordinator {
    config: CoordinatorConfig,
    backend: Backend,
    dispatcher: Arc<Dispatcher>,
    engine: Option<Engine>,
}

impl Coordinator {
    /// Create a coordinator for `config`
    ///
    /// In direct and thread modes the model is served by `runtime`. In
    /// process mode the worker program serves its own runtime and `runtime`
    /// is not used.
    pub fn new(
        config: CoordinatorConfig,
        runtime: Arc<dyn ModelRuntime>,
        callbacks: Callbacks,
    ) -> Self {
        let backend = match &config.isolation {
            IsolationMode::Direct => Backend::Direct(runtime),
            IsolationMode::Thread => Backend::Isolated(Arc::new(ThreadLauncher::new(runtime))),
            IsolationMode::Process { program, args } => Backend::Isolated(Arc::new(
                ProcessLauncher::new(program.clone()).with_args(args.iter().cloned()),
            )),
        };
        Self::with_backend(config, backend, callbacks)
    }

    /// Create a coordinator whose model always runs in contexts from `launcher`
    ///
    /// The isolation mode in `config` is ignored.
    pub fn with_launcher(
        config: CoordinatorConfig,
        launcher: Arc<dyn ContextLauncher>,
        callbacks: Callbacks,
    ) -> Self {
        Self::with_backend(config, Backend::Isolated(launcher), callbacks)
    }

    fn with_backend(config: CoordinatorConfig, backend: Backend, callbacks: Callbacks) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            config.model.clone(),
            config.category.descriptor(),
            callbacks,
        ));
        tracing::debug!(
            model = %config.model,
            category = %config.category,
            isolated = matches!(backend, Backend::Isolated(_)),
            "coordinator created"
        );
        Self {
            config,
            backend,
            dispatcher,
            engine: None,
        }
    }

    /// Current state
    ///
    /// A destroyed coordinator reports [`CoordinatorState::Idle`].
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        self.dispatcher.state()
    }

    /// Model identifier
    #[must_use]
    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Category the model is hosted for
    #[must_use]
    pub fn category(&self) -> Category {
        self.config.category
    }

    /// Whether the model runs outside the caller's context
    #[must_use]
    pub fn is_isolated(&self) -> bool {
        matches!(self.backend, Backend::Isolated(_))
    }

    /// Configuration this coordinator was built with
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Load the model
    ///
    /// Resolves after the terminal load event has been delivered: on success
    /// the state is `ready` and the caller has seen exactly one `ready`
    /// progress event; on failure the state is `error`, the caller has seen
    /// exactly one `onError`, and the same reason is returned.
    ///
    /// Dropping the returned future abandons the load and returns the
    /// coordinator to `idle`.
    ///
    /// # Errors
    ///
    /// `LoadInProgress`, `AlreadyLoaded` or `Destroyed` without any event;
    /// `LoadFailed` after the error event.
    pub async fn load(&mut self) -> Result<(), CoordinatorError> {
        let epoch = self.dispatcher.begin_load()?;
        // A reload from `error` replaces the previous model
        self.engine = None;

        let pending = Pending::new(&self.dispatcher, epoch);
        let router = Arc::new(EpochRouter::new(Arc::clone(&self.dispatcher), epoch));
        let spec = self.config.load_payload();

        tracing::info!(
            model = %self.config.model,
            category = %self.config.category,
            epoch,
            isolated = self.is_isolated(),
            "loading"
        );

        let outcome = match &self.backend {
            Backend::Direct(runtime) => {
                let mut executor = TaskExecutor::new(Arc::clone(runtime), spec, router);
                match executor.load().await {
                    Ok(()) => Ok(Engine::Direct(executor)),
                    Err(message) => Err(CoordinatorError::LoadFailed(message)),
                }
            }
            Backend::Isolated(launcher) => IsolatedAdapter::start(
                launcher.as_ref(),
                ExecutionRequest::load(&spec),
                router,
                self.config.context_exit_grace,
            )
            .await
            .map(Engine::Isolated),
        };

        pending.disarm();
        let engine = outcome?;
        self.engine = Some(engine);
        Ok(())
    }

    /// Run an operation by name
    ///
    /// In direct mode this resolves after the operation's events have been
    /// delivered. In isolated mode it resolves once the request has been
    /// handed to the context, and the events follow through the callbacks.
    /// Either way the outcome arrives as `onResult` or `onError`, never as
    /// the returned value.
    ///
    /// # Errors
    ///
    /// `NotReady`, `Busy` or `Destroyed` without any event.
    pub async fn invoke(
        &mut self,
        operation: &str,
        payload: Value,
    ) -> Result<(), CoordinatorError> {
        let epoch = self.dispatcher.begin_operation()?;
        let request = ExecutionRequest::new(operation, payload);

        tracing::debug!(model = %self.config.model, operation, epoch, "invoking operation");

        match self.engine.as_mut() {
            Some(Engine::Direct(executor)) => {
                let pending = Pending::new(&self.dispatcher, epoch);
                let _ = executor.run(&request).await;
                pending.disarm();
            }
            Some(Engine::Isolated(adapter)) => {
                if let Err(e) = adapter.send(request) {
                    self.dispatcher.deliver(epoch, ExecutorEvent::error(e.to_string()));
                }
            }
            None => {
                // Only reachable if the engine vanished between state checks
                self.dispatcher.abandon(epoch);
                return Err(CoordinatorError::NotReady {
                    state: self.dispatcher.state(),
                });
            }
        }
        Ok(())
    }

    /// Run a typed operation
    ///
    /// # Errors
    ///
    /// See [`invoke`](Self::invoke).
    pub async fn run(&mut self, operation: Operation) -> Result<(), CoordinatorError> {
        let payload = operation.payload();
        self.invoke(operation.name(), payload).await
    }

    /// Chat completion (`chat`, `visual-question-answering`)
    ///
    /// # Errors
    ///
    /// See [`invoke`](Self::invoke).
    pub async fn prompt(&mut self, messages: Vec<ChatMessage>) -> Result<(), CoordinatorError> {
        self.run(Operation::Prompt {
            messages,
            settings: None,
        })
        .await
    }

    /// Speech recognition (`audio-text-to-text`)
    ///
    /// # Errors
    ///
    /// See [`invoke`](Self::invoke).
    pub async fn transcribe(&mut self, audio: impl Into<String>) -> Result<(), CoordinatorError> {
        self.run(Operation::Transcribe {
            audio: audio.into(),
        })
        .await
    }

    /// Question about an image or document (`image-text-to-text`,
    /// `document-question-answering`)
    ///
    /// # Errors
    ///
    /// See [`invoke`](Self::invoke).
    pub async fn ask(
        &mut self,
        image: impl Into<String>,
        question: impl Into<String>,
    ) -> Result<(), CoordinatorError> {
        self.run(Operation::Ask {
            image: image.into(),
            question: question.into(),
        })
        .await
    }

    /// Image classification
    ///
    /// # Errors
    ///
    /// See [`invoke`](Self::invoke).
    pub async fn classify(&mut self, image: impl Into<String>) -> Result<(), CoordinatorError> {
        self.run(Operation::Classify {
            image: image.into(),
        })
        .await
    }

    /// Object detection
    ///
    /// # Errors
    ///
    /// See [`invoke`](Self::invoke).
    pub async fn detect(&mut self, image: impl Into<String>) -> Result<(), CoordinatorError> {
        self.run(Operation::Detect {
            image: image.into(),
        })
        .await
    }

    /// Depth estimation
    ///
    /// # Errors
    ///
    /// See [`invoke`](Self::invoke).
    pub async fn estimate(&mut self, image: impl Into<String>) -> Result<(), CoordinatorError> {
        self.run(Operation::Estimate {
            image: image.into(),
        })
        .await
    }

    /// Speech synthesis with the default voice and speed
    ///
    /// # Errors
    ///
    /// See [`invoke`](Self::invoke).
    pub async fn speak(&mut self, text: impl Into<String>) -> Result<(), CoordinatorError> {
        self.run(Operation::Speak {
            text: text.into(),
            voice: None,
            speed: None,
        })
        .await
    }

    /// Tear everything down
    ///
    /// Stops the isolated context (if any) without waiting for in-flight
    /// work, drops the model, and silences every callback. Safe to call any
    /// number of times, in any state.
    ///
    /// A process context is killed outright. A thread context stops at the
    /// operation's next `.await`; blocking work keeps its thread busy until
    /// it returns, though nothing it emits is delivered.
    pub fn destroy(&mut self) {
        if self.dispatcher.is_closed() {
            return;
        }

        // Silence callbacks first so nothing slips out while the engine stops
        self.dispatcher.close();
        if let Some(Engine::Isolated(mut adapter)) = self.engine.take() {
            adapter.terminate();
        }
        tracing::info!(model = %self.config.model, "coordinator destroyed");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("model", &self.config.model)
            .field("category", &self.config.category)
            .field("isolated", &self.is_isolated())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
