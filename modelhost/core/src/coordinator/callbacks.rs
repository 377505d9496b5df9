//! Caller Callbacks
//!
//! The record of functions a coordinator reports to. It is built once and
//! handed to the coordinator's constructor; there is no way to swap a
//! callback on a live coordinator.
//!
//! ```ignore
//! let callbacks = Callbacks::new()
//!     .on_result(|result| println!("{}: {}", result.operation, result.payload))
//!     .on_error(|error| eprintln!("failed: {}", error.message));
//! ```
//!
//! For tests and for callers that prefer a stream, [`Callbacks::channel`]
//! wires every callback into one ordered channel of [`CoordinatorEvent`]s.

use tokio::sync::mpsc;

use super::CoordinatorState;
use crate::protocol::{ErrorEvent, ProgressEvent, ResultEvent, UpdateEvent};

type Callback<T> = Box<dyn Fn(T) + Send + Sync>;
type Signal = Box<dyn Fn() + Send + Sync>;

/// Everything a coordinator reports, as one value
#[derive(Clone, Debug, PartialEq)]
pub enum CoordinatorEvent {
    /// `on_progress_change`
    Progress(ProgressEvent),
    /// `on_update`
    Update(UpdateEvent),
    /// `on_result`
    Result(ResultEvent),
    /// `on_error`
    Error(ErrorEvent),
    /// `on_done`
    Done,
    /// `on_ready`
    Ready,
    /// `on_state_change`
    StateChanged(CoordinatorState),
}

/// Callback record injected into a coordinator
#[derive(Default)]
pub struct Callbacks {
    progress_change: Option<Callback<ProgressEvent>>,
    update: Option<Callback<UpdateEvent>>,
    result: Option<Callback<ResultEvent>>,
    error: Option<Callback<ErrorEvent>>,
    done: Option<Signal>,
    ready: Option<Signal>,
    state_change: Option<Callback<CoordinatorState>>,
}

impl Callbacks {
    /// An empty record
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load progress, including the final `ready` event
    #[must_use]
    pub fn on_progress_change(mut self, f: impl Fn(ProgressEvent) + Send + Sync + 'static) -> Self {
        self.progress_change = Some(Box::new(f));
        self
    }

    /// Partial output streamed while an operation runs
    #[must_use]
    pub fn on_update(mut self, f: impl Fn(UpdateEvent) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    /// Operation results
    #[must_use]
    pub fn on_result(mut self, f: impl Fn(ResultEvent) + Send + Sync + 'static) -> Self {
        self.result = Some(Box::new(f));
        self
    }

    /// Load and operation failures
    #[must_use]
    pub fn on_error(mut self, f: impl Fn(ErrorEvent) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    /// Completion signal after a result, for categories that send one
    #[must_use]
    pub fn on_done(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.done = Some(Box::new(f));
        self
    }

    /// Fired once per successful load
    #[must_use]
    pub fn on_ready(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.ready = Some(Box::new(f));
        self
    }

    /// Every state transition
    #[must_use]
    pub fn on_state_change(mut self, f: impl Fn(CoordinatorState) + Send + Sync + 'static) -> Self {
        self.state_change = Some(Box::new(f));
        self
    }

    /// A record that forwards everything into a channel
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CoordinatorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let send = move |event: CoordinatorEvent| {
            let _ = tx.send(event);
        };

        let progress = send.clone();
        let update = send.clone();
        let result = send.clone();
        let error = send.clone();
        let done = send.clone();
        let ready = send.clone();
        let state = send;

        let callbacks = Self::new()
            .on_progress_change(move |p| progress(CoordinatorEvent::Progress(p)))
            .on_update(move |u| update(CoordinatorEvent::Update(u)))
            .on_result(move |r| result(CoordinatorEvent::Result(r)))
            .on_error(move |e| error(CoordinatorEvent::Error(e)))
            .on_done(move || done(CoordinatorEvent::Done))
            .on_ready(move || ready(CoordinatorEvent::Ready))
            .on_state_change(move |s| state(CoordinatorEvent::StateChanged(s)));
        (callbacks, rx)
    }

    pub(crate) fn progress_changed(&self, progress: ProgressEvent) {
        if let Some(f) = &self.progress_change {
            f(progress);
        }
    }

    pub(crate) fn update(&self, update: UpdateEvent) {
        if let Some(f) = &self.update {
            f(update);
        }
    }

    pub(crate) fn result(&self, result: ResultEvent) {
        if let Some(f) = &self.result {
            f(result);
        }
    }

    pub(crate) fn error(&self, error: ErrorEvent) {
        if let Some(f) = &self.error {
            f(error);
        }
    }

    pub(crate) fn done(&self) {
        if let Some(f) = &self.done {
            f();
        }
    }

    pub(crate) fn ready(&self) {
        if let Some(f) = &self.ready {
            f();
        }
    }

    pub(crate) fn state_changed(&self, state: CoordinatorState) {
        if let Some(f) = &self.state_change {
            f(state);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_progress_change", &self.progress_change.is_some())
            .field("on_update", &self.update.is_some())
            .field("on_result", &self.result.is_some())
            .field("on_error", &self.error.is_some())
            .field("on_done", &self.done.is_some())
            .field("on_ready", &self.ready.is_some())
            .field("on_state_change", &self.state_change.is_some())
            .finish()
    }
}
