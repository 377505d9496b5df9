//! Event Dispatch
//!
//! Turns executor events into state transitions and caller callbacks. Both
//! execution modes feed the same [`Dispatcher`], which is what makes them
//! indistinguishable to the caller.
//!
//! Every load starts a new epoch. Events are tagged with the epoch of the
//! engine that produced them, and anything from an older epoch, or arriving
//! after the coordinator was closed, is dropped. The state is always updated
//! before the callbacks for the event run.

use std::sync::Arc;

use parking_lot::Mutex;

use super::callbacks::Callbacks;
use super::CoordinatorState;
use crate::category::CategoryDescriptor;
use crate::error::CoordinatorError;
use crate::executor::EventSink;
use crate::isolation::EventRouter;
use crate::protocol::{ExecutorEvent, ProgressEvent};

struct Inner {
    state: CoordinatorState,
    epoch: u64,
    closed: bool,
    model_loaded: bool,
    callbacks: Option<Arc<Callbacks>>,
}

/// Shared state machine behind a coordinator
pub(crate) struct Dispatcher {
    model: String,
    descriptor: &'static CategoryDescriptor,
    inner: Mutex<Inner>,
    /// Held while callbacks run; `close` takes it to wait out a delivery
    delivery: Mutex<()>,
}

impl Dispatcher {
    pub(crate) fn new(
        model: impl Into<String>,
        descriptor: &'static CategoryDescriptor,
        callbacks: Callbacks,
    ) -> Self {
        Self {
            model: model.into(),
            descriptor,
            inner: Mutex::new(Inner {
                state: CoordinatorState::Idle,
                epoch: 0,
                closed: false,
                model_loaded: false,
                callbacks: Some(Arc::new(callbacks)),
            }),
            delivery: Mutex::new(()),
        }
    }

    pub(crate) fn state(&self) -> CoordinatorState {
        self.inner.lock().state
    }

    /// Enter `loading` under a new epoch
    pub(crate) fn begin_load(&self) -> Result<u64, CoordinatorError> {
        let _delivery = self.delivery.lock();
        let (epoch, callbacks) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(CoordinatorError::Destroyed);
            }
            match inner.state {
                CoordinatorState::Loading => return Err(CoordinatorError::LoadInProgress),
                CoordinatorState::Ready | CoordinatorState::Busy => {
                    return Err(CoordinatorError::AlreadyLoaded)
                }
                CoordinatorState::Idle | CoordinatorState::Error => {}
            }
            inner.epoch += 1;
            inner.model_loaded = false;
            inner.state = CoordinatorState::Loading;
            (inner.epoch, inner.callbacks.clone())
        };

        tracing::debug!(model = %self.model, epoch, "state -> loading");
        if let Some(callbacks) = callbacks {
            callbacks.state_changed(CoordinatorState::Loading);
        }
        Ok(epoch)
    }

    /// Enter `busy` for one operation; returns the current epoch
    pub(crate) fn begin_operation(&self) -> Result<u64, CoordinatorError> {
        let _delivery = self.delivery.lock();
        let (epoch, callbacks) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(CoordinatorError::Destroyed);
            }
            match inner.state {
                CoordinatorState::Busy => return Err(CoordinatorError::Busy),
                CoordinatorState::Ready => {}
                CoordinatorState::Error if inner.model_loaded => {}
                state => return Err(CoordinatorError::NotReady { state }),
            }
            inner.state = CoordinatorState::Busy;
            (inner.epoch, inner.callbacks.clone())
        };

        tracing::debug!(model = %self.model, epoch, "state -> busy");
        if let Some(callbacks) = callbacks {
            callbacks.state_changed(CoordinatorState::Busy);
        }
        Ok(epoch)
    }

    /// Roll back a load or operation whose future was dropped
    pub(crate) fn abandon(&self, epoch: u64) {
        let _delivery = self.delivery.lock();
        let (next, callbacks) = {
            let mut inner = self.inner.lock();
            if inner.closed || inner.epoch != epoch {
                return;
            }
            let next = match inner.state {
                CoordinatorState::Loading => {
                    // Orphan whatever the abandoned load still emits
                    inner.epoch += 1;
                    CoordinatorState::Idle
                }
                CoordinatorState::Busy => CoordinatorState::Ready,
                _ => return,
            };
            inner.state = next;
            (next, inner.callbacks.clone())
        };

        tracing::debug!(model = %self.model, epoch, state = %next, "abandoned request");
        if let Some(callbacks) = callbacks {
            callbacks.state_changed(next);
        }
    }

    /// Apply one executor event
    pub(crate) fn deliver(&self, epoch: u64, event: ExecutorEvent) {
        let _delivery = self.delivery.lock();
        let (callbacks, transition) = {
            let mut inner = self.inner.lock();
            if inner.closed || inner.epoch != epoch {
                tracing::debug!(
                    model = %self.model,
                    epoch,
                    current = inner.epoch,
                    event = event.name(),
                    "discarding stale event"
                );
                return;
            }

            let next = match (&event, inner.state) {
                (ExecutorEvent::Progress { .. } | ExecutorEvent::Update(_), _) => None,
                (ExecutorEvent::Load, CoordinatorState::Loading) => {
                    inner.model_loaded = true;
                    Some(CoordinatorState::Ready)
                }
                (ExecutorEvent::Load, state) => {
                    tracing::warn!(model = %self.model, %state, "unexpected onLoad, ignoring");
                    return;
                }
                (ExecutorEvent::Result(_), CoordinatorState::Busy) if !self.descriptor.emits_done => {
                    Some(CoordinatorState::Ready)
                }
                (ExecutorEvent::Result(_), _) => None,
                (ExecutorEvent::Done, CoordinatorState::Busy) => Some(CoordinatorState::Ready),
                (ExecutorEvent::Done, _) => None,
                (ExecutorEvent::Error(_), _) => Some(CoordinatorState::Error),
            };

            let transition = next.filter(|state| *state != inner.state);
            if let Some(state) = transition {
                inner.state = state;
            }
            (inner.callbacks.clone(), transition)
        };

        if let Some(state) = transition {
            tracing::debug!(model = %self.model, epoch, %state, event = event.name(), "state changed");
        }
        let Some(callbacks) = callbacks else {
            return;
        };
        if let Some(state) = transition {
            callbacks.state_changed(state);
        }

        match event {
            ExecutorEvent::Progress { progress } => callbacks.progress_changed(progress),
            ExecutorEvent::Update(update) => callbacks.update(update),
            ExecutorEvent::Load => {
                callbacks.progress_changed(ProgressEvent::ready(&self.model));
                callbacks.ready();
            }
            ExecutorEvent::Result(result) => callbacks.result(result),
            ExecutorEvent::Error(error) => callbacks.error(error),
            ExecutorEvent::Done => callbacks.done(),
        }
    }

    /// The isolated context of `epoch` died
    pub(crate) fn context_lost(&self, epoch: u64, reason: String) {
        {
            let mut inner = self.inner.lock();
            if inner.closed || inner.epoch != epoch {
                return;
            }
            inner.model_loaded = false;
        }
        self.deliver(epoch, ExecutorEvent::error(reason));
    }

    /// Stop all delivery; returns once no callback is running
    pub(crate) fn close(&self) {
        let _delivery = self.delivery.lock();
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.model_loaded = false;
        inner.state = CoordinatorState::Idle;
        inner.callbacks = None;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Routes events from one engine into the dispatcher under its epoch
pub(crate) struct EpochRouter {
    dispatcher: Arc<Dispatcher>,
    epoch: u64,
}

impl EpochRouter {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, epoch: u64) -> Self {
        Self { dispatcher, epoch }
    }
}

impl EventSink for EpochRouter {
    fn emit(&self, event: ExecutorEvent) {
        self.dispatcher.deliver(self.epoch, event);
    }
}

impl EventRouter for EpochRouter {
    fn on_message(&self, event: ExecutorEvent) {
        self.dispatcher.deliver(self.epoch, event);
    }

    fn on_context_failure(&self, reason: String) {
        self.dispatcher.context_lost(self.epoch, reason);
    }
}

/// Rolls the dispatcher back if a load or operation future is dropped early
pub(crate) struct Pending<'a> {
    dispatcher: &'a Dispatcher,
    epoch: u64,
    armed: bool,
}

impl<'a> Pending<'a> {
    pub(crate) fn new(dispatcher: &'a Dispatcher, epoch: u64) -> Self {
        Self {
            dispatcher,
            epoch,
            armed: true,
        }
    }

    /// The request finished; nothing to roll back
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.dispatcher.abandon(self.epoch);
        }
    }
}
