//! Event-name to handler fan-out.
//!
//! Handlers are identified by their `Arc`: registering the same `Arc` twice
//! for one event is a no-op. Dispatch runs handlers in registration order and
//! isolates failures, so an `Err` or a panic in one handler never keeps the
//! others from running.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, trace, warn};

use crate::error::RealtimeError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

pub type EventHandler = Arc<dyn Fn(&Value) -> HandlerResult + Send + Sync>;

/// Wraps a closure as an [`EventHandler`]. Keep the returned `Arc` to `off` it later.
pub fn handler<F>(f: F) -> EventHandler
where
    F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

type HandlerMap = HashMap<String, Vec<EventHandler>>;

#[derive(Clone, Default)]
pub struct EventDispatcher {
    handlers: Arc<Mutex<HandlerMap>>,
}

/// Outcome of one local emission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// One [`RealtimeError::Handler`] per handler that failed or panicked.
    pub failures: Vec<RealtimeError>,
}

impl DispatchReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: &str, handler: EventHandler) -> Registration {
        let mut handlers = self.handlers.lock();
        let slot = handlers.entry(event.to_string()).or_default();
        if slot.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
            trace!(target = "riptide.dispatch", event, "handler already registered");
        } else {
            slot.push(Arc::clone(&handler));
        }
        Registration {
            handlers: Arc::downgrade(&self.handlers),
            event: event.to_string(),
            handler,
        }
    }

    /// Removes exactly `handler` from `event`. Returns whether it was registered.
    pub fn off(&self, event: &str, handler: &EventHandler) -> bool {
        remove(&self.handlers, event, handler)
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.lock().get(event).map_or(0, Vec::len)
    }

    /// Fans `payload` out to every handler registered for `event`.
    pub fn emit_locally(&self, event: &str, payload: &Value) -> DispatchReport {
        // Snapshot so handlers may register or unregister while we dispatch.
        let targets: Vec<EventHandler> = match self.handlers.lock().get(event) {
            Some(handlers) => handlers.clone(),
            None => {
                trace!(target = "riptide.dispatch", event, "no handlers for event");
                return DispatchReport::default();
            }
        };

        let mut report = DispatchReport::default();
        for (index, handler) in targets.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    let failure = RealtimeError::Handler {
                        event: event.to_string(),
                        detail: err.to_string(),
                    };
                    warn!(
                        target = "riptide.dispatch",
                        handler = index,
                        error = %failure,
                        "event handler failed"
                    );
                    report.failures.push(failure);
                }
                Err(panic) => {
                    let failure = RealtimeError::Handler {
                        event: event.to_string(),
                        detail: format!("panicked: {}", panic_message(&*panic)),
                    };
                    error!(
                        target = "riptide.dispatch",
                        handler = index,
                        error = %failure,
                        "event handler panicked"
                    );
                    report.failures.push(failure);
                }
            }
        }
        report
    }
}

/// Handle returned by [`EventDispatcher::on`].
///
/// Dropping it leaves the handler registered; call [`Registration::unregister`]
/// to remove it.
pub struct Registration {
    handlers: Weak<Mutex<HandlerMap>>,
    event: String,
    handler: EventHandler,
}

impl Registration {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn unregister(self) -> bool {
        match self.handlers.upgrade() {
            Some(handlers) => remove(&handlers, &self.event, &self.handler),
            None => false,
        }
    }
}

fn remove(handlers: &Mutex<HandlerMap>, event: &str, handler: &EventHandler) -> bool {
    let mut handlers = handlers.lock();
    let Some(slot) = handlers.get_mut(event) else {
        return false;
    };
    let before = slot.len();
    slot.retain(|existing| !Arc::ptr_eq(existing, handler));
    let removed = slot.len() != before;
    if slot.is_empty() {
        handlers.remove(event);
    }
    removed
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
