// Detached multi-subscriber event dispatch
//
// Every emission spawns one background task per handler, so a slow
// subscriber can never delay the timer task that raised the event. No
// ordering is guaranteed between events of different kinds or between
// events raised from different ticks; this is a documented non-goal, not an
// accident.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use tracing::error;
use uuid::Uuid;

use crate::context::Context;
use crate::errors::RuntimeError;

/// Which component raised an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Trigger,
    Job,
    Orchestrator,
}

/// Identity of the component that raised an event.
#[derive(Debug, Clone)]
pub struct EventSource {
    pub id: Uuid,
    pub name: String,
    pub group: Option<String>,
    pub kind: ComponentKind,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "[{}:{}]", group, self.name),
            None => write!(f, "[{}]", self.name),
        }
    }
}

/// A lifecycle notification: the originating component, the opaque context
/// supplied at activation, and — for Faulted events only — the error.
#[derive(Debug, Clone)]
pub struct Event {
    pub source: EventSource,
    pub context: Option<Context>,
    pub error: Option<Arc<RuntimeError>>,
}

impl Event {
    pub fn new(source: EventSource, context: Option<Context>) -> Self {
        Self { source, context, error: None }
    }

    pub fn faulted(source: EventSource, context: Option<Context>, error: Arc<RuntimeError>) -> Self {
        Self { source, context, error: Some(error) }
    }
}

type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A multi-subscriber hook for one event kind.
pub struct Hook {
    /// Event name used in logs and handler-fault reports.
    event: &'static str,
    handlers: RwLock<Vec<Handler>>,
}

impl Hook {
    pub fn new(event: &'static str) -> Self {
        Self {
            event,
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler. Handlers added after an emission only observe
    /// subsequent events.
    pub fn subscribe<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Dispatch to every subscriber on detached tasks. A handler error is
    /// handed to `on_handler_error`; the caller decides whether it becomes a
    /// Faulted event or is only logged.
    pub fn emit<E>(&self, event: Event, on_handler_error: E)
    where
        E: Fn(RuntimeError) + Clone + Send + Sync + 'static,
    {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let name = self.event;

        for handler in handlers {
            let event = event.clone();
            let on_error = on_handler_error.clone();
            tokio::spawn(async move {
                if let Err(e) = handler(event).await {
                    on_error(RuntimeError::HandlerFailed {
                        event: name,
                        reason: e.to_string(),
                    });
                }
            });
        }
    }

    /// Dispatch where handler errors are terminal: logged and discarded,
    /// never re-raised. Used for Faulted itself so a failing Faulted handler
    /// cannot recurse.
    pub fn emit_logged(&self, event: Event) {
        let name = self.event;
        self.emit(event, move |e| {
            error!(event = name, error = %e, "event handler failed");
        });
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook").field("event", &self.event).finish()
    }
}
