//! Event name → handler routing

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{trace, warn};

use crate::{event::AmiEventType, protocol::ProtocolMessage};

/// Error type handlers may return. It is logged, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by event handlers.
pub type HandlerResult = Result<(), HandlerError>;

type Handler = Box<dyn Fn(&ProtocolMessage) -> HandlerResult + Send + Sync>;

/// Routes events to the handlers registered for their name.
///
/// Names match case-insensitively. Handlers for one name run in registration
/// order, then the catch-all handlers. A handler that returns an error or
/// panics is logged and skipped; the rest still run.
///
/// ```
/// use asterisk_ami_tokio::{AmiEventType, EventDispatcher, ProtocolMessage};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let hangups = Arc::new(AtomicUsize::new(0));
/// let counter = hangups.clone();
/// let mut dispatcher = EventDispatcher::new();
/// dispatcher.on(AmiEventType::Hangup, move |_event| {
///     counter.fetch_add(1, Ordering::Relaxed);
///     Ok(())
/// });
///
/// dispatcher.dispatch(&ProtocolMessage::event("Hangup", [("Channel", "SIP/100-00000001")]));
/// assert_eq!(hangups.load(Ordering::Relaxed), 1);
/// ```
#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<String, Vec<Handler>>,
    any: Vec<Handler>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self
            .handlers
            .keys()
            .collect();
        names.sort();
        f.debug_struct("EventDispatcher")
            .field("events", &names)
            .field("catch_all", &self.any.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a known event.
    pub fn on<F>(&mut self, event: AmiEventType, handler: F) -> &mut Self
    where
        F: Fn(&ProtocolMessage) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_name(event.as_str(), handler)
    }

    /// Register a handler by raw event name, for events without an
    /// [`AmiEventType`] variant (e.g. `UserEvent` subtypes, module events).
    pub fn on_name<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(&ProtocolMessage) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(Box::new(handler));
        self
    }

    /// Register a handler that sees every event.
    pub fn on_any<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&ProtocolMessage) -> HandlerResult + Send + Sync + 'static,
    {
        self.any
            .push(Box::new(handler));
        self
    }

    /// Number of handlers registered for `name`, catch-alls excluded.
    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers
            .get(&name.to_ascii_lowercase())
            .map_or(0, Vec::len)
    }

    /// Run every matching handler. Returns how many handlers ran without
    /// error or panic. Non-events are ignored.
    pub fn dispatch(&self, event: &ProtocolMessage) -> usize {
        let Some(name) = event.event_name() else {
            return 0;
        };
        let named = self
            .handlers
            .get(&name.to_ascii_lowercase());
        if named.is_none() && self.any.is_empty() {
            trace!("[DISPATCH] No handler for {}", name);
            return 0;
        }

        let mut ok = 0;
        for handler in named
            .into_iter()
            .flatten()
            .chain(self.any.iter())
        {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => ok += 1,
                Ok(Err(e)) => warn!("[DISPATCH] Handler for {} failed: {}", name, e),
                Err(_) => warn!("[DISPATCH] Handler for {} panicked", name),
            }
        }
        ok
    }
}
