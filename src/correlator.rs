//! Matches responses and list events back to pending actions

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use crate::{
    action::{Action, ActionKind, ActionResult},
    connection::SessionWriter,
    constants::{EVENT_LIST_COMPLETE, RESPONSE_SUCCESS},
    error::{AmiError, AmiResult},
    headers::AmiHeader,
    protocol::{MessageKind, ProtocolMessage},
};

/// One action waiting for its result.
struct PendingAction {
    command: String,
    kind: ActionKind,
    submitted_at: Instant,
    response: Option<ProtocolMessage>,
    events: Vec<ProtocolMessage>,
    reply: oneshot::Sender<AmiResult<ActionResult>>,
}

impl PendingAction {
    fn complete(self, response: ProtocolMessage, events: Vec<ProtocolMessage>) {
        trace!(
            "[ACTION] {} completed after {:?} with {} events",
            self.command,
            self.submitted_at
                .elapsed(),
            events.len()
        );
        let result = ActionResult::new(self.command, response, events);
        // Receiver gone means the caller already timed out
        let _ = self
            .reply
            .send(Ok(result));
    }
}

type PendingTable = HashMap<String, PendingAction>;

struct CorrelatorState {
    pending: StdMutex<PendingTable>,
    writer: Mutex<Option<SessionWriter>>,
    next_id: AtomicU64,
}

/// Assigns ActionIDs and routes replies back to callers.
///
/// Cheap to clone; all clones share one pending table. The supervisor
/// attaches a [`SessionWriter`] while a session is up and detaches it on
/// disconnect, failing whatever is still pending.
#[derive(Clone)]
pub struct Correlator {
    state: Arc<CorrelatorState>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .finish_non_exhaustive()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CorrelatorState {
                pending: StdMutex::new(HashMap::new()),
                writer: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Route submissions to this session's write half.
    pub async fn attach(&self, writer: SessionWriter) {
        *self
            .state
            .writer
            .lock()
            .await = Some(writer);
    }

    /// Stop accepting submissions and fail everything pending with
    /// [`AmiError::ConnectionClosed`].
    pub async fn detach(&self) {
        self.state
            .writer
            .lock()
            .await
            .take();
        self.fail_all()
            .await;
    }

    pub async fn is_attached(&self) -> bool {
        self.state
            .writer
            .lock()
            .await
            .is_some()
    }

    fn generate_id(&self) -> String {
        self.state
            .next_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
    }

    /// Submit an action and wait for its result or `deadline`.
    pub async fn submit(&self, action: Action, deadline: Duration) -> AmiResult<ActionResult> {
        let writer = self
            .state
            .writer
            .lock()
            .await
            .clone()
            .ok_or(AmiError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        let (action_id, wire) = {
            let mut pending = self.lock_pending();
            let mut action_id = self.generate_id();
            while pending.contains_key(&action_id) {
                warn!("[ACTION] ActionID {} still pending, regenerating", action_id);
                action_id = self.generate_id();
            }
            let wire = action.to_wire(&action_id)?;
            pending.insert(
                action_id.clone(),
                PendingAction {
                    command: action
                        .name()
                        .to_string(),
                    kind: action.kind(),
                    submitted_at: Instant::now(),
                    response: None,
                    events: Vec::new(),
                    reply: tx,
                },
            );
            (action_id, wire)
        };
        // Dropped on every exit, including when the caller abandons this future
        let _entry = PendingEntry {
            state: &self.state,
            action_id: action_id.clone(),
        };

        debug!("[ACTION] Sending {} ({})", action.name(), action_id);
        writer
            .send(&wire)
            .await?;

        match timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AmiError::ConnectionClosed),
            Err(_) => {
                warn!(
                    "[ACTION] {} ({}) timed out after {}ms",
                    action.name(),
                    action_id,
                    deadline.as_millis()
                );
                Err(AmiError::ActionTimeout {
                    action_id,
                    command: action
                        .name()
                        .to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingTable> {
        self.state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer an inbound message to the pending table.
    ///
    /// Returns the message back when it does not belong to a pending action,
    /// so the caller can hand it to the event dispatcher.
    pub async fn route(&self, message: ProtocolMessage) -> Option<ProtocolMessage> {
        let Some(action_id) = message
            .action_id()
            .map(str::to_string)
        else {
            return Some(message);
        };

        let mut pending = self.lock_pending();
        let Some(entry) = pending.get_mut(&action_id) else {
            return Some(message);
        };

        match (message.kind(), entry.kind) {
            (MessageKind::Response, ActionKind::Single) => {
                if let Some(entry) = pending.remove(&action_id) {
                    entry.complete(message, Vec::new());
                }
                None
            }
            (MessageKind::Response, ActionKind::List { .. }) => {
                if message.is_error() {
                    if let Some(entry) = pending.remove(&action_id) {
                        entry.complete(message, Vec::new());
                    }
                } else {
                    entry.response = Some(message);
                }
                None
            }
            (MessageKind::Event(name), ActionKind::List { complete_event }) => {
                let done = complete_event.matches(name)
                    || message
                        .get(AmiHeader::EventList)
                        .is_some_and(|v| v.eq_ignore_ascii_case(EVENT_LIST_COMPLETE));
                entry
                    .events
                    .push(message);
                if done {
                    if let Some(mut entry) = pending.remove(&action_id) {
                        let response = entry
                            .response
                            .take()
                            .unwrap_or_else(|| {
                                ProtocolMessage::from_fields([
                                    (AmiHeader::Response.as_str(), RESPONSE_SUCCESS),
                                    (AmiHeader::ActionId.as_str(), action_id.as_str()),
                                ])
                            });
                        let events = std::mem::take(&mut entry.events);
                        entry.complete(response, events);
                    }
                }
                None
            }
            // Events echoing a single action's id (OriginateResponse) are ordinary events
            _ => Some(message),
        }
    }

    /// Fail every pending action with [`AmiError::ConnectionClosed`].
    pub async fn fail_all(&self) {
        let drained: Vec<(String, PendingAction)> = self
            .lock_pending()
            .drain()
            .collect();
        if !drained.is_empty() {
            debug!("[ACTION] Failing {} pending actions", drained.len());
        }
        for (_, entry) in drained {
            let _ = entry
                .reply
                .send(Err(AmiError::ConnectionClosed));
        }
    }

    /// Number of actions awaiting a result.
    pub async fn pending_count(&self) -> usize {
        self.lock_pending()
            .len()
    }
}

/// Removes a submitted action from the pending table when its `submit`
/// future finishes or is dropped. A no-op once the entry was completed.
struct PendingEntry<'a> {
    state: &'a CorrelatorState,
    action_id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        let removed = self
            .state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.action_id);
        if let Some(entry) = removed {
            trace!("[ACTION] {} ({}) abandoned", entry.command, self.action_id);
        }
    }
}
