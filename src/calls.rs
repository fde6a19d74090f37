//! Active call registry driven by channel lifecycle events.
//!
//! The registry is fed from the reader task through the event dispatcher and
//! is the only writer of call state. Everyone else reads cloned snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    channel::CallStatus,
    dispatch::EventDispatcher,
    event::{AmiEventType, BridgeEvent, HangupEvent, NewChannelEvent, NewStateEvent},
    headers::AmiHeader,
    protocol::ProtocolMessage,
};

/// Time source for call timestamps.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One call leg currently known to the switch, keyed by channel name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveCall {
    pub channel: String,
    pub unique_id: String,
    pub caller_id_num: Option<String>,
    pub caller_id_name: Option<String>,
    pub connected_line_num: Option<String>,
    pub connected_line_name: Option<String>,
    pub destination: Option<String>,
    pub context: Option<String>,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    /// Set once, on the first transition into `Up`.
    pub answered_at: Option<DateTime<Utc>>,
    pub bridge_id: Option<String>,
}

impl ActiveCall {
    /// Whole seconds from start until answer, or until `now` if unanswered.
    /// Never negative.
    pub fn duration_seconds(&self, now: DateTime<Utc>) -> u64 {
        let end = self
            .answered_at
            .unwrap_or(now);
        whole_seconds(end - self.started_at)
    }

    /// Whole seconds since answer, `None` if never answered.
    pub fn talk_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        self.answered_at
            .map(|answered| whole_seconds(now - answered))
    }

    pub fn is_answered(&self) -> bool {
        self.answered_at
            .is_some()
    }
}

fn whole_seconds(delta: chrono::Duration) -> u64 {
    u64::try_from(delta.num_seconds()).unwrap_or(0)
}

/// Lifecycle notification emitted by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    Started {
        call: ActiveCall,
    },
    StateChanged {
        call: ActiveCall,
        previous: CallStatus,
        current: CallStatus,
    },
    /// Sent before the call leaves the registry; `call` is its final state.
    Ended {
        call: ActiveCall,
        cause: String,
        cause_text: String,
        /// `(answered_at or hangup time) − started_at`
        duration_seconds: u64,
        /// `hangup time − answered_at` for answered calls
        talk_seconds: Option<u64>,
    },
}

impl CallEvent {
    pub fn call(&self) -> &ActiveCall {
        match self {
            CallEvent::Started { call }
            | CallEvent::StateChanged { call, .. }
            | CallEvent::Ended { call, .. } => call,
        }
    }

    pub fn channel(&self) -> &str {
        &self
            .call()
            .channel
    }
}

/// A caller waiting in a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueCaller {
    pub channel: String,
    pub caller_id_num: Option<String>,
    pub caller_id_name: Option<String>,
    pub position: Option<u32>,
    pub joined_at: DateTime<Utc>,
}

/// Last reported state of a queue member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueMemberPresence {
    pub interface: String,
    pub name: Option<String>,
    /// Device state number as sent (`1` = not in use, `2` = in use, ...)
    pub status: Option<String>,
    pub paused: bool,
    pub updated_at: DateTime<Utc>,
}

/// Looser per-queue view built from queue events.
///
/// Unlike the call registry this is best effort: Asterisk does not replay
/// queue state on connect, so it only reflects changes seen since then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuePresence {
    pub queue: String,
    pub waiting: Vec<QueueCaller>,
    pub members: Vec<QueueMemberPresence>,
}

#[derive(Default)]
struct QueueState {
    waiting: Vec<QueueCaller>,
    members: BTreeMap<String, QueueMemberPresence>,
}

struct RegistryInner {
    calls: RwLock<HashMap<String, ActiveCall>>,
    queues: RwLock<BTreeMap<String, QueueState>>,
    events_tx: broadcast::Sender<CallEvent>,
    clock: Arc<dyn Clock>,
}

/// Registry of active calls plus the queue presence view.
///
/// Cloning is cheap and every clone shares the same state.
///
/// ```
/// use asterisk_ami_tokio::{CallRegistry, ProtocolMessage};
///
/// let calls = CallRegistry::new(16);
/// calls.handle_message(&ProtocolMessage::event(
///     "Newchannel",
///     [("Channel", "SIP/100-00000001"), ("Uniqueid", "1700000000.1")],
/// ));
/// assert_eq!(calls.len(), 1);
/// ```
#[derive(Clone)]
pub struct CallRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRegistry")
            .field("active_calls", &self.len())
            .finish()
    }
}

impl CallRegistry {
    /// Registry on the wall clock; `capacity` bounds the notification channel.
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let (events_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(RegistryInner {
                calls: RwLock::new(HashMap::new()),
                queues: RwLock::new(BTreeMap::new()),
                events_tx,
                clock,
            }),
        }
    }

    /// Receive lifecycle notifications from now on.
    pub fn subscribe(&self) -> CallEventStream {
        CallEventStream {
            rx: self
                .inner
                .events_tx
                .subscribe(),
        }
    }

    /// Register this registry's handlers on a dispatcher.
    pub fn install(&self, dispatcher: &mut EventDispatcher) {
        for event in [
            AmiEventType::Newchannel,
            AmiEventType::Newstate,
            AmiEventType::Hangup,
            AmiEventType::BridgeEnter,
            AmiEventType::BridgeLeave,
            AmiEventType::QueueCallerJoin,
            AmiEventType::QueueCallerLeave,
            AmiEventType::QueueCallerAbandon,
            AmiEventType::QueueMemberStatus,
        ] {
            let registry = self.clone();
            dispatcher.on(event, move |msg| {
                registry.handle_message(msg);
                Ok(())
            });
        }
    }

    /// Apply one event. Returns `true` if it changed any state.
    pub fn handle_message(&self, message: &ProtocolMessage) -> bool {
        let Some(event_type) = message.event_type() else {
            return false;
        };
        match event_type {
            AmiEventType::Newchannel => NewChannelEvent::from_message(message)
                .map(|ev| self.on_new_channel(ev))
                .is_some(),
            AmiEventType::Newstate => NewStateEvent::from_message(message)
                .is_some_and(|ev| self.on_new_state(ev)),
            AmiEventType::Hangup => HangupEvent::from_message(message)
                .is_some_and(|ev| self.on_hangup(ev)),
            AmiEventType::BridgeEnter | AmiEventType::BridgeLeave => {
                BridgeEvent::from_message(message).is_some_and(|ev| self.on_bridge(ev))
            }
            AmiEventType::QueueCallerJoin => self.on_queue_join(message),
            AmiEventType::QueueCallerLeave | AmiEventType::QueueCallerAbandon => {
                self.on_queue_leave(message)
            }
            AmiEventType::QueueMemberStatus => self.on_member_status(message),
            _ => false,
        }
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self
            .inner
            .events_tx
            .send(event);
    }

    fn calls_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ActiveCall>> {
        self.inner
            .calls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn calls_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ActiveCall>> {
        self.inner
            .calls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert: a call already tracked on this channel is replaced, not merged.
    pub fn on_new_channel(&self, ev: NewChannelEvent) {
        let call = ActiveCall {
            channel: ev.channel,
            unique_id: ev.unique_id,
            caller_id_num: ev.caller_id_num,
            caller_id_name: ev.caller_id_name,
            connected_line_num: None,
            connected_line_name: None,
            destination: ev.destination,
            context: ev.context,
            status: CallStatus::Ringing,
            started_at: self
                .inner
                .clock
                .now(),
            answered_at: None,
            bridge_id: None,
        };

        let mut calls = self.calls_write();
        if let Some(stale) = calls.insert(call.channel.clone(), call.clone()) {
            warn!(
                "[CALLS] Replacing stale call on {} (uniqueid {} -> {})",
                call.channel, stale.unique_id, call.unique_id
            );
        }
        info!(
            "[CALLS] Call started on {} from {}",
            call.channel,
            call.caller_id_num
                .as_deref()
                .unwrap_or("unknown")
        );
        self.emit(CallEvent::Started { call });
    }

    /// Untracked channels are ignored. Returns `true` if a call was updated.
    pub fn on_new_state(&self, ev: NewStateEvent) -> bool {
        let current = ev.status();
        let now = self
            .inner
            .clock
            .now();

        let mut calls = self.calls_write();
        let Some(call) = calls.get_mut(&ev.channel) else {
            debug!("[CALLS] Newstate for untracked channel {}", ev.channel);
            return false;
        };

        let previous = std::mem::replace(&mut call.status, current.clone());
        if current.is_up() && call.answered_at.is_none() {
            call.answered_at = Some(now);
        }
        if ev.connected_line_num.is_some() {
            call.connected_line_num = ev.connected_line_num;
        }
        if ev.connected_line_name.is_some() {
            call.connected_line_name = ev.connected_line_name;
        }

        debug!(
            "[CALLS] {} {} -> {}",
            call.channel, previous, current
        );
        let snapshot = call.clone();
        self.emit(CallEvent::StateChanged {
            call: snapshot,
            previous,
            current,
        });
        true
    }

    /// Untracked channels are ignored. `Ended` is sent before removal.
    pub fn on_hangup(&self, ev: HangupEvent) -> bool {
        let now = self
            .inner
            .clock
            .now();

        let mut calls = self.calls_write();
        let Some(call) = calls.get(&ev.channel) else {
            debug!("[CALLS] Hangup for untracked channel {}", ev.channel);
            return false;
        };

        let duration_seconds = call.duration_seconds(now);
        let talk_seconds = call.talk_seconds(now);
        info!(
            "[CALLS] Call ended on {}: {} ({}), {}s",
            call.channel, ev.cause, ev.cause_text, duration_seconds
        );
        self.emit(CallEvent::Ended {
            call: call.clone(),
            cause: ev.cause,
            cause_text: ev.cause_text,
            duration_seconds,
            talk_seconds,
        });
        calls.remove(&ev.channel);
        true
    }

    /// Record or clear the bridge a tracked channel sits in.
    pub fn on_bridge(&self, ev: BridgeEvent) -> bool {
        let mut calls = self.calls_write();
        let Some(call) = calls.get_mut(&ev.channel) else {
            return false;
        };
        if ev.entered {
            call.bridge_id = Some(ev.bridge_id);
        } else if call.bridge_id.as_deref() == Some(ev.bridge_id.as_str()) || ev.bridge_id.is_empty() {
            call.bridge_id = None;
        }
        true
    }

    fn queues_write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, QueueState>> {
        self.inner
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn on_queue_join(&self, message: &ProtocolMessage) -> bool {
        let (Some(queue), Some(channel)) = (
            message.get(AmiHeader::Queue),
            message.get(AmiHeader::Channel),
        ) else {
            return false;
        };
        let caller = QueueCaller {
            channel: channel.to_string(),
            caller_id_num: message
                .get(AmiHeader::CallerIdNum)
                .map(str::to_string),
            caller_id_name: message
                .get(AmiHeader::CallerIdName)
                .map(str::to_string),
            position: message
                .get(AmiHeader::Position)
                .and_then(|p| p.parse().ok()),
            joined_at: self
                .inner
                .clock
                .now(),
        };
        let mut queues = self.queues_write();
        let state = queues
            .entry(queue.to_string())
            .or_default();
        state
            .waiting
            .retain(|c| c.channel != caller.channel);
        state
            .waiting
            .push(caller);
        true
    }

    fn on_queue_leave(&self, message: &ProtocolMessage) -> bool {
        let (Some(queue), Some(channel)) = (
            message.get(AmiHeader::Queue),
            message.get(AmiHeader::Channel),
        ) else {
            return false;
        };
        let mut queues = self.queues_write();
        let Some(state) = queues.get_mut(queue) else {
            return false;
        };
        let before = state
            .waiting
            .len();
        state
            .waiting
            .retain(|c| c.channel != channel);
        before != state
            .waiting
            .len()
    }

    fn on_member_status(&self, message: &ProtocolMessage) -> bool {
        let Some(queue) = message.get(AmiHeader::Queue) else {
            return false;
        };
        // Older versions send Location instead of Interface
        let Some(interface) = message
            .get(AmiHeader::Interface)
            .or_else(|| message.get("Location"))
        else {
            return false;
        };
        let member = QueueMemberPresence {
            interface: interface.to_string(),
            name: message
                .get(AmiHeader::MemberName)
                .map(str::to_string),
            status: message
                .get(AmiHeader::Status)
                .map(str::to_string),
            paused: message
                .get(AmiHeader::Paused)
                .is_some_and(|p| p == "1"),
            updated_at: self
                .inner
                .clock
                .now(),
        };
        self.queues_write()
            .entry(queue.to_string())
            .or_default()
            .members
            .insert(member.interface.clone(), member);
        true
    }

    /// Snapshot of every active call, newest first (ties broken by channel).
    pub fn list_active_calls(&self) -> Vec<ActiveCall> {
        let mut calls: Vec<ActiveCall> = self
            .calls_read()
            .values()
            .cloned()
            .collect();
        calls.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.channel.cmp(&b.channel))
        });
        calls
    }

    /// Snapshot of one call.
    pub fn get(&self, channel: &str) -> Option<ActiveCall> {
        self.calls_read()
            .get(channel)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.calls_read()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the queue presence view, ordered by queue name.
    pub fn queue_presence(&self) -> Vec<QueuePresence> {
        self.inner
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, state)| QueuePresence {
                queue: name.clone(),
                waiting: state
                    .waiting
                    .clone(),
                members: state
                    .members
                    .values()
                    .cloned()
                    .collect(),
            })
            .collect()
    }
}

/// Receiver side of the call notification channel.
#[derive(Debug)]
pub struct CallEventStream {
    rx: broadcast::Receiver<CallEvent>,
}

impl CallEventStream {
    /// Next notification, `None` once the registry is gone.
    ///
    /// A subscriber that falls behind by more than the channel capacity
    /// loses the oldest notifications; the gap is logged and skipped.
    pub async fn recv(&mut self) -> Option<CallEvent> {
        loop {
            match self
                .rx
                .recv()
                .await
            {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("[CALLS] Subscriber lagged, {} notifications lost", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<CallEvent> {
        loop {
            match self
                .rx
                .try_recv()
            {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("[CALLS] Subscriber lagged, {} notifications lost", n);
                }
                Err(_) => return None,
            }
        }
    }
}
