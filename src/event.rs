//! AMI event names and typed views over lifecycle events

use crate::channel::{CallStatus, ChannelState};
use crate::headers::AmiHeader;
use crate::protocol::ProtocolMessage;
use std::fmt;

/// Error returned when parsing an unknown event name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventTypeError(pub String);

impl fmt::Display for ParseEventTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for ParseEventTypeError {}

define_wire_enum! {
    error_type: ParseEventTypeError,
    /// AMI event names the engine knows about.
    ///
    /// Variant names are the wire names. Events outside this list still reach
    /// handlers registered by raw name through
    /// [`EventDispatcher::on_name`](crate::EventDispatcher::on_name).
    pub enum AmiEventType {
        FullyBooted => "FullyBooted",
        Shutdown => "Shutdown",
        Reload => "Reload",
        Newchannel => "Newchannel",
        Newstate => "Newstate",
        NewCallerid => "NewCallerid",
        NewConnectedLine => "NewConnectedLine",
        Newexten => "Newexten",
        Hangup => "Hangup",
        HangupRequest => "HangupRequest",
        DialBegin => "DialBegin",
        DialEnd => "DialEnd",
        BridgeCreate => "BridgeCreate",
        BridgeDestroy => "BridgeDestroy",
        BridgeEnter => "BridgeEnter",
        BridgeLeave => "BridgeLeave",
        VarSet => "VarSet",
        PeerStatus => "PeerStatus",
        QueueCallerJoin => "QueueCallerJoin",
        QueueCallerLeave => "QueueCallerLeave",
        QueueCallerAbandon => "QueueCallerAbandon",
        QueueMemberStatus => "QueueMemberStatus",
        QueueMemberPause => "QueueMemberPause",
        QueueParams => "QueueParams",
        QueueMember => "QueueMember",
        QueueEntry => "QueueEntry",
        QueueStatusComplete => "QueueStatusComplete",
        CoreShowChannel => "CoreShowChannel",
        CoreShowChannelsComplete => "CoreShowChannelsComplete",
    }
}

fn owned(message: &ProtocolMessage, header: AmiHeader) -> String {
    message
        .get(header)
        .unwrap_or_default()
        .to_string()
}

fn optional(message: &ProtocolMessage, header: AmiHeader) -> Option<String> {
    message
        .get(header)
        .filter(|v| !v.is_empty() && !is_unknown_placeholder(v))
        .map(str::to_string)
}

/// Asterisk fills absent caller id fields with `<unknown>`.
fn is_unknown_placeholder(value: &str) -> bool {
    value.eq_ignore_ascii_case("<unknown>")
}

/// `Newchannel` fields used by call tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChannelEvent {
    pub channel: String,
    pub unique_id: String,
    pub caller_id_num: Option<String>,
    pub caller_id_name: Option<String>,
    pub context: Option<String>,
    pub destination: Option<String>,
}

impl NewChannelEvent {
    /// `None` unless `message` is a `Newchannel` event with a `Channel` field.
    pub fn from_message(message: &ProtocolMessage) -> Option<Self> {
        if !message.is_event(AmiEventType::Newchannel) {
            return None;
        }
        Some(Self {
            channel: message
                .get(AmiHeader::Channel)?
                .to_string(),
            unique_id: owned(message, AmiHeader::Uniqueid),
            caller_id_num: optional(message, AmiHeader::CallerIdNum),
            caller_id_name: optional(message, AmiHeader::CallerIdName),
            context: optional(message, AmiHeader::Context),
            destination: optional(message, AmiHeader::Exten),
        })
    }
}

/// `Newstate` fields used by call tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStateEvent {
    pub channel: String,
    /// Raw `ChannelState` number; `None` if absent or not numeric.
    pub state: Option<u8>,
    pub state_desc: String,
    pub connected_line_num: Option<String>,
    pub connected_line_name: Option<String>,
}

impl NewStateEvent {
    pub fn from_message(message: &ProtocolMessage) -> Option<Self> {
        if !message.is_event(AmiEventType::Newstate) {
            return None;
        }
        Some(Self {
            channel: message
                .get(AmiHeader::Channel)?
                .to_string(),
            state: message
                .get(AmiHeader::ChannelState)
                .and_then(|s| s.trim().parse().ok()),
            state_desc: owned(message, AmiHeader::ChannelStateDesc),
            connected_line_num: optional(message, AmiHeader::ConnectedLineNum),
            connected_line_name: optional(message, AmiHeader::ConnectedLineName),
        })
    }

    /// Typed channel state, if the number is a known one.
    pub fn channel_state(&self) -> Option<ChannelState> {
        ChannelState::from_number(self.state?)
    }

    /// Call status this state maps to.
    pub fn status(&self) -> CallStatus {
        CallStatus::from_channel_state(self.channel_state(), &self.state_desc)
    }
}

/// `Hangup` fields used by call tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HangupEvent {
    pub channel: String,
    pub unique_id: String,
    /// Q.850 cause code as sent (`16` for normal clearing)
    pub cause: String,
    pub cause_text: String,
}

impl HangupEvent {
    pub fn from_message(message: &ProtocolMessage) -> Option<Self> {
        if !message.is_event(AmiEventType::Hangup) {
            return None;
        }
        Some(Self {
            channel: message
                .get(AmiHeader::Channel)?
                .to_string(),
            unique_id: owned(message, AmiHeader::Uniqueid),
            cause: owned(message, AmiHeader::Cause),
            cause_text: owned(message, AmiHeader::CauseTxt),
        })
    }
}

/// `BridgeEnter` / `BridgeLeave` fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEvent {
    pub channel: String,
    pub bridge_id: String,
    /// `true` for `BridgeEnter`.
    pub entered: bool,
}

impl BridgeEvent {
    pub fn from_message(message: &ProtocolMessage) -> Option<Self> {
        let entered = if message.is_event(AmiEventType::BridgeEnter) {
            true
        } else if message.is_event(AmiEventType::BridgeLeave) {
            false
        } else {
            return None;
        };
        Some(Self {
            channel: message
                .get(AmiHeader::Channel)?
                .to_string(),
            bridge_id: owned(message, AmiHeader::BridgeUniqueid),
            entered,
        })
    }
}
