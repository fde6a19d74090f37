//! Typed rows for the list and CLI actions the client wraps: queue status,
//! active channels, SIP peers and the system summary.

use serde::Serialize;

use crate::{
    channel::{CallStatus, ChannelState},
    event::AmiEventType,
    headers::AmiHeader,
    protocol::ProtocolMessage,
};

fn text(message: &ProtocolMessage, name: impl AsRef<str>) -> String {
    message
        .get(name)
        .unwrap_or_default()
        .to_string()
}

fn number(message: &ProtocolMessage, name: impl AsRef<str>) -> u64 {
    message
        .get(name)
        .and_then(|v| {
            v.trim()
                .parse()
                .ok()
        })
        .unwrap_or(0)
}

fn ratio(message: &ProtocolMessage, name: impl AsRef<str>) -> f64 {
    message
        .get(name)
        .and_then(|v| {
            v.trim()
                .parse()
                .ok()
        })
        .unwrap_or(0.0)
}

/// One `QueueMember` row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueMemberInfo {
    pub name: String,
    /// Member interface (`Location`, or `StateInterface` on newer versions)
    pub location: String,
    /// Device state number as sent
    pub status: String,
    pub paused: bool,
    pub calls_taken: u64,
    /// Unix time of the last call, 0 if none
    pub last_call: u64,
    pub penalty: u64,
}

impl QueueMemberInfo {
    pub fn from_event(message: &ProtocolMessage) -> Option<Self> {
        if !message.is_event(AmiEventType::QueueMember) {
            return None;
        }
        let location = message
            .get("Location")
            .or_else(|| message.get(AmiHeader::Interface))
            .or_else(|| message.get("StateInterface"))
            .unwrap_or_default()
            .to_string();
        Some(Self {
            name: text(message, "Name"),
            location,
            status: text(message, AmiHeader::Status),
            paused: message
                .get(AmiHeader::Paused)
                .is_some_and(|p| p.trim() == "1"),
            calls_taken: number(message, "CallsTaken"),
            last_call: number(message, "LastCall"),
            penalty: number(message, "Penalty"),
        })
    }
}

/// One `QueueEntry` row: a caller waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEntryInfo {
    pub position: u64,
    pub channel: String,
    pub caller_id_num: String,
    pub caller_id_name: String,
    /// Seconds waited so far
    pub wait: u64,
}

impl QueueEntryInfo {
    pub fn from_event(message: &ProtocolMessage) -> Option<Self> {
        if !message.is_event(AmiEventType::QueueEntry) {
            return None;
        }
        Some(Self {
            position: number(message, AmiHeader::Position),
            channel: text(message, AmiHeader::Channel),
            caller_id_num: text(message, AmiHeader::CallerIdNum),
            caller_id_name: text(message, AmiHeader::CallerIdName),
            wait: number(message, "Wait"),
        })
    }
}

/// One queue from a `QueueStatus` listing, with its members and waiting callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSummary {
    pub name: String,
    pub strategy: String,
    /// Maximum waiting callers, 0 for unlimited
    pub max: u64,
    pub calls: u64,
    pub holdtime: u64,
    pub talktime: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub service_level: u64,
    pub service_level_perf: f64,
    pub members: Vec<QueueMemberInfo>,
    pub entries: Vec<QueueEntryInfo>,
}

impl QueueSummary {
    pub fn from_params(message: &ProtocolMessage) -> Option<Self> {
        if !message.is_event(AmiEventType::QueueParams) {
            return None;
        }
        Some(Self {
            name: message
                .get(AmiHeader::Queue)?
                .to_string(),
            strategy: text(message, "Strategy"),
            max: number(message, "Max"),
            calls: number(message, "Calls"),
            holdtime: number(message, "Holdtime"),
            talktime: number(message, "TalkTime"),
            completed: number(message, "Completed"),
            abandoned: number(message, "Abandoned"),
            service_level: number(message, "ServiceLevel"),
            service_level_perf: ratio(message, "ServicelevelPerf"),
            members: Vec::new(),
            entries: Vec::new(),
        })
    }

    /// Fold the events of a `QueueStatus` listing into one summary per queue.
    ///
    /// Member and entry rows attach to the queue named in their `Queue`
    /// field, or to the most recent `QueueParams` if that field is missing.
    /// Rows for a queue never announced are dropped.
    pub fn aggregate<'a, I>(events: I) -> Vec<QueueSummary>
    where
        I: IntoIterator<Item = &'a ProtocolMessage>,
    {
        let mut queues: Vec<QueueSummary> = Vec::new();

        for event in events {
            if let Some(summary) = Self::from_params(event) {
                queues.push(summary);
                continue;
            }
            let target = match event.get(AmiHeader::Queue) {
                Some(name) => queues
                    .iter_mut()
                    .rev()
                    .find(|q| q.name == name),
                None => queues.last_mut(),
            };
            let Some(queue) = target else {
                continue;
            };
            if let Some(member) = QueueMemberInfo::from_event(event) {
                queue
                    .members
                    .push(member);
            } else if let Some(entry) = QueueEntryInfo::from_event(event) {
                queue
                    .entries
                    .push(entry);
            }
        }
        queues
    }
}

/// One `CoreShowChannel` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSummary {
    pub channel: String,
    /// Numeric channel state as sent
    pub state: String,
    pub state_desc: String,
    pub caller_id_num: String,
    pub caller_id_name: String,
    pub connected_line_num: String,
    pub context: String,
    pub extension: String,
    pub priority: String,
    pub application: String,
    pub application_data: String,
    /// `HH:MM:SS`
    pub duration: String,
}

impl ChannelSummary {
    pub fn from_event(message: &ProtocolMessage) -> Option<Self> {
        if !message.is_event(AmiEventType::CoreShowChannel) {
            return None;
        }
        Some(Self {
            channel: message
                .get(AmiHeader::Channel)?
                .to_string(),
            state: text(message, AmiHeader::ChannelState),
            state_desc: text(message, AmiHeader::ChannelStateDesc),
            caller_id_num: text(message, AmiHeader::CallerIdNum),
            caller_id_name: text(message, AmiHeader::CallerIdName),
            connected_line_num: text(message, AmiHeader::ConnectedLineNum),
            context: text(message, AmiHeader::Context),
            extension: text(message, AmiHeader::Exten),
            priority: text(message, AmiHeader::Priority),
            application: text(message, AmiHeader::Application),
            application_data: text(message, AmiHeader::ApplicationData),
            duration: text(message, AmiHeader::Duration),
        })
    }

    pub fn channel_state(&self) -> Option<ChannelState> {
        ChannelState::from_number(
            self.state
                .trim()
                .parse()
                .ok()?,
        )
    }

    /// Same mapping as a tracked call's `Newstate`.
    pub fn status(&self) -> CallStatus {
        CallStatus::from_channel_state(self.channel_state(), &self.state_desc)
    }
}

/// Peer registration state as reported by `sip show peers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Offline,
}

/// One row of `sip show peers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SipPeer {
    pub name: String,
    pub host: String,
    pub status: PeerStatus,
}

impl SipPeer {
    /// Parse the CLI table. The header and the trailing summary line are
    /// skipped; a peer is online when its row reports `OK`.
    pub fn parse_table(output: &str) -> Vec<SipPeer> {
        output
            .lines()
            .filter_map(Self::parse_row)
            .collect()
    }

    fn parse_row(line: &str) -> Option<SipPeer> {
        let mut columns = line.split_whitespace();
        let name = columns.next()?;
        let host = columns.next()?;
        // at least one more column after host
        columns.next()?;
        if name.starts_with("Name/") || !line.starts_with(|c: char| !c.is_whitespace()) {
            return None;
        }
        if line.contains("sip peers [") {
            return None;
        }
        let name = name
            .split('/')
            .next()
            .unwrap_or(name);
        let status = if line.contains("OK") {
            PeerStatus::Online
        } else {
            PeerStatus::Offline
        };
        Some(SipPeer {
            name: name.to_string(),
            host: host.to_string(),
            status,
        })
    }
}

/// Summary built from `core show uptime` and `core show channels count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    pub connected: bool,
    /// Free text after `System uptime:`, or `Unknown`
    pub uptime: String,
    pub active_channels: u64,
}

impl SystemStatus {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            uptime: "Unknown".to_string(),
            active_channels: 0,
        }
    }

    /// Text after `System uptime:` in `core show uptime` output.
    pub fn parse_uptime(output: &str) -> Option<String> {
        output
            .lines()
            .find_map(|line| {
                let (_, rest) = line.split_once("System uptime:")?;
                let rest = rest.trim();
                (!rest.is_empty()).then(|| rest.to_string())
            })
    }

    /// The `N active channel(s)` figure of `core show channels count`.
    pub fn parse_channel_count(output: &str) -> Option<u64> {
        output
            .lines()
            .find_map(|line| {
                let (count, rest) = line
                    .trim()
                    .split_once(char::is_whitespace)?;
                rest.trim_start()
                    .starts_with("active channel")
                    .then(|| count.parse().ok())
                    .flatten()
            })
    }
}
