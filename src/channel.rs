//! Channel state numbers and the derived call status.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Channel state from Asterisk's `ast_channel_state`, carried in the
/// `ChannelState` field as an integer and in `ChannelStateDesc` as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ChannelState {
    Down = 0,
    Reserved = 1,
    OffHook = 2,
    Dialing = 3,
    Ring = 4,
    Ringing = 5,
    Up = 6,
    Busy = 7,
    DialingOffhook = 8,
    Prering = 9,
    Mute = 10,
}

impl ChannelState {
    /// Parse from the `ChannelState` integer field value.
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::Down),
            1 => Some(Self::Reserved),
            2 => Some(Self::OffHook),
            3 => Some(Self::Dialing),
            4 => Some(Self::Ring),
            5 => Some(Self::Ringing),
            6 => Some(Self::Up),
            7 => Some(Self::Busy),
            8 => Some(Self::DialingOffhook),
            9 => Some(Self::Prering),
            10 => Some(Self::Mute),
            _ => None,
        }
    }

    /// Integer discriminant matching `ast_channel_state`.
    pub fn as_number(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Same text as ast_state2str(), which fills ChannelStateDesc
        let name = match self {
            Self::Down => "Down",
            Self::Reserved => "Rsrvd",
            Self::OffHook => "OffHook",
            Self::Dialing => "Dialing",
            Self::Ring => "Ring",
            Self::Ringing => "Ringing",
            Self::Up => "Up",
            Self::Busy => "Busy",
            Self::DialingOffhook => "Dialing Offhook",
            Self::Prering => "Pre-ring",
            Self::Mute => "Mute",
        };
        f.write_str(name)
    }
}

/// Error returned when parsing an invalid channel state string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseChannelStateError(pub String);

impl fmt::Display for ParseChannelStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown channel state: {}", self.0)
    }
}

impl std::error::Error for ParseChannelStateError {}

impl FromStr for ChannelState {
    type Err = ParseChannelStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s
            .to_lowercase()
            .as_str()
        {
            "down" => Ok(Self::Down),
            "rsrvd" | "reserved" => Ok(Self::Reserved),
            "offhook" => Ok(Self::OffHook),
            "dialing" => Ok(Self::Dialing),
            "ring" => Ok(Self::Ring),
            "ringing" => Ok(Self::Ringing),
            "up" => Ok(Self::Up),
            "busy" => Ok(Self::Busy),
            "dialing offhook" => Ok(Self::DialingOffhook),
            "pre-ring" => Ok(Self::Prering),
            "mute" => Ok(Self::Mute),
            _ => Err(ParseChannelStateError(s.to_string())),
        }
    }
}

/// Status of a tracked call.
///
/// Only states 0, 4, 5 and 6 have a fixed mapping. Any other state keeps the
/// lower-cased `ChannelStateDesc` text in [`CallStatus::Other`], so new
/// Asterisk states pass through instead of being forced into a closed set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum CallStatus {
    Ringing,
    Up,
    Busy,
    Down,
    /// Lower-cased description of a state without a fixed mapping
    Other(String),
}

impl CallStatus {
    /// Map a `Newstate` channel state and description to a status.
    ///
    /// Unmapped states use the description, or the state's own name when
    /// Asterisk sent none.
    pub fn from_channel_state(state: Option<ChannelState>, description: &str) -> Self {
        match state {
            Some(ChannelState::Down) => CallStatus::Down,
            Some(ChannelState::Ring | ChannelState::Ringing) => CallStatus::Ringing,
            Some(ChannelState::Up) => CallStatus::Up,
            other => {
                let description = description.trim();
                let text = match other {
                    Some(state) if description.is_empty() => state.to_string(),
                    _ => description.to_string(),
                };
                CallStatus::from(text.to_lowercase())
            }
        }
    }

    /// Lower-case text form, as stored by persistence layers.
    pub fn as_str(&self) -> &str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Up => "up",
            CallStatus::Busy => "busy",
            CallStatus::Down => "down",
            CallStatus::Other(s) => s,
        }
    }

    pub fn is_up(&self) -> bool {
        *self == CallStatus::Up
    }
}

impl From<String> for CallStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ringing" => CallStatus::Ringing,
            "up" => CallStatus::Up,
            "busy" => CallStatus::Busy,
            "down" => CallStatus::Down,
            _ => CallStatus::Other(s),
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CallStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
