//! Outbound actions and their correlated results

use crate::{
    constants::{
        DEFAULT_CONTEXT, ORIGINATE_RESPONSE_MARGIN_MS, RESPONSE_ERROR, RESPONSE_FOLLOWS,
        RESPONSE_GOODBYE, RESPONSE_SUCCESS,
    },
    error::{AmiError, AmiResult},
    event::AmiEventType,
    headers::AmiHeader,
    protocol::{serialize_action, ProtocolMessage},
};
use std::fmt;
use std::time::Duration;

/// How the result of an action is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// One `Response` completes the action.
    Single,
    /// A `Response` followed by events echoing the ActionID, closed by
    /// `complete_event` (or any event carrying `EventList: Complete`).
    List { complete_event: AmiEventType },
}

/// An AMI action ready to be submitted.
///
/// Parameters keep insertion order. The `ActionID` is assigned at submission
/// time and must not be set here.
///
/// ```
/// use asterisk_ami_tokio::Action;
///
/// let action = Action::new("Redirect")
///     .param("Channel", "SIP/100-00000001")
///     .param("Exten", "300")
///     .param("Context", "from-internal")
///     .param("Priority", "1");
/// let wire = action.to_wire("7").unwrap();
/// assert!(wire.starts_with("Action: Redirect\r\nActionID: 7\r\n"));
/// ```
#[derive(Clone)]
pub struct Action {
    name: String,
    params: Vec<(String, String)>,
    kind: ActionKind,
    timeout: Option<Duration>,
}

impl Action {
    /// Action answered by a single `Response`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            kind: ActionKind::Single,
            timeout: None,
        }
    }

    /// List-style action finished by `complete_event`.
    pub fn list(name: impl Into<String>, complete_event: AmiEventType) -> Self {
        Self {
            kind: ActionKind::List { complete_event },
            ..Self::new(name)
        }
    }

    /// Append a parameter. Validation happens in [`to_wire`](Self::to_wire).
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params
            .push((name.into(), value.into()));
        self
    }

    /// Override the client's default action timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Serialize with the given ActionID as the first parameter.
    pub fn to_wire(&self, action_id: &str) -> AmiResult<String> {
        if self
            .params
            .iter()
            .any(|(k, _)| AmiHeader::ActionId.matches(k))
        {
            return Err(AmiError::encoding(
                "ActionID is assigned by the client and must not be set as a parameter",
            ));
        }
        let id = std::iter::once((AmiHeader::ActionId.as_str(), action_id));
        let params = self
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()));
        serialize_action(&self.name, id.chain(params))
    }

    /// `Login` with username and secret.
    pub fn login(username: &str, secret: &str) -> Self {
        Self::new("Login")
            .param(AmiHeader::Username.as_str(), username)
            .param(AmiHeader::Secret.as_str(), secret)
    }

    pub fn logoff() -> Self {
        Self::new("Logoff")
    }

    pub fn ping() -> Self {
        Self::new("Ping")
    }

    /// Originate a call from a SIP extension into the dialplan.
    ///
    /// `timeout_seconds` is sent in milliseconds as Asterisk expects. An empty
    /// `context` means [`DEFAULT_CONTEXT`].
    ///
    /// The originate is synchronous: Asterisk answers once the dial ends, so
    /// the action waits `timeout_seconds` plus a margin instead of the
    /// client's default deadline.
    pub fn originate(
        from_extension: &str,
        destination: &str,
        context: &str,
        timeout_seconds: u32,
    ) -> Self {
        let context = if context.is_empty() {
            DEFAULT_CONTEXT
        } else {
            context
        };
        Self::new("Originate")
            .param(AmiHeader::Channel.as_str(), format!("SIP/{}", from_extension))
            .param(AmiHeader::Exten.as_str(), destination)
            .param(AmiHeader::Context.as_str(), context)
            .param(AmiHeader::Priority.as_str(), "1")
            .param("Timeout", (u64::from(timeout_seconds) * 1000).to_string())
            .param("CallerID", from_extension)
            .with_timeout(
                Duration::from_secs(u64::from(timeout_seconds))
                    + Duration::from_millis(ORIGINATE_RESPONSE_MARGIN_MS),
            )
    }

    pub fn hangup(channel: &str) -> Self {
        Self::new("Hangup").param(AmiHeader::Channel.as_str(), channel)
    }

    /// `QueueStatus`, optionally limited to one queue.
    pub fn queue_status(queue: Option<&str>) -> Self {
        let action = Self::list("QueueStatus", AmiEventType::QueueStatusComplete);
        match queue {
            Some(q) => action.param(AmiHeader::Queue.as_str(), q),
            None => action,
        }
    }

    pub fn core_show_channels() -> Self {
        Self::list("CoreShowChannels", AmiEventType::CoreShowChannelsComplete)
    }

    /// CLI command (`core show uptime`).
    pub fn command(text: &str) -> Self {
        Self::new("Command").param("Command", text)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<(&str, &str)> = self
            .params
            .iter()
            .map(|(k, v)| {
                if AmiHeader::Secret.matches(k) {
                    (k.as_str(), "[REDACTED]")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("params", &params)
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// `Response:` classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResponseStatus {
    Success,
    Error,
    /// Legacy `Command` output
    Follows,
    /// Reply to `Logoff`
    Goodbye,
    /// Missing or unrecognized `Response:` value
    Other,
}

impl ResponseStatus {
    pub fn from_message(message: &ProtocolMessage) -> Self {
        match message.response() {
            Some(r) if r.eq_ignore_ascii_case(RESPONSE_SUCCESS) => Self::Success,
            Some(r) if r.eq_ignore_ascii_case(RESPONSE_ERROR) => Self::Error,
            Some(r) if r.eq_ignore_ascii_case(RESPONSE_FOLLOWS) => Self::Follows,
            Some(r) if r.eq_ignore_ascii_case(RESPONSE_GOODBYE) => Self::Goodbye,
            _ => Self::Other,
        }
    }
}

/// Outcome of a submitted action: its `Response` plus, for list actions,
/// every event that echoed the ActionID (the closing event included).
#[derive(Debug, Clone)]
pub struct ActionResult {
    command: String,
    response: ProtocolMessage,
    events: Vec<ProtocolMessage>,
    status: ResponseStatus,
}

impl ActionResult {
    pub fn new(
        command: impl Into<String>,
        response: ProtocolMessage,
        events: Vec<ProtocolMessage>,
    ) -> Self {
        let status = ResponseStatus::from_message(&response);
        Self {
            command: command.into(),
            response,
            events,
            status,
        }
    }

    /// `true` for every status except `Error` and `Other`.
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            ResponseStatus::Success | ResponseStatus::Follows | ResponseStatus::Goodbye
        )
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    /// Name of the action this result answers.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn action_id(&self) -> Option<&str> {
        self.response
            .action_id()
    }

    pub fn response(&self) -> &ProtocolMessage {
        &self.response
    }

    /// `Message:` of the response.
    pub fn message(&self) -> Option<&str> {
        self.response
            .message()
    }

    pub fn events(&self) -> &[ProtocolMessage] {
        &self.events
    }

    /// Events of one type, in arrival order.
    pub fn events_of(&self, event: AmiEventType) -> impl Iterator<Item = &ProtocolMessage> {
        self.events
            .iter()
            .filter(move |e| e.is_event(event))
    }

    /// Text output of a `Command` action.
    ///
    /// Newer Asterisk sends one `Output:` field per line, older versions a
    /// `Response: Follows` body. `None` when neither is present.
    pub fn output_text(&self) -> Option<String> {
        let output = self
            .response
            .get_all(AmiHeader::Output);
        if !output.is_empty() {
            return Some(output.join("\n"));
        }
        let body = self
            .response
            .body();
        if !body.is_empty() {
            return Some(body.join("\n"));
        }
        None
    }

    /// Convert to result based on success status.
    pub fn into_result(self) -> AmiResult<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let message = self
            .message()
            .unwrap_or("no message")
            .to_string();
        Err(AmiError::ActionFailed {
            command: self.command,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_message;

    #[test]
    fn test_action_id_goes_first() {
        let wire = Action::hangup("SIP/100-00000001")
            .to_wire("abc")
            .unwrap();
        assert_eq!(
            wire,
            "Action: Hangup\r\nActionID: abc\r\nChannel: SIP/100-00000001\r\n\r\n"
        );
    }

    #[test]
    fn test_originate_fields() {
        let wire = Action::originate("100", "5551234", "from-internal", 30)
            .to_wire("1")
            .unwrap();
        let msg = parse_message(wire.as_bytes()).unwrap();
        assert_eq!(msg.get("Action"), Some("Originate"));
        assert_eq!(msg.get("Channel"), Some("SIP/100"));
        assert_eq!(msg.get("Exten"), Some("5551234"));
        assert_eq!(msg.get("Context"), Some("from-internal"));
        assert_eq!(msg.get("Priority"), Some("1"));
        assert_eq!(msg.get("Timeout"), Some("30000"));
        assert_eq!(msg.get("CallerID"), Some("100"));
    }

    #[test]
    fn test_originate_waits_for_dial_timeout() {
        let action = Action::originate("100", "200", "from-internal", 30);
        assert_eq!(
            action.timeout(),
            Some(Duration::from_secs(30) + Duration::from_millis(ORIGINATE_RESPONSE_MARGIN_MS))
        );
    }

    #[test]
    fn test_originate_empty_context_uses_default() {
        let action = Action::originate("100", "200", "", 30);
        assert!(action
            .params()
            .iter()
            .any(|(k, v)| k == "Context" && v == DEFAULT_CONTEXT));
    }

    #[test]
    fn test_list_actions() {
        assert_eq!(
            Action::queue_status(Some("support")).kind(),
            ActionKind::List {
                complete_event: AmiEventType::QueueStatusComplete
            }
        );
        assert_eq!(
            Action::queue_status(None)
                .params()
                .len(),
            0
        );
        assert_eq!(Action::ping().kind(), ActionKind::Single);
    }

    #[test]
    fn test_newline_injection_rejected() {
        let err = Action::command("core show uptime\r\n\r\nAction: Logoff")
            .to_wire("1")
            .unwrap_err();
        assert!(matches!(err, AmiError::Encoding { .. }));
        assert!(Action::hangup("SIP/1\n")
            .to_wire("1")
            .is_err());
    }

    #[test]
    fn test_user_action_id_rejected() {
        assert!(Action::new("Ping")
            .param("ActionID", "mine")
            .to_wire("1")
            .is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let debug_str = format!("{:?}", Action::login("admin", "s3cret"));
        assert!(!debug_str.contains("s3cret"));
        assert!(debug_str.contains("admin"));
        assert!(debug_str.contains("REDACTED"));
    }

    #[test]
    fn test_result_status() {
        let ok = ActionResult::new(
            "Ping",
            ProtocolMessage::from_fields([("Response", "Success"), ("Ping", "Pong")]),
            vec![],
        );
        assert_eq!(ok.status(), ResponseStatus::Success);
        assert!(ok
            .into_result()
            .is_ok());

        let err = ActionResult::new(
            "Hangup",
            ProtocolMessage::from_fields([("Response", "Error"), ("Message", "No such channel")]),
            vec![],
        );
        assert!(!err.is_success());
        let e = err
            .into_result()
            .unwrap_err();
        assert!(
            matches!(e, AmiError::ActionFailed { ref command, ref message } if command == "Hangup" && message == "No such channel")
        );
    }

    #[test]
    fn test_output_text_from_output_fields() {
        let result = ActionResult::new(
            "Command",
            ProtocolMessage::from_fields([
                ("Response", "Success"),
                ("Output", "System uptime: 1 hour"),
                ("Output", "Last reload: 5 minutes"),
            ]),
            vec![],
        );
        assert_eq!(
            result
                .output_text()
                .as_deref(),
            Some("System uptime: 1 hour\nLast reload: 5 minutes")
        );
    }

    #[test]
    fn test_output_text_from_follows_body() {
        let msg = parse_message(
            b"Response: Follows\r\nPrivilege: Command\r\n2 active channels\r\n--END COMMAND--\r\n\r\n",
        )
        .unwrap();
        let result = ActionResult::new("Command", msg, vec![]);
        assert_eq!(result.status(), ResponseStatus::Follows);
        assert_eq!(
            result
                .output_text()
                .as_deref(),
            Some("2 active channels")
        );
    }
}
