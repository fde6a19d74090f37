//! AMI wire codec: framing, parsing and serialization

use crate::{
    buffer::AmiBuffer,
    constants::{
        END_COMMAND_MARKER, LINE_TERMINATOR, MAX_MESSAGE_SIZE, RESPONSE_ERROR, RESPONSE_FOLLOWS,
        RESPONSE_GOODBYE, RESPONSE_SUCCESS,
    },
    error::{AmiError, AmiResult},
    event::AmiEventType,
    headers::AmiHeader,
};
use tracing::trace;

/// What kind of record a [`ProtocolMessage`] is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Unsolicited event (`Event: <name>`)
    Event(String),
    /// Reply to an action (`Response: Success|Error|Follows|Goodbye`)
    Response,
    /// Neither field present
    Raw,
}

/// One parsed AMI message.
///
/// Fields keep their wire order, and duplicate keys are all retained.
/// [`get`](Self::get) returns the last value for a key,
/// [`get_all`](Self::get_all) returns every value in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    kind: MessageKind,
    fields: Vec<(String, String)>,
    body: Vec<String>,
}

impl ProtocolMessage {
    /// Build a message from ordered fields. The kind is taken from the first
    /// `Response` or `Event` field.
    pub fn from_fields<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let fields: Vec<(String, String)> = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let kind = classify(&fields);
        Self {
            kind,
            fields,
            body: Vec::new(),
        }
    }

    /// Shorthand for an event with the given name followed by `fields`.
    pub fn event<K, V, I>(name: impl Into<String>, fields: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut all = vec![(AmiHeader::Event.to_string(), name.into())];
        all.extend(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into())),
        );
        Self::from_fields(all)
    }

    /// Message kind.
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// Event name, if this is an event.
    pub fn event_name(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Event(name) => Some(name),
            _ => None,
        }
    }

    /// Typed event kind, if recognized.
    pub fn event_type(&self) -> Option<AmiEventType> {
        self.event_name()?
            .parse()
            .ok()
    }

    /// `true` for `Response:` messages.
    pub fn is_response(&self) -> bool {
        self.kind == MessageKind::Response
    }

    /// `true` if this is the named event (case-insensitive).
    pub fn is_event(&self, event: AmiEventType) -> bool {
        self.event_name()
            .is_some_and(|name| event.matches(name))
    }

    /// Last value for `name`.
    ///
    /// Exact-case matches win; otherwise a case-insensitive match is used,
    /// since Asterisk versions disagree on casing (`Uniqueid` vs `UniqueID`).
    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        self.fields
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .or_else(|| {
                self.fields
                    .iter()
                    .rev()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
            })
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in wire order (case-insensitive).
    pub fn get_all(&self, name: impl AsRef<str>) -> Vec<&str> {
        let name = name.as_ref();
        self.fields
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// All fields in wire order.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Free-text lines of a legacy `Response: Follows` message.
    pub fn body(&self) -> &[String] {
        &self.body
    }

    /// Append a field, keeping any earlier value for the same key.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields
            .push((name.into(), value.into()));
        self.kind = classify(&self.fields);
    }

    /// Replace every value of `name` with a single value.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let name = name.as_ref();
        self.fields
            .retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.push(name, value);
    }

    /// `ActionID` echoed from the originating action.
    pub fn action_id(&self) -> Option<&str> {
        self.get(AmiHeader::ActionId)
    }

    /// `Response:` value (`Success`, `Error`, `Follows`, `Goodbye`).
    pub fn response(&self) -> Option<&str> {
        self.get(AmiHeader::Response)
    }

    /// `Message:` value.
    pub fn message(&self) -> Option<&str> {
        self.get(AmiHeader::Message)
    }

    /// `true` for responses other than `Response: Error`.
    pub fn is_success(&self) -> bool {
        match self.response() {
            Some(r) => {
                r.eq_ignore_ascii_case(RESPONSE_SUCCESS)
                    || r.eq_ignore_ascii_case(RESPONSE_FOLLOWS)
                    || r.eq_ignore_ascii_case(RESPONSE_GOODBYE)
            }
            None => false,
        }
    }

    /// `true` for `Response: Error`.
    pub fn is_error(&self) -> bool {
        self.response()
            .is_some_and(|r| r.eq_ignore_ascii_case(RESPONSE_ERROR))
    }

    /// Order-insensitive comparison of the field sets.
    pub fn same_fields(&self, other: &ProtocolMessage) -> bool {
        let mut a: Vec<_> = self
            .fields
            .iter()
            .collect();
        let mut b: Vec<_> = other
            .fields
            .iter()
            .collect();
        a.sort();
        b.sort();
        a == b && self.body == other.body
    }

    /// Serialize back to wire format, including the terminating blank line.
    pub fn to_wire(&self) -> AmiResult<String> {
        let mut out = String::new();
        for (key, value) in &self.fields {
            push_field(&mut out, key, value)?;
        }
        if !self.body.is_empty() {
            for line in &self.body {
                validate_no_newlines(line, "body line")?;
                out.push_str(line);
                out.push_str(LINE_TERMINATOR);
            }
            out.push_str(END_COMMAND_MARKER);
            out.push_str(LINE_TERMINATOR);
        }
        out.push_str(LINE_TERMINATOR);
        Ok(out)
    }
}

fn classify(fields: &[(String, String)]) -> MessageKind {
    for (key, value) in fields {
        if AmiHeader::Response.matches(key) {
            return MessageKind::Response;
        }
        if AmiHeader::Event.matches(key) {
            return MessageKind::Event(value.clone());
        }
    }
    MessageKind::Raw
}

/// AMI values are line-delimited; an embedded newline would let a value
/// inject a blank line and end the message early.
fn validate_no_newlines(s: &str, context: &str) -> AmiResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(AmiError::encoding(format!(
            "{} must not contain newlines",
            context
        )));
    }
    Ok(())
}

fn push_field(out: &mut String, key: &str, value: &str) -> AmiResult<()> {
    if key.is_empty() || key.contains(':') {
        return Err(AmiError::encoding(format!("invalid field name '{}'", key)));
    }
    validate_no_newlines(key, "field name")?;
    validate_no_newlines(value, "field value")?;
    out.push_str(key);
    out.push_str(": ");
    out.push_str(value);
    out.push_str(LINE_TERMINATOR);
    Ok(())
}

/// Serialize an action with ordered parameters.
///
/// ```
/// let wire = asterisk_ami_tokio::serialize_action("Ping", [("ActionID", "1")]).unwrap();
/// assert_eq!(wire, "Action: Ping\r\nActionID: 1\r\n\r\n");
/// ```
pub fn serialize_action<K, V, I>(command: &str, params: I) -> AmiResult<String>
where
    K: AsRef<str>,
    V: AsRef<str>,
    I: IntoIterator<Item = (K, V)>,
{
    let mut out = String::new();
    push_field(&mut out, AmiHeader::Action.as_str(), command)?;
    for (key, value) in params {
        push_field(&mut out, key.as_ref(), value.as_ref())?;
    }
    out.push_str(LINE_TERMINATOR);
    Ok(out)
}

/// Parse one complete message block.
///
/// The trailing blank line is optional. A blank line inside the block is an
/// [`Encoding`](AmiError::Encoding) error, except in the free-text body of a
/// `Response: Follows` message. Bytes that are not UTF-8 (Latin-1 caller
/// names) are replaced with U+FFFD.
pub fn parse_message(raw: &[u8]) -> AmiResult<ProtocolMessage> {
    let text = String::from_utf8_lossy(raw);
    let mut lines: Vec<&str> = text
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .collect();
    while lines
        .last()
        .is_some_and(|l| l.is_empty())
    {
        lines.pop();
    }
    if lines.is_empty() {
        return Err(AmiError::malformed("empty message"));
    }
    if !is_follows_header(lines[0]) && lines.iter().any(|l| l.is_empty()) {
        return Err(AmiError::encoding(
            "embedded blank line inside message",
        ));
    }
    parse_lines(&lines)
}

fn is_follows_header(line: &str) -> bool {
    match line.split_once(':') {
        Some((k, v)) => {
            AmiHeader::Response.matches(k.trim()) && v.trim().eq_ignore_ascii_case(RESPONSE_FOLLOWS)
        }
        None => false,
    }
}

fn parse_lines<S: AsRef<str>>(lines: &[S]) -> AmiResult<ProtocolMessage> {
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut body = Vec::new();
    let follows = lines
        .first()
        .is_some_and(|l| is_follows_header(l.as_ref()));
    let mut in_body = false;

    for line in lines {
        let line = line.as_ref();
        if follows {
            if !in_body {
                match line.split_once(':') {
                    Some((k, v)) if is_follows_preamble(k.trim()) => {
                        fields.push((k.trim().to_string(), v.trim().to_string()));
                        continue;
                    }
                    _ => in_body = true,
                }
            }
            if let Some(rest) = line.strip_suffix(END_COMMAND_MARKER) {
                if !rest.is_empty() {
                    body.push(rest.to_string());
                }
                break;
            }
            body.push(line.to_string());
            continue;
        }

        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| AmiError::malformed(format!("line without separator: '{}'", line)))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(AmiError::malformed(format!("empty field name: '{}'", line)));
        }
        fields.push((key.to_string(), value.trim().to_string()));
    }

    let mut message = ProtocolMessage::from_fields(fields);
    message.body = body;
    Ok(message)
}

/// Fields Asterisk sends ahead of the raw text of a `Follows` response.
fn is_follows_preamble(key: &str) -> bool {
    AmiHeader::Response.matches(key)
        || AmiHeader::Privilege.matches(key)
        || AmiHeader::ActionId.matches(key)
        || AmiHeader::Message.matches(key)
}

/// Incremental AMI stream parser.
///
/// Feed socket bytes with [`add_data`](Self::add_data) and pull complete
/// messages with [`parse_message`](Self::parse_message). A framing error
/// discards the offending message only; the parser stays usable.
pub struct AmiParser {
    buffer: AmiBuffer,
    pending: Vec<String>,
    pending_bytes: usize,
    in_follows: bool,
}

impl AmiParser {
    /// Create new parser
    pub fn new() -> Self {
        Self {
            buffer: AmiBuffer::new(),
            pending: Vec::new(),
            pending_bytes: 0,
            in_follows: false,
        }
    }

    /// Add data to the parser buffer
    pub fn add_data(&mut self, data: &[u8]) -> AmiResult<()> {
        self.buffer
            .extend_from_slice(data);
        self.buffer
            .check_size_limits()
    }

    fn next_line(&mut self) -> AmiResult<Option<String>> {
        match self
            .buffer
            .extract_until_pattern(b"\n")
        {
            Some(raw) => {
                let mut line = String::from_utf8(raw).unwrap_or_else(|e| {
                    trace!("[RECV] Non UTF-8 line, replacing invalid bytes");
                    String::from_utf8_lossy(e.as_bytes()).into_owned()
                });
                if line.ends_with('\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
            None => {
                self.buffer
                    .compact();
                self.buffer
                    .check_pending_line()?;
                Ok(None)
            }
        }
    }

    /// Take a single raw line, outside of message framing.
    ///
    /// Asterisk greets with `Asterisk Call Manager/<version>` and no blank line.
    pub fn take_line(&mut self) -> AmiResult<Option<String>> {
        self.next_line()
    }

    /// Try to parse a complete message from the buffer
    pub fn parse_message(&mut self) -> AmiResult<Option<ProtocolMessage>> {
        loop {
            let line = match self.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.reset_pending();
                    return Err(e);
                }
            };

            if line.is_empty() && !self.in_follows {
                if self
                    .pending
                    .is_empty()
                {
                    // Stray separator between messages
                    continue;
                }
                let lines = std::mem::take(&mut self.pending);
                self.reset_pending();
                return parse_lines(&lines).map(Some);
            }

            if self
                .pending
                .is_empty()
                && is_follows_header(&line)
            {
                self.in_follows = true;
            }
            if self.in_follows && line.ends_with(END_COMMAND_MARKER) {
                self.in_follows = false;
            }

            self.pending_bytes += line.len();
            if self.pending_bytes > MAX_MESSAGE_SIZE {
                let size = self.pending_bytes;
                self.reset_pending();
                return Err(AmiError::BufferOverflow {
                    size,
                    limit: MAX_MESSAGE_SIZE,
                });
            }
            self.pending
                .push(line);
        }
    }

    /// Signal end of stream. Fails if an unterminated message is left over.
    pub fn finish(&mut self) -> AmiResult<()> {
        let leftover = self
            .buffer
            .take_remaining();
        let had_pending = !self
            .pending
            .is_empty();
        self.reset_pending();
        if had_pending || !leftover.is_empty() {
            return Err(AmiError::malformed(
                "unterminated message at end of stream",
            ));
        }
        Ok(())
    }

    fn reset_pending(&mut self) {
        self.pending
            .clear();
        self.pending_bytes = 0;
        self.in_follows = false;
    }
}

impl Default for AmiParser {
    fn default() -> Self {
        Self::new()
    }
}
