//! Error types for the AMI engine

use thiserror::Error;

/// Result alias used throughout the crate.
pub type AmiResult<T> = Result<T, AmiError>;

/// Errors produced by the AMI engine.
///
/// The supervisor treats [`is_connection_error`](AmiError::is_connection_error)
/// variants as retryable; framing errors are contained by the reader loop and
/// action errors are returned to the individual caller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AmiError {
    /// Socket-level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network-level failure other than raw I/O (TLS, DNS name, banner)
    #[error("connection error: {message}")]
    Connection { message: String },

    /// TCP (or TLS) connect did not complete in time
    #[error("connect timed out after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    /// Asterisk rejected the Login action
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// Protocol framing violation on the inbound stream
    #[error("malformed message: {message}")]
    MalformedMessage { message: String },

    /// Outbound field name or value cannot be framed
    #[error("encoding error: {message}")]
    Encoding { message: String },

    /// No matching response arrived before the action deadline
    #[error("action {command} ({action_id}) timed out after {timeout_ms}ms")]
    ActionTimeout {
        action_id: String,
        command: String,
        timeout_ms: u64,
    },

    /// Asterisk answered the action with `Response: Error`
    #[error("action {command} failed: {message}")]
    ActionFailed { command: String, message: String },

    /// The supervisor gave up after the configured number of attempts
    #[error("reconnect limit exceeded after {attempts} attempts")]
    ReconnectLimitExceeded { attempts: u32 },

    /// No session is currently established
    #[error("not connected")]
    NotConnected,

    /// Session ended while an action was waiting for its response
    #[error("connection closed")]
    ConnectionClosed,

    /// Configuration cannot ever produce a working session
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Inbound data exceeded buffer limits
    #[error("buffer overflow: {size} bytes exceeds limit {limit}")]
    BufferOverflow { size: usize, limit: usize },
}

impl AmiError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        AmiError::MalformedMessage {
            message: message.into(),
        }
    }

    pub(crate) fn encoding(message: impl Into<String>) -> Self {
        AmiError::Encoding {
            message: message.into(),
        }
    }

    pub(crate) fn connection(message: impl Into<String>) -> Self {
        AmiError::Connection {
            message: message.into(),
        }
    }

    pub(crate) fn auth_failed(message: impl Into<String>) -> Self {
        AmiError::Authentication {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        AmiError::InvalidConfig {
            message: message.into(),
        }
    }

    /// Errors that end the current session and send the supervisor into backoff.
    ///
    /// Authentication failures count: credentials may be fixed on the PBX side
    /// while we wait.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmiError::Io(_)
                | AmiError::Connection { .. }
                | AmiError::ConnectTimeout { .. }
                | AmiError::Authentication { .. }
                | AmiError::ConnectionClosed
                | AmiError::NotConnected
                | AmiError::BufferOverflow { .. }
        )
    }

    /// Framing errors: the offending message is discarded and reading continues.
    pub fn is_framing_error(&self) -> bool {
        matches!(
            self,
            AmiError::MalformedMessage { .. } | AmiError::Encoding { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(AmiError::auth_failed("bad secret").is_connection_error());
        assert!(AmiError::ConnectTimeout { timeout_ms: 10 }.is_connection_error());
        assert!(AmiError::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
            .is_connection_error());
        assert!(!AmiError::invalid_config("empty host").is_connection_error());
        assert!(!AmiError::ReconnectLimitExceeded { attempts: 3 }.is_connection_error());
        assert!(AmiError::malformed("x").is_framing_error());
        assert!(!AmiError::malformed("x").is_connection_error());
    }

    #[test]
    fn display_messages() {
        let err = AmiError::ActionTimeout {
            action_id: "7".into(),
            command: "Ping".into(),
            timeout_ms: 50,
        };
        assert_eq!(err.to_string(), "action Ping (7) timed out after 50ms");
        assert_eq!(
            AmiError::ReconnectLimitExceeded { attempts: 3 }.to_string(),
            "reconnect limit exceeded after 3 attempts"
        );
    }
}
