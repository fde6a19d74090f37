//! Connection and engine configuration

use crate::{
    constants::{
        DEFAULT_ACTION_TIMEOUT_MS, DEFAULT_AMI_PORT, DEFAULT_CONNECT_TIMEOUT_MS,
        DEFAULT_EVENT_QUEUE_SIZE, DEFAULT_READ_TIMEOUT_MS, DEFAULT_RECONNECT_DELAY_MS,
    },
    error::{AmiError, AmiResult},
};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Transport used to reach the manager port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportScheme {
    /// Plain TCP (`tcp://`)
    #[default]
    #[serde(alias = "tcp")]
    Plain,
    /// TLS (`tls://`), requires the `tls` feature
    #[serde(alias = "tls", alias = "ssl")]
    Secure,
}

/// Engine configuration.
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// # use asterisk_ami_tokio::AmiConfig;
/// let cfg: AmiConfig = serde_json::from_str(r#"{"username": "admin", "password": "amp111"}"#).unwrap();
/// assert_eq!(cfg.port, 5038);
/// assert_eq!(cfg.host, "127.0.0.1");
/// ```
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AmiConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub scheme: TransportScheme,
    /// TCP (and TLS handshake) timeout
    pub connect_timeout_ms: u64,
    /// Idle period before a keepalive `Ping`; a second one disconnects. 0 disables.
    pub read_timeout_ms: u64,
    /// Default deadline for action responses
    pub action_timeout_ms: u64,
    /// Wait between reconnection attempts
    pub reconnect_delay_ms: u64,
    /// Consecutive failures before giving up; 0 retries forever
    pub max_reconnects: u32,
    /// Capacity of the call notification channel
    pub event_queue_size: usize,
}

impl Default for AmiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_AMI_PORT,
            username: String::new(),
            password: String::new(),
            scheme: TransportScheme::Plain,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            action_timeout_ms: DEFAULT_ACTION_TIMEOUT_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_reconnects: 0,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
        }
    }
}

impl fmt::Debug for AmiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmiConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("scheme", &self.scheme)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .field("action_timeout_ms", &self.action_timeout_ms)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("max_reconnects", &self.max_reconnects)
            .field("event_queue_size", &self.event_queue_size)
            .finish()
    }
}

impl AmiConfig {
    /// Config for `host:port` with credentials, everything else default.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Reject configurations that can never log in.
    ///
    /// These are not retried by the supervisor.
    pub fn validate(&self) -> AmiResult<()> {
        if self
            .host
            .trim()
            .is_empty()
        {
            return Err(AmiError::invalid_config("host is empty"));
        }
        if self.port == 0 {
            return Err(AmiError::invalid_config("port is 0"));
        }
        if self
            .username
            .is_empty()
        {
            return Err(AmiError::invalid_config("username is empty"));
        }
        for (name, value) in [
            ("host", &self.host),
            ("username", &self.username),
            ("password", &self.password),
        ] {
            if value.contains('\n') || value.contains('\r') {
                return Err(AmiError::invalid_config(format!(
                    "{} must not contain newlines",
                    name
                )));
            }
        }
        if self.event_queue_size == 0 {
            return Err(AmiError::invalid_config("event_queue_size is 0"));
        }
        #[cfg(not(feature = "tls"))]
        if self.scheme == TransportScheme::Secure {
            return Err(AmiError::invalid_config(
                "secure transport requested but the `tls` feature is disabled",
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `None` when idle detection is disabled.
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
