//! Cloneable command handle on top of the correlator

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    action::{Action, ActionResult},
    connection::ConnectionState,
    correlator::Correlator,
    error::{AmiError, AmiResult},
    event::AmiEventType,
    status::{ChannelSummary, QueueSummary, SipPeer, SystemStatus},
};

/// Send actions to Asterisk from any task.
///
/// Obtained from [`AmiEngine::client`](crate::AmiEngine::client). Every clone
/// talks through the engine's current session; while the engine is
/// reconnecting, submissions fail with [`AmiError::NotConnected`].
#[derive(Clone)]
pub struct AmiClient {
    correlator: Correlator,
    state_rx: watch::Receiver<ConnectionState>,
    action_timeout_ms: Arc<AtomicU64>,
}

impl std::fmt::Debug for AmiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiClient")
            .field("state", &self.connection_state())
            .field("action_timeout", &self.action_timeout())
            .finish()
    }
}

impl AmiClient {
    pub(crate) fn new(
        correlator: Correlator,
        state_rx: watch::Receiver<ConnectionState>,
        action_timeout: Duration,
    ) -> Self {
        Self {
            correlator,
            state_rx,
            action_timeout_ms: Arc::new(AtomicU64::new(action_timeout.as_millis() as u64)),
        }
    }

    /// Current connection state snapshot.
    pub fn connection_state(&self) -> ConnectionState {
        *self
            .state_rx
            .borrow()
    }

    /// Whether a logged-in session is up.
    pub fn is_connected(&self) -> bool {
        self.connection_state()
            .is_ready()
    }

    /// Wait until the engine is `Ready`.
    ///
    /// Fails with [`AmiError::ConnectionClosed`] if the engine stops first.
    pub async fn wait_ready(&self) -> AmiResult<()> {
        let mut rx = self
            .state_rx
            .clone();
        let state = rx
            .wait_for(|s| s.is_ready() || *s == ConnectionState::Stopped)
            .await
            .map_err(|_| AmiError::ConnectionClosed)?;
        if state.is_ready() {
            Ok(())
        } else {
            Err(AmiError::ConnectionClosed)
        }
    }

    /// Default deadline for actions without their own timeout.
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(
            self.action_timeout_ms
                .load(Ordering::Relaxed),
        )
    }

    /// Change the default action deadline for this handle and its clones.
    pub fn set_action_timeout(&self, duration: Duration) {
        self.action_timeout_ms
            .store(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Submit any action and wait for its result.
    ///
    /// An `Error` response is returned as a result, not an error; use
    /// [`ActionResult::into_result`] to turn it into one.
    pub async fn submit(&self, action: Action) -> AmiResult<ActionResult> {
        let deadline = action
            .timeout()
            .unwrap_or_else(|| self.action_timeout());
        self.correlator
            .submit(action, deadline)
            .await
    }

    /// Round-trip a `Ping`.
    pub async fn ping(&self) -> AmiResult<bool> {
        Ok(self
            .submit(Action::ping())
            .await?
            .is_success())
    }

    /// Place a call from a SIP extension to `destination`.
    ///
    /// `Ok(false)` when Asterisk rejects the originate.
    pub async fn originate(
        &self,
        from_extension: &str,
        destination: &str,
        context: &str,
        timeout_seconds: u32,
    ) -> AmiResult<bool> {
        let action = Action::originate(from_extension, destination, context, timeout_seconds);
        let result = self
            .submit(action)
            .await?;
        if result.is_success() {
            info!(
                "[ACTION] Originate {} -> {} accepted",
                from_extension, destination
            );
        } else {
            warn!(
                "[ACTION] Originate {} -> {} rejected: {}",
                from_extension,
                destination,
                result
                    .message()
                    .unwrap_or("no message")
            );
        }
        Ok(result.is_success())
    }

    /// Hang up a channel. `Ok(false)` when Asterisk rejects it (e.g. no
    /// such channel).
    pub async fn hangup_channel(&self, channel: &str) -> AmiResult<bool> {
        let result = self
            .submit(Action::hangup(channel))
            .await?;
        if !result.is_success() {
            debug!(
                "[ACTION] Hangup {} rejected: {}",
                channel,
                result
                    .message()
                    .unwrap_or("no message")
            );
        }
        Ok(result.is_success())
    }

    /// Queue parameters, members and waiting callers, for one queue or all.
    pub async fn queue_status(&self, queue: Option<&str>) -> AmiResult<Vec<QueueSummary>> {
        let result = self
            .submit(Action::queue_status(queue))
            .await?
            .into_result()?;
        Ok(QueueSummary::aggregate(result.events()))
    }

    /// One row per live channel, from `CoreShowChannels`.
    pub async fn active_channels(&self) -> AmiResult<Vec<ChannelSummary>> {
        let result = self
            .submit(Action::core_show_channels())
            .await?
            .into_result()?;
        Ok(result
            .events_of(AmiEventType::CoreShowChannel)
            .filter_map(ChannelSummary::from_event)
            .collect())
    }

    /// Run a CLI command and return its text output.
    ///
    /// `Ok(None)` when the command is rejected; `Ok(Some(""))` when it
    /// succeeds without output.
    pub async fn run_command(&self, command: &str) -> AmiResult<Option<String>> {
        let result = self
            .submit(Action::command(command))
            .await?;
        if !result.is_success() {
            debug!(
                "[ACTION] Command '{}' rejected: {}",
                command,
                result
                    .message()
                    .unwrap_or("no message")
            );
            return Ok(None);
        }
        Ok(Some(
            result
                .output_text()
                .unwrap_or_default(),
        ))
    }

    /// Uptime and channel count. When not connected, returns
    /// [`SystemStatus::disconnected`] instead of an error.
    pub async fn system_status(&self) -> AmiResult<SystemStatus> {
        if !self.is_connected() {
            return Ok(SystemStatus::disconnected());
        }
        let uptime = self
            .run_command("core show uptime")
            .await?
            .as_deref()
            .and_then(SystemStatus::parse_uptime)
            .unwrap_or_else(|| "Unknown".to_string());
        let active_channels = self
            .run_command("core show channels count")
            .await?
            .as_deref()
            .and_then(SystemStatus::parse_channel_count)
            .unwrap_or(0);
        Ok(SystemStatus {
            connected: true,
            uptime,
            active_channels,
        })
    }

    /// Peers listed by `sip show peers` (chan_sip).
    ///
    /// Empty when the command is unavailable.
    pub async fn sip_peers(&self) -> AmiResult<Vec<SipPeer>> {
        Ok(self
            .run_command("sip show peers")
            .await?
            .map(|output| SipPeer::parse_table(&output))
            .unwrap_or_default())
    }
}
