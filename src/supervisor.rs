//! Connection lifecycle: connect, log in, read until the session drops,
//! back off, repeat.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    calls::{CallRegistry, Clock, SystemClock},
    client::AmiClient,
    config::AmiConfig,
    connection::{ConnectionState, Session},
    correlator::Correlator,
    dispatch::{EventDispatcher, HandlerResult},
    error::{AmiError, AmiResult},
    event::AmiEventType,
    protocol::{MessageKind, ProtocolMessage},
};

/// Result of one bounded read.
enum ReadOutcome {
    Message(ProtocolMessage),
    /// Clean end of stream.
    Closed,
    /// Nothing arrived within the idle period.
    Idle,
}

async fn read_with_idle(session: &mut Session, idle: Option<Duration>) -> AmiResult<ReadOutcome> {
    let next = match idle {
        Some(limit) => match timeout(limit, session.read_next()).await {
            Ok(next) => next?,
            Err(_) => return Ok(ReadOutcome::Idle),
        },
        None => {
            session
                .read_next()
                .await?
        }
    };
    Ok(match next {
        Some(message) => ReadOutcome::Message(message),
        None => ReadOutcome::Closed,
    })
}

/// Owns the AMI connection and keeps it alive.
///
/// Build it, take the handles you need ([`client`](Self::client),
/// [`calls`](Self::calls), [`shutdown_token`](Self::shutdown_token)),
/// register extra handlers, then drive it with [`run`](Self::run) or
/// [`spawn`](Self::spawn).
///
/// ```rust,no_run
/// use asterisk_ami_tokio::{AmiConfig, AmiEngine, AmiError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), AmiError> {
///     let engine = AmiEngine::new(AmiConfig::new("127.0.0.1", 5038, "admin", "amp111"));
///     let client = engine.client();
///     let mut calls = engine.calls().subscribe();
///     let shutdown = engine.shutdown_token();
///     let task = engine.spawn();
///
///     client.wait_ready().await?;
///     client.originate("100", "200", "from-internal", 30).await?;
///     while let Some(event) = calls.recv().await {
///         println!("{:?}", event);
///     }
///
///     shutdown.cancel();
///     task.await.ok();
///     Ok(())
/// }
/// ```
pub struct AmiEngine {
    config: AmiConfig,
    correlator: Correlator,
    dispatcher: EventDispatcher,
    calls: CallRegistry,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for AmiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiEngine")
            .field("config", &self.config)
            .field("state", &*self.state_tx.borrow())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl AmiEngine {
    pub fn new(config: AmiConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Engine whose call registry takes timestamps from `clock`.
    pub fn with_clock(config: AmiConfig, clock: Arc<dyn Clock>) -> Self {
        let calls = CallRegistry::with_clock(config.event_queue_size, clock);
        let mut dispatcher = EventDispatcher::new();
        calls.install(&mut dispatcher);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            correlator: Correlator::new(),
            dispatcher,
            calls,
            state_tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &AmiConfig {
        &self.config
    }

    /// Command handle; valid for the engine's whole life.
    pub fn client(&self) -> AmiClient {
        AmiClient::new(
            self.correlator
                .clone(),
            self.state_tx
                .subscribe(),
            self.config
                .action_timeout(),
        )
    }

    /// The live call registry.
    pub fn calls(&self) -> CallRegistry {
        self.calls
            .clone()
    }

    /// Cancel this token to stop the engine.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel
            .clone()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx
            .subscribe()
    }

    /// Handlers registered here run after the call registry's own.
    pub fn dispatcher_mut(&mut self) -> &mut EventDispatcher {
        &mut self.dispatcher
    }

    /// Shorthand for `dispatcher_mut().on(..)`.
    pub fn on<F>(&mut self, event: AmiEventType, handler: F) -> &mut Self
    where
        F: Fn(&ProtocolMessage) -> HandlerResult + Send + Sync + 'static,
    {
        self.dispatcher
            .on(event, handler);
        self
    }

    /// Run [`run`](Self::run) on a new task.
    pub fn spawn(self) -> tokio::task::JoinHandle<AmiResult<()>> {
        tokio::spawn(self.run())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self
            .state_tx
            .send_replace(state);
        if previous != state {
            debug!("[STATE] {:?} -> {:?}", previous, state);
        }
    }

    /// Keep a session up until shutdown or until the reconnect limit.
    ///
    /// Returns `Ok(())` after a shutdown request, [`AmiError::InvalidConfig`]
    /// for a configuration that can never work, and
    /// [`AmiError::ReconnectLimitExceeded`] once `max_reconnects`
    /// consecutive attempts have failed. The state is `Stopped` in every case.
    pub async fn run(self) -> AmiResult<()> {
        let result = self
            .supervise()
            .await;
        self.correlator
            .detach()
            .await;
        self.set_state(ConnectionState::Stopped);
        match &result {
            Ok(()) => info!("[SHUTDOWN] Engine stopped"),
            Err(e) => error!("[SHUTDOWN] Engine stopped: {}", e),
        }
        result
    }

    async fn supervise(&self) -> AmiResult<()> {
        self.config
            .validate()?;
        let max = self
            .config
            .max_reconnects;
        let mut attempts: u32 = 0;

        loop {
            if self
                .cancel
                .is_cancelled()
            {
                return Ok(());
            }

            match self
                .open_session()
                .await
            {
                Ok(None) => return Ok(()),
                Ok(Some(mut session)) => {
                    attempts = 0;
                    let outcome = self
                        .serve(&mut session)
                        .await;
                    session
                        .close()
                        .await;
                    match outcome {
                        Ok(()) => return Ok(()),
                        Err(e) => warn!("[RECONNECT] Session lost: {}", e),
                    }
                }
                Err(e) if !e.is_connection_error() => return Err(e),
                Err(e) => warn!("[RECONNECT] Connect attempt failed: {}", e),
            }

            self.set_state(ConnectionState::Disconnected);
            attempts = attempts.saturating_add(1);
            if max > 0 && attempts >= max {
                return Err(AmiError::ReconnectLimitExceeded { attempts });
            }

            let delay = self
                .config
                .reconnect_delay();
            info!(
                "[RECONNECT] Retrying in {}ms (attempt {}{})",
                delay.as_millis(),
                attempts + 1,
                if max > 0 {
                    format!(" of {}", max)
                } else {
                    String::new()
                }
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Connect and log in. `Ok(None)` when shutdown interrupts either step;
    /// a session that was already open is closed first.
    async fn open_session(&self) -> AmiResult<Option<Session>> {
        self.set_state(ConnectionState::Connecting);
        let mut session = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            connected = Session::connect(&self.config) => connected?,
        };

        self.set_state(ConnectionState::Authenticating);
        let login = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = session.login(&self.config) => Some(result),
        };
        match login {
            Some(Ok(())) => Ok(Some(session)),
            Some(Err(e)) => {
                session
                    .close()
                    .await;
                Err(e)
            }
            None => {
                info!("[SHUTDOWN] Shutdown requested during login");
                session
                    .close()
                    .await;
                Ok(None)
            }
        }
    }

    /// Attach the session, read until it ends, detach.
    ///
    /// `Ok(())` only on shutdown.
    async fn serve(&self, session: &mut Session) -> AmiResult<()> {
        self.correlator
            .attach(session.writer())
            .await;
        self.set_state(ConnectionState::Ready);

        let outcome = AssertUnwindSafe(self.read_loop(session))
            .catch_unwind()
            .await;

        self.correlator
            .detach()
            .await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                error!("[RECV] Reader loop panicked");
                Err(AmiError::connection("reader loop panicked"))
            }
        }
    }

    async fn read_loop(&self, session: &mut Session) -> AmiResult<()> {
        let idle = self
            .config
            .read_timeout();
        let mut keepalive_sent = false;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("[SHUTDOWN] Cancellation requested, leaving reader loop");
                    return Ok(());
                }
                outcome = read_with_idle(session, idle) => outcome,
            };

            match outcome {
                Ok(ReadOutcome::Message(message)) => {
                    keepalive_sent = false;
                    self.handle_message(message)
                        .await;
                }
                Ok(ReadOutcome::Closed) => return Err(AmiError::ConnectionClosed),
                Ok(ReadOutcome::Idle) if keepalive_sent => {
                    warn!("[KEEPALIVE] No traffic after Ping, dropping session");
                    return Err(AmiError::connection("keepalive timed out"));
                }
                Ok(ReadOutcome::Idle) => {
                    session
                        .send_keepalive()
                        .await?;
                    keepalive_sent = true;
                }
                Err(e) if e.is_framing_error() => {
                    warn!("[RECV] Discarding bad message: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_message(&self, message: ProtocolMessage) {
        let Some(message) = self
            .correlator
            .route(message)
            .await
        else {
            return;
        };

        match message.kind() {
            MessageKind::Event(name) => {
                if AmiEventType::Shutdown.matches(name) {
                    warn!("[RECV] Asterisk is shutting down");
                }
                self.dispatcher
                    .dispatch(&message);
            }
            MessageKind::Response => {
                debug!(
                    "[RECV] Dropping unmatched response (ActionID {:?})",
                    message.action_id()
                );
            }
            MessageKind::Raw => trace!("[RECV] Ignoring message without Response or Event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_session_and_run_future_cross_threads() {
        assert_sync::<Session>();
        let engine = AmiEngine::new(AmiConfig::new("127.0.0.1", 5038, "admin", "secret"));
        let run = engine.run();
        assert_send(&run);
    }

    #[tokio::test]
    async fn test_invalid_config_stops_immediately() {
        let engine = AmiEngine::new(AmiConfig::new("127.0.0.1", 5038, "", "secret"));
        let state = engine.state();
        let result = engine
            .run()
            .await;
        assert!(matches!(result, Err(AmiError::InvalidConfig { .. })));
        assert_eq!(*state.borrow(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_before_run() {
        let engine = AmiEngine::new(AmiConfig::new("127.0.0.1", 5038, "admin", "secret"));
        engine
            .shutdown_token()
            .cancel();
        let client = engine.client();
        assert!(engine
            .run()
            .await
            .is_ok());
        assert_eq!(client.connection_state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_registry_installed_before_user_handlers() {
        let mut engine = AmiEngine::new(AmiConfig::new("127.0.0.1", 5038, "admin", "secret"));
        engine.on(AmiEventType::Hangup, |_| Ok(()));
        assert_eq!(
            engine
                .dispatcher_mut()
                .handler_count("Hangup"),
            2
        );
    }
}
