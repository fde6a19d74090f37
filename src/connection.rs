//! Transport session: socket, greeting banner and login handshake

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::{
    action::Action,
    config::{AmiConfig, TransportScheme},
    constants::{BANNER_PREFIX, SOCKET_BUF_SIZE},
    error::{AmiError, AmiResult},
    protocol::{AmiParser, ProtocolMessage},
};

type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// ActionID of the login action; nothing else is pending at that point.
const LOGIN_ACTION_ID: &str = "login";

/// How long `close()` waits for the `Logoff` write.
const LOGOFF_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle of the engine's connection, published on a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionState {
    /// No session; waiting to (re)connect.
    Disconnected,
    /// TCP/TLS connect and banner in progress.
    Connecting,
    /// `Login` sent, waiting for the response.
    Authenticating,
    /// Logged in; actions and events flow.
    Ready,
    /// The supervisor has exited. Terminal.
    Stopped,
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        *self == ConnectionState::Ready
    }
}

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(
    host: &str,
    port: u16,
    timeout_ms: u64,
) -> AmiResult<TcpStream> {
    let tcp_result = timeout(
        Duration::from_millis(timeout_ms),
        TcpStream::connect((host, port)),
    )
    .await;

    match tcp_result {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established to {}:{}", host, port);
            if let Err(e) = s.set_nodelay(true) {
                debug!("[CONNECT] could not set TCP_NODELAY: {}", e);
            }
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect to {}:{} failed: {}", host, port, e);
            Err(AmiError::Io(e))
        }
        Err(_) => {
            warn!("[CONNECT] TCP connect timed out after {}ms", timeout_ms);
            Err(AmiError::ConnectTimeout { timeout_ms })
        }
    }
}

#[cfg(feature = "tls")]
async fn tls_wrap(
    stream: TcpStream,
    host: &str,
    timeout_ms: u64,
) -> AmiResult<tokio_rustls::client::TlsStream<TcpStream>> {
    use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
    use tokio_rustls::TlsConnector;

    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(
        webpki_roots::TLS_SERVER_ROOTS
            .iter()
            .map(|ta| {
                OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject,
                    ta.spki,
                    ta.name_constraints,
                )
            }),
    );
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server_name = ServerName::try_from(host)
        .map_err(|e| AmiError::connection(format!("invalid TLS server name '{}': {}", host, e)))?;

    let connector = TlsConnector::from(Arc::new(config));
    match timeout(
        Duration::from_millis(timeout_ms),
        connector.connect(server_name, stream),
    )
    .await
    {
        Ok(Ok(tls)) => {
            debug!("[CONNECT] TLS handshake complete");
            Ok(tls)
        }
        Ok(Err(e)) => Err(AmiError::connection(format!("TLS handshake failed: {}", e))),
        Err(_) => Err(AmiError::ConnectTimeout { timeout_ms }),
    }
}

/// Shareable write half of a session.
///
/// Writes are serialized by a mutex so concurrent actions never interleave
/// on the wire. After [`shutdown`](Self::shutdown) every send fails with
/// [`AmiError::NotConnected`].
#[derive(Clone)]
pub struct SessionWriter {
    inner: Arc<Mutex<Option<BoxedWriter>>>,
}

impl std::fmt::Debug for SessionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWriter")
            .finish_non_exhaustive()
    }
}

impl SessionWriter {
    pub(crate) fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(writer)))),
        }
    }

    /// Write one serialized message.
    pub async fn send(&self, wire: &str) -> AmiResult<()> {
        let mut guard = self
            .inner
            .lock()
            .await;
        let writer = guard
            .as_mut()
            .ok_or(AmiError::NotConnected)?;
        writer
            .write_all(wire.as_bytes())
            .await?;
        writer
            .flush()
            .await?;
        Ok(())
    }

    /// Shut down the write half. Idempotent.
    pub async fn shutdown(&self) {
        let taken = self
            .inner
            .lock()
            .await
            .take();
        if let Some(mut writer) = taken {
            if let Err(e) = writer
                .shutdown()
                .await
            {
                debug!("[CLOSE] write half shutdown: {}", e);
            }
        }
    }

    pub async fn is_open(&self) -> bool {
        self.inner
            .lock()
            .await
            .is_some()
    }
}

/// One logged-in AMI session.
///
/// The read side is driven by a single owner through
/// [`read_next`](Self::read_next); writes go through cloned
/// [`SessionWriter`]s.
pub struct Session {
    reader: BoxedReader,
    writer: SessionWriter,
    parser: AmiParser,
    read_buffer: Vec<u8>,
    banner: String,
    eof: bool,
    closed: bool,
    keepalive_seq: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("banner", &self.banner)
            .field("eof", &self.eof)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Session {
    /// Connect, read the banner and log in.
    ///
    /// Rejected credentials fail with [`AmiError::Authentication`]; network
    /// failures with `Io`, `Connection` or `ConnectTimeout`.
    pub async fn open(config: &AmiConfig) -> AmiResult<Session> {
        let mut session = Self::connect(config).await?;
        if let Err(e) = session
            .login(config)
            .await
        {
            session
                .close()
                .await;
            return Err(e);
        }
        Ok(session)
    }

    /// Connect and read the greeting banner, without logging in.
    pub async fn connect(config: &AmiConfig) -> AmiResult<Session> {
        info!(
            "[CONNECT] Connecting to Asterisk at {}:{} ({:?})",
            config.host, config.port, config.scheme
        );
        let tcp =
            tcp_connect_with_timeout(&config.host, config.port, config.connect_timeout_ms).await?;

        let mut session = match config.scheme {
            TransportScheme::Plain => Self::from_stream(tcp),
            #[cfg(feature = "tls")]
            TransportScheme::Secure => {
                Self::from_stream(tls_wrap(tcp, &config.host, config.connect_timeout_ms).await?)
            }
            #[cfg(not(feature = "tls"))]
            TransportScheme::Secure => {
                return Err(AmiError::invalid_config(
                    "secure transport requested but the `tls` feature is disabled",
                ))
            }
        };

        session
            .read_banner(config.connect_timeout())
            .await?;
        Ok(session)
    }

    /// Wrap an already-connected stream.
    pub fn from_stream<S>(stream: S) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Session {
            reader: Box::new(reader),
            writer: SessionWriter::new(writer),
            parser: AmiParser::new(),
            read_buffer: vec![0u8; SOCKET_BUF_SIZE],
            banner: String::new(),
            eof: false,
            closed: false,
            keepalive_seq: AtomicU64::new(0),
        }
    }

    /// Greeting line, e.g. `Asterisk Call Manager/5.0.1`.
    pub fn banner(&self) -> &str {
        &self.banner
    }

    /// Protocol version from the banner (`5.0.1`).
    pub fn protocol_version(&self) -> Option<&str> {
        self.banner
            .split_once('/')
            .map(|(_, v)| v.trim())
    }

    pub fn writer(&self) -> SessionWriter {
        self.writer
            .clone()
    }

    /// Write one serialized message.
    pub async fn send(&self, wire: &str) -> AmiResult<()> {
        self.writer
            .send(wire)
            .await
    }

    async fn fill(&mut self) -> AmiResult<bool> {
        trace!("[RECV] Buffer needs more data, reading from socket");
        let n = self
            .reader
            .read(&mut self.read_buffer)
            .await?;
        trace!("[RECV] Read {} bytes from socket", n);
        if n == 0 {
            return Ok(false);
        }
        self.parser
            .add_data(&self.read_buffer[..n])?;
        Ok(true)
    }

    async fn next_banner_line(&mut self) -> AmiResult<String> {
        loop {
            if let Some(line) = self
                .parser
                .take_line()?
            {
                if !line.is_empty() {
                    return Ok(line);
                }
                continue;
            }
            if !self
                .fill()
                .await?
            {
                return Err(AmiError::connection(
                    "connection closed before greeting banner",
                ));
            }
        }
    }

    async fn read_banner(&mut self, limit: Duration) -> AmiResult<()> {
        let banner = timeout(limit, self.next_banner_line())
            .await
            .map_err(|_| AmiError::connection("no greeting banner received"))??;

        if !banner.starts_with(BANNER_PREFIX) {
            return Err(AmiError::connection(format!(
                "unexpected greeting '{}', not an AMI endpoint",
                banner
            )));
        }
        debug!("[CONNECT] Greeting: {}", banner);
        self.banner = banner;
        Ok(())
    }

    async fn await_login_response(&mut self) -> AmiResult<ProtocolMessage> {
        loop {
            match self
                .read_next()
                .await?
            {
                Some(msg) if msg.is_response() && msg.action_id() == Some(LOGIN_ACTION_ID) => {
                    return Ok(msg)
                }
                Some(msg) => trace!("[AUTH] skipping {:?} before login response", msg.kind()),
                None => return Err(AmiError::connection("connection closed during login")),
            }
        }
    }

    /// Send `Login` and wait for its response.
    ///
    /// Events that arrive before the response are discarded.
    pub async fn login(&mut self, config: &AmiConfig) -> AmiResult<()> {
        debug!("[AUTH] Sending Login for user {} [REDACTED]", config.username);
        let wire = Action::login(&config.username, &config.password).to_wire(LOGIN_ACTION_ID)?;
        self.send(&wire)
            .await?;

        let limit = config.action_timeout();
        let response = timeout(limit, self.await_login_response())
            .await
            .map_err(|_| {
                AmiError::connection(format!(
                    "no login response within {}ms",
                    limit.as_millis()
                ))
            })??;

        if !response.is_success() {
            let message = response
                .message()
                .unwrap_or("Authentication failed")
                .to_string();
            warn!("[AUTH] Login rejected: {}", message);
            return Err(AmiError::auth_failed(message));
        }
        info!("[AUTH] Logged in as {}", config.username);
        Ok(())
    }

    /// Next complete message; `Ok(None)` at end of stream.
    ///
    /// A framing error discards only the offending message; calling again
    /// continues with the next one. An unterminated block at end of stream is
    /// reported once as `MalformedMessage`, then `Ok(None)`.
    ///
    /// Cancel-safe: no bytes are lost if the future is dropped while waiting.
    pub async fn read_next(&mut self) -> AmiResult<Option<ProtocolMessage>> {
        loop {
            if let Some(message) = self
                .parser
                .parse_message()?
            {
                trace!("[RECV] Parsed message: {:?}", message.kind());
                return Ok(Some(message));
            }
            if self.eof {
                return Ok(None);
            }
            if !self
                .fill()
                .await?
            {
                info!("[RECV] Connection closed (EOF)");
                self.eof = true;
                self.parser
                    .finish()?;
                return Ok(None);
            }
        }
    }

    /// Write a `Ping` that is not tracked as a pending action.
    ///
    /// Its response arrives unmatched and is dropped by the reader.
    pub async fn send_keepalive(&self) -> AmiResult<()> {
        let seq = self
            .keepalive_seq
            .fetch_add(1, Ordering::Relaxed);
        let wire = Action::ping().to_wire(&format!("keepalive-{}", seq))?;
        debug!("[KEEPALIVE] Sending Ping");
        self.send(&wire)
            .await
    }

    /// Best-effort `Logoff`, then shut the write half. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.eof {
            if let Ok(wire) = Action::logoff().to_wire("logoff") {
                match timeout(LOGOFF_WRITE_TIMEOUT, self.writer.send(&wire)).await {
                    Ok(Ok(())) => debug!("[CLOSE] Logoff sent"),
                    Ok(Err(e)) => debug!("[CLOSE] Logoff not sent: {}", e),
                    Err(_) => debug!("[CLOSE] Logoff write timed out"),
                }
            }
        }
        self.writer
            .shutdown()
            .await;
        info!("[CLOSE] Session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
