//! Engine tests against an in-process mock AMI server on 127.0.0.1.

use asterisk_ami_tokio::{
    parse_message, Action, AmiClient, AmiConfig, AmiEngine, AmiError, CallEvent, CallStatus,
    ConnectionState, ProtocolMessage,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::timeout;

const BANNER: &str = "Asterisk Call Manager/5.0.1\r\n";
const STEP: Duration = Duration::from_secs(5);

struct MockConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MockConn {
    async fn accept(listener: &TcpListener) -> MockConn {
        let (stream, _) = timeout(STEP, listener.accept())
            .await
            .expect("engine never connected")
            .unwrap();
        let (read, mut writer) = stream.into_split();
        writer
            .write_all(BANNER.as_bytes())
            .await
            .unwrap();
        MockConn {
            reader: BufReader::new(read),
            writer,
        }
    }

    /// Accept, then answer the `Login` with success.
    async fn accept_logged_in(listener: &TcpListener) -> MockConn {
        let mut conn = Self::accept(listener).await;
        let login = conn
            .read_action()
            .await
            .expect("no login");
        assert_eq!(login.get("Action"), Some("Login"));
        assert_eq!(login.get("Username"), Some("admin"));
        let id = login
            .action_id()
            .unwrap()
            .to_string();
        conn.send(&[
            ("Response", "Success"),
            ("ActionID", id.as_str()),
            ("Message", "Authentication accepted"),
        ])
        .await;
        conn
    }

    /// Next request block, `None` at EOF.
    async fn read_action(&mut self) -> Option<ProtocolMessage> {
        let mut block = String::new();
        loop {
            let mut line = String::new();
            let n = timeout(STEP, self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a request")
                .unwrap();
            if n == 0 {
                return None;
            }
            if line == "\r\n" || line == "\n" {
                if block.is_empty() {
                    continue;
                }
                return Some(parse_message(block.as_bytes()).unwrap());
            }
            block.push_str(&line);
        }
    }

    async fn send(&mut self, fields: &[(&str, &str)]) {
        let mut wire = String::new();
        for (k, v) in fields {
            wire.push_str(&format!("{}: {}\r\n", k, v));
        }
        wire.push_str("\r\n");
        self.writer
            .write_all(wire.as_bytes())
            .await
            .unwrap();
    }

    async fn send_raw(&mut self, raw: &str) {
        self.writer
            .write_all(raw.as_bytes())
            .await
            .unwrap();
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn listener() -> (TcpListener, u16) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let port = listener
        .local_addr()
        .unwrap()
        .port();
    (listener, port)
}

fn config(port: u16) -> AmiConfig {
    let mut cfg = AmiConfig::new("127.0.0.1", port, "admin", "amp111");
    cfg.connect_timeout_ms = 2_000;
    cfg.action_timeout_ms = 2_000;
    cfg.read_timeout_ms = 0;
    cfg.reconnect_delay_ms = 50;
    cfg
}

async fn ready(client: &AmiClient) {
    timeout(STEP, client.wait_ready())
        .await
        .expect("engine never became ready")
        .unwrap();
}

#[tokio::test]
async fn test_call_lifecycle_over_tcp() {
    let (listener, port) = listener().await;
    let engine = AmiEngine::new(config(port));
    let calls = engine.calls();
    let mut stream = calls.subscribe();
    let shutdown = engine.shutdown_token();
    let task = engine.spawn();

    let mut conn = MockConn::accept_logged_in(&listener).await;
    let ch = "SIP/100-00000001";
    conn.send(&[
        ("Event", "Newchannel"),
        ("Privilege", "call,all"),
        ("Channel", ch),
        ("ChannelState", "4"),
        ("ChannelStateDesc", "Ring"),
        ("CallerIDNum", "5551234"),
        ("CallerIDName", "<unknown>"),
        ("Context", "from-internal"),
        ("Exten", "200"),
        ("Uniqueid", "1700000000.1"),
    ])
    .await;
    conn.send(&[
        ("Event", "Newstate"),
        ("Channel", ch),
        ("ChannelState", "6"),
        ("ChannelStateDesc", "Up"),
    ])
    .await;
    conn.send(&[
        ("Event", "Hangup"),
        ("Channel", ch),
        ("Uniqueid", "1700000000.1"),
        ("Cause", "16"),
        ("Cause-txt", "Normal Clearing"),
    ])
    .await;

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(
            timeout(STEP, stream.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    match &seen[0] {
        CallEvent::Started { call } => {
            assert_eq!(call.channel, ch);
            assert_eq!(call.caller_id_num.as_deref(), Some("5551234"));
            assert_eq!(call.caller_id_name, None);
        }
        other => panic!("expected Started, got {:?}", other),
    }
    assert!(matches!(
        &seen[1],
        CallEvent::StateChanged { current: CallStatus::Up, .. }
    ));
    match &seen[2] {
        CallEvent::Ended {
            cause_text,
            talk_seconds,
            ..
        } => {
            assert_eq!(cause_text, "Normal Clearing");
            assert!(talk_seconds.is_some());
        }
        other => panic!("expected Ended, got {:?}", other),
    }
    assert!(calls.get(ch).is_none());

    shutdown.cancel();
    let logoff = conn
        .read_action()
        .await
        .expect("expected Logoff before close");
    assert_eq!(logoff.get("Action"), Some("Logoff"));
    assert!(conn
        .read_action()
        .await
        .is_none());
    assert!(timeout(STEP, task)
        .await
        .unwrap()
        .unwrap()
        .is_ok());
}

#[tokio::test]
async fn test_queue_status_for_support() {
    let (listener, port) = listener().await;
    let engine = AmiEngine::new(config(port));
    let client = engine.client();
    let calls = engine.calls();
    let shutdown = engine.shutdown_token();
    let task = engine.spawn();

    let mut conn = MockConn::accept_logged_in(&listener).await;
    ready(&client).await;

    let pending = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .queue_status(Some("support"))
                .await
        }
    });

    let req = conn
        .read_action()
        .await
        .unwrap();
    assert_eq!(req.get("Action"), Some("QueueStatus"));
    assert_eq!(req.get("Queue"), Some("support"));
    let id = req
        .action_id()
        .unwrap()
        .to_string();

    conn.send(&[
        ("Response", "Success"),
        ("ActionID", id.as_str()),
        ("EventList", "start"),
        ("Message", "Queue status will follow"),
    ])
    .await;
    conn.send(&[
        ("Event", "QueueParams"),
        ("Queue", "support"),
        ("Max", "0"),
        ("Strategy", "ringall"),
        ("Calls", "1"),
        ("Holdtime", "8"),
        ("TalkTime", "120"),
        ("Completed", "10"),
        ("Abandoned", "2"),
        ("ServiceLevel", "60"),
        ("ServicelevelPerf", "90.0"),
        ("ActionID", id.as_str()),
    ])
    .await;
    // unrelated traffic in the middle of the listing
    conn.send(&[
        ("Event", "Newchannel"),
        ("Channel", "SIP/300-00000002"),
        ("ChannelState", "4"),
        ("Uniqueid", "1700000000.2"),
    ])
    .await;
    conn.send(&[
        ("Event", "QueueMember"),
        ("Queue", "support"),
        ("Name", "Agent 100"),
        ("Location", "SIP/100"),
        ("Status", "1"),
        ("Paused", "0"),
        ("CallsTaken", "4"),
        ("ActionID", id.as_str()),
    ])
    .await;
    conn.send(&[
        ("Event", "QueueEntry"),
        ("Queue", "support"),
        ("Position", "1"),
        ("Channel", "SIP/300-00000002"),
        ("CallerIDNum", "300"),
        ("Wait", "8"),
        ("ActionID", id.as_str()),
    ])
    .await;
    conn.send(&[
        ("Event", "QueueStatusComplete"),
        ("ActionID", id.as_str()),
        ("EventList", "Complete"),
        ("ListItems", "3"),
    ])
    .await;

    let queues = timeout(STEP, pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0].name, "support");
    assert_eq!(queues[0].abandoned, 2);
    assert_eq!(queues[0].members.len(), 1);
    assert_eq!(queues[0].members[0].calls_taken, 4);
    assert_eq!(queues[0].entries[0].channel, "SIP/300-00000002");
    // the interleaved event reached the registry
    assert!(calls
        .get("SIP/300-00000002")
        .is_some());

    shutdown.cancel();
    timeout(STEP, task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_commands_and_originate() {
    let (listener, port) = listener().await;
    let engine = AmiEngine::new(config(port));
    let client = engine.client();
    let shutdown = engine.shutdown_token();
    let task = engine.spawn();

    let mut conn = MockConn::accept_logged_in(&listener).await;
    ready(&client).await;

    let originate = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .originate("100", "200", "from-internal", 30)
                .await
        }
    });
    let req = conn
        .read_action()
        .await
        .unwrap();
    assert_eq!(req.get("Action"), Some("Originate"));
    assert_eq!(req.get("Channel"), Some("SIP/100"));
    assert_eq!(req.get("Exten"), Some("200"));
    assert_eq!(req.get("Timeout"), Some("30000"));
    let id = req
        .action_id()
        .unwrap()
        .to_string();
    conn.send(&[
        ("Response", "Success"),
        ("ActionID", id.as_str()),
        ("Message", "Originate successfully queued"),
    ])
    .await;
    assert!(originate
        .await
        .unwrap()
        .unwrap());

    // legacy Follows body
    let status = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .system_status()
                .await
        }
    });
    let req = conn
        .read_action()
        .await
        .unwrap();
    assert_eq!(req.get("Command"), Some("core show uptime"));
    let id = req
        .action_id()
        .unwrap()
        .to_string();
    conn.send_raw(&format!(
        "Response: Follows\r\nPrivilege: Command\r\nActionID: {}\r\n\
         System uptime: 3 hours, 2 minutes\r\n--END COMMAND--\r\n\r\n",
        id
    ))
    .await;

    // Output: lines
    let req = conn
        .read_action()
        .await
        .unwrap();
    assert_eq!(req.get("Command"), Some("core show channels count"));
    let id = req
        .action_id()
        .unwrap()
        .to_string();
    conn.send(&[
        ("Response", "Success"),
        ("ActionID", id.as_str()),
        ("Output", "2 active channels"),
        ("Output", "1 active call"),
    ])
    .await;

    let status = status
        .await
        .unwrap()
        .unwrap();
    assert!(status.connected);
    assert_eq!(status.uptime, "3 hours, 2 minutes");
    assert_eq!(status.active_channels, 2);

    shutdown.cancel();
    timeout(STEP, task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_originate_outlives_default_action_timeout() {
    let (listener, port) = listener().await;
    let engine = AmiEngine::new(config(port));
    let client = engine.client();
    let shutdown = engine.shutdown_token();
    let task = engine.spawn();

    let mut conn = MockConn::accept_logged_in(&listener).await;
    ready(&client).await;
    client.set_action_timeout(Duration::from_millis(100));

    let originate = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .originate("100", "200", "from-internal", 1)
                .await
        }
    });
    let req = conn
        .read_action()
        .await
        .unwrap();
    assert_eq!(req.get("Action"), Some("Originate"));
    let id = req
        .action_id()
        .unwrap()
        .to_string();

    // the callee rings well past the default deadline before the dial fails
    tokio::time::sleep(Duration::from_millis(400)).await;
    conn.send(&[
        ("Response", "Error"),
        ("ActionID", id.as_str()),
        ("Message", "Originate failed"),
    ])
    .await;
    assert!(!originate
        .await
        .unwrap()
        .unwrap());

    shutdown.cancel();
    timeout(STEP, task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_action_timeout_leaves_nothing_pending() {
    let (listener, port) = listener().await;
    let engine = AmiEngine::new(config(port));
    let client = engine.client();
    let shutdown = engine.shutdown_token();
    let task = engine.spawn();

    let mut conn = MockConn::accept_logged_in(&listener).await;
    ready(&client).await;

    let result = client
        .submit(Action::ping().with_timeout(Duration::from_millis(200)))
        .await;
    match result {
        Err(AmiError::ActionTimeout {
            command,
            timeout_ms,
            ..
        }) => {
            assert_eq!(command, "Ping");
            assert_eq!(timeout_ms, 200);
        }
        other => panic!("expected ActionTimeout, got {:?}", other),
    }

    // a late response is dropped and the session stays usable
    let late = conn
        .read_action()
        .await
        .unwrap();
    let late_id = late
        .action_id()
        .unwrap()
        .to_string();
    conn.send(&[("Response", "Success"), ("ActionID", late_id.as_str()), ("Ping", "Pong")])
        .await;

    let ping = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .ping()
                .await
        }
    });
    let req = conn
        .read_action()
        .await
        .unwrap();
    assert_ne!(req.action_id(), Some(late_id.as_str()));
    let id = req
        .action_id()
        .unwrap()
        .to_string();
    conn.send(&[("Response", "Success"), ("ActionID", id.as_str()), ("Ping", "Pong")])
        .await;
    assert!(ping
        .await
        .unwrap()
        .unwrap());

    shutdown.cancel();
    timeout(STEP, task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_pending_action_fails_on_disconnect_then_reconnects() {
    let (listener, port) = listener().await;
    let engine = AmiEngine::new(config(port));
    let client = engine.client();
    let shutdown = engine.shutdown_token();
    let task = engine.spawn();

    let mut conn = MockConn::accept_logged_in(&listener).await;
    ready(&client).await;

    let pending = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .ping()
                .await
        }
    });
    conn.read_action()
        .await
        .unwrap();
    drop(conn);

    assert!(matches!(
        timeout(STEP, pending)
            .await
            .unwrap()
            .unwrap(),
        Err(AmiError::ConnectionClosed)
    ));

    // second session
    let _conn = MockConn::accept_logged_in(&listener).await;
    ready(&client).await;
    assert_eq!(client.connection_state(), ConnectionState::Ready);

    shutdown.cancel();
    timeout(STEP, task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_rejected_login_counts_as_failure() {
    let (listener, port) = listener().await;
    let mut cfg = config(port);
    cfg.max_reconnects = 1;
    let engine = AmiEngine::new(cfg);
    let task = engine.spawn();

    let mut conn = MockConn::accept(&listener).await;
    let login = conn
        .read_action()
        .await
        .unwrap();
    let id = login
        .action_id()
        .unwrap()
        .to_string();
    conn.send(&[
        ("Response", "Error"),
        ("ActionID", id.as_str()),
        ("Message", "Authentication failed"),
    ])
    .await;

    let result = timeout(STEP, task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        result,
        Err(AmiError::ReconnectLimitExceeded { attempts: 1 })
    ));
}

#[tokio::test]
async fn test_reconnect_limit_against_closed_port() {
    let (listener, port) = listener().await;
    drop(listener);

    let mut cfg = config(port);
    cfg.max_reconnects = 3;
    cfg.reconnect_delay_ms = 10;
    let engine = AmiEngine::new(cfg);
    let state = engine.state();

    let result = timeout(STEP, engine.run())
        .await
        .unwrap();
    assert!(matches!(
        result,
        Err(AmiError::ReconnectLimitExceeded { attempts: 3 })
    ));
    assert_eq!(*state.borrow(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_unlimited_reconnects_until_shutdown() {
    let (listener, port) = listener().await;
    drop(listener);

    let mut cfg = config(port);
    cfg.max_reconnects = 0;
    cfg.reconnect_delay_ms = 10;
    let engine = AmiEngine::new(cfg);
    let shutdown = engine.shutdown_token();
    let task = engine.spawn();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!task.is_finished());

    shutdown.cancel();
    assert!(timeout(STEP, task)
        .await
        .unwrap()
        .unwrap()
        .is_ok());
}

#[tokio::test]
async fn test_idle_session_pings_then_drops() {
    let (listener, port) = listener().await;
    let mut cfg = config(port);
    cfg.read_timeout_ms = 150;
    cfg.max_reconnects = 1;
    let engine = AmiEngine::new(cfg);
    let task = engine.spawn();

    let mut conn = MockConn::accept_logged_in(&listener).await;
    let ping = conn
        .read_action()
        .await
        .unwrap();
    assert_eq!(ping.get("Action"), Some("Ping"));
    assert!(ping
        .action_id()
        .unwrap()
        .starts_with("keepalive-"));

    // no reply: the engine gives up on the session
    let logoff = conn
        .read_action()
        .await
        .unwrap();
    assert_eq!(logoff.get("Action"), Some("Logoff"));

    let result = timeout(STEP, task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        result,
        Err(AmiError::ReconnectLimitExceeded { attempts: 1 })
    ));
}

#[tokio::test]
async fn test_shutdown_during_login_logs_off() {
    let (listener, port) = listener().await;
    let engine = AmiEngine::new(config(port));
    let state = engine.state();
    let shutdown = engine.shutdown_token();
    let task = engine.spawn();

    // banner, then sit on the Login without answering
    let mut conn = MockConn::accept(&listener).await;
    let login = conn
        .read_action()
        .await
        .unwrap();
    assert_eq!(login.get("Action"), Some("Login"));
    assert_eq!(*state.borrow(), ConnectionState::Authenticating);

    shutdown.cancel();
    let logoff = conn
        .read_action()
        .await
        .unwrap();
    assert_eq!(logoff.get("Action"), Some("Logoff"));
    assert!(conn
        .read_action()
        .await
        .is_none());

    timeout(STEP, task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(*state.borrow(), ConnectionState::Stopped);
}
