//! Integration tests against a live Asterisk instance.
//!
//! These tests require AMI on 127.0.0.1:5038 with a manager user
//! `admin` / `amp111` (read/write `all`).
//! Run with: cargo test --test live_asterisk -- --ignored

use asterisk_ami_tokio::{
    Action, AmiClient, AmiConfig, AmiEngine, AmiError, AmiEventType, ConnectionState,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const AMI_HOST: &str = "127.0.0.1";
const AMI_PORT: u16 = 5038;
const AMI_USER: &str = "admin";
const AMI_SECRET: &str = "amp111";

async fn connect() -> (AmiClient, CancellationToken, JoinHandle<Result<(), AmiError>>) {
    let mut config = AmiConfig::new(AMI_HOST, AMI_PORT, AMI_USER, AMI_SECRET);
    config.max_reconnects = 1;
    let engine = AmiEngine::new(config);
    let client = engine.client();
    let shutdown = engine.shutdown_token();
    let task = engine.spawn();
    tokio::time::timeout(Duration::from_secs(10), client.wait_ready())
        .await
        .expect("timeout waiting for login")
        .expect("failed to connect to Asterisk");
    (client, shutdown, task)
}

async fn stop(shutdown: CancellationToken, task: JoinHandle<Result<(), AmiError>>) {
    shutdown.cancel();
    task.await
        .unwrap()
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn live_connect_and_ping() {
    let (client, shutdown, task) = connect().await;
    assert_eq!(client.connection_state(), ConnectionState::Ready);
    assert!(client
        .ping()
        .await
        .unwrap());
    stop(shutdown, task).await;
}

#[tokio::test]
#[ignore]
async fn live_bad_secret_is_rejected() {
    let mut config = AmiConfig::new(AMI_HOST, AMI_PORT, AMI_USER, "definitely-wrong");
    config.max_reconnects = 1;
    let result = AmiEngine::new(config)
        .run()
        .await;
    assert!(matches!(
        result,
        Err(AmiError::ReconnectLimitExceeded { attempts: 1 })
    ));
}

#[tokio::test]
#[ignore]
async fn live_system_status() {
    let (client, shutdown, task) = connect().await;
    let status = client
        .system_status()
        .await
        .unwrap();
    assert!(status.connected);
    assert_ne!(status.uptime, "Unknown", "uptime not parsed: {:?}", status);
    stop(shutdown, task).await;
}

#[tokio::test]
#[ignore]
async fn live_core_show_channels_completes() {
    let (client, shutdown, task) = connect().await;
    let result = client
        .submit(Action::core_show_channels())
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(
        result
            .events_of(AmiEventType::CoreShowChannelsComplete)
            .count(),
        1
    );
    let channels = client
        .active_channels()
        .await
        .unwrap();
    println!("{} active channels", channels.len());
    stop(shutdown, task).await;
}

#[tokio::test]
#[ignore]
async fn live_queue_status_lists() {
    let (client, shutdown, task) = connect().await;
    let queues = client
        .queue_status(None)
        .await
        .unwrap();
    for queue in &queues {
        println!(
            "{}: {} members, {} waiting",
            queue.name,
            queue.members.len(),
            queue.entries.len()
        );
    }
    stop(shutdown, task).await;
}

#[tokio::test]
#[ignore]
async fn live_hangup_unknown_channel_is_false() {
    let (client, shutdown, task) = connect().await;
    assert!(!client
        .hangup_channel("SIP/does-not-exist-00000000")
        .await
        .unwrap());
    stop(shutdown, task).await;
}

#[tokio::test]
#[ignore]
async fn live_unknown_command_returns_none_or_text() {
    let (client, shutdown, task) = connect().await;
    // Asterisk answers unknown CLI commands with either an Error response or
    // "No such command" output, depending on version
    let out = client
        .run_command("no such command here")
        .await
        .unwrap();
    if let Some(text) = out {
        assert!(text.contains("No such command"), "unexpected output: {}", text);
    }
    stop(shutdown, task).await;
}
