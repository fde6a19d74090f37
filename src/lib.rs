//! Asterisk Manager Interface (AMI) client for Rust
//!
//! This crate keeps one authenticated AMI session alive, correlates actions
//! with their responses, routes events to handlers and maintains a live
//! registry of active calls built from channel events.
//!
//! # Architecture
//!
//! - [`AmiEngine`]: owns the connection; reconnects with a fixed delay until
//!   shut down or out of attempts
//! - [`AmiClient`] (Clone + Send): submit actions from any task
//! - [`CallRegistry`]: active calls, plus [`CallEvent`] notifications through
//!   [`CallRegistry::subscribe`]
//! - [`EventDispatcher`]: per-event handlers, run on the reader task
//!
//! # Examples
//!
//! ## Tracking calls
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{AmiConfig, AmiEngine, CallEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AmiConfig::new("127.0.0.1", 5038, "admin", "amp111");
//!     let engine = AmiEngine::new(config);
//!     let mut calls = engine.calls().subscribe();
//!     let _task = engine.spawn();
//!
//!     while let Some(event) = calls.recv().await {
//!         match event {
//!             CallEvent::Started { call } => println!("{} ringing", call.channel),
//!             CallEvent::Ended { call, duration_seconds, .. } => {
//!                 println!("{} ended after {}s", call.channel, duration_seconds)
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Actions
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{Action, AmiConfig, AmiEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = AmiEngine::new(AmiConfig::new("127.0.0.1", 5038, "admin", "amp111"));
//!     let client = engine.client();
//!     let _task = engine.spawn();
//!     client.wait_ready().await?;
//!
//!     for queue in client.queue_status(Some("support")).await? {
//!         println!("{}: {} waiting, {} members", queue.name, queue.calls, queue.members.len());
//!     }
//!
//!     // Anything else goes through `submit`
//!     let result = client
//!         .submit(Action::new("Setvar").param("Variable", "NIGHT_MODE").param("Value", "1"))
//!         .await?
//!         .into_result()?;
//!     println!("{:?}", result.message());
//!     Ok(())
//! }
//! ```
//!
//! ## Wire format
//!
//! ```rust
//! use asterisk_ami_tokio::{parse_message, serialize_action};
//!
//! let wire = serialize_action("Ping", [("ActionID", "1")]).unwrap();
//! assert_eq!(wire, "Action: Ping\r\nActionID: 1\r\n\r\n");
//!
//! let msg = parse_message(b"Response: Success\r\nActionID: 1\r\nPing: Pong\r\n\r\n").unwrap();
//! assert!(msg.is_success());
//! assert_eq!(msg.get("Ping"), Some("Pong"));
//! ```

#[macro_use]
mod macros;

pub mod action;
pub mod calls;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod headers;
pub mod status;
pub mod supervisor;

pub(crate) mod buffer;
pub mod constants;
pub mod protocol;

pub use action::{Action, ActionKind, ActionResult, ResponseStatus};
pub use calls::{
    ActiveCall, CallEvent, CallEventStream, CallRegistry, Clock, QueueCaller,
    QueueMemberPresence, QueuePresence, SystemClock,
};
pub use channel::{CallStatus, ChannelState, ParseChannelStateError};
pub use client::AmiClient;
pub use config::{AmiConfig, TransportScheme};
pub use connection::{ConnectionState, Session, SessionWriter};
pub use constants::{DEFAULT_AMI_PORT, DEFAULT_AMI_TLS_PORT};
pub use correlator::Correlator;
pub use dispatch::{EventDispatcher, HandlerError, HandlerResult};
pub use error::{AmiError, AmiResult};
pub use event::{
    AmiEventType, BridgeEvent, HangupEvent, NewChannelEvent, NewStateEvent, ParseEventTypeError,
};
pub use headers::{AmiHeader, ParseHeaderError};
pub use protocol::{parse_message, serialize_action, AmiParser, MessageKind, ProtocolMessage};
pub use status::{
    ChannelSummary, PeerStatus, QueueEntryInfo, QueueMemberInfo, QueueSummary, SipPeer,
    SystemStatus,
};
pub use supervisor::AmiEngine;
