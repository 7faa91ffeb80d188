//! Client protocol engine for MCP request/response messaging.
//!
//! Many logical requests share one physical connection. Each request is
//! tagged with a correlation id, written as a length-prefixed frame and
//! matched with its response by a background read loop.
//!
//! # Features
//!
//! - **Framing**: Versioned, length-prefixed binary frames
//! - **Correlation**: Concurrent requests over one connection, each resolved exactly once
//! - **Timeouts and Retry**: Per-attempt deadlines with exponential backoff
//! - **Lifecycle Events**: Connect, disconnect and error callbacks
//! - **Pluggable Transports**: Anything implementing [`Transport`]
//!
//! # Example
//!
//! ```no_run
//! use proven_mcp::{Connector, McpClient, Message, RetryPolicy};
//! use std::time::Duration;
//!
//! async fn example(connector: impl Connector) -> Result<(), proven_mcp::Error> {
//!     let client = McpClient::builder()
//!         .default_timeout(Duration::from_secs(5))
//!         .retry_policy(RetryPolicy::default().with_max_attempts(5))
//!         .build(connector);
//!
//!     client.set_on_disconnect(|reason| eprintln!("disconnected: {reason}"));
//!     client.connect().await?;
//!
//!     let response = client
//!         .send_message(Message::new("tools/list").with_metadata("session", "abc"))
//!         .await?;
//!     println!("{}", response.message().context());
//!
//!     client.disconnect().await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod codec;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod events;
pub mod message;
pub mod retry;
pub mod transport;

// Re-export commonly used types
pub use client::{ClientBuilder, ClientConfig, McpClient, RequestOptions, Response, ResponseHandle};
pub use codec::{Frame, FrameCodec};
pub use connection::{Connection, ConnectionConfig, ConnectionState, DisconnectReason};
pub use correlator::{Correlator, PendingRequest, Resolution};
pub use error::{Error, ErrorKind, Result};
pub use events::{Event, EventNotifier};
pub use message::Message;
pub use retry::RetryPolicy;
pub use transport::{Connector, Transport, TransportError};

// Re-export dependencies that are part of our public API
pub use async_trait::async_trait;
pub use bytes::Bytes;
