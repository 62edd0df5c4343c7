//! Duplex RPC client.
//!
//! This crate provides the client half of duplexrpc: a reconnecting
//! WebSocket transport that multiplexes any number of logical streams over
//! one physical connection, plus typed stubs for the four stream shapes.
//!
//! ## Stream shapes
//!
//! - Request-reply: one message out, one reply back
//!   ([`RequestReplyStub`])
//! - Bidirectional stream: both sides send until either completes
//!   ([`BidiStreamStub`])
//! - Server stream: one start message, the server pushes
//!   ([`ServerStreamStub`])
//! - Client stream: the client pushes, the server completes
//!   ([`ClientStreamStub`])
//!
//! ## Example
//!
//! ```ignore
//! use duplexrpc_client::{TransportConfig, WebSocketEndpoint};
//!
//! let endpoint = WebSocketEndpoint::new(TransportConfig::new("ws://localhost:3000/"));
//! endpoint.connect().await;
//!
//! let reply: duplexrpc_core::Reply<String> = endpoint
//!     .request_reply_stub()
//!     .execute("echo", &"hello".to_string())
//!     .await;
//! ```
//!
//! The transport reconnects transparently: sends issued while the
//! connection is down wait for the next successful reconnect instead of
//! failing, and logical subscriptions survive across physical sockets. When
//! a connection is lost, every open stream receives exactly one synthesized
//! completion carrying the disconnect reason.

mod channel;
mod endpoint;
mod error;
mod http;
mod reconnect;
mod stub;
mod transport;

pub use channel::{MultiplexedChannel, StreamEvent};
pub use endpoint::WebSocketEndpoint;
pub use error::ClientError;
pub use self::http::HttpRequestReplyStub;
pub use reconnect::{
    ConnectionState, Connector, DEFAULT_RECONNECT_TIMEOUT, ReconnectConfig, ReconnectingClient,
};
pub use stub::{
    BidiStreamStub, ClientStreamStub, RequestReplyStub, ServerStreamStub, StreamItem,
};
pub use transport::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_EXPECTED_PING_DELAY, Subscription, TransportConfig,
    WebSocketTransport,
};

// Re-export core types that users need
pub use duplexrpc_core::{Frame, HttpContext, Reply, RequestIdAllocator, ServerFrame};
