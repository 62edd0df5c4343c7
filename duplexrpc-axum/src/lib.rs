//! Duplex RPC server for axum.
//!
//! This crate provides the server half of duplexrpc. A single WebSocket
//! connection carries any number of concurrent logical streams, each
//! identified by a request id; the server dispatches every inbound frame to
//! one of four service shapes and multiplexes all outbound traffic back
//! over the same socket.
//!
//! ## Service shapes
//!
//! - Request-reply: [`RequestReplyService`], also exposed as
//!   `POST {base_url}/{method}` over plain HTTP
//! - Bidirectional stream: [`BidiStreamFactory`] /
//!   [`BidiStreamService`]
//! - Server-push stream: [`ServerStreamFactory`] /
//!   [`ServerStreamService`]
//! - Client-push stream: [`ClientStreamFactory`] /
//!   [`ClientStreamService`]
//!
//! ## Example
//!
//! ```ignore
//! use duplexrpc_axum::{RpcServer, RpcServerConfig};
//!
//! let config = RpcServerConfig::builder()
//!     .add_request_reply_service(Echo)?
//!     .build();
//! RpcServer::new(config).listen().await?;
//! ```
//!
//! Middleware chains run in registration order and short-circuit on the
//! first failure: one server-wide chain first, then the chain of the
//! targeted service. Connections are pinged every second and dropped when
//! they stop answering for a full `connection_timeout`; every stream open
//! on a dropped connection receives exactly one completion carrying the
//! disconnect reason.

mod config;
mod dispatcher;
mod middleware;
mod routes;
mod server;
mod service;

pub use config::{
    ConfigError, ContextFactory, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_PORT, HEALTHZ_PATH,
    MethodRegistration, RpcServerConfig, RpcServerConfigBuilder,
};
pub use middleware::{Middleware, MiddlewareChain, middleware_fn};
pub use server::{PING_INTERVAL, RpcServer, ServeError};
pub use service::{
    BidiStreamFactory, BidiStreamService, ClientStreamFactory, ClientStreamService,
    ConnectionEvent, RequestReplyService, ServerStreamFactory, ServerStreamService, StreamHandle,
};

// Re-export core types that users need
pub use duplexrpc_core::{
    CLIENT_CONTEXT_METHOD, COMPLETE_METHOD, Frame, HttpContext, Reply, ServerFrame, SharedContext,
};
