//! The server entry point and the per-connection loop.

use crate::config::RpcServerConfig;
use crate::dispatcher::ConnectionDispatcher;
use crate::routes::build_router;
use crate::service::ConnectionEvent;
use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use duplexrpc_core::SharedContext;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

/// How often the server pings each connection.
pub const PING_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to serve: {0}")]
    Io(#[from] std::io::Error),
}

/// Serves the configured methods over WebSocket and plain HTTP.
pub struct RpcServer {
    config: Arc<RpcServerConfig>,
}

impl RpcServer {
    pub fn new(config: RpcServerConfig) -> Self {
        RpcServer {
            config: Arc::new(config),
        }
    }

    /// The axum router for this server, for embedding into an existing
    /// application or binding to a caller-owned listener.
    pub fn router(&self) -> Router {
        build_router(self.config.clone())
    }

    /// Binds the configured port and serves until the process stops.
    pub async fn listen(&self) -> Result<(), ServeError> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.config.port())).await?;
        tracing::info!(port = self.config.port(), "listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Runs one WebSocket connection to completion.
///
/// A single loop owns both directions of the socket: inbound messages go to
/// the dispatcher, outbound [`ConnectionEvent`]s are written to the sink, and
/// two timers drive ping emission and liveness. A connection that stops
/// answering pings for a full `connection_timeout` is dropped.
pub(crate) async fn serve_socket(
    socket: WebSocket,
    config: Arc<RpcServerConfig>,
    context: SharedContext,
) {
    let (mut sink, mut stream) = socket.split();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut dispatcher = ConnectionDispatcher::new(config.clone(), context, events_tx);

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut liveness = tokio::time::interval_at(
        Instant::now() + config.connection_timeout,
        config.connection_timeout,
    );
    let mut alive = true;

    let reason = loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => dispatcher.handle_text(text.as_str()).await,
                Some(Ok(Message::Pong(_))) => alive = true,
                // Pings are answered by the protocol layer on read.
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Binary(_))) => {
                    tracing::debug!("ignoring a binary message");
                }
                Some(Ok(Message::Close(_))) | None => {
                    break "The connection was closed.".to_string();
                }
                Some(Err(e)) => break format!("The connection failed: {e}"),
            },
            event = events.recv() => match event {
                Some(ConnectionEvent::Outbound(frame)) => {
                    if sink.send(Message::Text(frame.to_text().into())).await.is_err() {
                        break "The connection was lost while sending.".to_string();
                    }
                }
                Some(ConnectionEvent::Complete { request_id, end }) => {
                    dispatcher.finish_stream(request_id, end);
                }
                // The dispatcher holds a sender, so the channel cannot close
                // before this loop ends.
                None => break "The connection was closed.".to_string(),
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break "The connection was lost while sending.".to_string();
                }
            },
            _ = liveness.tick() => {
                if !alive {
                    break format!(
                        "Disconnected due to timeout ({}ms).",
                        config.connection_timeout.as_millis()
                    );
                }
                alive = false;
            },
        }
    };

    tracing::debug!(%reason, "connection ended");
    dispatcher.handle_disconnect(&reason);
}
