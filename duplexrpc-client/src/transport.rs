//! Reconnecting WebSocket transport.
//!
//! One physical socket carries any number of logical streams, demultiplexed
//! by request id. The per-id subscription table is independent of the
//! physical socket: it survives reconnects, and the reader task of every new
//! socket routes into the same table.

use crate::reconnect::{ConnectionState, Connector, ReconnectConfig, ReconnectingClient};
use async_tungstenite::tokio::connect_async;
use async_tungstenite::tungstenite::Message;
use duplexrpc_core::{Frame, Reply, RequestIdAllocator, ServerFrame};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the transport waits for a server ping before it considers the
/// connection dead.
pub const DEFAULT_EXPECTED_PING_DELAY: Duration = Duration::from_secs(6);

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub expected_ping_delay: Duration,
    pub reconnect: ReconnectConfig,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        TransportConfig {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            expected_ping_delay: DEFAULT_EXPECTED_PING_DELAY,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Clone)]
struct Route {
    frames: mpsc::UnboundedSender<ServerFrame>,
    completed: Arc<AtomicBool>,
}

struct Shared {
    config: TransportConfig,
    /// Writer half of the current socket, if any.
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    routes: Mutex<HashMap<u64, Route>>,
    /// Set by [`WebSocketTransport::close`]; distinguishes a local close
    /// from a lost connection.
    was_closed: AtomicBool,
}

impl Shared {
    fn lock_writer(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_routes(&self) -> MutexGuard<'_, HashMap<u64, Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The receiving end of one logical stream. Dropping it removes the route.
pub struct Subscription {
    request_id: u64,
    pub(crate) frames: mpsc::UnboundedReceiver<ServerFrame>,
    pub(crate) completed: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.lock_routes().remove(&self.request_id);
    }
}

/// A WebSocket connection that reconnects itself and multiplexes logical
/// streams by request id.
pub struct WebSocketTransport {
    shared: Arc<Shared>,
    reconnect: ReconnectingClient<Dialer>,
    allocator: RequestIdAllocator,
}

impl WebSocketTransport {
    pub fn new(config: TransportConfig) -> Self {
        let reconnect_config = config.reconnect.clone();
        let shared = Arc::new(Shared {
            config,
            writer: Mutex::new(None),
            routes: Mutex::new(HashMap::new()),
            was_closed: AtomicBool::new(false),
        });
        let (disconnects_tx, mut disconnects_rx) = mpsc::unbounded_channel::<Reply<()>>();
        let dialer = Dialer {
            shared: shared.clone(),
            disconnects: disconnects_tx,
        };
        let reconnect = ReconnectingClient::new(dialer, reconnect_config);

        // Reader tasks report lost sockets here; the supervisor feeds them
        // back into the reconnect cycle.
        let supervisor = reconnect.clone();
        let supervisor_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(reason) = disconnects_rx.recv().await {
                if supervisor_shared.was_closed.load(Ordering::SeqCst) {
                    break;
                }
                supervisor.on_disconnect(&reason).await.log_if_error();
            }
        });

        WebSocketTransport {
            shared,
            reconnect,
            allocator: RequestIdAllocator::new(),
        }
    }

    pub async fn connect(&self) -> Reply<()> {
        self.reconnect.connect().await
    }

    pub async fn resolve_when_connected(&self) -> Reply<()> {
        self.reconnect.resolve_when_connected().await
    }

    pub fn is_connected(&self) -> bool {
        self.reconnect.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.reconnect.state()
    }

    pub fn next_request_id(&self) -> u64 {
        self.allocator.next()
    }

    /// Registers a logical stream. At most one subscription may exist per
    /// request id.
    pub fn subscribe(&self, request_id: u64) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let completed = Arc::new(AtomicBool::new(false));
        let replaced = self.shared.lock_routes().insert(
            request_id,
            Route {
                frames: tx,
                completed: completed.clone(),
            },
        );
        debug_assert!(replaced.is_none(), "duplicate subscription for one id");
        Subscription {
            request_id,
            frames: rx,
            completed,
            shared: self.shared.clone(),
        }
    }

    /// Sends a frame, waiting for the connection first. Frames issued while
    /// the transport is reconnecting are queued behind the reconnect, not
    /// dropped.
    pub async fn send(&self, frame: &Frame) -> Reply<()> {
        let text = frame.to_text();
        let connected = self.resolve_when_connected().await;
        if connected.is_err() {
            return connected;
        }
        let writer = self.shared.lock_writer().clone();
        match writer {
            Some(writer) if writer.send(Message::Text(text)).is_ok() => Reply::ok_empty(),
            _ => Reply::err("The connection was lost while sending."),
        }
    }

    /// Closes the transport for good. Open streams still receive their
    /// synthesized completion, but no reconnect is attempted.
    pub fn close(&self) {
        self.shared.was_closed.store(true, Ordering::SeqCst);
        if let Some(writer) = self.shared.lock_writer().take() {
            let _ = writer.send(Message::Close(None));
        }
    }

    pub fn on_reconnects_exceeded(&self, listener: impl FnMut(&Reply<()>) + Send + 'static) {
        self.reconnect.on_reconnects_exceeded(listener);
    }

    /// Fires after every successful connect, including the first.
    pub fn subscribe_connected(&self) -> broadcast::Receiver<()> {
        self.reconnect.subscribe_connected()
    }

    #[cfg(test)]
    fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

struct Dialer {
    shared: Arc<Shared>,
    disconnects: mpsc::UnboundedSender<Reply<()>>,
}

impl Connector for Dialer {
    async fn connect(&self) -> Reply<()> {
        let url = self.shared.config.url.clone();
        let dial = connect_async(url.clone());
        let socket = match tokio::time::timeout(self.shared.config.connect_timeout, dial).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(e)) => return Reply::err(format!("Failed to connect to {url}: {e}")),
            Err(_) => return Reply::err(format!("Timed out connecting to {url}.")),
        };

        let (mut sink, stream) = socket.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();
        *self.shared.lock_writer() = Some(writer_tx.clone());

        tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(read_loop(
            self.shared.clone(),
            writer_tx,
            stream,
            self.disconnects.clone(),
        ));
        Reply::ok_empty()
    }
}

async fn read_loop<S>(
    shared: Arc<Shared>,
    writer: mpsc::UnboundedSender<Message>,
    mut stream: S,
    disconnects: mpsc::UnboundedSender<Reply<()>>,
) where
    S: futures::Stream<Item = Result<Message, async_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut ping_deadline = Instant::now() + shared.config.expected_ping_delay;
    let reason: Reply<()> = loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => route_frame(&shared, &text),
                Some(Ok(Message::Ping(payload))) => {
                    ping_deadline = Instant::now() + shared.config.expected_ping_delay;
                    let _ = writer.send(Message::Pong(payload));
                }
                Some(Ok(Message::Close(_))) | None => {
                    break Reply::err_with_trace("The connection was closed.", None);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Reply::err(format!("The connection failed: {e}")),
            },
            // No ping within the expected delay: the server is gone even if
            // the socket still looks open. Terminate without a close
            // handshake.
            _ = tokio::time::sleep_until(ping_deadline) => {
                break Reply::err(format!(
                    "Disconnected due to timeout ({}ms).",
                    shared.config.expected_ping_delay.as_millis()
                ));
            }
        }
    };

    shared.lock_writer().take();
    complete_all_routes(&shared, &reason);
    if !shared.was_closed.load(Ordering::SeqCst) {
        let _ = disconnects.send(reason);
    }
}

fn route_frame(shared: &Shared, text: &str) {
    match ServerFrame::parse(text) {
        Ok(frame) => {
            let route = {
                let mut routes = shared.lock_routes();
                if frame.is_complete() {
                    routes.remove(&frame.request_id)
                } else {
                    routes.get(&frame.request_id).cloned()
                }
            };
            match route {
                Some(route) => {
                    if frame.is_complete() {
                        route.completed.store(true, Ordering::SeqCst);
                    }
                    let _ = route.frames.send(frame);
                }
                None => {
                    tracing::debug!(request_id = frame.request_id, "no subscriber, frame dropped")
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "dropping unparseable frame"),
    }
}

/// Delivers exactly one synthesized completion to every live stream and
/// clears the table.
fn complete_all_routes(shared: &Shared, reason: &Reply<()>) {
    let routes = std::mem::take(&mut *shared.lock_routes());
    for (request_id, route) in routes {
        route.completed.store(true, Ordering::SeqCst);
        let _ = route.frames.send(ServerFrame::complete(request_id, reason));
    }
}

// =============================================================================
// Tests
// =============================================================================
