//! The client-facing entry point for one duplex connection.

use crate::channel::MultiplexedChannel;
use crate::stub::{
    BidiStreamStub, ClientStreamStub, DEFAULT_REQUEST_TIMEOUT, RequestReplyStub, ServerStreamStub,
};
use crate::transport::{TransportConfig, WebSocketTransport};
use duplexrpc_core::{CLIENT_CONTEXT_METHOD, Frame, HttpContext, Reply};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;

/// One duplex connection to a server, with constructors for all stub kinds.
///
/// The endpoint remembers the last client context set on it and replays it
/// after every reconnect, so server-side context survives physical socket
/// churn.
pub struct WebSocketEndpoint {
    transport: Arc<WebSocketTransport>,
    context: Arc<Mutex<Option<HttpContext>>>,
}

impl WebSocketEndpoint {
    pub fn new(config: TransportConfig) -> Self {
        let transport = Arc::new(WebSocketTransport::new(config));
        let context = Arc::new(Mutex::new(None::<HttpContext>));
        spawn_context_replay(
            Arc::downgrade(&transport),
            context.clone(),
            transport.subscribe_connected(),
        );
        WebSocketEndpoint { transport, context }
    }

    pub async fn connect(&self) -> Reply<()> {
        self.transport.connect().await
    }

    pub fn close(&self) {
        self.transport.close();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn transport(&self) -> &Arc<WebSocketTransport> {
        &self.transport
    }

    pub fn on_reconnects_exceeded(&self, listener: impl FnMut(&Reply<()>) + Send + 'static) {
        self.transport.on_reconnects_exceeded(listener);
    }

    pub fn request_reply_stub(&self) -> RequestReplyStub {
        RequestReplyStub::new(self.transport.clone())
    }

    pub fn new_bidi_stream_stub<C: Serialize, S: DeserializeOwned>(
        &self,
        method: impl Into<String>,
    ) -> BidiStreamStub<C, S> {
        BidiStreamStub::new(self.transport.clone(), method)
    }

    pub fn new_server_stream_stub<A: Serialize, S: DeserializeOwned>(
        &self,
        method: impl Into<String>,
    ) -> ServerStreamStub<A, S> {
        ServerStreamStub::new(self.transport.clone(), method)
    }

    pub fn new_client_stream_stub<C: Serialize>(
        &self,
        method: impl Into<String>,
    ) -> ClientStreamStub<C> {
        ClientStreamStub::new(self.transport.clone(), method)
    }

    /// Raw channel access for callers that want untyped streams.
    pub fn new_channel(&self, method: impl Into<String>) -> MultiplexedChannel {
        MultiplexedChannel::new(self.transport.clone(), method)
    }

    /// Sends a context update and waits for the server's acknowledgement.
    /// The context is stored and re-sent after every reconnect.
    pub async fn set_client_context(&self, context: HttpContext) -> Reply<()> {
        *lock(&self.context) = Some(context.clone());
        send_client_context(&self.transport, &context).await
    }
}

fn lock(context: &Mutex<Option<HttpContext>>) -> MutexGuard<'_, Option<HttpContext>> {
    context.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_context_replay(
    transport: Weak<WebSocketTransport>,
    context: Arc<Mutex<Option<HttpContext>>>,
    mut connected: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            match connected.recv().await {
                Ok(()) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
            let Some(transport) = transport.upgrade() else {
                break;
            };
            let snapshot = lock(&context).clone();
            if let Some(snapshot) = snapshot {
                send_client_context(&transport, &snapshot).await.log_if_error();
            }
        }
    });
}

async fn send_client_context(transport: &WebSocketTransport, context: &HttpContext) -> Reply<()> {
    let args = match serde_json::to_value(context) {
        Ok(args) => args,
        Err(e) => return Reply::err(format!("The client context is not serializable: {e}")),
    };
    let request_id = transport.next_request_id();
    let mut subscription = transport.subscribe(request_id);
    let sent = transport
        .send(&Frame::open(request_id, CLIENT_CONTEXT_METHOD, args))
        .await;
    if sent.is_err() {
        return sent;
    }
    match tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, subscription.frames.recv()).await {
        Ok(Some(frame)) => Reply::<serde_json::Value>::from_wire(frame.reply).status(),
        Ok(None) => Reply::err("The connection was closed before the context was acknowledged."),
        Err(_) => Reply::err("Timeout."),
    }
}
