//! Typed stubs for the four stream shapes.

use crate::channel::{MultiplexedChannel, StreamEvent};
use crate::error::ClientError;
use crate::transport::WebSocketTransport;
use duplexrpc_core::{Frame, Reply};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Default deadline for a single request-reply call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// One inbound item on a streaming stub.
#[derive(Debug)]
pub enum StreamItem<S> {
    Message(S),
    /// The terminal event. Carries the end result of the stream, which on a
    /// lost connection is the disconnect reason.
    Completed(Reply),
}

/// Issues request-reply calls. Every call gets a fresh request id.
pub struct RequestReplyStub {
    transport: Arc<WebSocketTransport>,
    timeout: Duration,
}

impl RequestReplyStub {
    pub fn new(transport: Arc<WebSocketTransport>) -> Self {
        RequestReplyStub {
            transport,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Calls `method` and resolves with the first matching reply, with an
    /// error reply on disconnect, or with a timeout error.
    pub async fn execute<A: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        args: &A,
    ) -> Reply<R> {
        let args = match serde_json::to_value(args) {
            Ok(args) => args,
            Err(e) => return Reply::err(format!("The arguments are not serializable: {e}")),
        };
        let request_id = self.transport.next_request_id();
        let mut subscription = self.transport.subscribe(request_id);
        let sent = self.transport.send(&Frame::open(request_id, method, args)).await;
        if sent.is_err() {
            return Reply::err_with_trace(
                sent.error_message().to_string(),
                sent.trace().map(str::to_string),
            );
        }
        match tokio::time::timeout(self.timeout, subscription.frames.recv()).await {
            Ok(Some(frame)) => Reply::from_wire(frame.reply),
            Ok(None) => Reply::err("The connection was closed before a reply arrived."),
            Err(_) => Reply::err("Timeout."),
        }
        // Dropping the subscription unregisters the id, so a reply that
        // arrives after the timeout is discarded by the transport.
    }
}

/// Both sides send until either completes.
pub struct BidiStreamStub<C, S> {
    channel: MultiplexedChannel,
    _outbound: PhantomData<fn(C)>,
    _inbound: PhantomData<fn() -> S>,
}

impl<C: Serialize, S: DeserializeOwned> BidiStreamStub<C, S> {
    pub(crate) fn new(transport: Arc<WebSocketTransport>, method: impl Into<String>) -> Self {
        BidiStreamStub {
            channel: MultiplexedChannel::new(transport, method),
            _outbound: PhantomData,
            _inbound: PhantomData,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.channel.request_id()
    }

    pub fn is_completed(&self) -> bool {
        self.channel.is_completed()
    }

    /// Sends a message; the first one opens the stream on the server.
    pub async fn send(&self, message: &C) -> Result<(), ClientError> {
        self.channel.send(serde_json::to_value(message)?).await
    }

    /// Completes the stream from this side.
    pub async fn complete(&self, end: &Reply) -> Result<(), ClientError> {
        self.channel.complete(end).await
    }

    /// The next inbound item, or `None` after the completion was consumed.
    /// Messages that do not deserialize as `S` are logged and skipped.
    pub async fn next(&mut self) -> Option<StreamItem<S>> {
        next_item(&mut self.channel).await
    }
}

/// The client sends one start message, then the server pushes.
pub struct ServerStreamStub<A, S> {
    channel: MultiplexedChannel,
    started: bool,
    _args: PhantomData<fn(A)>,
    _inbound: PhantomData<fn() -> S>,
}

impl<A: Serialize, S: DeserializeOwned> ServerStreamStub<A, S> {
    pub(crate) fn new(transport: Arc<WebSocketTransport>, method: impl Into<String>) -> Self {
        ServerStreamStub {
            channel: MultiplexedChannel::new(transport, method),
            started: false,
            _args: PhantomData,
            _inbound: PhantomData,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.channel.request_id()
    }

    pub fn is_completed(&self) -> bool {
        self.channel.is_completed()
    }

    /// Opens the stream. May be called once.
    pub async fn start(&mut self, args: &A) -> Result<(), ClientError> {
        if self.started {
            return Err(ClientError::AlreadyStarted(self.channel.request_id()));
        }
        self.started = true;
        self.channel.send(serde_json::to_value(args)?).await
    }

    pub async fn complete(&self, end: &Reply) -> Result<(), ClientError> {
        self.channel.complete(end).await
    }

    /// The next pushed item, or `None` after the completion was consumed.
    pub async fn next(&mut self) -> Option<StreamItem<S>> {
        next_item(&mut self.channel).await
    }
}

/// The client pushes, the server completes.
pub struct ClientStreamStub<C> {
    channel: MultiplexedChannel,
    _outbound: PhantomData<fn(C)>,
}

impl<C: Serialize> ClientStreamStub<C> {
    pub(crate) fn new(transport: Arc<WebSocketTransport>, method: impl Into<String>) -> Self {
        ClientStreamStub {
            channel: MultiplexedChannel::new(transport, method),
            _outbound: PhantomData,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.channel.request_id()
    }

    pub fn is_completed(&self) -> bool {
        self.channel.is_completed()
    }

    pub async fn send(&self, message: &C) -> Result<(), ClientError> {
        self.channel.send(serde_json::to_value(message)?).await
    }

    pub async fn complete(&self, end: &Reply) -> Result<(), ClientError> {
        self.channel.complete(end).await
    }

    /// Waits for the end result of the stream.
    pub async fn completion(&mut self) -> Reply {
        loop {
            match self.channel.next_event().await {
                Some(StreamEvent::Completed(end)) => return end,
                Some(StreamEvent::Message(_)) => {
                    tracing::warn!(
                        request_id = self.channel.request_id(),
                        "unexpected server message on a client-push stream"
                    );
                }
                None => return Reply::err("The stream ended without a completion."),
            }
        }
    }
}

async fn next_item<S: DeserializeOwned>(channel: &mut MultiplexedChannel) -> Option<StreamItem<S>> {
    loop {
        match channel.next_event().await? {
            StreamEvent::Completed(end) => return Some(StreamItem::Completed(end)),
            StreamEvent::Message(value) => match serde_json::from_value(value) {
                Ok(message) => return Some(StreamItem::Message(message)),
                Err(e) => {
                    tracing::warn!(
                        request_id = channel.request_id(),
                        error = %e,
                        "skipping message that does not match the expected type"
                    );
                }
            },
        }
    }
}
