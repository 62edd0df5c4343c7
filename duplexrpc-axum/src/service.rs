//! Service traits and the handle streams use to talk back.

use crate::middleware::MiddlewareChain;
use duplexrpc_core::{Reply, ServerFrame, SharedContext};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

/// Events raised toward the connection loop that owns the socket. All
/// outbound traffic of a connection funnels through one of these channels,
/// which is what serializes server-initiated sends with dispatch.
#[derive(Debug)]
pub enum ConnectionEvent {
    Outbound(ServerFrame),
    Complete { request_id: u64, end: Reply },
}

/// Lets a stream service push messages and complete its own stream.
///
/// Handles are cheap to clone and safe to move into spawned tasks; sends
/// after the stream completed are dropped by the receiving client.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    request_id: u64,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl StreamHandle {
    pub(crate) fn new(request_id: u64, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        StreamHandle { request_id, events }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Pushes one message to the client side of this stream.
    pub fn send(&self, message: Value) {
        let _ = self.events.send(ConnectionEvent::Outbound(ServerFrame::reply(
            self.request_id,
            message,
        )));
    }

    /// Completes this stream with an end result.
    pub fn complete(&self, end: Reply) {
        let _ = self.events.send(ConnectionEvent::Complete {
            request_id: self.request_id,
            end,
        });
    }
}

/// One message in, one reply out.
pub trait RequestReplyService: Send + Sync + 'static {
    /// The method name clients call. Checked against the registry at
    /// configuration time.
    fn name(&self) -> &str;

    /// Per-service middleware, run after the server-wide chain.
    fn middleware(&self) -> MiddlewareChain {
        MiddlewareChain::new()
    }

    fn execute<'a>(&'a self, args: Value, context: &'a SharedContext)
    -> BoxFuture<'a, Reply<Value>>;
}

/// One live bidirectional stream. Created per stream by its factory.
pub trait BidiStreamService: Send + 'static {
    fn on_message<'a>(&'a mut self, message: Value, context: &'a SharedContext)
    -> BoxFuture<'a, ()>;

    /// Invoked exactly once, with the end result of the stream (the
    /// client's completion, a middleware failure, or the disconnect
    /// reason).
    fn on_completed(&mut self, end: Reply);
}

pub trait BidiStreamFactory: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn middleware(&self) -> MiddlewareChain {
        MiddlewareChain::new()
    }

    fn create(&self, handle: StreamHandle) -> Box<dyn BidiStreamService>;
}

/// One live server-push stream.
pub trait ServerStreamService: Send + 'static {
    /// Invoked with the stream-opening arguments. Pushing happens through
    /// the [`StreamHandle`] given at creation.
    fn start<'a>(&'a mut self, args: Value, context: &'a SharedContext) -> BoxFuture<'a, ()>;

    fn on_completed(&mut self, end: Reply);
}

pub trait ServerStreamFactory: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn middleware(&self) -> MiddlewareChain {
        MiddlewareChain::new()
    }

    fn create(&self, handle: StreamHandle) -> Box<dyn ServerStreamService>;
}

/// One live client-push stream. Never sends; its handle is only good for
/// completing.
pub trait ClientStreamService: Send + 'static {
    fn on_message<'a>(&'a mut self, message: Value, context: &'a SharedContext)
    -> BoxFuture<'a, ()>;

    fn on_completed(&mut self, end: Reply);
}

pub trait ClientStreamFactory: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn middleware(&self) -> MiddlewareChain {
        MiddlewareChain::new()
    }

    fn create(&self, handle: StreamHandle) -> Box<dyn ClientStreamService>;
}
