//! The id-scoped primitive underneath every stream stub.

use crate::error::ClientError;
use crate::transport::{Subscription, WebSocketTransport};
use duplexrpc_core::{Frame, Reply};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One logical stream over a [`WebSocketTransport`].
///
/// The channel owns a single request id for its whole lifetime. The first
/// send carries the method name and opens the stream on the server;
/// follow-up sends carry only the id. A completion (from either side) is
/// terminal: later sends fail locally with
/// [`ClientError::StreamCompleted`].
pub struct MultiplexedChannel {
    transport: Arc<WebSocketTransport>,
    request_id: u64,
    method: String,
    subscription: Subscription,
    opened: AtomicBool,
}

/// What a channel yields when polled.
#[derive(Debug)]
pub enum StreamEvent {
    Message(Value),
    Completed(Reply),
}

impl MultiplexedChannel {
    pub fn new(transport: Arc<WebSocketTransport>, method: impl Into<String>) -> Self {
        let request_id = transport.next_request_id();
        let subscription = transport.subscribe(request_id);
        MultiplexedChannel {
            transport,
            request_id,
            method: method.into(),
            subscription,
            opened: AtomicBool::new(false),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn is_completed(&self) -> bool {
        self.subscription.completed.load(Ordering::SeqCst)
    }

    /// Sends a message. The first send opens the stream.
    pub async fn send(&self, args: Value) -> Result<(), ClientError> {
        let frame = if self.opened.swap(true, Ordering::SeqCst) {
            Frame::message(self.request_id, args)
        } else {
            Frame::open(self.request_id, self.method.as_str(), args)
        };
        self.send_frame(frame).await
    }

    /// Completes the stream with an end result. Ends the local side too: no
    /// further sends are accepted.
    pub async fn complete(&self, end: &Reply) -> Result<(), ClientError> {
        self.send_frame(Frame::complete(self.request_id, end)).await?;
        self.subscription.completed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// The next inbound event, or `None` once the completion event has been
    /// consumed.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        let frame = self.subscription.frames.recv().await?;
        if frame.is_complete() {
            Some(StreamEvent::Completed(Reply::from_wire(frame.reply)))
        } else {
            Some(StreamEvent::Message(frame.reply))
        }
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), ClientError> {
        if self.is_completed() {
            return Err(ClientError::StreamCompleted(self.request_id));
        }
        let sent = self.transport.send(&frame).await;
        if sent.is_err() {
            return Err(ClientError::Transport(sent.error_message().to_string()));
        }
        Ok(())
    }
}
