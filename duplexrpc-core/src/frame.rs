//! Wire frames multiplexed over a single duplex socket.
//!
//! Every logical stream is identified by a `requestId`; concurrent streams
//! interleave their frames over one physical connection and are demultiplexed
//! by id on both sides. Frames travel as JSON text messages.

use crate::Reply;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Reserved method name a peer sends to complete a logical stream.
pub const COMPLETE_METHOD: &str = "complete";

/// Reserved method name that carries a client context update.
pub const CLIENT_CONTEXT_METHOD: &str = "setClientContext";

/// Request id used when replying to a frame whose id could not be read.
pub const UNKNOWN_REQUEST_ID: u64 = 0;

/// A client to server frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub request_id: u64,
    /// Present on stream-opening and request-reply frames, and on the
    /// reserved [`COMPLETE_METHOD`] / [`CLIENT_CONTEXT_METHOD`] frames.
    /// Absent on follow-up messages of an already open stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub args: Value,
}

impl Frame {
    pub fn open(request_id: u64, method: impl Into<String>, args: Value) -> Self {
        Frame {
            request_id,
            method: Some(method.into()),
            args,
        }
    }

    pub fn message(request_id: u64, args: Value) -> Self {
        Frame {
            request_id,
            method: None,
            args,
        }
    }

    /// A completion frame carrying the end result of a stream.
    pub fn complete<T: serde::Serialize>(request_id: u64, end: &Reply<T>) -> Self {
        Frame {
            request_id,
            method: Some(COMPLETE_METHOD.to_string()),
            args: end.to_wire(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.method.as_deref() == Some(COMPLETE_METHOD)
    }

    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        serde_json::from_str(raw).map_err(|source| FrameError::Invalid {
            source,
        })
    }

    pub fn to_text(&self) -> String {
        // Frames contain only JSON-representable fields.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A server to client frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    pub request_id: u64,
    /// A wire reply envelope (see [`Reply::to_wire`]).
    pub reply: Value,
    /// Set on the terminal frame of a logical stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
}

impl ServerFrame {
    pub fn reply(request_id: u64, reply: Value) -> Self {
        ServerFrame {
            request_id,
            reply,
            complete: None,
        }
    }

    /// The terminal frame of a stream, carrying its end result.
    pub fn complete<T: serde::Serialize>(request_id: u64, end: &Reply<T>) -> Self {
        ServerFrame {
            request_id,
            reply: end.to_wire(),
            complete: Some(true),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete.unwrap_or(false)
    }

    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        serde_json::from_str(raw).map_err(|source| FrameError::Invalid {
            source,
        })
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame: {source}")]
    Invalid {
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// Tests
// =============================================================================
