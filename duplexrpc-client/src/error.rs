//! Client-side error types.
//!
//! These cover local programmer-facing failures only. Remote failures travel
//! as [`duplexrpc_core::Reply`] error envelopes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// A send was attempted on a stream that already completed.
    #[error("the stream with request id {0} was already completed")]
    StreamCompleted(u64),

    /// A server stream was started twice.
    #[error("the stream with request id {0} was already started")]
    AlreadyStarted(u64),

    #[error("the message is not serializable: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("transport failure: {0}")]
    Transport(String),
}
