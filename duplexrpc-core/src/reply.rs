//! The result envelope carried by every RPC outcome.
//!
//! A [`Reply`] is either ok (with an optional data payload) or an error (with
//! a human-readable message and an optional local trace). The wire projection
//! is exactly `{"code": "Ok", "data": ...}` or
//! `{"code": "Error", "errMessage": "..."}`; the trace never crosses the wire.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::backtrace::Backtrace;

/// Error message used when an incoming wire reply cannot be deserialized.
pub const PARSE_ERROR_MESSAGE: &str = "The reply could not be parsed.";

/// The outcome of an RPC operation.
///
/// Accessors are fail-fast: reading the value of an error reply (or the error
/// message of an ok reply) is a programmer error and panics. Use [`Reply::is_ok`]
/// to branch first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code")]
pub enum Reply<T = Value> {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<T>,
    },
    Error {
        #[serde(rename = "errMessage")]
        message: String,
        /// Captured where the error was constructed. Local diagnostics only,
        /// never serialized.
        #[serde(skip)]
        trace: Option<String>,
    },
}

impl<T> Reply<T> {
    /// An ok reply carrying `data`.
    pub fn ok(data: T) -> Self {
        Reply::Ok { data: Some(data) }
    }

    /// An ok reply without a payload.
    pub fn ok_empty() -> Self {
        Reply::Ok { data: None }
    }

    /// An error reply with a trace captured at the call site.
    pub fn err(message: impl Into<String>) -> Self {
        Reply::Error {
            message: message.into(),
            trace: Some(Backtrace::force_capture().to_string()),
        }
    }

    /// An error reply with an explicit trace (used when a trace from another
    /// source should be preserved).
    pub fn err_with_trace(message: impl Into<String>, trace: Option<String>) -> Self {
        Reply::Error {
            message: message.into(),
            trace,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok { .. })
    }

    pub fn is_err(&self) -> bool {
        !self.is_ok()
    }

    /// The data payload.
    ///
    /// # Panics
    ///
    /// Panics if this reply is an error or carries no data.
    pub fn value(&self) -> &T {
        match self {
            Reply::Ok { data: Some(data) } => data,
            Reply::Ok { data: None } => panic!("called value() on an ok reply without data"),
            Reply::Error { message, .. } => {
                panic!("called value() on an error reply: {message}")
            }
        }
    }

    /// Consumes the reply and returns the data payload.
    ///
    /// # Panics
    ///
    /// Panics if this reply is an error or carries no data.
    pub fn into_value(self) -> T {
        match self {
            Reply::Ok { data: Some(data) } => data,
            Reply::Ok { data: None } => panic!("called into_value() on an ok reply without data"),
            Reply::Error { message, .. } => {
                panic!("called into_value() on an error reply: {message}")
            }
        }
    }

    /// The data payload, or `alternative` if this reply is an error or empty.
    pub fn value_or(self, alternative: T) -> T {
        match self {
            Reply::Ok { data: Some(data) } => data,
            _ => alternative,
        }
    }

    /// The error message.
    ///
    /// # Panics
    ///
    /// Panics if this reply is ok.
    pub fn error_message(&self) -> &str {
        match self {
            Reply::Error { message, .. } => message,
            Reply::Ok { .. } => panic!("called error_message() on an ok reply"),
        }
    }

    pub fn trace(&self) -> Option<&str> {
        match self {
            Reply::Error { trace, .. } => trace.as_deref(),
            Reply::Ok { .. } => None,
        }
    }

    /// Drops the payload, keeping the ok/error outcome.
    pub fn status(&self) -> Reply<()> {
        match self {
            Reply::Ok { .. } => Reply::ok_empty(),
            Reply::Error { message, trace } => Reply::Error {
                message: message.clone(),
                trace: trace.clone(),
            },
        }
    }

    /// Maps the data payload of an ok reply.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reply<U> {
        match self {
            Reply::Ok { data } => Reply::Ok {
                data: data.map(f),
            },
            Reply::Error { message, trace } => Reply::Error { message, trace },
        }
    }

    /// Ok if every input is ok. All inputs are evaluated; the error messages
    /// of all failing inputs are joined with a newline.
    pub fn all(replies: impl IntoIterator<Item = Reply<T>>) -> Reply<T> {
        let mut messages = Vec::new();
        for reply in replies {
            if let Reply::Error { message, .. } = reply {
                messages.push(message);
            }
        }
        if messages.is_empty() {
            Reply::ok_empty()
        } else {
            Reply::err_with_trace(messages.join("\n"), None)
        }
    }

    /// Ok if any input is ok (the first ok input wins). If all inputs fail,
    /// their error messages are joined with a newline.
    pub fn any(replies: impl IntoIterator<Item = Reply<T>>) -> Reply<T> {
        let mut messages = Vec::new();
        for reply in replies {
            match reply {
                ok @ Reply::Ok { .. } => return ok,
                Reply::Error { message, .. } => messages.push(message),
            }
        }
        Reply::err_with_trace(messages.join("\n"), None)
    }

    /// `other` if this reply is ok, otherwise this error.
    pub fn and(self, other: Reply<T>) -> Reply<T> {
        if self.is_ok() { other } else { self }
    }

    /// This reply if it is ok, otherwise `other`.
    pub fn or(self, other: Reply<T>) -> Reply<T> {
        if self.is_ok() { self } else { other }
    }

    /// Logs this reply: ok replies at info level, error replies at error
    /// level with their trace at debug level.
    pub fn log(&self) {
        match self {
            Reply::Ok { .. } => tracing::info!("ok reply"),
            Reply::Error { message, trace } => {
                tracing::error!(%message, "error reply");
                if let Some(trace) = trace {
                    tracing::debug!(%trace, "error reply trace");
                }
            }
        }
    }

    pub fn log_if_error(&self) {
        if self.is_err() {
            self.log();
        }
    }
}

impl<T: Serialize> Reply<T> {
    /// The wire projection of this reply. The trace is dropped; a payload
    /// that cannot be serialized becomes an error envelope instead of a
    /// panic.
    pub fn to_wire(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            json!({
                "code": "Error",
                "errMessage": format!("The reply could not be serialized: {e}"),
            })
        })
    }
}

impl<T: DeserializeOwned> Reply<T> {
    /// Parses a wire reply. Unparseable input becomes an error reply, never
    /// a panic (the wire is not trusted).
    pub fn from_wire(value: Value) -> Reply<T> {
        serde_json::from_value(value).unwrap_or_else(|_| Reply::err(PARSE_ERROR_MESSAGE))
    }
}

// =============================================================================
// Tests
// =============================================================================
