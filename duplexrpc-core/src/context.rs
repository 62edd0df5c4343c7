//! The mutable HTTP context shared across a request's middleware chain.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-request HTTP metadata.
///
/// One instance is shared by every middleware and the handler of a request
/// (see [`SharedContext`]); mutations made early in the chain are visible to
/// everything after.
///
/// Header keys are stored lowercased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpContext {
    pub request_headers: HashMap<String, String>,
    pub response_headers: HashMap<String, String>,
    pub http_status_code: u16,
}

impl Default for HttpContext {
    fn default() -> Self {
        HttpContext {
            request_headers: HashMap::new(),
            response_headers: HashMap::new(),
            http_status_code: 200,
        }
    }
}

impl HttpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_request_header(&mut self, key: &str, value: impl Into<String>) {
        self.request_headers.insert(key.to_lowercase(), value.into());
    }

    pub fn request_header(&self, key: &str) -> Option<&str> {
        self.request_headers.get(&key.to_lowercase()).map(String::as_str)
    }

    pub fn set_response_header(&mut self, key: &str, value: impl Into<String>) {
        self.response_headers.insert(key.to_lowercase(), value.into());
    }

    pub fn response_header(&self, key: &str) -> Option<&str> {
        self.response_headers.get(&key.to_lowercase()).map(String::as_str)
    }

    /// Copies `other` into this context. Header keys are lowercased on the
    /// way in; existing entries with the same key are overwritten.
    pub fn merge(&mut self, other: &HttpContext) {
        for (key, value) in &other.request_headers {
            self.request_headers.insert(key.to_lowercase(), value.clone());
        }
        for (key, value) in &other.response_headers {
            self.response_headers.insert(key.to_lowercase(), value.clone());
        }
        self.http_status_code = other.http_status_code;
    }

    pub fn into_shared(self) -> SharedContext {
        Arc::new(Mutex::new(self))
    }
}

/// The context handle passed through a middleware chain. All participants
/// see (and may mutate) the same underlying record.
pub type SharedContext = Arc<Mutex<HttpContext>>;

// =============================================================================
// Tests
// =============================================================================
