//! Request-reply over plain HTTP.
//!
//! Servers expose every request-reply service as `POST {base_url}/{method}`
//! in addition to the socket. This stub is for callers that only need unary
//! calls and no duplex connection.

use bytes::Bytes;
use duplexrpc_core::{HttpContext, PARSE_ERROR_MESSAGE, Reply};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub struct HttpRequestReplyStub {
    base_url: String,
    client: Client<HttpConnector, Full<Bytes>>,
    context: Mutex<HttpContext>,
}

impl HttpRequestReplyStub {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpRequestReplyStub {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::builder(TokioExecutor::new()).build_http(),
            context: Mutex::new(HttpContext::new()),
        }
    }

    /// Replaces the context whose request headers are attached to every
    /// call.
    pub fn set_context(&self, context: HttpContext) {
        *self.lock_context() = context;
    }

    pub async fn execute<A: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        args: &A,
    ) -> Reply<R> {
        let body = match serde_json::to_vec(args) {
            Ok(body) => body,
            Err(e) => return Reply::err(format!("The arguments are not serializable: {e}")),
        };
        let headers: Vec<(String, String)> = self
            .lock_context()
            .request_headers
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let mut request = http::Request::builder()
            .method(http::Method::POST)
            .uri(format!("{}/{method}", self.base_url))
            .header(http::header::CONTENT_TYPE, "application/json");
        for (key, value) in &headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let request = match request.body(Full::new(Bytes::from(body))) {
            Ok(request) => request,
            Err(e) => return Reply::err(format!("Failed to build the request: {e}")),
        };

        let response = match self.client.request(request).await {
            Ok(response) => response,
            Err(e) => return Reply::err(format!("The request failed: {e}")),
        };
        let bytes = match response.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return Reply::err(format!("Failed to read the response: {e}")),
        };
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(wire) => Reply::from_wire(wire),
            Err(_) => Reply::err(PARSE_ERROR_MESSAGE),
        }
    }

    fn lock_context(&self) -> MutexGuard<'_, HttpContext> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
