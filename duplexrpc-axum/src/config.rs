//! Server configuration.
//!
//! All validation happens at construction time: bad ports, bad base urls,
//! reserved or duplicate method names and malformed headers are
//! [`ConfigError`]s before the server ever binds a socket. The resulting
//! [`RpcServerConfig`] is immutable.

use crate::middleware::{Middleware, MiddlewareChain};
use crate::service::{
    BidiStreamFactory, ClientStreamFactory, RequestReplyService, ServerStreamFactory,
};
use duplexrpc_core::{CLIENT_CONTEXT_METHOD, COMPLETE_METHOD, HttpContext};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3000;
pub const MIN_PORT: u16 = 1025;
pub const MAX_PORT: u16 = 65535;

/// Route used by health checks; reserved alongside the protocol methods.
pub const HEALTHZ_PATH: &str = "healthz";

/// How long a connection may go without answering a ping.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid port {0}: must be within {MIN_PORT}..={MAX_PORT}")]
    InvalidPort(u16),

    #[error("invalid base url {0:?}: must start with '/' and must not end with '/'")]
    InvalidBaseUrl(String),

    #[error("the name {0:?} is reserved or already registered")]
    ReservedName(String),

    #[error("the response header {0:?} is already configured")]
    DuplicateHeader(String),

    #[error("invalid response header {0:?}")]
    InvalidHeader(String),
}

/// A registered method, resolved to its shape at configuration time.
#[derive(Clone)]
pub enum MethodRegistration {
    RequestReply(Arc<dyn RequestReplyService>),
    BidiStream(Arc<dyn BidiStreamFactory>),
    ServerStream(Arc<dyn ServerStreamFactory>),
    ClientStream(Arc<dyn ClientStreamFactory>),
}

/// Builds the initial request context from the transport's headers.
pub type ContextFactory = Arc<dyn Fn(&HeaderMap) -> HttpContext + Send + Sync>;

pub struct RpcServerConfig {
    pub(crate) port: u16,
    pub(crate) base_url: String,
    pub(crate) response_headers: Vec<(HeaderName, HeaderValue)>,
    pub(crate) registry: HashMap<String, MethodRegistration>,
    pub(crate) static_paths: Vec<(String, PathBuf)>,
    pub(crate) server_middleware: MiddlewareChain,
    pub(crate) connection_timeout: Duration,
    pub(crate) context_factory: ContextFactory,
}

impl RpcServerConfig {
    pub fn builder() -> RpcServerConfigBuilder {
        RpcServerConfigBuilder::default()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

pub struct RpcServerConfigBuilder {
    port: u16,
    base_url: String,
    response_headers: Vec<(HeaderName, HeaderValue)>,
    registry: HashMap<String, MethodRegistration>,
    static_paths: Vec<(String, PathBuf)>,
    server_middleware: MiddlewareChain,
    connection_timeout: Duration,
    context_factory: ContextFactory,
}

impl Default for RpcServerConfigBuilder {
    fn default() -> Self {
        RpcServerConfigBuilder {
            port: DEFAULT_PORT,
            base_url: String::new(),
            response_headers: Vec::new(),
            registry: HashMap::new(),
            static_paths: Vec::new(),
            server_middleware: MiddlewareChain::new(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            context_factory: Arc::new(context_from_headers),
        }
    }
}

impl RpcServerConfigBuilder {
    pub fn port(mut self, port: u16) -> Result<Self, ConfigError> {
        if port < MIN_PORT {
            return Err(ConfigError::InvalidPort(port));
        }
        self.port = port;
        Ok(self)
    }

    /// Prefix for every route, e.g. `"/api"`. Empty means the root.
    pub fn base_url(mut self, base_url: &str) -> Result<Self, ConfigError> {
        if !base_url.is_empty() && (!base_url.starts_with('/') || base_url.ends_with('/')) {
            return Err(ConfigError::InvalidBaseUrl(base_url.to_string()));
        }
        self.base_url = base_url.to_string();
        Ok(self)
    }

    /// Adds a header set on every response. Multiple values are joined with
    /// `", "`. Each header key may be configured once.
    pub fn add_response_header(mut self, key: &str, values: &[&str]) -> Result<Self, ConfigError> {
        let name = HeaderName::try_from(key.to_lowercase())
            .map_err(|_| ConfigError::InvalidHeader(key.to_string()))?;
        if self.response_headers.iter().any(|(existing, _)| *existing == name) {
            return Err(ConfigError::DuplicateHeader(key.to_string()));
        }
        let value = HeaderValue::try_from(values.join(", "))
            .map_err(|_| ConfigError::InvalidHeader(key.to_string()))?;
        self.response_headers.push((name, value));
        Ok(self)
    }

    /// Permissive CORS: any origin, any headers, any methods.
    pub fn allow_all_origins_and_headers_and_requests(self) -> Result<Self, ConfigError> {
        self.add_response_header("access-control-allow-origin", &["*"])?
            .add_response_header("access-control-allow-headers", &["*"])?
            .add_response_header("access-control-allow-methods", &["*"])
    }

    pub fn add_server_middleware(mut self, middleware: impl Middleware) -> Self {
        self.server_middleware.push(middleware);
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn context_factory(
        mut self,
        factory: impl Fn(&HeaderMap) -> HttpContext + Send + Sync + 'static,
    ) -> Self {
        self.context_factory = Arc::new(factory);
        self
    }

    pub fn add_request_reply_service(
        mut self,
        service: impl RequestReplyService,
    ) -> Result<Self, ConfigError> {
        let name = self.reserve(service.name())?;
        self.registry
            .insert(name, MethodRegistration::RequestReply(Arc::new(service)));
        Ok(self)
    }

    pub fn add_bidi_stream_service(
        mut self,
        factory: impl BidiStreamFactory,
    ) -> Result<Self, ConfigError> {
        let name = self.reserve(factory.name())?;
        self.registry
            .insert(name, MethodRegistration::BidiStream(Arc::new(factory)));
        Ok(self)
    }

    pub fn add_server_stream_service(
        mut self,
        factory: impl ServerStreamFactory,
    ) -> Result<Self, ConfigError> {
        let name = self.reserve(factory.name())?;
        self.registry
            .insert(name, MethodRegistration::ServerStream(Arc::new(factory)));
        Ok(self)
    }

    pub fn add_client_stream_service(
        mut self,
        factory: impl ClientStreamFactory,
    ) -> Result<Self, ConfigError> {
        let name = self.reserve(factory.name())?;
        self.registry
            .insert(name, MethodRegistration::ClientStream(Arc::new(factory)));
        Ok(self)
    }

    /// Serves a directory at `GET {base_url}/{url}/...`. The first path
    /// segment is reserved like a method name.
    pub fn add_static_path(
        mut self,
        url: &str,
        dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let url = url.trim_matches('/').to_string();
        let first_segment = url.split('/').next().unwrap_or_default();
        if first_segment.is_empty() || !self.is_free(first_segment) {
            return Err(ConfigError::ReservedName(url));
        }
        self.static_paths.push((url, dir.into()));
        Ok(self)
    }

    pub fn build(self) -> RpcServerConfig {
        RpcServerConfig {
            port: self.port,
            base_url: self.base_url,
            response_headers: self.response_headers,
            registry: self.registry,
            static_paths: self.static_paths,
            server_middleware: self.server_middleware,
            connection_timeout: self.connection_timeout,
            context_factory: self.context_factory,
        }
    }

    fn reserve(&mut self, name: &str) -> Result<String, ConfigError> {
        if !self.is_free(name) {
            return Err(ConfigError::ReservedName(name.to_string()));
        }
        Ok(name.to_string())
    }

    fn is_free(&self, name: &str) -> bool {
        !name.is_empty()
            && name != COMPLETE_METHOD
            && name != CLIENT_CONTEXT_METHOD
            && name != HEALTHZ_PATH
            && !self.registry.contains_key(name)
            && !self
                .static_paths
                .iter()
                .any(|(url, _)| url.split('/').next() == Some(name))
    }
}

/// Default context factory: every transport header becomes a request
/// header.
fn context_from_headers(headers: &HeaderMap) -> HttpContext {
    let mut context = HttpContext::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            context.set_request_header(name.as_str(), value);
        }
    }
    context
}

// =============================================================================
// Tests
// =============================================================================
