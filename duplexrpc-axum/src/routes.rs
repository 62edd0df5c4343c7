//! The HTTP surface: WebSocket upgrade, unary POST routes, health checks
//! and static files.
//!
//! Every route is prefixed with the configured base url. Request-reply
//! services are reachable both over the socket and as plain
//! `POST {base_url}/{method}` with a JSON body, sharing the same middleware
//! chains and context semantics.

use crate::config::{HEALTHZ_PATH, MethodRegistration, RpcServerConfig};
use crate::dispatcher::{
    INTERNAL_SERVER_ERROR, UNABLE_TO_PARSE, lock_context, unknown_method_message, widen,
};
use crate::middleware::panic_message;
use crate::server::serve_socket;
use crate::service::RequestReplyService;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use duplexrpc_core::Reply;
use futures::FutureExt;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tower_http::services::ServeDir;

pub(crate) fn build_router(config: Arc<RpcServerConfig>) -> Router {
    let base = config.base_url().to_string();
    let socket_path = if base.is_empty() { "/".to_string() } else { base.clone() };

    let upgrade_config = config.clone();
    let mut router = Router::new()
        .route(
            &socket_path,
            get(move |upgrade: WebSocketUpgrade, headers: HeaderMap| {
                let config = upgrade_config.clone();
                async move {
                    let context = (config.context_factory)(&headers).into_shared();
                    upgrade.on_upgrade(move |socket| serve_socket(socket, config, context))
                }
            }),
        )
        .route(
            &format!("{base}/{HEALTHZ_PATH}"),
            get(|| async { StatusCode::OK }),
        );

    for (name, registration) in &config.registry {
        let MethodRegistration::RequestReply(service) = registration else {
            continue;
        };
        let service = service.clone();
        let unary_config = config.clone();
        router = router.route(
            &format!("{base}/{name}"),
            post(move |headers: HeaderMap, body: Bytes| {
                handle_unary(service.clone(), unary_config.clone(), headers, body)
            }),
        );
    }

    for (url, dir) in &config.static_paths {
        router = router.nest_service(&format!("{base}/{url}"), ServeDir::new(dir));
    }

    // Unknown POST paths answer with the same error envelope as the socket.
    let fallback_base = base.clone();
    router = router.fallback(move |method: Method, uri: Uri| {
        let base = fallback_base.clone();
        async move { handle_unknown(&method, &uri, &base) }
    });

    if config.response_headers.is_empty() {
        return router;
    }
    let fixed_headers = config.response_headers.clone();
    router.layer(axum::middleware::map_response(move |mut response: Response| {
        let fixed_headers = fixed_headers.clone();
        async move {
            for (name, value) in fixed_headers {
                response.headers_mut().insert(name, value);
            }
            response
        }
    }))
}

fn handle_unknown(method: &Method, uri: &Uri, base: &str) -> Response {
    let path = uri.path();
    let name = path.strip_prefix(base).unwrap_or(path).trim_start_matches('/');
    if *method == Method::POST {
        let reply = Reply::<Value>::err(unknown_method_message(name));
        (StatusCode::NOT_FOUND, Json(reply.to_wire())).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn handle_unary(
    service: Arc<dyn RequestReplyService>,
    config: Arc<RpcServerConfig>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/json") && !content_type.starts_with("text/plain") {
        let reply = Reply::<Value>::err(format!("Unsupported content type '{content_type}'."));
        return (StatusCode::BAD_REQUEST, Json(reply.to_wire())).into_response();
    }
    let Ok(args) = serde_json::from_slice::<Value>(&body) else {
        let reply = Reply::<Value>::err(UNABLE_TO_PARSE);
        return (StatusCode::BAD_REQUEST, Json(reply.to_wire())).into_response();
    };

    let context = (config.context_factory)(&headers).into_shared();
    let validation = config.server_middleware.run(&args, &context).await;
    let reply = if validation.is_err() {
        widen(validation)
    } else {
        let validation = service.middleware().run(&args, &context).await;
        if validation.is_err() {
            widen(validation)
        } else {
            AssertUnwindSafe(service.execute(args, &context))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    tracing::error!(
                        method = service.name(),
                        panic = panic_message(&panic),
                        "request-reply handler panicked"
                    );
                    lock_context(&context).http_status_code = 500;
                    Reply::err(INTERNAL_SERVER_ERROR)
                })
        }
    };

    let (status_code, response_headers) = {
        let context = lock_context(&context);
        (context.http_status_code, context.response_headers.clone())
    };
    let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::OK);
    let mut response = (status, Json(reply.to_wire())).into_response();
    for (key, value) in response_headers {
        let Ok(name) = HeaderName::try_from(key) else {
            continue;
        };
        let Ok(value) = HeaderValue::try_from(value) else {
            continue;
        };
        response.headers_mut().insert(name, value);
    }
    response
}
