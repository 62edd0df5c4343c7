//! Full round trips through a real server and the WebSocket client.

use duplexrpc_axum::{
    BidiStreamFactory, BidiStreamService, ClientStreamFactory, ClientStreamService,
    MiddlewareChain, RequestReplyService, RpcServer, RpcServerConfig, ServerStreamFactory,
    ServerStreamService, StreamHandle, middleware_fn,
};
use duplexrpc_client::{
    ClientError, HttpRequestReplyStub, StreamItem, TransportConfig, WebSocketEndpoint,
};
use duplexrpc_core::{HttpContext, Reply, SharedContext};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

struct Echo;

impl RequestReplyService for Echo {
    fn name(&self) -> &str {
        "echo"
    }
    fn execute<'a>(
        &'a self,
        args: Value,
        _context: &'a SharedContext,
    ) -> BoxFuture<'a, Reply<Value>> {
        async move { Reply::ok(args) }.boxed()
    }
}

struct WhoAmI;

impl RequestReplyService for WhoAmI {
    fn name(&self) -> &str {
        "whoami"
    }
    fn execute<'a>(
        &'a self,
        _args: Value,
        context: &'a SharedContext,
    ) -> BoxFuture<'a, Reply<Value>> {
        async move {
            let user = context
                .lock()
                .map(|c| c.request_header("x-user").unwrap_or("anonymous").to_string())
                .unwrap_or_default();
            Reply::ok(json!(user))
        }
        .boxed()
    }
}

/// Never replies within any reasonable deadline.
struct Stall;

impl RequestReplyService for Stall {
    fn name(&self) -> &str {
        "stall"
    }
    fn execute<'a>(
        &'a self,
        _args: Value,
        _context: &'a SharedContext,
    ) -> BoxFuture<'a, Reply<Value>> {
        async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Reply::ok_empty()
        }
        .boxed()
    }
}

struct Guarded {
    calls: Arc<AtomicU32>,
}

impl RequestReplyService for Guarded {
    fn name(&self) -> &str {
        "guarded"
    }
    fn middleware(&self) -> MiddlewareChain {
        MiddlewareChain::new().with(middleware_fn(|args: Value, _context| async move {
            if args.get("bad").is_some() {
                Reply::err_with_trace("Bad arguments.", None)
            } else {
                Reply::ok_empty()
            }
        }))
    }
    fn execute<'a>(
        &'a self,
        _args: Value,
        _context: &'a SharedContext,
    ) -> BoxFuture<'a, Reply<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        async { Reply::ok_empty() }.boxed()
    }
}

struct EchoStream {
    handle: StreamHandle,
}

impl BidiStreamService for EchoStream {
    fn on_message<'a>(
        &'a mut self,
        message: Value,
        _context: &'a SharedContext,
    ) -> BoxFuture<'a, ()> {
        self.handle.send(message);
        async {}.boxed()
    }
    fn on_completed(&mut self, _end: Reply) {}
}

struct EchoStreamFactory;

impl BidiStreamFactory for EchoStreamFactory {
    fn name(&self) -> &str {
        "echoStream"
    }
    fn create(&self, handle: StreamHandle) -> Box<dyn BidiStreamService> {
        Box::new(EchoStream { handle })
    }
}

struct Countdown {
    handle: StreamHandle,
}

impl ServerStreamService for Countdown {
    fn start<'a>(&'a mut self, args: Value, _context: &'a SharedContext) -> BoxFuture<'a, ()> {
        let count = args.get("count").and_then(Value::as_u64).unwrap_or(0);
        for n in (1..=count).rev() {
            self.handle.send(json!(n));
        }
        self.handle.complete(Reply::ok_empty());
        async {}.boxed()
    }
    fn on_completed(&mut self, _end: Reply) {}
}

struct CountdownFactory;

impl ServerStreamFactory for CountdownFactory {
    fn name(&self) -> &str {
        "countdown"
    }
    fn create(&self, handle: StreamHandle) -> Box<dyn ServerStreamService> {
        Box::new(Countdown { handle })
    }
}

/// Sums pushed numbers and completes the stream once the total reaches 10.
struct Adder {
    handle: StreamHandle,
    total: u64,
}

impl ClientStreamService for Adder {
    fn on_message<'a>(
        &'a mut self,
        message: Value,
        _context: &'a SharedContext,
    ) -> BoxFuture<'a, ()> {
        self.total += message.as_u64().unwrap_or(0);
        if self.total >= 10 {
            self.handle.complete(Reply::ok(json!(self.total)));
        }
        async {}.boxed()
    }
    fn on_completed(&mut self, _end: Reply) {}
}

struct AdderFactory;

impl ClientStreamFactory for AdderFactory {
    fn name(&self) -> &str {
        "add"
    }
    fn create(&self, handle: StreamHandle) -> Box<dyn ClientStreamService> {
        Box::new(Adder { handle, total: 0 })
    }
}

struct Fixture {
    ws_url: String,
    http_url: String,
    guarded_calls: Arc<AtomicU32>,
}

async fn start_server() -> Fixture {
    let guarded_calls = Arc::new(AtomicU32::new(0));
    let config = RpcServerConfig::builder()
        .add_request_reply_service(Echo)
        .unwrap()
        .add_request_reply_service(WhoAmI)
        .unwrap()
        .add_request_reply_service(Stall)
        .unwrap()
        .add_request_reply_service(Guarded {
            calls: guarded_calls.clone(),
        })
        .unwrap()
        .add_bidi_stream_service(EchoStreamFactory)
        .unwrap()
        .add_server_stream_service(CountdownFactory)
        .unwrap()
        .add_client_stream_service(AdderFactory)
        .unwrap()
        .build();
    let router = RpcServer::new(config).router();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Fixture {
        ws_url: format!("ws://{addr}/"),
        http_url: format!("http://{addr}"),
        guarded_calls,
    }
}

async fn connect(fixture: &Fixture) -> WebSocketEndpoint {
    let endpoint = WebSocketEndpoint::new(TransportConfig::new(&fixture.ws_url));
    assert!(endpoint.connect().await.is_ok());
    endpoint
}

#[tokio::test]
async fn unary_over_the_socket() {
    let fixture = start_server().await;
    let endpoint = connect(&fixture).await;

    let reply: Reply<String> = endpoint
        .request_reply_stub()
        .execute("echo", &"hello".to_string())
        .await;
    assert_eq!(reply.value(), "hello");
}

#[tokio::test]
async fn unary_over_plain_http() {
    let fixture = start_server().await;
    let stub = HttpRequestReplyStub::new(&fixture.http_url);

    let reply: Reply<Value> = stub.execute("echo", &json!({"n": 1})).await;
    assert_eq!(reply.value(), &json!({"n": 1}));

    let reply: Reply<Value> = stub.execute("nope", &json!({})).await;
    assert!(reply.error_message().contains("'nope'"));
}

#[tokio::test]
async fn unknown_method_over_the_socket() {
    let fixture = start_server().await;
    let endpoint = connect(&fixture).await;

    let reply: Reply<Value> = endpoint.request_reply_stub().execute("nope", &json!({})).await;
    assert_eq!(
        reply.error_message(),
        "The provided method 'nope' is not exposed by the server."
    );
}

#[tokio::test]
async fn request_reply_times_out_without_a_reply() {
    let fixture = start_server().await;
    let endpoint = connect(&fixture).await;

    let reply: Reply<Value> = endpoint
        .request_reply_stub()
        .with_timeout(Duration::from_millis(200))
        .execute("stall", &json!({}))
        .await;
    assert_eq!(reply.error_message(), "Timeout.");

    // The server keeps serving other connections.
    let second = connect(&fixture).await;
    let reply: Reply<String> = second
        .request_reply_stub()
        .execute("echo", &"still up".to_string())
        .await;
    assert_eq!(reply.value(), "still up");
}

#[tokio::test]
async fn middleware_rejections_reach_the_caller() {
    let fixture = start_server().await;
    let endpoint = connect(&fixture).await;

    let reply: Reply<Value> = endpoint
        .request_reply_stub()
        .execute("guarded", &json!({"bad": true}))
        .await;
    assert_eq!(reply.error_message(), "Bad arguments.");
    assert_eq!(fixture.guarded_calls.load(Ordering::SeqCst), 0);

    let reply: Reply<Value> = endpoint
        .request_reply_stub()
        .execute("guarded", &json!({}))
        .await;
    assert!(reply.is_ok());
    assert_eq!(fixture.guarded_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bidi_stream_echoes_in_order() {
    let fixture = start_server().await;
    let endpoint = connect(&fixture).await;

    let mut stream = endpoint.new_bidi_stream_stub::<u64, u64>("echoStream");
    for n in 0..1000u64 {
        stream.send(&n).await.unwrap();
    }
    for expected in 0..1000u64 {
        match stream.next().await {
            Some(StreamItem::Message(n)) => assert_eq!(n, expected),
            other => panic!("expected message {expected}, got {other:?}"),
        }
    }
    stream.complete(&Reply::ok_empty()).await.unwrap();
}

#[tokio::test]
async fn sending_after_completion_fails_locally() {
    let fixture = start_server().await;
    let endpoint = connect(&fixture).await;

    let stream = endpoint.new_bidi_stream_stub::<u64, u64>("echoStream");
    stream.send(&1).await.unwrap();
    stream.complete(&Reply::ok_empty()).await.unwrap();
    assert!(matches!(
        stream.send(&2).await,
        Err(ClientError::StreamCompleted(_))
    ));
}

#[tokio::test]
async fn server_stream_pushes_until_complete() {
    let fixture = start_server().await;
    let endpoint = connect(&fixture).await;

    let mut stream = endpoint.new_server_stream_stub::<Value, u64>("countdown");
    stream.start(&json!({"count": 5})).await.unwrap();
    for expected in (1..=5u64).rev() {
        match stream.next().await {
            Some(StreamItem::Message(n)) => assert_eq!(n, expected),
            other => panic!("expected message {expected}, got {other:?}"),
        }
    }
    match stream.next().await {
        Some(StreamItem::Completed(end)) => assert!(end.is_ok()),
        other => panic!("expected the completion, got {other:?}"),
    }
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn client_stream_is_completed_by_the_server() {
    let fixture = start_server().await;
    let endpoint = connect(&fixture).await;

    let mut stream = endpoint.new_client_stream_stub::<u64>("add");
    for n in [1, 2, 3, 4] {
        stream.send(&n).await.unwrap();
    }
    let end = stream.completion().await;
    assert_eq!(end.value(), &json!(10));
}

#[tokio::test]
async fn context_updates_apply_to_later_calls() {
    let fixture = start_server().await;
    let endpoint = connect(&fixture).await;

    let reply: Reply<String> = endpoint.request_reply_stub().execute("whoami", &json!({})).await;
    assert_eq!(reply.value(), "anonymous");

    let mut context = HttpContext::new();
    context.set_request_header("x-user", "alice");
    assert!(endpoint.set_client_context(context).await.is_ok());

    let reply: Reply<String> = endpoint.request_reply_stub().execute("whoami", &json!({})).await;
    assert_eq!(reply.value(), "alice");
}

#[tokio::test]
async fn closing_the_endpoint_completes_open_streams() {
    let fixture = start_server().await;
    let endpoint = connect(&fixture).await;

    let mut stream = endpoint.new_bidi_stream_stub::<u64, u64>("echoStream");
    stream.send(&1).await.unwrap();
    assert!(matches!(
        stream.next().await,
        Some(StreamItem::Message(1))
    ));

    endpoint.close();
    match stream.next().await {
        Some(StreamItem::Completed(end)) => assert!(end.is_err()),
        other => panic!("expected the completion, got {other:?}"),
    }
    assert!(stream.next().await.is_none());
}
