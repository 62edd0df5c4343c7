//! Per-connection frame dispatch.
//!
//! One dispatcher exists per WebSocket connection. It owns the connection's
//! context, the registries of open streams keyed by request id, and runs the
//! fixed decision sequence for every inbound frame:
//!
//! 1. context update
//! 2. server-wide middleware
//! 3. frame for an already open stream (completion or message)
//! 4. stream-opening frame (factory instantiation)
//! 5. request-reply execution
//! 6. unknown method
//!
//! All outbound traffic is emitted as [`ConnectionEvent`]s and written by
//! the single connection loop, so server-initiated sends never race
//! dispatch.

use crate::config::{MethodRegistration, RpcServerConfig};
use crate::middleware::{MiddlewareChain, panic_message};
use crate::service::{
    BidiStreamFactory, BidiStreamService, ClientStreamFactory, ClientStreamService,
    ConnectionEvent, RequestReplyService, ServerStreamFactory, ServerStreamService, StreamHandle,
};
use duplexrpc_core::{
    CLIENT_CONTEXT_METHOD, COMPLETE_METHOD, Frame, HttpContext, Reply, ServerFrame, SharedContext,
    UNKNOWN_REQUEST_ID,
};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::mpsc;

pub(crate) const UNABLE_TO_PARSE: &str = "Unable to parse the message.";
pub(crate) const INTERNAL_SERVER_ERROR: &str = "Internal server error.";
pub(crate) const INVALID_CONTEXT: &str = "The provided client context is invalid.";

pub(crate) fn unknown_method_message(method: &str) -> String {
    format!("The provided method '{method}' is not exposed by the server.")
}

pub(crate) fn lock_context(context: &SharedContext) -> MutexGuard<'_, HttpContext> {
    context.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Turns a middleware verdict into a full reply.
pub(crate) fn widen(status: Reply<()>) -> Reply {
    status.map(|_| Value::Null)
}

struct ActiveBidi {
    service: Box<dyn BidiStreamService>,
    middleware: MiddlewareChain,
}

struct ActiveClient {
    service: Box<dyn ClientStreamService>,
    middleware: MiddlewareChain,
}

struct ActiveServer {
    service: Box<dyn ServerStreamService>,
}

pub(crate) struct ConnectionDispatcher {
    config: Arc<RpcServerConfig>,
    context: SharedContext,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    bidi_streams: HashMap<u64, ActiveBidi>,
    client_streams: HashMap<u64, ActiveClient>,
    server_streams: HashMap<u64, ActiveServer>,
}

impl ConnectionDispatcher {
    pub(crate) fn new(
        config: Arc<RpcServerConfig>,
        context: SharedContext,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        ConnectionDispatcher {
            config,
            context,
            events,
            bidi_streams: HashMap::new(),
            client_streams: HashMap::new(),
            server_streams: HashMap::new(),
        }
    }

    pub(crate) async fn handle_text(&mut self, raw: &str) {
        match Frame::parse(raw) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(e) => {
                tracing::warn!(error = %e, "received an unparseable frame");
                self.emit(ServerFrame::reply(
                    UNKNOWN_REQUEST_ID,
                    Reply::<Value>::err(UNABLE_TO_PARSE).to_wire(),
                ));
            }
        }
    }

    pub(crate) async fn handle_frame(&mut self, frame: Frame) {
        let Frame {
            request_id,
            method,
            args,
        } = frame;

        if method.as_deref() == Some(CLIENT_CONTEXT_METHOD) {
            self.update_context(request_id, args);
            return;
        }

        let context = self.context.clone();
        let validation = self.config.server_middleware.run(&args, &context).await;
        if validation.is_err() {
            self.emit(ServerFrame::reply(request_id, validation.to_wire()));
            return;
        }

        if self.bidi_streams.contains_key(&request_id) {
            self.bidi_message(request_id, method, args, &context).await;
            return;
        }
        if self.client_streams.contains_key(&request_id) {
            self.client_message(request_id, method, args, &context).await;
            return;
        }
        if self.server_streams.contains_key(&request_id) {
            // Only a completion is meaningful on a live server-push stream.
            if method.as_deref() == Some(COMPLETE_METHOD) {
                if let Some(mut active) = self.server_streams.remove(&request_id) {
                    active.service.on_completed(Reply::from_wire(args));
                }
            }
            return;
        }

        let Some(method) = method else {
            self.emit_unknown_method(request_id, "<none>");
            return;
        };
        match self.config.registry.get(&method).cloned() {
            Some(MethodRegistration::RequestReply(service)) => {
                self.execute_request_reply(request_id, service, args, &context)
                    .await;
            }
            Some(MethodRegistration::BidiStream(factory)) => {
                self.open_bidi(request_id, factory, args, &context).await;
            }
            Some(MethodRegistration::ServerStream(factory)) => {
                self.open_server_stream(request_id, factory, args, &context)
                    .await;
            }
            Some(MethodRegistration::ClientStream(factory)) => {
                self.open_client_stream(request_id, factory, args, &context)
                    .await;
            }
            None => self.emit_unknown_method(request_id, &method),
        }
    }

    /// Completes a stream server-side: removes it, notifies the service and
    /// sends the terminal frame. A completion for an unknown id is a no-op,
    /// which makes duplicate completions harmless.
    pub(crate) fn finish_stream(&mut self, request_id: u64, end: Reply) {
        let found = if let Some(mut active) = self.bidi_streams.remove(&request_id) {
            active.service.on_completed(end.clone());
            true
        } else if let Some(mut active) = self.client_streams.remove(&request_id) {
            active.service.on_completed(end.clone());
            true
        } else if let Some(mut active) = self.server_streams.remove(&request_id) {
            active.service.on_completed(end.clone());
            true
        } else {
            false
        };
        if found {
            self.emit(ServerFrame::complete(request_id, &end));
        }
    }

    /// Invoked when the socket is gone. Every open stream gets exactly one
    /// completion carrying the disconnect reason; no frames are emitted.
    pub(crate) fn handle_disconnect(&mut self, reason: &str) {
        let open = self.bidi_streams.len() + self.client_streams.len() + self.server_streams.len();
        if open > 0 {
            tracing::debug!(open, reason, "completing streams of a lost connection");
        }
        let end: Reply = Reply::err_with_trace(reason.to_string(), None);
        for (_, mut active) in self.bidi_streams.drain() {
            active.service.on_completed(end.clone());
        }
        for (_, mut active) in self.client_streams.drain() {
            active.service.on_completed(end.clone());
        }
        for (_, mut active) in self.server_streams.drain() {
            active.service.on_completed(end.clone());
        }
    }

    fn update_context(&mut self, request_id: u64, args: Value) {
        match serde_json::from_value::<HttpContext>(args) {
            Ok(update) => {
                lock_context(&self.context).merge(&update);
                self.emit(ServerFrame::reply(
                    request_id,
                    Reply::<Value>::ok_empty().to_wire(),
                ));
            }
            Err(_) => {
                self.emit(ServerFrame::reply(
                    request_id,
                    Reply::<Value>::err(INVALID_CONTEXT).to_wire(),
                ));
            }
        }
    }

    async fn execute_request_reply(
        &mut self,
        request_id: u64,
        service: Arc<dyn RequestReplyService>,
        args: Value,
        context: &SharedContext,
    ) {
        let validation = service.middleware().run(&args, context).await;
        if validation.is_err() {
            self.emit(ServerFrame::reply(request_id, validation.to_wire()));
            return;
        }
        let outcome = AssertUnwindSafe(service.execute(args, context))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                tracing::error!(
                    method = service.name(),
                    panic = panic_message(&panic),
                    "request-reply handler panicked"
                );
                lock_context(context).http_status_code = 500;
                Reply::err(INTERNAL_SERVER_ERROR)
            });
        self.emit(ServerFrame::reply(request_id, outcome.to_wire()));
    }

    async fn bidi_message(
        &mut self,
        request_id: u64,
        method: Option<String>,
        args: Value,
        context: &SharedContext,
    ) {
        if method.as_deref() == Some(COMPLETE_METHOD) {
            if let Some(mut active) = self.bidi_streams.remove(&request_id) {
                active.service.on_completed(Reply::from_wire(args));
            }
            return;
        }
        let Some(middleware) = self
            .bidi_streams
            .get(&request_id)
            .map(|active| active.middleware.clone())
        else {
            return;
        };
        let validation = middleware.run(&args, context).await;
        if validation.is_err() {
            self.finish_stream(request_id, widen(validation));
            return;
        }
        self.deliver_bidi(request_id, args, context).await;
    }

    async fn deliver_bidi(&mut self, request_id: u64, args: Value, context: &SharedContext) {
        let panicked = match self.bidi_streams.get_mut(&request_id) {
            Some(active) => AssertUnwindSafe(active.service.on_message(args, context))
                .catch_unwind()
                .await
                .is_err(),
            None => false,
        };
        if panicked {
            tracing::error!(request_id, "stream handler panicked");
            self.finish_stream(request_id, Reply::err(INTERNAL_SERVER_ERROR));
        }
    }

    async fn client_message(
        &mut self,
        request_id: u64,
        method: Option<String>,
        args: Value,
        context: &SharedContext,
    ) {
        if method.as_deref() == Some(COMPLETE_METHOD) {
            if let Some(mut active) = self.client_streams.remove(&request_id) {
                active.service.on_completed(Reply::from_wire(args));
            }
            return;
        }
        let Some(middleware) = self
            .client_streams
            .get(&request_id)
            .map(|active| active.middleware.clone())
        else {
            return;
        };
        let validation = middleware.run(&args, context).await;
        if validation.is_err() {
            self.finish_stream(request_id, widen(validation));
            return;
        }
        self.deliver_client(request_id, args, context).await;
    }

    async fn deliver_client(&mut self, request_id: u64, args: Value, context: &SharedContext) {
        let panicked = match self.client_streams.get_mut(&request_id) {
            Some(active) => AssertUnwindSafe(active.service.on_message(args, context))
                .catch_unwind()
                .await
                .is_err(),
            None => false,
        };
        if panicked {
            tracing::error!(request_id, "stream handler panicked");
            self.finish_stream(request_id, Reply::err(INTERNAL_SERVER_ERROR));
        }
    }

    async fn open_bidi(
        &mut self,
        request_id: u64,
        factory: Arc<dyn BidiStreamFactory>,
        args: Value,
        context: &SharedContext,
    ) {
        let middleware = factory.middleware();
        let service = factory.create(StreamHandle::new(request_id, self.events.clone()));
        self.bidi_streams.insert(
            request_id,
            ActiveBidi {
                service,
                middleware: middleware.clone(),
            },
        );
        let validation = middleware.run(&args, context).await;
        if validation.is_err() {
            self.finish_stream(request_id, widen(validation));
            return;
        }
        // The opening frame doubles as the first message. The chain already
        // ran above, so deliver directly.
        self.deliver_bidi(request_id, args, context).await;
    }

    async fn open_client_stream(
        &mut self,
        request_id: u64,
        factory: Arc<dyn ClientStreamFactory>,
        args: Value,
        context: &SharedContext,
    ) {
        let middleware = factory.middleware();
        let service = factory.create(StreamHandle::new(request_id, self.events.clone()));
        self.client_streams.insert(
            request_id,
            ActiveClient {
                service,
                middleware: middleware.clone(),
            },
        );
        let validation = middleware.run(&args, context).await;
        if validation.is_err() {
            self.finish_stream(request_id, widen(validation));
            return;
        }
        self.deliver_client(request_id, args, context).await;
    }

    async fn open_server_stream(
        &mut self,
        request_id: u64,
        factory: Arc<dyn ServerStreamFactory>,
        args: Value,
        context: &SharedContext,
    ) {
        let service = factory.create(StreamHandle::new(request_id, self.events.clone()));
        self.server_streams
            .insert(request_id, ActiveServer { service });
        let validation = factory.middleware().run(&args, context).await;
        if validation.is_err() {
            self.finish_stream(request_id, widen(validation));
            return;
        }
        let panicked = match self.server_streams.get_mut(&request_id) {
            Some(active) => AssertUnwindSafe(active.service.start(args, context))
                .catch_unwind()
                .await
                .is_err(),
            None => false,
        };
        if panicked {
            tracing::error!(request_id, "stream handler panicked");
            self.finish_stream(request_id, Reply::err(INTERNAL_SERVER_ERROR));
        }
    }

    fn emit_unknown_method(&self, request_id: u64, method: &str) {
        tracing::debug!(request_id, method, "unknown method");
        self.emit(ServerFrame::reply(
            request_id,
            Reply::<Value>::err(unknown_method_message(method)).to_wire(),
        ));
    }

    fn emit(&self, frame: ServerFrame) {
        let _ = self.events.send(ConnectionEvent::Outbound(frame));
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{MiddlewareChain, middleware_fn};
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

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

    struct Panics;

    impl RequestReplyService for Panics {
        fn name(&self) -> &str {
            "panics"
        }
        fn execute<'a>(
            &'a self,
            _args: Value,
            _context: &'a SharedContext,
        ) -> BoxFuture<'a, Reply<Value>> {
            async { panic!("handler exploded") }.boxed()
        }
    }

    type Completions = Arc<Mutex<Vec<Reply>>>;

    struct EchoStream {
        handle: StreamHandle,
        completions: Completions,
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
        fn on_completed(&mut self, end: Reply) {
            self.completions.lock().unwrap().push(end);
        }
    }

    struct EchoStreamFactory {
        completions: Completions,
        reject_opens: bool,
    }

    impl BidiStreamFactory for EchoStreamFactory {
        fn name(&self) -> &str {
            "echoStream"
        }
        fn middleware(&self) -> MiddlewareChain {
            if !self.reject_opens {
                return MiddlewareChain::new();
            }
            MiddlewareChain::new().with(middleware_fn(|_args, _context| async {
                Reply::err_with_trace("Bad arguments.", None)
            }))
        }
        fn create(&self, handle: StreamHandle) -> Box<dyn BidiStreamService> {
            Box::new(EchoStream {
                handle,
                completions: self.completions.clone(),
            })
        }
    }

    struct Countdown {
        handle: StreamHandle,
        completions: Completions,
    }

    impl ServerStreamService for Countdown {
        fn start<'a>(&'a mut self, args: Value, _context: &'a SharedContext) -> BoxFuture<'a, ()> {
            let count = args.get("count").and_then(Value::as_u64).unwrap_or(0);
            for n in (1..=count).rev() {
                self.handle.send(json!(n));
            }
            async {}.boxed()
        }
        fn on_completed(&mut self, end: Reply) {
            self.completions.lock().unwrap().push(end);
        }
    }

    struct CountdownFactory {
        completions: Completions,
    }

    impl ServerStreamFactory for CountdownFactory {
        fn name(&self) -> &str {
            "countdown"
        }
        fn create(&self, handle: StreamHandle) -> Box<dyn ServerStreamService> {
            Box::new(Countdown {
                handle,
                completions: self.completions.clone(),
            })
        }
    }

    struct Collector {
        handle: StreamHandle,
        seen: Arc<Mutex<Vec<Value>>>,
        completions: Completions,
    }

    impl ClientStreamService for Collector {
        fn on_message<'a>(
            &'a mut self,
            message: Value,
            _context: &'a SharedContext,
        ) -> BoxFuture<'a, ()> {
            if message == json!("done") {
                self.handle.complete(Reply::ok(json!(
                    self.seen.lock().unwrap().len()
                )));
            } else {
                self.seen.lock().unwrap().push(message);
            }
            async {}.boxed()
        }
        fn on_completed(&mut self, end: Reply) {
            self.completions.lock().unwrap().push(end);
        }
    }

    struct CollectorFactory {
        seen: Arc<Mutex<Vec<Value>>>,
        completions: Completions,
    }

    impl ClientStreamFactory for CollectorFactory {
        fn name(&self) -> &str {
            "collect"
        }
        fn create(&self, handle: StreamHandle) -> Box<dyn ClientStreamService> {
            Box::new(Collector {
                handle,
                seen: self.seen.clone(),
                completions: self.completions.clone(),
            })
        }
    }

    struct Fixture {
        dispatcher: ConnectionDispatcher,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        context: SharedContext,
        guarded_calls: Arc<AtomicU32>,
        bidi_completions: Completions,
        server_completions: Completions,
        client_completions: Completions,
        client_seen: Arc<Mutex<Vec<Value>>>,
    }

    fn fixture() -> Fixture {
        fixture_with(false)
    }

    fn fixture_with(reject_stream_opens: bool) -> Fixture {
        let guarded_calls = Arc::new(AtomicU32::new(0));
        let bidi_completions: Completions = Arc::default();
        let server_completions: Completions = Arc::default();
        let client_completions: Completions = Arc::default();
        let client_seen: Arc<Mutex<Vec<Value>>> = Arc::default();
        let config = RpcServerConfig::builder()
            .add_server_middleware(middleware_fn(|args: Value, _context| async move {
                if args.get("reject").is_some() {
                    Reply::err_with_trace("Rejected by the server.", None)
                } else {
                    Reply::ok_empty()
                }
            }))
            .add_request_reply_service(Echo)
            .unwrap()
            .add_request_reply_service(Guarded {
                calls: guarded_calls.clone(),
            })
            .unwrap()
            .add_request_reply_service(Panics)
            .unwrap()
            .add_bidi_stream_service(EchoStreamFactory {
                completions: bidi_completions.clone(),
                reject_opens: reject_stream_opens,
            })
            .unwrap()
            .add_server_stream_service(CountdownFactory {
                completions: server_completions.clone(),
            })
            .unwrap()
            .add_client_stream_service(CollectorFactory {
                seen: client_seen.clone(),
                completions: client_completions.clone(),
            })
            .unwrap()
            .build();
        let context = HttpContext::new().into_shared();
        let (events_tx, events) = mpsc::unbounded_channel();
        Fixture {
            dispatcher: ConnectionDispatcher::new(Arc::new(config), context.clone(), events_tx),
            events,
            context,
            guarded_calls,
            bidi_completions,
            server_completions,
            client_completions,
            client_seen,
        }
    }

    fn next_outbound(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ServerFrame {
        match events.try_recv().expect("expected an event") {
            ConnectionEvent::Outbound(frame) => frame,
            other => panic!("expected an outbound frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let mut f = fixture();
        f.dispatcher
            .handle_frame(Frame::open(1, "echo", json!({"text": "hi"})))
            .await;
        let frame = next_outbound(&mut f.events);
        assert_eq!(frame.request_id, 1);
        assert!(!frame.is_complete());
        assert_eq!(frame.reply, json!({"code": "Ok", "data": {"text": "hi"}}));
    }

    #[tokio::test]
    async fn unknown_method_gets_an_error_reply() {
        let mut f = fixture();
        f.dispatcher
            .handle_frame(Frame::open(1, "nope", json!({})))
            .await;
        let frame = next_outbound(&mut f.events);
        let reply: Reply = Reply::from_wire(frame.reply);
        assert_eq!(
            reply.error_message(),
            "The provided method 'nope' is not exposed by the server."
        );
    }

    #[tokio::test]
    async fn frame_without_method_and_unknown_id_is_an_error() {
        let mut f = fixture();
        f.dispatcher.handle_frame(Frame::message(77, json!(1))).await;
        let frame = next_outbound(&mut f.events);
        let reply: Reply = Reply::from_wire(frame.reply);
        assert!(reply.error_message().contains("'<none>'"));
    }

    #[tokio::test]
    async fn unparseable_text_replies_on_the_unknown_id() {
        let mut f = fixture();
        f.dispatcher.handle_text("not json").await;
        let frame = next_outbound(&mut f.events);
        assert_eq!(frame.request_id, UNKNOWN_REQUEST_ID);
        let reply: Reply = Reply::from_wire(frame.reply);
        assert_eq!(reply.error_message(), UNABLE_TO_PARSE);
    }

    #[tokio::test]
    async fn server_middleware_runs_before_everything() {
        let mut f = fixture();
        f.dispatcher
            .handle_frame(Frame::open(1, "echo", json!({"reject": true})))
            .await;
        let frame = next_outbound(&mut f.events);
        let reply: Reply = Reply::from_wire(frame.reply);
        assert_eq!(reply.error_message(), "Rejected by the server.");
    }

    #[tokio::test]
    async fn service_middleware_rejection_skips_the_handler() {
        let mut f = fixture();
        f.dispatcher
            .handle_frame(Frame::open(1, "guarded", json!({"bad": true})))
            .await;
        let frame = next_outbound(&mut f.events);
        let reply: Reply = Reply::from_wire(frame.reply);
        assert_eq!(reply.error_message(), "Bad arguments.");
        assert_eq!(f.guarded_calls.load(Ordering::SeqCst), 0);

        f.dispatcher
            .handle_frame(Frame::open(2, "guarded", json!({})))
            .await;
        let frame = next_outbound(&mut f.events);
        assert!(Reply::<Value>::from_wire(frame.reply).is_ok());
        assert_eq!(f.guarded_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_panicking_handler_becomes_an_internal_error() {
        let mut f = fixture();
        f.dispatcher
            .handle_frame(Frame::open(1, "panics", json!({})))
            .await;
        let frame = next_outbound(&mut f.events);
        let reply: Reply = Reply::from_wire(frame.reply);
        assert_eq!(reply.error_message(), INTERNAL_SERVER_ERROR);
        assert_eq!(lock_context(&f.context).http_status_code, 500);
    }

    #[tokio::test]
    async fn context_updates_merge_and_acknowledge() {
        let mut f = fixture();
        let mut update = HttpContext::new();
        update.set_request_header("x-token", "abc");
        f.dispatcher
            .handle_frame(Frame::open(
                5,
                CLIENT_CONTEXT_METHOD,
                serde_json::to_value(&update).unwrap(),
            ))
            .await;
        let frame = next_outbound(&mut f.events);
        assert_eq!(frame.request_id, 5);
        assert!(Reply::<Value>::from_wire(frame.reply).is_ok());
        assert_eq!(
            lock_context(&f.context).request_header("x-token"),
            Some("abc")
        );
    }

    #[tokio::test]
    async fn an_invalid_context_update_is_rejected() {
        let mut f = fixture();
        f.dispatcher
            .handle_frame(Frame::open(5, CLIENT_CONTEXT_METHOD, json!(42)))
            .await;
        let frame = next_outbound(&mut f.events);
        let reply: Reply = Reply::from_wire(frame.reply);
        assert_eq!(reply.error_message(), INVALID_CONTEXT);
    }

    #[tokio::test]
    async fn bidi_stream_lifecycle() {
        let mut f = fixture();
        f.dispatcher
            .handle_frame(Frame::open(3, "echoStream", json!("first")))
            .await;
        assert_eq!(next_outbound(&mut f.events).reply, json!("first"));

        f.dispatcher
            .handle_frame(Frame::message(3, json!("second")))
            .await;
        assert_eq!(next_outbound(&mut f.events).reply, json!("second"));

        // Client completes: the service sees the embedded end result, no
        // frame is echoed back.
        f.dispatcher
            .handle_frame(Frame::complete(3, &Reply::<Value>::ok_empty()))
            .await;
        assert!(f.events.try_recv().is_err());
        assert!(f.bidi_completions.lock().unwrap()[0].is_ok());

        // The id is free again; a message for it is an unknown method.
        f.dispatcher.handle_frame(Frame::message(3, json!(1))).await;
        let frame = next_outbound(&mut f.events);
        assert!(Reply::<Value>::from_wire(frame.reply).is_err());
    }

    #[tokio::test]
    async fn stream_middleware_runs_once_per_frame() {
        struct CountedFactory {
            ran: Arc<AtomicU32>,
            completions: Completions,
        }
        impl BidiStreamFactory for CountedFactory {
            fn name(&self) -> &str {
                "counted"
            }
            fn middleware(&self) -> MiddlewareChain {
                let ran = self.ran.clone();
                MiddlewareChain::new().with(middleware_fn(move |_args, _context| {
                    let ran = ran.clone();
                    async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Reply::ok_empty()
                    }
                }))
            }
            fn create(&self, handle: StreamHandle) -> Box<dyn BidiStreamService> {
                Box::new(EchoStream {
                    handle,
                    completions: self.completions.clone(),
                })
            }
        }

        let ran = Arc::new(AtomicU32::new(0));
        let config = RpcServerConfig::builder()
            .add_bidi_stream_service(CountedFactory {
                ran: ran.clone(),
                completions: Arc::default(),
            })
            .unwrap()
            .build();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut dispatcher = ConnectionDispatcher::new(
            Arc::new(config),
            HttpContext::new().into_shared(),
            events_tx,
        );

        dispatcher
            .handle_frame(Frame::open(1, "counted", json!("first")))
            .await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        dispatcher
            .handle_frame(Frame::message(1, json!("second")))
            .await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);

        // Both frames still reached the service exactly once.
        assert_eq!(next_outbound(&mut events).reply, json!("first"));
        assert_eq!(next_outbound(&mut events).reply, json!("second"));
    }

    #[tokio::test]
    async fn a_rejected_stream_open_completes_the_stream() {
        let mut f = fixture_with(true);
        f.dispatcher
            .handle_frame(Frame::open(4, "echoStream", json!("first")))
            .await;
        let frame = next_outbound(&mut f.events);
        assert!(frame.is_complete());
        let end: Reply = Reply::from_wire(frame.reply);
        assert_eq!(end.error_message(), "Bad arguments.");
        assert_eq!(f.bidi_completions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn server_stream_pushes_then_client_completes() {
        let mut f = fixture();
        f.dispatcher
            .handle_frame(Frame::open(6, "countdown", json!({"count": 3})))
            .await;
        for expected in [3, 2, 1] {
            assert_eq!(next_outbound(&mut f.events).reply, json!(expected));
        }
        f.dispatcher
            .handle_frame(Frame::complete(6, &Reply::<Value>::ok_empty()))
            .await;
        assert_eq!(f.server_completions.lock().unwrap().len(), 1);

        // Non-completion frames on a live server stream are ignored.
        f.dispatcher
            .handle_frame(Frame::open(7, "countdown", json!({"count": 0})))
            .await;
        f.dispatcher.handle_frame(Frame::message(7, json!(1))).await;
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn client_stream_collects_and_server_completes() {
        let mut f = fixture();
        f.dispatcher
            .handle_frame(Frame::open(8, "collect", json!(1)))
            .await;
        f.dispatcher.handle_frame(Frame::message(8, json!(2))).await;
        f.dispatcher
            .handle_frame(Frame::message(8, json!("done")))
            .await;
        assert_eq!(*f.client_seen.lock().unwrap(), vec![json!(1), json!(2)]);

        // The service completed through its handle; the loop feeds that
        // event back into the dispatcher.
        match f.events.try_recv().unwrap() {
            ConnectionEvent::Complete { request_id, end } => {
                assert_eq!(request_id, 8);
                f.dispatcher.finish_stream(request_id, end);
            }
            other => panic!("expected a completion event, got {other:?}"),
        }
        let frame = next_outbound(&mut f.events);
        assert!(frame.is_complete());
        assert_eq!(
            Reply::<Value>::from_wire(frame.reply).value(),
            &json!(2)
        );
        assert_eq!(f.client_completions.lock().unwrap().len(), 1);

        // A duplicate completion is a no-op.
        f.dispatcher.finish_stream(8, Reply::ok_empty());
        assert!(f.events.try_recv().is_err());
        assert_eq!(f.client_completions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_completes_every_open_stream_once() {
        let mut f = fixture();
        f.dispatcher
            .handle_frame(Frame::open(1, "echoStream", json!("x")))
            .await;
        f.dispatcher
            .handle_frame(Frame::open(2, "countdown", json!({"count": 0})))
            .await;
        f.dispatcher
            .handle_frame(Frame::open(3, "collect", json!(1)))
            .await;

        f.dispatcher.handle_disconnect("The connection was closed.");
        let ends = f.bidi_completions.lock().unwrap();
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].error_message(), "The connection was closed.");
        drop(ends);
        assert_eq!(f.server_completions.lock().unwrap().len(), 1);
        assert_eq!(f.client_completions.lock().unwrap().len(), 1);

        // Idempotent: a second disconnect finds nothing to complete.
        f.dispatcher.handle_disconnect("The connection was closed.");
        assert_eq!(f.bidi_completions.lock().unwrap().len(), 1);
    }
}
