//! Proxies and the references behind them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tracing::trace;

use crate::batch::{BatchRequestQueue, BatchTarget};
use crate::communicator::Instance;
use crate::connection::Connection;
use crate::endpoint::EndpointResolver;
use crate::error::Result;
use crate::message::{self, Context, Identity, InvocationMode, OperationMode, RequestTarget};
use crate::outgoing::{InvocationFuture, OutgoingAsync};
use crate::protocol;
use crate::request_handler::{RequestHandler, RequestHandlerCache};
use crate::retry::RetryQueue;
use crate::router::RouterInfo;
use crate::stream::OutputStream;

/// How a reference reaches its object.
#[derive(Clone)]
pub(crate) enum ReferenceTarget {
    /// Resolved on demand, optionally through a router.
    Routable {
        resolver: Arc<dyn EndpointResolver>,
        router: Option<Arc<dyn RouterInfo>>,
    },
    /// Bound to one connection for its whole life.
    Fixed(Connection),
}

/// Immutable addressing and call settings of a proxy.
#[derive(Clone)]
pub(crate) struct Reference {
    pub(crate) identity: Identity,
    pub(crate) facet: Option<String>,
    pub(crate) mode: InvocationMode,
    pub(crate) compress: bool,
    pub(crate) context: Context,
    pub(crate) invocation_timeout: Option<Duration>,
    pub(crate) cache_connection: bool,
    pub(crate) target: ReferenceTarget,
}

impl Reference {
    pub(crate) fn new(identity: Identity, target: ReferenceTarget, invocation_timeout: Option<Duration>) -> Self {
        Self {
            identity,
            facet: None,
            mode: InvocationMode::Twoway,
            compress: false,
            context: Context::new(),
            invocation_timeout,
            cache_connection: true,
            target,
        }
    }

    /// Resolver to connect through; the router's client endpoints win.
    pub(crate) fn resolver(&self) -> Option<Arc<dyn EndpointResolver>> {
        match &self.target {
            ReferenceTarget::Routable {
                router: Some(router), ..
            } => Some(router.client_endpoints()),
            ReferenceTarget::Routable { resolver, .. } => Some(resolver.clone()),
            ReferenceTarget::Fixed(_) => None,
        }
    }

    pub(crate) fn router(&self) -> Option<&Arc<dyn RouterInfo>> {
        match &self.target {
            ReferenceTarget::Routable { router, .. } => router.as_ref(),
            ReferenceTarget::Fixed(_) => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity)?;
        if let Some(facet) = &self.facet {
            write!(f, " -f {facet}")?;
        }
        let mode = match self.mode {
            InvocationMode::Twoway => "-t",
            InvocationMode::Oneway => "-o",
            InvocationMode::BatchOneway => "-O",
            InvocationMode::Datagram => "-d",
            InvocationMode::BatchDatagram => "-D",
        };
        write!(f, " {mode}")?;
        if let ReferenceTarget::Fixed(connection) = &self.target {
            write!(f, " @ {}", connection.id())?;
        }
        Ok(())
    }
}

struct ProxyInner {
    instance: Arc<Instance>,
    reference: Arc<Reference>,
    cache: Arc<RequestHandlerCache>,
    batch_queue: Arc<BatchRequestQueue>,
}

/// Local handle to a remote object.
///
/// Cloning is cheap and shares the connection cache and batch queue. The
/// `with_*` builders return a new proxy with its own cache.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Proxy").field(&self.inner.reference.to_string()).finish()
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.reference, f)
    }
}

impl Proxy {
    pub(crate) fn new(instance: Arc<Instance>, reference: Reference) -> Self {
        let batch_queue = match &reference.target {
            ReferenceTarget::Fixed(connection) => connection.batch_queue().clone(),
            ReferenceTarget::Routable { .. } => Arc::new(BatchRequestQueue::new(
                instance.config.batch_auto_flush_size,
                instance.batch_interceptor.clone(),
            )),
        };
        let reference = Arc::new(reference);
        let cache = RequestHandlerCache::new(reference.clone(), instance.clone());
        Self {
            inner: Arc::new(ProxyInner {
                instance,
                reference,
                cache,
                batch_queue,
            }),
        }
    }

    fn derive(&self, change: impl FnOnce(&mut Reference)) -> Proxy {
        let mut reference = (*self.inner.reference).clone();
        change(&mut reference);
        Proxy::new(self.inner.instance.clone(), reference)
    }

    /// Proxy with invocation mode `mode`.
    pub fn with_mode(&self, mode: InvocationMode) -> Proxy {
        self.derive(|r| r.mode = mode)
    }

    /// Proxy that asks for compressed requests and replies.
    pub fn with_compress(&self, compress: bool) -> Proxy {
        self.derive(|r| r.compress = compress)
    }

    /// Proxy targeting `facet`.
    pub fn with_facet(&self, facet: impl Into<String>) -> Proxy {
        let facet = facet.into();
        self.derive(|r| r.facet = (!facet.is_empty()).then_some(facet))
    }

    /// Proxy sending `context` when an invocation passes none.
    pub fn with_context(&self, context: Context) -> Proxy {
        self.derive(|r| r.context = context)
    }

    /// Proxy with its own invocation timeout; `None` waits forever.
    pub fn with_invocation_timeout(&self, timeout: Option<Duration>) -> Proxy {
        self.derive(|r| r.invocation_timeout = timeout)
    }

    /// Proxy that does (or does not) keep its connection between invocations.
    pub fn with_cache_connection(&self, cache: bool) -> Proxy {
        self.derive(|r| r.cache_connection = cache)
    }

    /// Target identity.
    pub fn identity(&self) -> &Identity {
        &self.inner.reference.identity
    }

    /// Target facet.
    pub fn facet(&self) -> Option<&str> {
        self.inner.reference.facet.as_deref()
    }

    /// Invocation mode.
    pub fn mode(&self) -> InvocationMode {
        self.inner.reference.mode
    }

    /// True if requests ask for compression.
    pub fn is_compressed(&self) -> bool {
        self.inner.reference.compress
    }

    /// Invocation timeout, if any.
    pub fn invocation_timeout(&self) -> Option<Duration> {
        self.inner.reference.invocation_timeout
    }

    /// True for proxies bound to one connection.
    pub fn is_fixed(&self) -> bool {
        matches!(self.inner.reference.target, ReferenceTarget::Fixed(_))
    }

    /// This proxy's batch queue.
    pub fn batch_queue(&self) -> &Arc<BatchRequestQueue> {
        &self.inner.batch_queue
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.instance.runtime
    }

    pub(crate) fn retry_queue(&self) -> &RetryQueue {
        &self.inner.instance.retry_queue
    }

    pub(crate) fn retry_intervals(&self) -> &[Duration] {
        &self.inner.instance.retry_intervals
    }

    pub(crate) fn request_handler(&self) -> Result<RequestHandler> {
        self.inner.cache.get()
    }

    pub(crate) fn clear_request_handler(&self, handler: &RequestHandler) {
        self.inner.cache.clear(handler);
    }

    #[cfg(test)]
    pub(crate) fn cached_handler(&self) -> Option<RequestHandler> {
        self.inner.cache.cached()
    }

    /// Waits for the connection this proxy sends on, establishing it if needed.
    pub async fn get_connection(&self) -> Result<Connection> {
        self.inner.cache.get_connection().await
    }

    /// Invokes `operation` with the encoded `params`.
    ///
    /// Twoway invocations resolve to the reply payload. Oneway and datagram
    /// invocations resolve once the request is written; batch invocations
    /// once it is queued. `context` overrides the proxy's context.
    pub fn invoke(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
        context: Option<&Context>,
    ) -> InvocationFuture {
        if let Err(ex) = self.inner.instance.check_destroyed() {
            return InvocationFuture::ready(Err(ex));
        }
        let reference = &self.inner.reference;
        let target = RequestTarget {
            identity: &reference.identity,
            facet: reference.facet.as_deref(),
            operation,
            mode,
            context: context.unwrap_or(&reference.context),
        };

        if reference.mode.is_batch() {
            return InvocationFuture::ready(self.invoke_batch(&target, params));
        }

        let mut os = OutputStream::new();
        protocol::write_request_header(&mut os);
        if let Err(ex) = message::write_request_body(&mut os, &target, params) {
            return InvocationFuture::ready(Err(ex));
        }
        trace!(proxy = %reference, operation, size = os.size(), "invoking");
        let (out, future) = OutgoingAsync::request(self.clone(), operation, mode, os.take());
        out.invoke();
        future
    }

    fn invoke_batch(&self, target: &RequestTarget<'_>, params: &[u8]) -> Result<Bytes> {
        let queue = &self.inner.batch_queue;
        let mut os = OutputStream::new();
        queue.prepare_batch_request(&mut os)?;
        match message::write_request_body(&mut os, target, params) {
            Ok(()) => {
                queue.finish_batch_request(&mut os, self, target.operation);
                Ok(Bytes::new())
            }
            Err(ex) => {
                queue.abort_batch_request(&mut os);
                Err(ex)
            }
        }
    }

    /// Sends every queued batch request as one message.
    pub fn flush_batch_requests(&self) -> InvocationFuture {
        if let Err(ex) = self.inner.instance.check_destroyed() {
            return InvocationFuture::ready(Err(ex));
        }
        let mut os = OutputStream::new();
        let Some(swapped) = self.inner.batch_queue.swap(&mut os) else {
            return InvocationFuture::ready(Ok(Bytes::new()));
        };
        let (out, future) = OutgoingAsync::proxy_flush_batch(
            self.clone(),
            os.take(),
            swapped.request_num,
            swapped.compress || self.is_compressed(),
        );
        out.invoke();
        future
    }
}

impl BatchTarget for Proxy {
    fn flush_batch_requests_async(&self) {
        drop(self.flush_batch_requests());
    }

    fn is_compressed(&self) -> bool {
        self.inner.reference.compress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::communicator::Communicator;
    use crate::config::RuntimeConfig;
    use crate::endpoint::FixedEndpoints;
    use crate::error::RpcError;
    use crate::message::{IncomingRequest, OutgoingResponse};
    use crate::server::Dispatcher;
    use crate::transport::memory;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<IncomingRequest>>,
    }

    #[async_trait]
    impl Dispatcher for Recorder {
        async fn dispatch(&self, request: IncomingRequest) -> OutgoingResponse {
            self.seen.lock().unwrap().push(request.clone());
            match request.operation.as_str() {
                "fail" => OutgoingResponse::user_exception(Bytes::from_static(b"boom")),
                "missing" => OutgoingResponse::operation_not_exist(),
                _ => OutgoingResponse::ok(request.params),
            }
        }
    }

    async fn served(name: &str, config: RuntimeConfig) -> (Communicator, Proxy, Arc<Recorder>) {
        let communicator = Communicator::new(config).unwrap();
        let (connector, acceptor) = memory::endpoint(name);
        let recorder = Arc::new(Recorder::default());
        let adapter = communicator.create_object_adapter("server", recorder.clone());
        adapter.serve(Arc::new(acceptor));
        let proxy = communicator.create_proxy(
            Identity::new("obj"),
            Arc::new(FixedEndpoints::new(vec![Arc::new(connector)])),
        );
        (communicator, proxy, recorder)
    }

    #[tokio::test]
    async fn test_twoway_roundtrip_with_facet_and_context() {
        let (communicator, proxy, recorder) = served("roundtrip", RuntimeConfig::default()).await;
        let mut context = Context::new();
        context.insert("tenant".into(), "a".into());
        let proxy = proxy.with_facet("admin").with_context(context);

        let reply = proxy.invoke("echo", OperationMode::Idempotent, b"hi", None).await.unwrap();
        assert_eq!(reply.as_ref(), b"hi");

        let mut explicit = Context::new();
        explicit.insert("tenant".into(), "b".into());
        proxy.invoke("echo", OperationMode::Normal, b"", Some(&explicit)).await.unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen[0].facet.as_deref(), Some("admin"));
        assert_eq!(seen[0].mode, OperationMode::Idempotent);
        assert_eq!(seen[0].context.get("tenant").map(String::as_str), Some("a"));
        assert_eq!(seen[1].context.get("tenant").map(String::as_str), Some("b"));
        drop(seen);
        communicator.destroy().await;
    }

    #[tokio::test]
    async fn test_compressed_roundtrip_counted() {
        let (communicator, proxy, _) = served("compressed", RuntimeConfig::default()).await;
        let payload = vec![3u8; 8192];
        let reply = proxy
            .with_compress(true)
            .invoke("echo", OperationMode::Normal, &payload, None)
            .await
            .unwrap();
        assert_eq!(reply.as_ref(), payload.as_slice());

        let stats = communicator.compression_stats();
        assert_eq!(stats.compressions, 2);
        assert_eq!(stats.decompressions, 2);
        assert!(stats.bytes_out < stats.bytes_in);
        communicator.destroy().await;
    }

    #[tokio::test]
    async fn test_reply_errors_are_typed() {
        let (communicator, proxy, _) = served("errors", RuntimeConfig::default()).await;
        match proxy.invoke("fail", OperationMode::Normal, b"", None).await {
            Err(RpcError::UserException { encapsulation, .. }) => assert_eq!(encapsulation.as_ref(), b"boom"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            proxy.invoke("missing", OperationMode::Normal, b"", None).await,
            Err(RpcError::OperationNotExist { ref operation, .. }) if operation == "missing"
        ));
        communicator.destroy().await;
    }

    #[tokio::test]
    async fn test_oneway_completes_when_sent() {
        let (communicator, proxy, recorder) = served("oneway", RuntimeConfig::default()).await;
        let oneway = proxy.with_mode(InvocationMode::Oneway);
        let mut fut = oneway.invoke("note", OperationMode::Normal, b"x", None);
        assert!(fut.sent().await);
        assert!(fut.await.unwrap().is_empty());

        // A twoway call on the same connection orders after the oneway.
        proxy.invoke("sync", OperationMode::Normal, b"", None).await.unwrap();
        let ops: Vec<String> = recorder.seen.lock().unwrap().iter().map(|r| r.operation.clone()).collect();
        assert_eq!(ops, vec!["note", "sync"]);
        communicator.destroy().await;
    }

    #[tokio::test]
    async fn test_batch_oneway_flush() {
        let (communicator, proxy, recorder) = served("batch", RuntimeConfig::default()).await;
        let batch = proxy.with_mode(InvocationMode::BatchOneway);
        for op in ["op1", "op2", "op3"] {
            batch.invoke(op, OperationMode::Normal, op.as_bytes(), None).await.unwrap();
        }
        assert!(!batch.batch_queue().is_empty());
        assert!(recorder.seen.lock().unwrap().is_empty());

        batch.flush_batch_requests().await.unwrap();
        assert!(batch.batch_queue().is_empty());
        proxy.invoke("sync", OperationMode::Normal, b"", None).await.unwrap();
        let ops: Vec<String> = recorder.seen.lock().unwrap().iter().map(|r| r.operation.clone()).collect();
        assert_eq!(ops, vec!["op1", "op2", "op3", "sync"]);
        assert!(recorder.seen.lock().unwrap()[..3].iter().all(|r| r.request_id == 0));

        // Empty queue: nothing to send.
        batch.flush_batch_requests().await.unwrap();
        communicator.destroy().await;
    }

    #[tokio::test]
    async fn test_batch_auto_flush_on_size() {
        let config = RuntimeConfig {
            batch_auto_flush_size: 128,
            ..RuntimeConfig::default()
        };
        let (communicator, proxy, recorder) = served("auto-flush", config).await;
        let batch = proxy.with_mode(InvocationMode::BatchOneway);
        for _ in 0..4 {
            batch.invoke("big", OperationMode::Normal, &[7u8; 60], None).await.unwrap();
        }
        proxy.invoke("sync", OperationMode::Normal, b"", None).await.unwrap();
        let flushed = recorder.seen.lock().unwrap().iter().filter(|r| r.operation == "big").count();
        assert!(flushed >= 2, "auto flush sent {flushed} requests");
        communicator.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invocation_timeout() {
        struct Never;

        #[async_trait]
        impl Dispatcher for Never {
            async fn dispatch(&self, _request: IncomingRequest) -> OutgoingResponse {
                std::future::pending().await
            }
        }

        let communicator = Communicator::new(RuntimeConfig::default()).unwrap();
        let (connector, acceptor) = memory::endpoint("timeout");
        let adapter = communicator.create_object_adapter("server", Arc::new(Never));
        adapter.serve(Arc::new(acceptor));
        let proxy = communicator
            .create_proxy(
                Identity::new("obj"),
                Arc::new(FixedEndpoints::new(vec![Arc::new(connector)])),
            )
            .with_invocation_timeout(Some(Duration::from_millis(500)));

        let err = proxy.invoke("slow", OperationMode::Idempotent, b"", None).await.unwrap_err();
        assert!(matches!(err, RpcError::InvocationTimeout { .. }), "{err}");
        let connection = proxy.get_connection().await.unwrap();
        assert!(connection.is_usable());
        assert_eq!(connection.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_destroyed_communicator_rejects_invocations() {
        let (communicator, proxy, _) = served("destroyed", RuntimeConfig::default()).await;
        communicator.destroy().await;
        assert!(matches!(
            proxy.invoke("op", OperationMode::Normal, b"", None).await,
            Err(RpcError::CommunicatorDestroyed)
        ));
        assert!(matches!(
            proxy.flush_batch_requests().await,
            Err(RpcError::CommunicatorDestroyed)
        ));
    }

    #[tokio::test]
    async fn test_reference_display() {
        let communicator = Communicator::new(RuntimeConfig::default()).unwrap();
        let proxy = communicator
            .create_proxy(
                Identity::with_category("obj", "cat"),
                Arc::new(FixedEndpoints::new(Vec::new())),
            )
            .with_facet("f")
            .with_mode(InvocationMode::BatchDatagram);
        assert_eq!(proxy.to_string(), "cat/obj -f f -D");
        communicator.destroy().await;
    }
}
