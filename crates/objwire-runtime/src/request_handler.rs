//! Request handler resolution.
//!
//! A proxy sends through a [`RequestHandler`]: straight to an established
//! connection, through a pending-connect queue while the connection is
//! being established, through a serial executor, or to the fixed
//! connection of a fixed proxy. Each proxy caches its handler in a
//! [`RequestHandlerCache`]; a failed handler is cleared so the next
//! attempt resolves a new one.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::cancel::CancellationHandler;
use crate::communicator::Instance;
use crate::connection::Connection;
use crate::endpoint::filter_connectors;
use crate::error::{Result, RpcError};
use crate::outgoing::OutgoingAsync;
use crate::proxy::{Reference, ReferenceTarget};
use crate::{lock, wait};

/// Outcome of handing a request to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncStatus {
    /// Held until a connection is available.
    Queued,
    /// Handed to a connection's writer.
    Sent,
}

/// Where a proxy sends its requests.
#[derive(Clone)]
pub(crate) enum RequestHandler {
    /// An established connection.
    Direct(Connection),
    /// A connection still being established.
    Pending(Arc<ConnectRequestHandler>),
    /// Another handler, driven from the serial executor.
    Queued(Arc<QueueRequestHandler>),
    /// The connection of a fixed proxy.
    Fixed(Connection),
}

impl fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestHandler::Direct(c) => f.debug_tuple("Direct").field(&c.id()).finish(),
            RequestHandler::Pending(_) => f.write_str("Pending"),
            RequestHandler::Queued(q) => f.debug_tuple("Queued").field(&q.delegate).finish(),
            RequestHandler::Fixed(c) => f.debug_tuple("Fixed").field(&c.id()).finish(),
        }
    }
}

impl RequestHandler {
    pub(crate) fn send_async_request(&self, out: &Arc<OutgoingAsync>) -> Result<AsyncStatus> {
        match self {
            RequestHandler::Direct(connection) | RequestHandler::Fixed(connection) => {
                connection.send_async_request(out)
            }
            RequestHandler::Pending(handler) => handler.send_async_request(out),
            RequestHandler::Queued(handler) => handler.send_async_request(out),
        }
    }

    /// The connection in use, if one is established.
    pub(crate) fn connection(&self) -> Option<Connection> {
        match self {
            RequestHandler::Direct(connection) | RequestHandler::Fixed(connection) => Some(connection.clone()),
            RequestHandler::Pending(handler) => handler.connection(),
            RequestHandler::Queued(handler) => handler.delegate.connection(),
        }
    }

    /// True if both refer to the same handler instance.
    pub(crate) fn same(&self, other: &RequestHandler) -> bool {
        match (self, other) {
            (RequestHandler::Direct(a), RequestHandler::Direct(b))
            | (RequestHandler::Fixed(a), RequestHandler::Fixed(b)) => a.id() == b.id(),
            (RequestHandler::Pending(a), RequestHandler::Pending(b)) => Arc::ptr_eq(a, b),
            (RequestHandler::Queued(a), RequestHandler::Queued(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn is_pending(&self, handler: &Arc<ConnectRequestHandler>) -> bool {
        match self {
            RequestHandler::Pending(p) => Arc::ptr_eq(p, handler),
            RequestHandler::Queued(q) => q.delegate.is_pending(handler),
            _ => false,
        }
    }

    /// Routes through `executor` when one is configured.
    pub(crate) fn wrap(self, executor: Option<&Arc<SerialExecutor>>) -> RequestHandler {
        match executor {
            Some(executor) => RequestHandler::Queued(Arc::new(QueueRequestHandler {
                delegate: self,
                executor: executor.clone(),
            })),
            None => self,
        }
    }
}

#[derive(Default)]
struct ConnectState {
    connection: Option<Connection>,
    exception: Option<RpcError>,
    flushing: bool,
    initialized: bool,
    requests: VecDeque<Arc<OutgoingAsync>>,
}

/// Queues requests while a connection is established, then flushes them in
/// order.
///
/// Senders arriving during the flush block until it ends, so a queued
/// request can never be overtaken by a later one.
pub(crate) struct ConnectRequestHandler {
    reference: Arc<Reference>,
    cache: Weak<RequestHandlerCache>,
    instance: Arc<Instance>,
    state: Mutex<ConnectState>,
    cond: Condvar,
    settled: watch::Sender<bool>,
}

impl ConnectRequestHandler {
    fn new(reference: Arc<Reference>, cache: Weak<RequestHandlerCache>, instance: Arc<Instance>) -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            reference,
            cache,
            instance,
            state: Mutex::new(ConnectState::default()),
            cond: Condvar::new(),
            settled,
        }
    }

    fn connection(&self) -> Option<Connection> {
        lock(&self.state).connection.clone()
    }

    /// Waits out a flush and reports whether requests may go straight to
    /// the connection.
    ///
    /// A handler that failed before obtaining a connection raises its
    /// error. One whose connection was established and then died reports
    /// ready: the send on the dead connection fails with `Retry`, which
    /// lets the caller resend on a fresh connection.
    fn initialized<'a>(
        &self,
        mut st: MutexGuard<'a, ConnectState>,
    ) -> Result<(bool, MutexGuard<'a, ConnectState>)> {
        if st.initialized {
            return Ok((true, st));
        }
        while st.flushing {
            st = wait(&self.cond, st);
        }
        if let Some(ex) = &st.exception {
            if st.connection.is_some() {
                return Ok((true, st));
            }
            return Err(ex.clone());
        }
        let ready = st.initialized;
        Ok((ready, st))
    }

    fn send_async_request(self: &Arc<Self>, out: &Arc<OutgoingAsync>) -> Result<AsyncStatus> {
        let connection = {
            let (ready, mut st) = self.initialized(lock(&self.state))?;
            if !ready {
                out.cancelable(self.clone())?;
                st.requests.push_back(out.clone());
                debug!(operation = %out.operation(), queued = st.requests.len(), "request queued until connected");
                return Ok(AsyncStatus::Queued);
            }
            st.connection.clone()
        };
        match connection {
            Some(connection) => connection.send_async_request(out),
            None => Err(RpcError::Retry(Box::new(RpcError::NoEndpoint {
                proxy: self.reference.to_string(),
            }))),
        }
    }

    /// Resolves endpoints and establishes the connection in the background.
    fn connect(self: &Arc<Self>) {
        let this = self.clone();
        self.instance.runtime.spawn(async move {
            match this.establish().await {
                Ok(connection) => this.set_connection(connection),
                Err(ex) => this.set_exception(ex),
            }
        });
    }

    async fn establish(&self) -> Result<Connection> {
        let Some(resolver) = self.reference.resolver() else {
            return Err(RpcError::NoEndpoint {
                proxy: self.reference.to_string(),
            });
        };
        let connectors = filter_connectors(resolver.resolve().await?, self.reference.mode.is_datagram());
        if connectors.is_empty() {
            return Err(RpcError::NoEndpoint {
                proxy: self.reference.to_string(),
            });
        }
        match self.instance.factory.create(&connectors).await {
            Ok(connection) => Ok(connection),
            Err(ex) => {
                resolver.invalidate();
                Err(ex)
            }
        }
    }

    fn set_connection(self: &Arc<Self>, connection: Connection) {
        {
            let mut st = lock(&self.state);
            if st.exception.is_some() {
                return;
            }
            st.connection = Some(connection.clone());
        }
        debug!(proxy = %self.reference, connection = %connection.id(), "connection established for proxy");

        if let Some(router) = self.reference.router() {
            let this = self.clone();
            let registered = router.add_proxy(
                &self.reference.identity,
                Box::new(move |result| match result {
                    Ok(()) => this.flush_requests(),
                    Err(ex) => this.set_exception(ex),
                }),
            );
            if !registered {
                return;
            }
        }
        self.flush_requests();
    }

    fn flush_requests(self: &Arc<Self>) {
        let (connection, requests) = {
            let mut st = lock(&self.state);
            if st.exception.is_some() {
                return;
            }
            let Some(connection) = st.connection.clone() else {
                return;
            };
            st.flushing = true;
            (connection, std::mem::take(&mut st.requests))
        };

        let count = requests.len();
        let mut exception = None;
        for out in requests {
            match connection.send_async_request(&out) {
                Ok(_) => {}
                Err(RpcError::Retry(cause)) => {
                    debug!(operation = %out.operation(), cause = %cause, "connection died while flushing, resending");
                    self.clear_from_cache();
                    out.retry_exception(*cause.clone());
                    exception = Some(*cause);
                }
                Err(ex) => {
                    out.exception(ex.clone());
                    exception = Some(ex);
                }
            }
        }

        if exception.is_none() && self.reference.cache_connection {
            if let Some(cache) = self.cache.upgrade() {
                let direct = RequestHandler::Direct(connection.clone()).wrap(self.instance.executor.as_ref());
                cache.replace_pending(self, direct);
            }
        }

        {
            let mut st = lock(&self.state);
            st.initialized = exception.is_none();
            st.exception = exception;
            st.flushing = false;
        }
        self.cond.notify_all();
        self.settled.send_replace(true);
        debug!(connection = %connection.id(), flushed = count, "queued requests flushed");
    }

    fn set_exception(self: &Arc<Self>, ex: RpcError) {
        let requests = {
            let mut st = lock(&self.state);
            if st.exception.is_some() {
                return;
            }
            st.exception = Some(ex.clone());
            st.flushing = false;
            std::mem::take(&mut st.requests)
        };
        self.cond.notify_all();
        self.settled.send_replace(true);
        info!(proxy = %self.reference, error = %ex, failed = requests.len(), "connection establishment failed");

        self.clear_from_cache();
        for out in requests {
            out.exception(ex.clone());
        }
    }

    fn clear_from_cache(self: &Arc<Self>) {
        if let Some(cache) = self.cache.upgrade() {
            cache.clear_pending(self);
        }
    }

    /// Waits for establishment and returns the connection.
    pub(crate) async fn get_connection(&self) -> Result<Connection> {
        let mut settled = self.settled.subscribe();
        let _ = settled.wait_for(|settled| *settled).await;
        let st = lock(&self.state);
        match (&st.connection, &st.exception) {
            (Some(connection), None) => Ok(connection.clone()),
            (_, Some(ex)) => Err(ex.clone()),
            (None, None) => Err(RpcError::NoEndpoint {
                proxy: self.reference.to_string(),
            }),
        }
    }
}

impl CancellationHandler for ConnectRequestHandler {
    fn request_canceled(&self, out: &Arc<OutgoingAsync>, ex: RpcError) {
        {
            let st = lock(&self.state);
            if let Ok((false, mut st)) = self.initialized(st) {
                if let Some(pos) = st.requests.iter().position(|r| Arc::ptr_eq(r, out)) {
                    st.requests.remove(pos);
                    drop(st);
                    debug!(operation = %out.operation(), "queued request canceled");
                    out.exception(ex);
                    return;
                }
            }
        }
        out.cancel_after_handoff(self as *const Self as *const (), ex);
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Runs closures one at a time on a dedicated thread.
pub(crate) struct SerialExecutor {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
}

impl fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("running", &lock(&self.tx).is_some())
            .finish()
    }
}

impl SerialExecutor {
    pub(crate) fn start(name: &str) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .map_err(|e| RpcError::Initialization {
                reason: format!("failed to start request executor: {e}"),
            })?;
        Ok(Arc::new(Self {
            tx: Mutex::new(Some(tx)),
        }))
    }

    /// Runs `f` on the executor thread and waits for its result.
    pub(crate) fn execute<R: Send + 'static>(&self, f: impl FnOnce() -> R + Send + 'static) -> Result<R> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            let _ = reply_tx.send(f());
        });
        {
            let tx = lock(&self.tx);
            let Some(tx) = tx.as_ref() else {
                return Err(RpcError::CommunicatorDestroyed);
            };
            tx.send(job).map_err(|_| RpcError::CommunicatorDestroyed)?;
        }
        reply_rx.recv().map_err(|_| RpcError::CommunicatorDestroyed)
    }

    /// Stops accepting work; the thread exits after the queued jobs.
    pub(crate) fn shutdown(&self) {
        lock(&self.tx).take();
    }
}

/// Drives another handler's sends from the serial executor.
pub(crate) struct QueueRequestHandler {
    delegate: RequestHandler,
    executor: Arc<SerialExecutor>,
}

impl QueueRequestHandler {
    fn send_async_request(&self, out: &Arc<OutgoingAsync>) -> Result<AsyncStatus> {
        let delegate = self.delegate.clone();
        let out = out.clone();
        self.executor
            .execute(move || delegate.send_async_request(&out))?
    }
}

/// Per-proxy handler cache.
pub(crate) struct RequestHandlerCache {
    reference: Arc<Reference>,
    instance: Arc<Instance>,
    cached: Mutex<Option<RequestHandler>>,
}

impl fmt::Debug for RequestHandlerCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandlerCache")
            .field("reference", &self.reference.to_string())
            .field("cached", &*lock(&self.cached))
            .finish()
    }
}

impl RequestHandlerCache {
    pub(crate) fn new(reference: Arc<Reference>, instance: Arc<Instance>) -> Arc<Self> {
        Arc::new(Self {
            reference,
            instance,
            cached: Mutex::new(None),
        })
    }

    /// Returns the cached handler, starting a connection if there is none.
    pub(crate) fn get(self: &Arc<Self>) -> Result<RequestHandler> {
        self.instance.check_destroyed()?;
        let executor = self.instance.executor.as_ref();

        if let ReferenceTarget::Fixed(connection) = &self.reference.target {
            connection.throw_exception()?;
            return Ok(RequestHandler::Fixed(connection.clone()).wrap(executor));
        }

        let (pending, handler) = {
            let mut cached = lock(&self.cached);
            if self.reference.cache_connection {
                if let Some(handler) = cached.as_ref() {
                    return Ok(handler.clone());
                }
            }
            let pending = Arc::new(ConnectRequestHandler::new(
                self.reference.clone(),
                Arc::downgrade(self),
                self.instance.clone(),
            ));
            let handler = RequestHandler::Pending(pending.clone()).wrap(executor);
            if self.reference.cache_connection {
                *cached = Some(handler.clone());
            }
            (pending, handler)
        };
        pending.connect();
        Ok(handler)
    }

    /// Drops `handler` if it is still the cached one.
    pub(crate) fn clear(&self, handler: &RequestHandler) {
        let mut cached = lock(&self.cached);
        if cached.as_ref().is_some_and(|h| h.same(handler)) {
            debug!(proxy = %self.reference, handler = ?handler, "cleared request handler");
            *cached = None;
        }
    }

    fn clear_pending(&self, pending: &Arc<ConnectRequestHandler>) {
        let mut cached = lock(&self.cached);
        if cached.as_ref().is_some_and(|h| h.is_pending(pending)) {
            *cached = None;
        }
    }

    /// Swaps a pending handler for `handler` once its connection is up.
    fn replace_pending(&self, pending: &Arc<ConnectRequestHandler>, handler: RequestHandler) {
        let mut cached = lock(&self.cached);
        if cached.as_ref().is_some_and(|h| h.is_pending(pending)) {
            *cached = Some(handler);
        }
    }

    /// Currently cached handler, if any.
    pub(crate) fn cached(&self) -> Option<RequestHandler> {
        lock(&self.cached).clone()
    }

    /// Waits for the proxy's connection.
    pub(crate) async fn get_connection(self: &Arc<Self>) -> Result<Connection> {
        let mut current = self.get()?;
        loop {
            match current {
                RequestHandler::Direct(connection) | RequestHandler::Fixed(connection) => return Ok(connection),
                RequestHandler::Pending(pending) => return pending.get_connection().await,
                RequestHandler::Queued(queued) => current = queued.delegate.clone(),
            }
        }
    }
}
