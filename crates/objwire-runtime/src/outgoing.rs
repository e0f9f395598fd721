//! In-flight invocations.
//!
//! An [`OutgoingAsync`] owns the framed request of one logical call and its
//! completion state. It is reused across retries: every send attempt bumps
//! an attempt counter, and callbacks from connections carry the attempt they
//! belong to so that late notifications for an abandoned attempt are ignored.
//! Completion happens exactly once and resolves the caller's
//! [`InvocationFuture`].

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cancel::{self, CancellationHandler};
use crate::connection::Connection;
use crate::error::{Result, RpcError};
use crate::lock;
use crate::message::OperationMode;
use crate::proxy::Proxy;
use crate::request_handler::RequestHandler;

/// Where an invocation is sent.
pub(crate) enum InvocationTarget {
    /// Through a proxy's request handler; retries go through the retry queue.
    Proxy {
        /// Issuing proxy.
        proxy: Proxy,
        /// Operation mode, drives retry eligibility.
        mode: OperationMode,
    },
    /// Straight to a connection; never retried.
    Connection(Connection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Pending,
    Sent,
    Done { sent: bool },
}

#[derive(Default)]
struct InvocationState {
    attempt: u32,
    attempt_done: bool,
    sent: bool,
    completed: bool,
    retry_count: usize,
    handler: Option<RequestHandler>,
    cancellation_handler: Option<Arc<dyn CancellationHandler>>,
    cancellation_exception: Option<RpcError>,
    timeout_task: Option<JoinHandle<()>>,
}

/// One logical call, from first send to completion.
pub struct OutgoingAsync {
    target: InvocationTarget,
    operation: String,
    twoway: bool,
    compress: bool,
    batch_request_num: Option<usize>,
    message: Bytes,
    state: Mutex<InvocationState>,
    completion: Mutex<Option<oneshot::Sender<Result<Bytes>>>>,
    progress: watch::Sender<Progress>,
}

impl std::fmt::Debug for OutgoingAsync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingAsync")
            .field("operation", &self.operation)
            .field("twoway", &self.twoway)
            .field("batch_request_num", &self.batch_request_num)
            .finish()
    }
}

impl OutgoingAsync {
    fn create(
        target: InvocationTarget,
        operation: String,
        twoway: bool,
        compress: bool,
        batch_request_num: Option<usize>,
        message: Bytes,
    ) -> (Arc<Self>, InvocationFuture) {
        let (tx, rx) = oneshot::channel();
        let (progress, progress_rx) = watch::channel(Progress::Pending);
        let out = Arc::new(Self {
            target,
            operation,
            twoway,
            compress,
            batch_request_num,
            message,
            state: Mutex::new(InvocationState::default()),
            completion: Mutex::new(Some(tx)),
            progress,
        });
        let future = InvocationFuture {
            out: Some(out.clone()),
            rx,
            progress: progress_rx,
        };
        (out, future)
    }

    /// A request issued on `proxy`; `message` is the framed request.
    pub(crate) fn request(
        proxy: Proxy,
        operation: &str,
        mode: OperationMode,
        message: Bytes,
    ) -> (Arc<Self>, InvocationFuture) {
        let twoway = proxy.mode().is_twoway();
        let compress = proxy.is_compressed();
        Self::create(
            InvocationTarget::Proxy { proxy, mode },
            operation.to_string(),
            twoway,
            compress,
            None,
            message,
        )
    }

    /// Sends a proxy's swapped batch queue.
    pub(crate) fn proxy_flush_batch(
        proxy: Proxy,
        message: Bytes,
        request_num: usize,
        compress: bool,
    ) -> (Arc<Self>, InvocationFuture) {
        Self::create(
            InvocationTarget::Proxy {
                proxy,
                mode: OperationMode::Normal,
            },
            "flush_batch_requests".to_string(),
            false,
            compress,
            Some(request_num),
            message,
        )
    }

    /// Sends a connection's swapped batch queue.
    pub(crate) fn connection_flush_batch(
        connection: Connection,
        message: Bytes,
        request_num: usize,
        compress: bool,
    ) -> (Arc<Self>, InvocationFuture) {
        Self::create(
            InvocationTarget::Connection(connection),
            "flush_batch_requests".to_string(),
            false,
            compress,
            Some(request_num),
            message,
        )
    }

    /// Operation name.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// True if a reply is expected.
    pub fn is_twoway(&self) -> bool {
        self.twoway
    }

    pub(crate) fn compress(&self) -> bool {
        self.compress
    }

    pub(crate) fn batch_request_num(&self) -> Option<usize> {
        self.batch_request_num
    }

    /// Framed message with the request id and size still unset.
    pub(crate) fn message(&self) -> &[u8] {
        &self.message
    }

    pub(crate) fn attempt(&self) -> u32 {
        lock(&self.state).attempt
    }

    /// True while `attempt` is the live attempt of an unfinished invocation.
    pub(crate) fn is_pending(&self, attempt: u32) -> bool {
        let st = lock(&self.state);
        !st.completed && st.attempt == attempt && !st.attempt_done
    }

    /// Starts the invocation.
    pub(crate) fn invoke(self: &Arc<Self>) {
        match &self.target {
            InvocationTarget::Proxy { proxy, .. } => {
                if let Some(timeout) = proxy.invocation_timeout() {
                    self.schedule_timeout(proxy, timeout);
                }
                self.invoke_impl();
            }
            InvocationTarget::Connection(connection) => {
                lock(&self.state).attempt = 1;
                if let Err(ex) = connection.send_async_request(self) {
                    self.complete(Err(ex.into_cause()));
                }
            }
        }
    }

    fn schedule_timeout(self: &Arc<Self>, proxy: &Proxy, timeout: Duration) {
        let weak = Arc::downgrade(self);
        let operation = self.operation.clone();
        let task = proxy.runtime().spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(out) = weak.upgrade() {
                debug!(operation = %operation, "invocation timed out");
                out.cancel(RpcError::InvocationTimeout { operation });
            }
        });
        let mut st = lock(&self.state);
        if st.completed {
            task.abort();
        } else {
            st.timeout_task = Some(task);
        }
    }

    fn invoke_impl(self: &Arc<Self>) {
        let InvocationTarget::Proxy { proxy, .. } = &self.target else {
            return;
        };
        loop {
            {
                let mut st = lock(&self.state);
                if st.completed {
                    return;
                }
                st.attempt += 1;
                st.attempt_done = false;
                st.sent = false;
            }

            let mut used = None;
            let result = proxy.request_handler().and_then(|handler| {
                lock(&self.state).handler = Some(handler.clone());
                used = Some(handler.clone());
                handler.send_async_request(self)
            });
            let ex = match result {
                Ok(_) => return,
                Err(ex) => ex,
            };

            if let RpcError::Retry(cause) = &ex {
                debug!(operation = %self.operation, cause = %cause, "connection unusable, resending");
                if let Some(handler) = &used {
                    proxy.clear_request_handler(handler);
                }
                continue;
            }

            match self.handle_exception(ex) {
                Ok(delay) if delay.is_zero() => continue,
                Ok(delay) => {
                    self.schedule_retry(proxy, delay);
                    return;
                }
                Err(ex) => {
                    self.complete(Err(ex));
                    return;
                }
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, proxy: &Proxy, delay: Duration) {
        if let Err(ex) = proxy.retry_queue().add(self, delay) {
            self.complete(Err(ex));
        }
    }

    /// Clears the failed handler from the proxy and decides on a retry.
    fn handle_exception(&self, ex: RpcError) -> Result<Duration> {
        let InvocationTarget::Proxy { proxy, mode } = &self.target else {
            return Err(ex.into_cause());
        };
        let (handler, sent) = {
            let mut st = lock(&self.state);
            (st.handler.take(), st.sent)
        };
        if let Some(handler) = &handler {
            proxy.clear_request_handler(handler);
        }
        let mut st = lock(&self.state);
        crate::retry::check_retry_after_exception(
            ex,
            *mode,
            sent,
            &mut st.retry_count,
            proxy.retry_intervals(),
        )
    }

    /// Marks the current attempt finished; false if it is stale.
    fn finish_attempt(&self, attempt: u32) -> bool {
        let mut st = lock(&self.state);
        if st.completed || st.attempt != attempt || st.attempt_done {
            return false;
        }
        st.attempt_done = true;
        true
    }

    /// The request of `attempt` was written to the transport.
    pub(crate) fn attempt_sent(self: &Arc<Self>, attempt: u32) {
        let done = {
            let mut st = lock(&self.state);
            if st.completed || st.attempt != attempt || st.attempt_done {
                return;
            }
            st.sent = true;
            if !self.twoway {
                st.attempt_done = true;
            }
            !self.twoway
        };
        self.progress.send_if_modified(|p| {
            if *p == Progress::Pending {
                *p = Progress::Sent;
                true
            } else {
                false
            }
        });
        if done {
            self.complete(Ok(Bytes::new()));
        }
    }

    /// The reply of `attempt` arrived.
    pub(crate) fn attempt_response(self: &Arc<Self>, attempt: u32, result: Result<Bytes>) {
        if !self.finish_attempt(attempt) {
            return;
        }
        lock(&self.state).sent = true;
        self.complete(result);
    }

    /// `attempt` failed locally; the invocation is retried if allowed.
    pub(crate) fn attempt_exception(self: &Arc<Self>, attempt: u32, ex: RpcError) {
        if self.finish_attempt(attempt) {
            self.fail(ex);
        }
    }

    /// Fails the invocation at whatever stage it is in. The caller owns the
    /// invocation exclusively, having just removed it from its own queue.
    pub(crate) fn exception(self: &Arc<Self>, ex: RpcError) {
        if self.take_over() {
            self.fail(ex);
        }
    }

    fn take_over(&self) -> bool {
        let mut st = lock(&self.state);
        if st.completed {
            return false;
        }
        st.attempt_done = true;
        true
    }

    fn fail(self: &Arc<Self>, ex: RpcError) {
        match &self.target {
            InvocationTarget::Connection(_) => {
                self.complete(Err(ex.into_cause()));
            }
            InvocationTarget::Proxy { proxy, .. } => match self.handle_exception(ex) {
                Ok(delay) => self.schedule_retry(proxy, delay),
                Err(ex) => {
                    self.complete(Err(ex));
                }
            },
        }
    }

    /// The connection picked for a queued request died before the request
    /// went out; resend immediately without counting a retry.
    pub(crate) fn retry_exception(self: &Arc<Self>, ex: RpcError) {
        if !self.take_over() {
            return;
        }
        match &self.target {
            InvocationTarget::Proxy { proxy, .. } => {
                let handler = lock(&self.state).handler.take();
                if let Some(handler) = &handler {
                    proxy.clear_request_handler(handler);
                }
                self.schedule_retry(proxy, Duration::ZERO);
            }
            InvocationTarget::Connection(_) => {
                self.complete(Err(ex.into_cause()));
            }
        }
    }

    /// Runs a scheduled retry.
    pub(crate) fn retry(self: &Arc<Self>) {
        self.invoke_impl();
    }

    /// Completes the invocation with `ex`, bypassing retries.
    pub(crate) fn abort(&self, ex: RpcError) {
        self.complete(Err(ex));
    }

    /// Installs the handler responsible for cancelling the next stage.
    ///
    /// Fails with the pending cancellation if the invocation was cancelled
    /// while no handler was installed.
    pub(crate) fn cancelable(&self, handler: Arc<dyn CancellationHandler>) -> Result<()> {
        let mut st = lock(&self.state);
        if let Some(ex) = st.cancellation_exception.take() {
            return Err(ex);
        }
        st.cancellation_handler = Some(handler);
        Ok(())
    }

    /// Cancels the invocation with `ex` (a cancel or timeout error).
    pub(crate) fn cancel(self: &Arc<Self>, ex: RpcError) {
        let handler = {
            let mut st = lock(&self.state);
            if st.completed {
                return;
            }
            match &st.cancellation_handler {
                Some(handler) => handler.clone(),
                None => {
                    st.cancellation_exception = Some(ex);
                    return;
                }
            }
        };
        handler.request_canceled(self, ex);
    }

    /// Re-routes a cancel that reached `stale` after it handed the
    /// invocation on. Parks the cancel until the next stage installs itself.
    pub(crate) fn cancel_after_handoff(self: &Arc<Self>, stale: *const (), ex: RpcError) {
        let handler = {
            let mut st = lock(&self.state);
            if st.completed {
                return;
            }
            match &st.cancellation_handler {
                Some(handler) if !cancel::is_handler(handler, stale) => handler.clone(),
                _ => {
                    st.cancellation_handler = None;
                    st.cancellation_exception = Some(ex);
                    return;
                }
            }
        };
        handler.request_canceled(self, ex);
    }

    /// Completes the invocation; returns false if it already completed.
    pub(crate) fn complete(&self, result: Result<Bytes>) -> bool {
        let (timeout_task, handler, cancellation_handler, sent) = {
            let mut st = lock(&self.state);
            if st.completed {
                return false;
            }
            st.completed = true;
            (
                st.timeout_task.take(),
                st.handler.take(),
                st.cancellation_handler.take(),
                st.sent,
            )
        };
        drop(handler);
        drop(cancellation_handler);
        if let Some(task) = timeout_task {
            task.abort();
        }
        let sent = sent || result.is_ok();
        self.progress.send_replace(Progress::Done { sent });
        if let Some(tx) = lock(&self.completion).take() {
            let _ = tx.send(result);
        }
        true
    }
}

/// Resolves to the reply payload of an invocation.
///
/// Dropping the future does not cancel the invocation; use
/// [`cancel`](Self::cancel).
pub struct InvocationFuture {
    out: Option<Arc<OutgoingAsync>>,
    rx: oneshot::Receiver<Result<Bytes>>,
    progress: watch::Receiver<Progress>,
}

impl std::fmt::Debug for InvocationFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationFuture")
            .field("progress", &*self.progress.borrow())
            .finish()
    }
}

impl InvocationFuture {
    /// An already completed invocation.
    pub(crate) fn ready(result: Result<Bytes>) -> Self {
        let (tx, rx) = oneshot::channel();
        let sent = result.is_ok();
        let _ = tx.send(result);
        let (_progress, progress_rx) = watch::channel(Progress::Done { sent });
        Self {
            out: None,
            rx,
            progress: progress_rx,
        }
    }

    /// Cancels the invocation. A late reply is discarded.
    pub fn cancel(&self) {
        if let Some(out) = &self.out {
            out.cancel(RpcError::InvocationCanceled {
                operation: out.operation.clone(),
            });
        }
    }

    /// True once the request was written to a transport.
    pub fn is_sent(&self) -> bool {
        matches!(
            *self.progress.borrow(),
            Progress::Sent | Progress::Done { sent: true }
        )
    }

    /// True once the invocation completed.
    pub fn is_completed(&self) -> bool {
        matches!(*self.progress.borrow(), Progress::Done { .. })
    }

    /// Waits until the request is written or the invocation completes.
    /// Returns whether the request was sent.
    pub async fn sent(&mut self) -> bool {
        match self.progress.wait_for(|p| *p != Progress::Pending).await {
            Ok(p) => matches!(*p, Progress::Sent | Progress::Done { sent: true }),
            Err(_) => false,
        }
    }
}

impl Future for InvocationFuture {
    type Output = Result<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::CommunicatorDestroyed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
