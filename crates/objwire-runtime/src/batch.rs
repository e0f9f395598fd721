//! Batch request queue.
//!
//! Batch-oneway and batch-datagram invocations are marshaled into one shared
//! buffer and sent later as a single `RequestBatch` message. Only one caller
//! marshals into the buffer at a time; the exclusion is a small gate state
//! machine over a `Condvar` rather than a lock held across marshaling, so
//! queue metadata stays readable while a request is being written.
//!
//! A flush may run while the buffer is in use only once the marshaling caller
//! has handed the buffer back (`MarshalingFlushable`), which is what lets the
//! size-triggered auto flush run from inside `finish_batch_request`.

use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::debug;

use crate::error::{Result, RpcError};
use crate::protocol::{self, BATCH_REQUEST_HEADER_SIZE};
use crate::stream::OutputStream;
use crate::{lock, wait};

/// Whatever owns a batch queue and can flush it.
pub trait BatchTarget: Send + Sync {
    /// Starts an asynchronous flush of the owner's batch queue.
    fn flush_batch_requests_async(&self);

    /// Whether requests from this target ask for compression.
    fn is_compressed(&self) -> bool;
}

/// View of a just-marshaled request handed to a [`BatchRequestInterceptor`].
pub struct BatchRequest<'a> {
    queue: &'a BatchRequestQueue,
    target: &'a dyn BatchTarget,
    operation: &'a str,
    size: usize,
    enqueued: Cell<bool>,
}

impl<'a> BatchRequest<'a> {
    /// Marshaled size of the request in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Operation name.
    pub fn operation(&self) -> &str {
        self.operation
    }

    /// The proxy (or connection) the request was issued on.
    pub fn proxy(&self) -> &dyn BatchTarget {
        self.target
    }

    /// Keeps the request in the batch. Without this call it is discarded.
    pub fn enqueue(&self) {
        if !self.enqueued.replace(true) {
            self.queue.enqueue_batch_request(self.target.is_compressed());
        }
    }
}

/// Decides per request whether it joins the batch.
pub trait BatchRequestInterceptor: Send + Sync {
    /// Called with the request, the number of requests already queued and
    /// the number of bytes they occupy. The request is kept only if this
    /// calls [`BatchRequest::enqueue`].
    fn intercept(&self, request: &BatchRequest<'_>, queue_count: usize, queue_size: usize);
}

impl<F> BatchRequestInterceptor for F
where
    F: Fn(&BatchRequest<'_>, usize, usize) + Send + Sync,
{
    fn intercept(&self, request: &BatchRequest<'_>, queue_count: usize, queue_size: usize) {
        self(request, queue_count, queue_size)
    }
}

/// Result of taking the queued batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSwap {
    /// Number of requests in the batch.
    pub request_num: usize,
    /// Whether any queued request asked for compression.
    pub compress: bool,
}

/// Exclusion gate between marshaling callers and flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchGate {
    /// Nobody is marshaling.
    Idle,
    /// A caller owns the buffer; flushes wait.
    Marshaling,
    /// A caller is finishing and has returned the buffer; flushes may proceed.
    MarshalingFlushable,
}

struct BatchState {
    stream: OutputStream,
    gate: BatchGate,
    marker: usize,
    request_num: usize,
    compress: bool,
    exception: Option<RpcError>,
}

/// Accumulates marshaled batch requests for one proxy or connection.
pub struct BatchRequestQueue {
    state: Mutex<BatchState>,
    cond: Condvar,
    interceptor: Option<Arc<dyn BatchRequestInterceptor>>,
    max_size: usize,
}

impl fmt::Debug for BatchRequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = lock(&self.state);
        f.debug_struct("BatchRequestQueue")
            .field("request_num", &st.request_num)
            .field("size", &st.stream.size())
            .field("gate", &st.gate)
            .field("max_size", &self.max_size)
            .finish()
    }
}

/// Releases the gate and drops uncommitted bytes, even on unwind.
struct ReleaseOnDrop<'a> {
    queue: &'a BatchRequestQueue,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        let mut st = lock(&self.queue.state);
        let marker = st.marker;
        st.stream.resize(marker);
        self.queue.release(&mut st);
    }
}

impl BatchRequestQueue {
    /// Creates an empty queue.
    ///
    /// `max_size` of 0 disables the size-triggered auto flush.
    pub fn new(max_size: usize, interceptor: Option<Arc<dyn BatchRequestInterceptor>>) -> Self {
        let mut stream = OutputStream::new();
        protocol::write_batch_request_header(&mut stream);
        Self {
            state: Mutex::new(BatchState {
                stream,
                gate: BatchGate::Idle,
                marker: BATCH_REQUEST_HEADER_SIZE,
                request_num: 0,
                compress: false,
                exception: None,
            }),
            cond: Condvar::new(),
            interceptor,
            max_size,
        }
    }

    fn acquire<'a>(&'a self, mut st: MutexGuard<'a, BatchState>) -> Result<MutexGuard<'a, BatchState>> {
        loop {
            if let Some(ex) = &st.exception {
                return Err(ex.clone());
            }
            if st.gate == BatchGate::Idle {
                st.gate = BatchGate::Marshaling;
                return Ok(st);
            }
            st = wait(&self.cond, st);
        }
    }

    fn try_acquire_for_flush<'a>(&'a self, mut st: MutexGuard<'a, BatchState>) -> MutexGuard<'a, BatchState> {
        while st.gate == BatchGate::Marshaling {
            st = wait(&self.cond, st);
        }
        st
    }

    fn release(&self, st: &mut BatchState) {
        st.gate = BatchGate::Idle;
        self.cond.notify_all();
    }

    /// Waits for exclusive use of the buffer and hands it to the caller in `os`.
    ///
    /// The caller appends one request body to `os`, then calls
    /// [`finish_batch_request`](Self::finish_batch_request) or
    /// [`abort_batch_request`](Self::abort_batch_request).
    pub fn prepare_batch_request(&self, os: &mut OutputStream) -> Result<()> {
        let mut st = self.acquire(lock(&self.state))?;
        st.marker = st.stream.size();
        st.stream.swap(os);
        Ok(())
    }

    /// Returns the buffer and commits the request appended to it.
    ///
    /// With an interceptor installed the request is only kept if the
    /// interceptor calls [`BatchRequest::enqueue`].
    pub fn finish_batch_request(&self, os: &mut OutputStream, target: &dyn BatchTarget, operation: &str) {
        let _release = ReleaseOnDrop { queue: self };

        let flush = {
            let mut st = lock(&self.state);
            st.stream.swap(os);
            st.gate = BatchGate::MarshalingFlushable;
            self.max_size > 0 && st.stream.size() >= self.max_size
        };

        if flush {
            debug!(operation, max_size = self.max_size, "batch queue full, flushing");
            target.flush_batch_requests_async();
        }

        match &self.interceptor {
            Some(interceptor) => {
                let (count, queued_bytes, size) = {
                    let st = lock(&self.state);
                    (st.request_num, st.marker, st.stream.size() - st.marker)
                };
                let request = BatchRequest {
                    queue: self,
                    target,
                    operation,
                    size,
                    enqueued: Cell::new(false),
                };
                interceptor.intercept(&request, count, queued_bytes);
            }
            None => self.enqueue_batch_request(target.is_compressed()),
        }
    }

    /// Discards the request being marshaled and returns the buffer.
    pub fn abort_batch_request(&self, os: &mut OutputStream) {
        let mut st = lock(&self.state);
        if st.gate != BatchGate::Idle {
            st.stream.swap(os);
            let marker = st.marker;
            st.stream.resize(marker);
            self.release(&mut st);
        }
    }

    fn enqueue_batch_request(&self, compress: bool) {
        let mut st = lock(&self.state);
        st.marker = st.stream.size();
        st.request_num += 1;
        st.compress |= compress;
    }

    /// Moves the queued batch into `os` and resets the queue.
    ///
    /// Bytes of a request still being finished are carried over into the
    /// fresh queue. Returns `None` if nothing is queued.
    pub fn swap(&self, os: &mut OutputStream) -> Option<BatchSwap> {
        let st = lock(&self.state);
        if st.request_num == 0 {
            return None;
        }
        let mut st = self.try_acquire_for_flush(st);
        if st.request_num == 0 {
            return None;
        }

        let in_progress = (st.marker < st.stream.size()).then(|| {
            let marker = st.marker;
            st.stream.split_off(marker)
        });

        let swapped = BatchSwap {
            request_num: st.request_num,
            compress: st.compress,
        };

        let mut fresh = OutputStream::new();
        protocol::write_batch_request_header(&mut fresh);
        std::mem::swap(&mut st.stream, &mut fresh);
        *os = fresh;

        st.request_num = 0;
        st.compress = false;
        st.marker = st.stream.size();
        if let Some(bytes) = in_progress {
            st.stream.write_blob(&bytes);
        }
        Some(swapped)
    }

    /// Poisons the queue: later `prepare_batch_request` calls fail with `ex`.
    pub fn destroy(&self, ex: RpcError) {
        let mut st = lock(&self.state);
        if st.exception.is_none() {
            st.exception = Some(ex);
        }
        self.cond.notify_all();
    }

    /// True if no request is queued.
    pub fn is_empty(&self) -> bool {
        let st = lock(&self.state);
        st.stream.size() == BATCH_REQUEST_HEADER_SIZE
    }
}
