//! Cancellation hand-off for in-flight invocations.
//!
//! An invocation has at most one active cancellation handler at a time: the
//! connect handler while a connection is being established, the connection
//! once the request is written, or a retry task while a retry is scheduled.
//! Each stage installs itself through `OutgoingAsync::cancelable`, and a
//! cancel is routed to whichever handler is current.

use std::sync::Arc;

use crate::error::RpcError;
use crate::outgoing::OutgoingAsync;

/// Receives cancellation of an invocation it currently owns.
pub trait CancellationHandler: Send + Sync {
    /// Called outside the invocation's lock. The handler must tolerate an
    /// invocation that already completed.
    fn request_canceled(&self, out: &Arc<OutgoingAsync>, ex: RpcError);
}

/// True if `handler` is the object at `addr`.
pub(crate) fn is_handler(handler: &Arc<dyn CancellationHandler>, addr: *const ()) -> bool {
    std::ptr::eq(Arc::as_ptr(handler) as *const (), addr)
}
