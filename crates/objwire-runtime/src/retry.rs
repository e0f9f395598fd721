//! Retry policy and the retry queue.
//!
//! Invocations that fail with a retryable error are parked in the
//! [`RetryQueue`] until their retry delay elapses. A parked [`RetryTask`] is
//! the invocation's cancellation handler; firing, cancellation and queue
//! destruction race for a single claim so exactly one of them acts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cancel::CancellationHandler;
use crate::error::{Result, RpcError};
use crate::lock;
use crate::message::OperationMode;
use crate::outgoing::OutgoingAsync;

/// Decides whether a failed invocation is resent and after which delay.
///
/// `retry_count` counts the retries already granted and is incremented when
/// another one is granted. A close-connection error is granted one extra
/// immediate retry past the configured intervals.
pub fn check_retry_after_exception(
    ex: RpcError,
    mode: OperationMode,
    sent: bool,
    retry_count: &mut usize,
    intervals: &[Duration],
) -> Result<Duration> {
    let ex = ex.into_cause();
    if !ex.is_retryable_local() {
        return Err(ex);
    }
    // Once sent, a non-idempotent request may have run; only a graceful close
    // guarantees it did not.
    if sent && !mode.is_idempotent() && !ex.is_close_connection() {
        return Err(ex);
    }

    *retry_count += 1;
    let delay = if *retry_count == intervals.len() + 1 && ex.is_close_connection() {
        Duration::ZERO
    } else if let Some(delay) = intervals.get(*retry_count - 1) {
        *delay
    } else {
        debug!(error = %ex, retries = *retry_count - 1, "cannot retry, retry limit reached");
        return Err(ex);
    };

    info!(
        error = %ex,
        retry = *retry_count,
        delay_ms = delay.as_millis() as u64,
        "retrying invocation"
    );
    Ok(delay)
}

struct QueueState {
    tasks: HashMap<u64, Arc<RetryTask>>,
    next_id: u64,
    destroyed: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    drained: Notify,
    runtime: Handle,
}

impl QueueInner {
    fn remove(&self, id: u64) {
        let mut st = lock(&self.state);
        st.tasks.remove(&id);
        if st.tasks.is_empty() {
            self.drained.notify_waiters();
        }
    }
}

/// Holds invocations waiting for their retry delay.
#[derive(Clone)]
pub struct RetryQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock(&self.inner.state);
        f.debug_struct("RetryQueue")
            .field("pending", &st.tasks.len())
            .field("destroyed", &st.destroyed)
            .finish()
    }
}

impl RetryQueue {
    /// Creates a queue whose timers run on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    tasks: HashMap::new(),
                    next_id: 0,
                    destroyed: false,
                }),
                drained: Notify::new(),
                runtime,
            }),
        }
    }

    /// Schedules `out` to be resent after `delay`.
    ///
    /// Fails if the queue was destroyed or the invocation was cancelled in
    /// the meantime; the caller then completes the invocation with the error.
    pub(crate) fn add(&self, out: &Arc<OutgoingAsync>, delay: Duration) -> Result<()> {
        let task = {
            let mut st = lock(&self.inner.state);
            if st.destroyed {
                return Err(RpcError::CommunicatorDestroyed);
            }
            st.next_id += 1;
            Arc::new(RetryTask {
                id: st.next_id,
                out: out.clone(),
                claimed: AtomicBool::new(false),
                queue: Arc::downgrade(&self.inner),
                timer: Mutex::new(None),
            })
        };

        out.cancelable(task.clone())?;

        {
            let mut st = lock(&self.inner.state);
            if st.destroyed {
                return Err(RpcError::CommunicatorDestroyed);
            }
            st.tasks.insert(task.id, task.clone());
        }

        let fire = task.clone();
        let timer = self.inner.runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            fire.run();
        });
        *lock(&task.timer) = Some(timer);
        Ok(())
    }

    /// Number of invocations waiting.
    pub fn len(&self) -> usize {
        lock(&self.inner.state).tasks.len()
    }

    /// True if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails every waiting invocation with `CommunicatorDestroyed` and waits
    /// for retries that already started to finish.
    pub async fn destroy(&self) {
        let claimed: Vec<Arc<RetryTask>> = {
            let mut st = lock(&self.inner.state);
            st.destroyed = true;
            let ids: Vec<u64> = st
                .tasks
                .iter()
                .filter(|(_, task)| task.claim())
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| st.tasks.remove(id)).collect()
        };

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "aborting pending retries");
        }
        for task in claimed {
            task.cancel_timer();
            task.out.abort(RpcError::CommunicatorDestroyed);
        }

        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock(&self.inner.state).tasks.is_empty() {
                break;
            }
            notified.await;
        }
    }
}

/// A scheduled resend of one invocation.
pub struct RetryTask {
    id: u64,
    out: Arc<OutgoingAsync>,
    claimed: AtomicBool,
    queue: Weak<QueueInner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RetryTask {
    fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cancel_timer(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
    }

    fn remove(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.remove(self.id);
        }
    }

    fn run(&self) {
        if !self.claim() {
            return;
        }
        self.out.retry();
        self.remove();
    }
}

impl CancellationHandler for RetryTask {
    fn request_canceled(&self, out: &Arc<OutgoingAsync>, ex: RpcError) {
        if self.claim() {
            self.cancel_timer();
            self.remove();
            out.exception(ex);
        } else {
            out.cancel_after_handoff(self as *const Self as *const (), ex);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::communicator::Communicator;
    use crate::config::RuntimeConfig;
    use crate::endpoint::FixedEndpoints;
    use crate::message::Identity;
    use crate::transport::memory;

    fn ms(v: &[u64]) -> Vec<Duration> {
        v.iter().map(|m| Duration::from_millis(*m)).collect()
    }

    fn refused() -> RpcError {
        RpcError::ConnectionRefused {
            peer: "tcp 127.0.0.1:1".into(),
        }
    }

    #[test]
    fn test_retry_intervals_bound_retries() {
        let intervals = ms(&[0, 10, 20]);
        let mut count = 0;
        let delays: Vec<_> = (0..3)
            .map(|_| {
                check_retry_after_exception(refused(), OperationMode::Normal, false, &mut count, &intervals)
                    .unwrap()
            })
            .collect();
        assert_eq!(delays, intervals);
        assert!(matches!(
            check_retry_after_exception(refused(), OperationMode::Normal, false, &mut count, &intervals),
            Err(RpcError::ConnectionRefused { .. })
        ));
    }

    #[test]
    fn test_close_connection_gets_extra_retry() {
        let intervals = ms(&[5]);
        let close = || RpcError::CloseConnection { peer: "p".into() };
        let mut count = 0;
        assert_eq!(
            check_retry_after_exception(close(), OperationMode::Normal, true, &mut count, &intervals).unwrap(),
            Duration::from_millis(5)
        );
        assert_eq!(
            check_retry_after_exception(close(), OperationMode::Normal, true, &mut count, &intervals).unwrap(),
            Duration::ZERO
        );
        assert!(check_retry_after_exception(close(), OperationMode::Normal, true, &mut count, &intervals).is_err());
    }

    #[test]
    fn test_sent_requests_retry_only_when_idempotent() {
        let intervals = ms(&[0]);
        let lost = || RpcError::ConnectionLost {
            peer: "p".into(),
            reason: "reset".into(),
        };
        let mut count = 0;
        assert!(check_retry_after_exception(lost(), OperationMode::Normal, true, &mut count, &intervals).is_err());
        assert_eq!(count, 0);
        assert!(check_retry_after_exception(lost(), OperationMode::Idempotent, true, &mut count, &intervals).is_ok());
        let mut count = 0;
        assert!(check_retry_after_exception(lost(), OperationMode::Nonmutating, true, &mut count, &intervals).is_ok());
    }

    #[test]
    fn test_fatal_errors_never_retried() {
        let intervals = ms(&[0, 0, 0]);
        let fatal = vec![
            RpcError::CommunicatorDestroyed,
            RpcError::InvocationTimeout { operation: "op".into() },
            RpcError::InvocationCanceled { operation: "op".into() },
            RpcError::Marshal { reason: "bad".into() },
            RpcError::ConnectionClosed {
                peer: "p".into(),
                by_application: true,
                reason: "closed".into(),
            },
            RpcError::ObjectNotExist {
                identity: "a".into(),
                facet: None,
                operation: "op".into(),
            },
        ];
        for ex in fatal {
            let mut count = 0;
            assert!(check_retry_after_exception(ex, OperationMode::Idempotent, false, &mut count, &intervals).is_err());
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn test_retry_wrapper_is_unwrapped() {
        let mut count = 0;
        let wrapped = RpcError::Retry(Box::new(refused()));
        assert!(check_retry_after_exception(wrapped, OperationMode::Normal, false, &mut count, &ms(&[])).is_err());
    }

    fn unreachable_config(intervals: &[u64]) -> RuntimeConfig {
        RuntimeConfig {
            retry_intervals_ms: intervals.to_vec(),
            ..RuntimeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_invocation_fails_after_retry_limit() {
        let communicator = Communicator::new(unreachable_config(&[0, 10, 20])).unwrap();
        let (connector, acceptor) = memory::endpoint("refusing");
        drop(acceptor);
        let proxy = communicator.create_proxy(
            Identity::new("target"),
            Arc::new(FixedEndpoints::new(vec![Arc::new(connector)])),
        );

        let err = proxy.invoke("op", OperationMode::Normal, b"", None).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionRefused { .. }), "{err}");
        assert!(communicator.retry_queue().is_empty());
        communicator.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_aborts_pending_retry() {
        let communicator = Communicator::new(unreachable_config(&[60_000])).unwrap();
        let (connector, acceptor) = memory::endpoint("refusing-slow");
        drop(acceptor);
        let proxy = communicator.create_proxy(
            Identity::new("target"),
            Arc::new(FixedEndpoints::new(vec![Arc::new(connector)])),
        );

        let fut = proxy.invoke("op", OperationMode::Normal, b"", None);
        while communicator.retry_queue().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        communicator.destroy().await;
        assert!(matches!(fut.await, Err(RpcError::CommunicatorDestroyed)));
    }

    #[tokio::test]
    async fn test_cancel_pending_retry() {
        let communicator = Communicator::new(unreachable_config(&[60_000])).unwrap();
        let (connector, acceptor) = memory::endpoint("refusing-cancel");
        drop(acceptor);
        let proxy = communicator.create_proxy(
            Identity::new("target"),
            Arc::new(FixedEndpoints::new(vec![Arc::new(connector)])),
        );

        let fut = proxy.invoke("op", OperationMode::Normal, b"", None);
        while communicator.retry_queue().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        fut.cancel();
        assert!(matches!(fut.await, Err(RpcError::InvocationCanceled { .. })));
        assert!(communicator.retry_queue().is_empty());
        communicator.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_racing_retry_has_one_outcome() {
        let outcomes = Arc::new(AtomicUsize::new(0));
        for round in 0..50 {
            let communicator = Communicator::new(unreachable_config(&[1, 1, 1])).unwrap();
            let (connector, acceptor) = memory::endpoint(&format!("race-{round}"));
            drop(acceptor);
            let proxy = communicator.create_proxy(
                Identity::new("target"),
                Arc::new(FixedEndpoints::new(vec![Arc::new(connector)])),
            );

            let fut = proxy.invoke("op", OperationMode::Normal, b"", None);
            while communicator.retry_queue().is_empty() && !fut.is_completed() {
                tokio::task::yield_now().await;
            }
            fut.cancel();
            let result = tokio::time::timeout(Duration::from_secs(5), fut)
                .await
                .expect("invocation hung");
            match result {
                Err(RpcError::InvocationCanceled { .. }) | Err(RpcError::ConnectionRefused { .. }) => {
                    outcomes.fetch_add(1, Ordering::SeqCst);
                }
                other => panic!("unexpected outcome {other:?}"),
            }
            communicator.destroy().await;
        }
        assert_eq!(outcomes.load(Ordering::SeqCst), 50);
    }
}
