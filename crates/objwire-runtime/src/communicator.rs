//! Communicator: one runtime instance and everything it owns.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::info;

use crate::batch::BatchRequestInterceptor;
use crate::compress::{CompressionStatsSnapshot, MessageCompressor};
use crate::config::RuntimeConfig;
use crate::connection::{Connection, ConnectionSettings};
use crate::endpoint::EndpointResolver;
use crate::error::{Result, RpcError};
use crate::factory::OutgoingConnectionFactory;
use crate::lock;
use crate::message::Identity;
use crate::proxy::{Proxy, Reference, ReferenceTarget};
use crate::request_handler::SerialExecutor;
use crate::retry::RetryQueue;
use crate::router::RouterInfo;
use crate::server::{Dispatcher, ObjectAdapter};

/// Shared state behind a communicator, its proxies and connections.
pub(crate) struct Instance {
    pub(crate) config: RuntimeConfig,
    pub(crate) settings: ConnectionSettings,
    pub(crate) retry_intervals: Vec<Duration>,
    pub(crate) retry_queue: RetryQueue,
    pub(crate) factory: Arc<OutgoingConnectionFactory>,
    pub(crate) executor: Option<Arc<SerialExecutor>>,
    pub(crate) batch_interceptor: Option<Arc<dyn BatchRequestInterceptor>>,
    pub(crate) runtime: Handle,
    destroyed: AtomicBool,
    adapters: Mutex<Vec<ObjectAdapter>>,
}

impl Instance {
    pub(crate) fn check_destroyed(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(RpcError::CommunicatorDestroyed)
        } else {
            Ok(())
        }
    }
}

/// Entry point of the runtime: creates proxies and object adapters and
/// owns the connections, retry queue and executor they share.
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct Communicator {
    instance: Arc<Instance>,
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("connections", &self.connection_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Communicator {
    /// Creates a communicator from `config`.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Creates a communicator whose proxy batch queues run `interceptor`
    /// on every batched request.
    pub fn with_batch_interceptor(config: RuntimeConfig, interceptor: Arc<dyn BatchRequestInterceptor>) -> Result<Self> {
        Self::build(config, Some(interceptor))
    }

    fn build(config: RuntimeConfig, batch_interceptor: Option<Arc<dyn BatchRequestInterceptor>>) -> Result<Self> {
        config.validate().map_err(|e| RpcError::Initialization {
            reason: format!("invalid configuration: {e}"),
        })?;
        let runtime = Handle::try_current().map_err(|e| RpcError::Initialization {
            reason: format!("no tokio runtime: {e}"),
        })?;
        let compressor = Arc::new(MessageCompressor::new(config.enable_compression));
        let settings = ConnectionSettings::new(&config, compressor, runtime.clone());
        let executor = if config.queue_requests {
            Some(SerialExecutor::start("objwire-requests")?)
        } else {
            None
        };
        info!(
            retries = config.retry_intervals_ms.len(),
            idle_timeout_secs = config.idle_timeout_secs,
            compression = config.enable_compression,
            "communicator created"
        );
        Ok(Self {
            instance: Arc::new(Instance {
                retry_intervals: config.retry_intervals(),
                retry_queue: RetryQueue::new(runtime.clone()),
                factory: OutgoingConnectionFactory::new(settings.clone()),
                config,
                settings,
                executor,
                batch_interceptor,
                runtime,
                destroyed: AtomicBool::new(false),
                adapters: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Configuration in effect.
    pub fn config(&self) -> &RuntimeConfig {
        &self.instance.config
    }

    /// Proxy for `identity` at the endpoints `resolver` produces.
    pub fn create_proxy(&self, identity: Identity, resolver: Arc<dyn EndpointResolver>) -> Proxy {
        let target = ReferenceTarget::Routable { resolver, router: None };
        self.proxy(identity, target)
    }

    /// Proxy for `identity` reached through `router`.
    pub fn create_routed_proxy(&self, identity: Identity, router: Arc<dyn RouterInfo>) -> Proxy {
        let target = ReferenceTarget::Routable {
            resolver: router.client_endpoints(),
            router: Some(router),
        };
        self.proxy(identity, target)
    }

    /// Proxy bound to `connection`; it never reconnects.
    pub fn create_fixed_proxy(&self, identity: Identity, connection: Connection) -> Proxy {
        self.proxy(identity, ReferenceTarget::Fixed(connection))
    }

    fn proxy(&self, identity: Identity, target: ReferenceTarget) -> Proxy {
        let reference = Reference::new(identity, target, self.instance.config.invocation_timeout());
        Proxy::new(self.instance.clone(), reference)
    }

    /// Creates an object adapter dispatching to `dispatcher`.
    pub fn create_object_adapter(&self, name: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> ObjectAdapter {
        let adapter = ObjectAdapter::new(name.into(), dispatcher, self.instance.settings.clone());
        lock(&self.instance.adapters).push(adapter.clone());
        adapter
    }

    /// The retry queue.
    pub fn retry_queue(&self) -> &RetryQueue {
        &self.instance.retry_queue
    }

    /// Number of open outgoing connections.
    pub fn connection_count(&self) -> usize {
        self.instance.factory.connection_count()
    }

    /// Compression counters for every connection of this communicator.
    pub fn compression_stats(&self) -> CompressionStatsSnapshot {
        self.instance.settings.compressor.stats()
    }

    /// True once `destroy` was called.
    pub fn is_destroyed(&self) -> bool {
        self.instance.destroyed.load(Ordering::Acquire)
    }

    /// Shuts down: deactivates adapters, closes outgoing connections, fails
    /// pending retries and waits for all of it to finish. Later invocations
    /// fail with `CommunicatorDestroyed`.
    pub async fn destroy(&self) {
        if self.instance.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("destroying communicator");
        let adapters = std::mem::take(&mut *lock(&self.instance.adapters));
        for adapter in &adapters {
            adapter.deactivate();
        }
        self.instance.factory.destroy();
        self.instance.retry_queue.destroy().await;
        self.instance.factory.wait_until_finished().await;
        for adapter in &adapters {
            adapter.wait_for_deactivate().await;
        }
        if let Some(executor) = &self.instance.executor {
            executor.shutdown();
        }
        let stats = self.compression_stats();
        info!(
            compressed = stats.compressions,
            decompressed = stats.decompressions,
            skipped = stats.skipped,
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            "communicator destroyed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = RuntimeConfig {
            connect_timeout_ms: 0,
            ..RuntimeConfig::default()
        };
        assert!(matches!(Communicator::new(config), Err(RpcError::Initialization { .. })));
    }

    #[test]
    fn test_requires_runtime() {
        assert!(matches!(
            Communicator::new(RuntimeConfig::default()),
            Err(RpcError::Initialization { .. })
        ));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let communicator = Communicator::new(RuntimeConfig::default()).unwrap();
        communicator.destroy().await;
        communicator.destroy().await;
        assert!(communicator.is_destroyed());
        assert_eq!(communicator.connection_count(), 0);
    }
}
