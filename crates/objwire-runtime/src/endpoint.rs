//! Endpoint resolution boundary.
//!
//! A proxy reference resolves to an ordered list of connectors. Resolution
//! may be asynchronous (a locator lookup); the runtime only consumes the
//! result and tells the resolver when its answer turned out to be stale.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, RpcError};
use crate::transport::Connector;

/// Produces the connectors a proxy may use, in preference order.
#[async_trait]
pub trait EndpointResolver: Send + Sync + fmt::Debug {
    /// Resolves the current endpoint list. An empty list is not an error
    /// here; the caller reports it as `NoEndpoint`.
    async fn resolve(&self) -> Result<Vec<Arc<dyn Connector>>>;

    /// Called after connecting to every resolved endpoint failed.
    fn invalidate(&self) {}
}

/// A fixed endpoint list.
#[derive(Debug, Clone)]
pub struct FixedEndpoints {
    connectors: Vec<Arc<dyn Connector>>,
}

impl FixedEndpoints {
    /// Wraps `connectors`.
    pub fn new(connectors: Vec<Arc<dyn Connector>>) -> Self {
        Self { connectors }
    }
}

#[async_trait]
impl EndpointResolver for FixedEndpoints {
    async fn resolve(&self) -> Result<Vec<Arc<dyn Connector>>> {
        Ok(self.connectors.clone())
    }
}

/// Adapter-id to endpoint registry, the in-process stand-in for a locator.
///
/// Proxies created through [`EndpointTable::resolver`] look up the adapter
/// on every connection attempt, so re-registering an adapter redirects new
/// connections without touching existing proxies.
#[derive(Debug, Default)]
pub struct EndpointTable {
    adapters: RwLock<HashMap<String, Vec<Arc<dyn Connector>>>>,
}

impl EndpointTable {
    /// Creates an empty table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers (or replaces) the endpoints of `adapter_id`.
    pub fn register(&self, adapter_id: impl Into<String>, connectors: Vec<Arc<dyn Connector>>) {
        let adapter_id = adapter_id.into();
        debug!(adapter = %adapter_id, endpoints = connectors.len(), "registered adapter endpoints");
        self.adapters
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(adapter_id, connectors);
    }

    /// Removes `adapter_id`; returns true if it was registered.
    pub fn unregister(&self, adapter_id: &str) -> bool {
        self.adapters
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(adapter_id)
            .is_some()
    }

    /// Resolver that looks up `adapter_id` in this table.
    pub fn resolver(self: &Arc<Self>, adapter_id: impl Into<String>) -> Arc<dyn EndpointResolver> {
        Arc::new(AdapterResolver {
            table: self.clone(),
            adapter_id: adapter_id.into(),
        })
    }

    fn lookup(&self, adapter_id: &str) -> Option<Vec<Arc<dyn Connector>>> {
        self.adapters
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(adapter_id)
            .cloned()
    }
}

#[derive(Debug)]
struct AdapterResolver {
    table: Arc<EndpointTable>,
    adapter_id: String,
}

#[async_trait]
impl EndpointResolver for AdapterResolver {
    async fn resolve(&self) -> Result<Vec<Arc<dyn Connector>>> {
        self.table
            .lookup(&self.adapter_id)
            .ok_or_else(|| RpcError::NoEndpoint {
                proxy: format!("adapter {}", self.adapter_id),
            })
    }

    fn invalidate(&self) {
        debug!(adapter = %self.adapter_id, "endpoint lookup invalidated");
    }
}

/// Keeps only connectors matching the invocation's transport kind.
pub(crate) fn filter_connectors(connectors: Vec<Arc<dyn Connector>>, datagram: bool) -> Vec<Arc<dyn Connector>> {
    connectors
        .into_iter()
        .filter(|c| c.is_datagram() == datagram)
        .collect()
}
