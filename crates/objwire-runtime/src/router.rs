//! Router boundary.
//!
//! A routed proxy connects to the router's client endpoints, and its
//! identity must be registered in the router's routing table before any
//! request is flushed on that connection. Registration is asynchronous;
//! [`RouterInfo::add_proxy`] reports synchronous success or defers to a
//! callback.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::endpoint::EndpointResolver;
use crate::error::Result;
use crate::lock;
use crate::message::Identity;

/// Completion of a deferred proxy registration.
pub type AddProxyCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Client-side view of a router.
pub trait RouterInfo: Send + Sync + fmt::Debug {
    /// Endpoints a routed proxy connects to.
    fn client_endpoints(&self) -> Arc<dyn EndpointResolver>;

    /// Registers `identity` with the router.
    ///
    /// Returns true if it is already registered, in which case `callback`
    /// is dropped without being called. Otherwise `callback` runs once the
    /// registration completes or fails.
    fn add_proxy(&self, identity: &Identity, callback: AddProxyCallback) -> bool;
}

/// The remote half of a router: adds identities to its routing table.
#[async_trait]
pub trait ProxyRegistrar: Send + Sync + fmt::Debug {
    /// Adds `identities`; returns the identities the router evicted to make room.
    async fn add_proxies(&self, identities: Vec<Identity>) -> Result<Vec<Identity>>;
}

/// [`RouterInfo`] that remembers which identities the router already knows.
pub struct CachingRouterInfo {
    registrar: Arc<dyn ProxyRegistrar>,
    endpoints: Arc<dyn EndpointResolver>,
    registered: Arc<Mutex<HashSet<Identity>>>,
    runtime: Handle,
}

impl fmt::Debug for CachingRouterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingRouterInfo")
            .field("registrar", &self.registrar)
            .field("registered", &lock(&self.registered).len())
            .finish()
    }
}

impl CachingRouterInfo {
    /// Creates router info over `registrar`, connecting through `endpoints`.
    pub fn new(
        registrar: Arc<dyn ProxyRegistrar>,
        endpoints: Arc<dyn EndpointResolver>,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            registrar,
            endpoints,
            registered: Arc::new(Mutex::new(HashSet::new())),
            runtime,
        })
    }

    /// True if `identity` is known to be in the routing table.
    pub fn is_registered(&self, identity: &Identity) -> bool {
        lock(&self.registered).contains(identity)
    }

    /// Forgets every registration; the next invocation re-registers.
    pub fn clear_cache(&self) {
        lock(&self.registered).clear();
    }
}

impl RouterInfo for CachingRouterInfo {
    fn client_endpoints(&self) -> Arc<dyn EndpointResolver> {
        self.endpoints.clone()
    }

    fn add_proxy(&self, identity: &Identity, callback: AddProxyCallback) -> bool {
        if self.is_registered(identity) {
            return true;
        }
        let registrar = self.registrar.clone();
        let registered = self.registered.clone();
        let identity = identity.clone();
        self.runtime.spawn(async move {
            match registrar.add_proxies(vec![identity.clone()]).await {
                Ok(evicted) => {
                    {
                        let mut set = lock(&registered);
                        for gone in &evicted {
                            set.remove(gone);
                        }
                        set.insert(identity.clone());
                    }
                    debug!(identity = %identity, evicted = evicted.len(), "proxy registered with router");
                    callback(Ok(()));
                }
                Err(ex) => {
                    warn!(identity = %identity, error = %ex, "router rejected proxy registration");
                    callback(Err(ex));
                }
            }
        });
        false
    }
}
