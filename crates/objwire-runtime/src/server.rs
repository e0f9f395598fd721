//! Object adapter boundary.
//!
//! An [`ObjectAdapter`] accepts transceivers, runs a server-side
//! [`Connection`] for each and hands incoming requests to its
//! [`Dispatcher`]. Servant lookup is the dispatcher's business.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionId, ConnectionSettings};
use crate::error::RpcError;
use crate::lock;
use crate::message::{IncomingRequest, OutgoingResponse};
use crate::transport::{Acceptor, Transceiver};

/// Handles requests arriving on an adapter's connections.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Produces the response for `request`. Oneway requests have their
    /// response discarded.
    async fn dispatch(&self, request: IncomingRequest) -> OutgoingResponse;
}

#[derive(Default)]
struct AdapterState {
    connections: HashMap<ConnectionId, Connection>,
    accept_tasks: Vec<JoinHandle<()>>,
    deactivated: bool,
}

struct AdapterInner {
    name: String,
    dispatcher: Arc<dyn Dispatcher>,
    settings: ConnectionSettings,
    state: Mutex<AdapterState>,
}

/// Server side of the runtime.
#[derive(Clone)]
pub struct ObjectAdapter {
    inner: Arc<AdapterInner>,
}

impl fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("name", &self.inner.name)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ObjectAdapter {
    pub(crate) fn new(name: String, dispatcher: Arc<dyn Dispatcher>, settings: ConnectionSettings) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                name,
                dispatcher,
                settings,
                state: Mutex::new(AdapterState::default()),
            }),
        }
    }

    /// Adapter name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Accepts connections from `acceptor` until it fails or the adapter is
    /// deactivated.
    pub fn serve(&self, acceptor: Arc<dyn Acceptor>) {
        let mut st = lock(&self.inner.state);
        if st.deactivated {
            warn!(adapter = %self.inner.name, "serve called on a deactivated adapter");
            return;
        }
        let adapter = Arc::downgrade(&self.inner);
        let task = self.inner.settings.runtime.spawn(accept_loop(adapter, acceptor));
        st.accept_tasks.push(task);
    }

    /// Number of open server-side connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.inner.state).connections.len()
    }

    /// Stops accepting and gracefully closes every connection once its
    /// dispatches finish.
    pub fn deactivate(&self) {
        let (tasks, connections) = {
            let mut st = lock(&self.inner.state);
            if st.deactivated {
                return;
            }
            st.deactivated = true;
            (
                std::mem::take(&mut st.accept_tasks),
                st.connections.values().cloned().collect::<Vec<_>>(),
            )
        };
        for task in tasks {
            task.abort();
        }
        info!(adapter = %self.inner.name, connections = connections.len(), "deactivating object adapter");
        for connection in connections {
            connection.destroy(RpcError::ObjectAdapterDeactivated {
                name: self.inner.name.clone(),
            });
        }
    }

    /// Waits until every connection of a deactivated adapter is closed.
    pub async fn wait_for_deactivate(&self) {
        let connections: Vec<Connection> = lock(&self.inner.state).connections.values().cloned().collect();
        for connection in connections {
            connection.closed().await;
        }
    }
}

impl AdapterInner {
    async fn incoming(self: Arc<Self>, transceiver: Arc<dyn Transceiver>) {
        let connection = Connection::new(transceiver, true, self.settings.clone());
        connection.set_dispatcher(self.dispatcher.clone());
        {
            let mut st = lock(&self.state);
            if st.deactivated {
                return;
            }
            st.connections.insert(connection.id(), connection.clone());
        }
        let adapter = Arc::downgrade(&self);
        connection.on_close(move |closed| {
            if let Some(adapter) = adapter.upgrade() {
                lock(&adapter.state).connections.remove(&closed.id());
            }
        });
        if let Err(ex) = connection.start().await {
            debug!(adapter = %self.name, peer = %connection.peer(), error = %ex, "incoming connection failed validation");
        }
    }
}

async fn accept_loop(adapter: Weak<AdapterInner>, acceptor: Arc<dyn Acceptor>) {
    info!(endpoint = %acceptor.local_addr(), "accepting connections");
    loop {
        let result = acceptor.accept().await;
        let Some(inner) = adapter.upgrade() else {
            return;
        };
        match result {
            Ok(transceiver) => {
                debug!(adapter = %inner.name, peer = %transceiver.peer(), "accepted connection");
                inner.settings.runtime.clone().spawn(inner.incoming(transceiver));
            }
            Err(ex) => {
                warn!(adapter = %inner.name, endpoint = %acceptor.local_addr(), error = %ex, "accept failed, stopping");
                return;
            }
        }
    }
}
