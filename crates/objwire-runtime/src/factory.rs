//! Outgoing connection factory.
//!
//! The factory owns every outgoing connection of a communicator, indexed by
//! id and by connector key. Connections hold only a weak handle back to the
//! factory, used to remove themselves once closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::connection::{Connection, ConnectionId, ConnectionSettings};
use crate::error::{Result, RpcError};
use crate::lock;
use crate::transport::Connector;

#[derive(Default)]
struct FactoryState {
    connections: HashMap<ConnectionId, Connection>,
    by_key: HashMap<String, Vec<ConnectionId>>,
    destroyed: bool,
}

/// Creates and tracks outgoing connections.
pub(crate) struct OutgoingConnectionFactory {
    settings: ConnectionSettings,
    state: Mutex<FactoryState>,
}

impl OutgoingConnectionFactory {
    pub(crate) fn new(settings: ConnectionSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            state: Mutex::new(FactoryState::default()),
        })
    }

    /// Returns a usable connection to one of `connectors`, reusing an
    /// existing one when possible; otherwise connects to each in order.
    pub(crate) async fn create(self: &Arc<Self>, connectors: &[Arc<dyn Connector>]) -> Result<Connection> {
        if let Some(existing) = self.find(connectors)? {
            return Ok(existing);
        }

        let mut last = None;
        for connector in connectors {
            match self.connect(connector.as_ref()).await {
                Ok(connection) => return self.register(connector.key(), connection),
                Err(ex) => {
                    debug!(endpoint = %connector.key(), error = %ex, "connection attempt failed");
                    last = Some(ex);
                }
            }
        }
        Err(last.unwrap_or_else(|| RpcError::NoEndpoint {
            proxy: "empty endpoint list".to_string(),
        }))
    }

    fn find(&self, connectors: &[Arc<dyn Connector>]) -> Result<Option<Connection>> {
        let st = lock(&self.state);
        if st.destroyed {
            return Err(RpcError::CommunicatorDestroyed);
        }
        for connector in connectors {
            let Some(ids) = st.by_key.get(&connector.key()) else {
                continue;
            };
            if let Some(connection) = ids
                .iter()
                .filter_map(|id| st.connections.get(id))
                .find(|c| c.is_usable())
            {
                return Ok(Some(connection.clone()));
            }
        }
        Ok(None)
    }

    async fn connect(&self, connector: &dyn Connector) -> Result<Connection> {
        let timeout = self.settings.connect_timeout;
        let transceiver = match tokio::time::timeout(timeout, connector.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RpcError::ConnectTimeout {
                    peer: connector.key(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };
        let connection = Connection::new(transceiver, false, self.settings.clone());
        connection.start().await?;
        Ok(connection)
    }

    fn register(self: &Arc<Self>, key: String, connection: Connection) -> Result<Connection> {
        {
            let mut st = lock(&self.state);
            if !st.destroyed {
                st.connections.insert(connection.id(), connection.clone());
                st.by_key.entry(key.clone()).or_default().push(connection.id());
            } else {
                drop(st);
                connection.destroy(RpcError::CommunicatorDestroyed);
                return Err(RpcError::CommunicatorDestroyed);
            }
        }
        let factory = Arc::downgrade(self);
        connection.on_close(move |closed| {
            if let Some(factory) = factory.upgrade() {
                factory.remove(closed.id());
            }
        });
        info!(connection = %connection.id(), endpoint = %key, "outgoing connection registered");
        Ok(connection)
    }

    fn remove(&self, id: ConnectionId) {
        let mut st = lock(&self.state);
        if st.connections.remove(&id).is_some() {
            st.by_key.retain(|_, ids| {
                ids.retain(|other| *other != id);
                !ids.is_empty()
            });
            debug!(connection = %id, remaining = st.connections.len(), "connection removed from factory");
        }
    }

    /// Starts a graceful close of every connection; later `create` calls fail.
    pub(crate) fn destroy(&self) {
        let connections: Vec<Connection> = {
            let mut st = lock(&self.state);
            st.destroyed = true;
            st.connections.values().cloned().collect()
        };
        for connection in connections {
            connection.destroy(RpcError::CommunicatorDestroyed);
        }
    }

    /// Waits until every connection is closed.
    pub(crate) async fn wait_until_finished(&self) {
        let connections: Vec<Connection> = lock(&self.state).connections.values().cloned().collect();
        for connection in connections {
            connection.closed().await;
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        lock(&self.state).connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::connection::tests::settings_with;
    use crate::transport::{memory, Acceptor, Transceiver};

    async fn accept_validated(acceptor: memory::MemoryAcceptor) -> Connection {
        let transceiver = acceptor.accept().await.unwrap();
        let connection = Connection::new(transceiver, true, settings_with(|_| {}));
        connection.start().await.unwrap();
        connection
    }

    #[tokio::test]
    async fn test_reuses_usable_connection() {
        let factory = OutgoingConnectionFactory::new(settings_with(|_| {}));
        let (connector, acceptor) = memory::endpoint("reuse");
        let connectors: Vec<Arc<dyn Connector>> = vec![Arc::new(connector)];

        let (first, server) = tokio::join!(factory.create(&connectors), accept_validated(acceptor));
        let first = first.unwrap();
        let second = factory.create(&connectors).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(factory.connection_count(), 1);

        first.abort();
        server.closed().await;
        assert_eq!(factory.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_tries_connectors_in_order() {
        let factory = OutgoingConnectionFactory::new(settings_with(|_| {}));
        let (dead, dead_acceptor) = memory::endpoint("dead");
        drop(dead_acceptor);
        let (live, acceptor) = memory::endpoint("live");
        let connectors: Vec<Arc<dyn Connector>> = vec![Arc::new(dead), Arc::new(live)];

        let (connection, _server) = tokio::join!(factory.create(&connectors), accept_validated(acceptor));
        assert!(connection.unwrap().peer().contains("live"));
    }

    #[tokio::test]
    async fn test_reports_last_failure() {
        let factory = OutgoingConnectionFactory::new(settings_with(|_| {}));
        let (a, acceptor_a) = memory::endpoint("a");
        let (b, acceptor_b) = memory::endpoint("b");
        drop((acceptor_a, acceptor_b));
        let connectors: Vec<Arc<dyn Connector>> = vec![Arc::new(a), Arc::new(b)];
        let err = factory.create(&connectors).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionRefused { ref peer } if peer.contains('b')));
    }

    #[derive(Debug)]
    struct HangingConnector;

    #[async_trait]
    impl Connector for HangingConnector {
        async fn connect(&self) -> Result<Arc<dyn Transceiver>> {
            std::future::pending().await
        }

        fn key(&self) -> String {
            "hanging".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let factory = OutgoingConnectionFactory::new(settings_with(|c| c.connect_timeout_ms = 250));
        let connectors: Vec<Arc<dyn Connector>> = vec![Arc::new(HangingConnector)];
        let err = factory.create(&connectors).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectTimeout { timeout_ms: 250, .. }), "{err}");
    }

    #[tokio::test]
    async fn test_destroy_closes_connections() {
        let factory = OutgoingConnectionFactory::new(settings_with(|_| {}));
        let (connector, acceptor) = memory::endpoint("destroy");
        let connectors: Vec<Arc<dyn Connector>> = vec![Arc::new(connector)];
        let (connection, server) = tokio::join!(factory.create(&connectors), accept_validated(acceptor));
        let connection = connection.unwrap();

        factory.destroy();
        tokio::time::timeout(Duration::from_secs(5), factory.wait_until_finished())
            .await
            .unwrap();
        assert!(matches!(connection.throw_exception(), Err(RpcError::CommunicatorDestroyed)));
        server.closed().await;
        assert!(matches!(factory.create(&connectors).await, Err(RpcError::CommunicatorDestroyed)));
    }
}
