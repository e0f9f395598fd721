//! TCP transport implementation

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Result, RpcError};
use crate::transport::{Acceptor, Connector, StreamTransceiver, Transceiver};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

fn wrap(stream: TcpStream, nodelay: bool) -> Result<Arc<dyn Transceiver>> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let local_addr = stream
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let peer = format!("tcp {} -> {}", local_addr, peer_addr);
    if nodelay {
        stream
            .set_nodelay(true)
            .map_err(|e| RpcError::from_io(e, &peer))?;
    }
    let (read, write) = stream.into_split();
    Ok(Arc::new(StreamTransceiver::new(read, write, peer, "tcp")))
}

/// Connects to one TCP endpoint.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    config: TcpConfig,
}

impl TcpConnector {
    /// Creates a connector for `addr` (e.g. `127.0.0.1:10000`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            config: TcpConfig::default(),
        }
    }

    /// Creates a connector with the given configuration.
    pub fn with_config(addr: impl Into<String>, config: TcpConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Arc<dyn Transceiver>> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| RpcError::from_io(e, &format!("tcp {}", self.addr)))?;
        tracing::debug!(addr = %self.addr, "TCP connected");
        wrap(stream, self.config.nodelay)
    }

    fn key(&self) -> String {
        format!("tcp {}", self.addr)
    }
}

/// Accepts TCP connections on a bound listener.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpAcceptor {
    /// Binds to `addr`.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RpcError::from_io(e, &format!("tcp {}", addr)))?;
        Ok(Self {
            listener,
            config: TcpConfig::default(),
        })
    }

    /// Returns the bound address, useful after binding port 0.
    pub fn bound_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::from_io(e, "tcp listener"))
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> Result<Arc<dyn Transceiver>> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| RpcError::from_io(e, "tcp listener"))?;
        wrap(stream, self.config.nodelay)
    }

    fn local_addr(&self) -> String {
        self.bound_addr()
            .map(|a| format!("tcp {}", a))
            .unwrap_or_else(|_| "tcp <unbound>".to_string())
    }
}
