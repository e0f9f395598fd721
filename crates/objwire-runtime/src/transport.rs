//! Transport abstraction consumed by connections.
//!
//! A `Connector` produces client-side transceivers, an `Acceptor` produces
//! server-side ones. A `Transceiver` supports one concurrent reader and one
//! concurrent writer; the connection guarantees at most one of each.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{Result, RpcError};

/// Byte pipe to one peer.
#[async_trait]
pub trait Transceiver: Send + Sync {
    /// Fills `buf` completely from the peer.
    async fn read_exact(&self, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `buf` to the peer.
    async fn write_all(&self, buf: &[u8]) -> Result<()>;

    /// Shuts down the write side; later reads observe the peer's close.
    async fn close(&self) -> Result<()>;

    /// Human-readable description of the link, used in errors and logs.
    fn peer(&self) -> &str;

    /// Transport name, e.g. `tcp`.
    fn protocol(&self) -> &str;

    /// True if the link is connectionless.
    fn is_datagram(&self) -> bool {
        false
    }
}

/// Establishes client-side transceivers to one endpoint.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Opens a new transceiver.
    async fn connect(&self) -> Result<Arc<dyn Transceiver>>;

    /// Identifies the endpoint; connections with equal keys are shared.
    fn key(&self) -> String;

    /// True if transceivers from this connector are connectionless.
    fn is_datagram(&self) -> bool {
        false
    }
}

/// Accepts server-side transceivers.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Waits for the next incoming transceiver.
    async fn accept(&self) -> Result<Arc<dyn Transceiver>>;

    /// Description of the local listening endpoint.
    fn local_addr(&self) -> String;
}

/// Transceiver over any split async byte stream.
pub struct StreamTransceiver<R, W> {
    read: Mutex<R>,
    write: Mutex<W>,
    peer: String,
    protocol: &'static str,
    datagram: bool,
}

impl<R, W> StreamTransceiver<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps a read half and a write half.
    pub fn new(read: R, write: W, peer: impl Into<String>, protocol: &'static str) -> Self {
        Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            peer: peer.into(),
            protocol,
            datagram: false,
        }
    }

    /// Marks the transceiver as connectionless.
    pub fn datagram(mut self, datagram: bool) -> Self {
        self.datagram = datagram;
        self
    }
}

impl<R, W> fmt::Debug for StreamTransceiver<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransceiver")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .finish()
    }
}

#[async_trait]
impl<R, W> Transceiver for StreamTransceiver<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut read = self.read.lock().await;
        read.read_exact(buf)
            .await
            .map_err(|e| RpcError::from_io(e, &self.peer))?;
        Ok(())
    }

    async fn write_all(&self, buf: &[u8]) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .write_all(buf)
            .await
            .map_err(|e| RpcError::from_io(e, &self.peer))?;
        write
            .flush()
            .await
            .map_err(|e| RpcError::from_io(e, &self.peer))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .shutdown()
            .await
            .map_err(|e| RpcError::from_io(e, &self.peer))
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    fn protocol(&self) -> &str {
        self.protocol
    }

    fn is_datagram(&self) -> bool {
        self.datagram
    }
}

/// In-process transport over `tokio::io::duplex` pipes.
pub mod memory {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::io::DuplexStream;
    use tokio::sync::{mpsc, Mutex};

    use super::{Acceptor, Connector, StreamTransceiver, Transceiver};
    use crate::error::{Result, RpcError};

    const PIPE_CAPACITY: usize = 256 * 1024;

    /// Creates a connected connector/acceptor pair named `name`.
    pub fn endpoint(name: &str) -> (MemoryConnector, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryConnector {
                name: name.to_string(),
                tx,
                datagram: false,
            },
            MemoryAcceptor {
                name: name.to_string(),
                rx: Mutex::new(rx),
            },
        )
    }

    fn wrap(stream: DuplexStream, peer: String, datagram: bool) -> Arc<dyn Transceiver> {
        let (read, write) = tokio::io::split(stream);
        Arc::new(StreamTransceiver::new(read, write, peer, "memory").datagram(datagram))
    }

    /// Client side of an in-process endpoint.
    #[derive(Debug, Clone)]
    pub struct MemoryConnector {
        name: String,
        tx: mpsc::UnboundedSender<DuplexStream>,
        datagram: bool,
    }

    impl MemoryConnector {
        /// Returns a connector whose transceivers report themselves as datagram links.
        pub fn datagram(mut self) -> Self {
            self.datagram = true;
            self
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self) -> Result<Arc<dyn Transceiver>> {
            let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
            self.tx
                .send(server)
                .map_err(|_| RpcError::ConnectionRefused {
                    peer: format!("memory {}", self.name),
                })?;
            Ok(wrap(client, format!("memory -> {}", self.name), self.datagram))
        }

        fn key(&self) -> String {
            let kind = if self.datagram { "memory-udp" } else { "memory" };
            format!("{} {}", kind, self.name)
        }

        fn is_datagram(&self) -> bool {
            self.datagram
        }
    }

    /// Server side of an in-process endpoint.
    #[derive(Debug)]
    pub struct MemoryAcceptor {
        name: String,
        rx: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    }

    #[async_trait]
    impl Acceptor for MemoryAcceptor {
        async fn accept(&self) -> Result<Arc<dyn Transceiver>> {
            let mut rx = self.rx.lock().await;
            match rx.recv().await {
                Some(stream) => Ok(wrap(stream, format!("memory <- {}", self.name), false)),
                None => Err(RpcError::ConnectionLost {
                    peer: format!("memory {}", self.name),
                    reason: "every connector was dropped".to_string(),
                }),
            }
        }

        fn local_addr(&self) -> String {
            format!("memory {}", self.name)
        }
    }
}
