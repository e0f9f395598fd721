#![warn(missing_docs)]

//! objwire runtime: proxies, connections, retries and batching for the IceP wire protocol

pub mod batch;
pub mod cancel;
pub mod communicator;
pub mod compress;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod message;
pub mod outgoing;
pub mod protocol;
pub mod proxy;
pub mod request_handler;
pub mod retry;
pub mod router;
pub mod server;
pub mod stream;
pub mod tcp;
pub mod transport;

pub use batch::{BatchRequest, BatchRequestInterceptor, BatchRequestQueue, BatchSwap, BatchTarget};
pub use communicator::Communicator;
pub use config::RuntimeConfig;
pub use connection::{CloseInitiator, Connection, ConnectionId, ConnectionState};
pub use endpoint::{EndpointResolver, EndpointTable, FixedEndpoints};
pub use error::{Result, RpcError};
pub use message::{Context, Identity, IncomingRequest, InvocationMode, OperationMode, OutgoingResponse, ReplyStatus};
pub use outgoing::InvocationFuture;
pub use proxy::Proxy;
pub use router::{CachingRouterInfo, ProxyRegistrar, RouterInfo};
pub use server::{Dispatcher, ObjectAdapter};
pub use tcp::{TcpAcceptor, TcpConnector};
pub use transport::{Acceptor, Connector, Transceiver};

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Locks a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Waits on a condition variable, recovering the data if a holder panicked.
pub(crate) fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
}
