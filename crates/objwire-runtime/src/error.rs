//! Error taxonomy for the invocation runtime.
//!
//! A single `RpcError` covers transport failures, protocol violations,
//! invocation outcomes and reply-carried exceptions. It is `Clone` because a
//! connection's terminal exception completes every invocation pending on it.

use bytes::Bytes;
use thiserror::Error;

/// Errors raised by connections, invocations and the retry machinery.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The peer actively refused the connection.
    #[error("connection refused by {peer}")]
    ConnectionRefused {
        /// Peer description.
        peer: String,
    },

    /// The transport failed after the connection was established.
    #[error("connection to {peer} lost: {reason}")]
    ConnectionLost {
        /// Peer description.
        peer: String,
        /// Underlying cause.
        reason: String,
    },

    /// Connection establishment (connect + validation) did not finish in time.
    #[error("timed out connecting to {peer} after {timeout_ms}ms")]
    ConnectTimeout {
        /// Peer description.
        peer: String,
        /// Configured connect timeout.
        timeout_ms: u64,
    },

    /// A graceful close did not complete within the close timeout.
    #[error("connection to {peer} did not close gracefully within {timeout_ms}ms")]
    CloseTimeout {
        /// Peer description.
        peer: String,
        /// Configured close timeout.
        timeout_ms: u64,
    },

    /// The connection was forcefully closed.
    #[error("connection to {peer} aborted: {reason}")]
    ConnectionAborted {
        /// Peer description.
        peer: String,
        /// True when the application called `abort()`.
        by_application: bool,
        /// Human readable reason.
        reason: String,
    },

    /// The connection was gracefully closed locally.
    #[error("connection to {peer} closed: {reason}")]
    ConnectionClosed {
        /// Peer description.
        peer: String,
        /// True when the application called `close()`.
        by_application: bool,
        /// Human readable reason.
        reason: String,
    },

    /// The peer sent a close-connection message. Pending requests were not dispatched.
    #[error("connection to {peer} closed gracefully by the peer")]
    CloseConnection {
        /// Peer description.
        peer: String,
    },

    /// Nothing was read from the peer for longer than the idle timeout.
    #[error("connection to {peer} aborted by the idle check: no data received for {timeout_secs}s")]
    ConnectionIdle {
        /// Peer description.
        peer: String,
        /// Configured idle timeout.
        timeout_secs: u64,
    },

    /// Endpoint resolution produced no usable connector.
    #[error("no suitable endpoint available for {proxy}")]
    NoEndpoint {
        /// Proxy description.
        proxy: String,
    },

    /// An I/O error not covered by a more specific variant.
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        /// Original error kind.
        kind: std::io::ErrorKind,
        /// Original error message.
        message: String,
    },

    /// Message did not start with the protocol magic.
    #[error("bad magic in message header: {got:02X?}")]
    BadMagic {
        /// Bytes found instead of the magic.
        got: [u8; 4],
    },

    /// Peer speaks a protocol version this runtime does not support.
    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedProtocol {
        /// Major version.
        major: u8,
        /// Minor version.
        minor: u8,
    },

    /// Peer uses a protocol encoding this runtime does not support.
    #[error("unsupported protocol encoding {major}.{minor}")]
    UnsupportedEncoding {
        /// Major version.
        major: u8,
        /// Minor version.
        minor: u8,
    },

    /// A message declared a size smaller than its own header.
    #[error("illegal message size {size}")]
    IllegalMessageSize {
        /// Declared size.
        size: i32,
    },

    /// A message exceeds the configured maximum message size.
    #[error("message of {size} bytes exceeds the maximum allowed of {max} bytes")]
    MessageSizeExceeded {
        /// Message size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Message header carried an unknown message type.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// Reply carried a status byte outside the known range.
    #[error("unknown reply status {0}")]
    UnknownReplyStatus(u8),

    /// The connection handshake failed.
    #[error("connection not validated: {reason}")]
    ConnectionNotValidated {
        /// Failure detail.
        reason: String,
    },

    /// A message body could not be encoded or decoded.
    #[error("marshal error: {reason}")]
    Marshal {
        /// Failure detail.
        reason: String,
    },

    /// Compressing or decompressing a message failed.
    #[error("compression error: {reason}")]
    Compression {
        /// Failure detail.
        reason: String,
    },

    /// The invocation timeout expired before a reply arrived.
    #[error("invocation of {operation} timed out")]
    InvocationTimeout {
        /// Operation name.
        operation: String,
    },

    /// The invocation was canceled by the caller.
    #[error("invocation of {operation} canceled")]
    InvocationCanceled {
        /// Operation name.
        operation: String,
    },

    /// The communicator owning this resource was destroyed.
    #[error("communicator destroyed")]
    CommunicatorDestroyed,

    /// The object adapter serving this connection was deactivated.
    #[error("object adapter {name} deactivated")]
    ObjectAdapterDeactivated {
        /// Adapter name.
        name: String,
    },

    /// The runtime could not be initialized.
    #[error("initialization error: {reason}")]
    Initialization {
        /// Failure detail.
        reason: String,
    },

    /// The operation raised a user exception, carried as an encapsulation.
    #[error("user exception raised by {operation}")]
    UserException {
        /// Operation name.
        operation: String,
        /// Encapsulated exception payload.
        encapsulation: Bytes,
    },

    /// The target object does not exist on the server.
    #[error("object {identity} does not exist (facet {facet:?}, operation {operation})")]
    ObjectNotExist {
        /// Stringified identity.
        identity: String,
        /// Facet, if any.
        facet: Option<String>,
        /// Operation name.
        operation: String,
    },

    /// The target facet does not exist on the server.
    #[error("facet {facet:?} of {identity} does not exist (operation {operation})")]
    FacetNotExist {
        /// Stringified identity.
        identity: String,
        /// Facet, if any.
        facet: Option<String>,
        /// Operation name.
        operation: String,
    },

    /// The target object does not implement the operation.
    #[error("operation {operation} does not exist on {identity}")]
    OperationNotExist {
        /// Stringified identity.
        identity: String,
        /// Facet, if any.
        facet: Option<String>,
        /// Operation name.
        operation: String,
    },

    /// The server raised a local exception while dispatching.
    #[error("unknown local exception: {message}")]
    UnknownLocal {
        /// Server-provided description.
        message: String,
    },

    /// The server raised an undeclared user exception.
    #[error("unknown user exception: {message}")]
    UnknownUser {
        /// Server-provided description.
        message: String,
    },

    /// The server raised an exception of an unknown kind.
    #[error("unknown exception: {message}")]
    Unknown {
        /// Server-provided description.
        message: String,
    },

    /// The connection died before the request reached it; resend on a new connection.
    #[error("retry on new connection: {0}")]
    Retry(Box<RpcError>),
}

/// Result alias for the runtime.
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// Maps an I/O error observed on the link to `peer`.
    pub fn from_io(err: std::io::Error, peer: &str) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => RpcError::ConnectionRefused {
                peer: peer.to_string(),
            },
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => RpcError::ConnectionLost {
                peer: peer.to_string(),
                reason: err.to_string(),
            },
            kind => RpcError::Io {
                kind,
                message: err.to_string(),
            },
        }
    }

    /// Returns true for the peer's graceful close notification.
    pub fn is_close_connection(&self) -> bool {
        matches!(self, RpcError::CloseConnection { .. })
    }

    /// Returns true if the application explicitly closed or aborted the connection.
    pub fn closed_by_application(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectionAborted {
                by_application: true,
                ..
            } | RpcError::ConnectionClosed {
                by_application: true,
                ..
            }
        )
    }

    /// Returns true for errors decoded from a reply: the request was dispatched.
    pub fn is_reply_error(&self) -> bool {
        matches!(
            self,
            RpcError::UserException { .. }
                | RpcError::ObjectNotExist { .. }
                | RpcError::FacetNotExist { .. }
                | RpcError::OperationNotExist { .. }
                | RpcError::UnknownLocal { .. }
                | RpcError::UnknownUser { .. }
                | RpcError::Unknown { .. }
        )
    }

    /// Returns true if a local error of this kind may ever be resolved by resending.
    ///
    /// Whether a resend is actually allowed also depends on whether the
    /// request was sent and on the operation mode, see the retry module.
    pub fn is_retryable_local(&self) -> bool {
        match self {
            RpcError::CommunicatorDestroyed
            | RpcError::ObjectAdapterDeactivated { .. }
            | RpcError::InvocationTimeout { .. }
            | RpcError::InvocationCanceled { .. }
            | RpcError::Marshal { .. }
            | RpcError::UnknownReplyStatus(_)
            | RpcError::MessageSizeExceeded { .. }
            | RpcError::NoEndpoint { .. }
            | RpcError::Initialization { .. }
            | RpcError::Retry(_) => false,
            RpcError::ConnectionAborted { .. } | RpcError::ConnectionClosed { .. } => {
                !self.closed_by_application()
            }
            other => !other.is_reply_error(),
        }
    }

    /// Strips a `Retry` wrapper, returning the underlying cause.
    pub fn into_cause(self) -> RpcError {
        match self {
            RpcError::Retry(inner) => inner.into_cause(),
            other => other,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::from_io(err, "<unknown>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_maps_kinds() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        assert!(matches!(
            RpcError::from_io(refused, "tcp 127.0.0.1:1"),
            RpcError::ConnectionRefused { .. }
        ));

        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(
            RpcError::from_io(eof, "peer"),
            RpcError::ConnectionLost { .. }
        ));

        let other = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(RpcError::from_io(other, "peer"), RpcError::Io { .. }));
    }

    #[test]
    fn test_closed_by_application() {
        let closed = RpcError::ConnectionClosed {
            peer: "p".into(),
            by_application: true,
            reason: "closed".into(),
        };
        assert!(closed.closed_by_application());
        assert!(!closed.is_retryable_local());

        let inactive = RpcError::ConnectionClosed {
            peer: "p".into(),
            by_application: false,
            reason: "inactive".into(),
        };
        assert!(!inactive.closed_by_application());
        assert!(inactive.is_retryable_local());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RpcError::CloseConnection { peer: "p".into() }.is_retryable_local());
        assert!(RpcError::ConnectionRefused { peer: "p".into() }.is_retryable_local());
        assert!(!RpcError::CommunicatorDestroyed.is_retryable_local());
        assert!(!RpcError::InvocationTimeout {
            operation: "op".into()
        }
        .is_retryable_local());
        assert!(!RpcError::ObjectNotExist {
            identity: "a".into(),
            facet: None,
            operation: "op".into()
        }
        .is_retryable_local());
    }

    #[test]
    fn test_into_cause_unwraps_retry() {
        let err = RpcError::Retry(Box::new(RpcError::CloseConnection { peer: "p".into() }));
        assert!(err.into_cause().is_close_connection());
    }
}
