//! Connection state machine.
//!
//! A [`Connection`] is one validated link to a peer. It multiplexes twoway
//! requests by request id, dispatches incoming requests to a [`Dispatcher`],
//! sends heartbeats while idle and drives graceful and forced shutdown.
//!
//! Each active connection runs a reader task, a writer task fed by an
//! unbounded channel (the only path to the transceiver's write side), and,
//! when configured, a heartbeat task and an inactivity task. State lives
//! behind one `std::sync::Mutex`; invocation callbacks run outside of it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::batch::BatchRequestQueue;
use crate::cancel::CancellationHandler;
use crate::compress::MessageCompressor;
use crate::config::RuntimeConfig;
use crate::error::{Result, RpcError};
use crate::lock;
use crate::message::{self, IncomingRequest, OutgoingResponse};
use crate::outgoing::{InvocationFuture, OutgoingAsync};
use crate::protocol::{
    self, CompressionStatus, MessageHeader, MessageType, HEADER_SIZE, REQUEST_HEADER_SIZE, REQUEST_ID_OFFSET,
};
use crate::request_handler::AsyncStatus;
use crate::server::Dispatcher;
use crate::stream::{InputStream, OutputStream};
use crate::transport::Transceiver;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Who started closing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    /// `close()` or `abort()` from the application.
    Application,
    /// The runtime: communicator shutdown, adapter deactivation, inactivity.
    Runtime,
    /// The peer sent a close-connection message.
    Peer,
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, transport not yet validated.
    Initializing,
    /// Exchanging the validate-connection message.
    Validating,
    /// Sending and receiving requests.
    Active,
    /// Waiting for dispatches to finish before sending close-connection.
    Closing(CloseInitiator),
    /// Close-connection sent or received; waiting for the transport to close.
    ClosingPending(CloseInitiator),
    /// Terminal.
    Closed,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            ConnectionState::Initializing => 0,
            ConnectionState::Validating => 1,
            ConnectionState::Active => 2,
            ConnectionState::Closing(_) => 3,
            ConnectionState::ClosingPending(_) => 4,
            ConnectionState::Closed => 5,
        }
    }

    /// True for `Closing` and `ClosingPending`.
    pub fn is_closing(self) -> bool {
        matches!(self, ConnectionState::Closing(_) | ConnectionState::ClosingPending(_))
    }
}

/// Per-connection tunables, resolved once from [`RuntimeConfig`].
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub(crate) connect_timeout: Duration,
    pub(crate) close_timeout: Duration,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) idle_check: bool,
    pub(crate) inactivity_timeout: Option<Duration>,
    pub(crate) message_size_max: usize,
    pub(crate) batch_auto_flush_size: usize,
    pub(crate) compressor: Arc<MessageCompressor>,
    pub(crate) runtime: Handle,
}

impl ConnectionSettings {
    pub(crate) fn new(config: &RuntimeConfig, compressor: Arc<MessageCompressor>, runtime: Handle) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            close_timeout: config.close_timeout(),
            idle_timeout: config.idle_timeout(),
            idle_check: config.enable_idle_check,
            inactivity_timeout: config.inactivity_timeout(),
            message_size_max: config.message_size_max,
            batch_auto_flush_size: config.batch_auto_flush_size,
            compressor,
            runtime,
        }
    }
}

struct PendingRequest {
    out: Arc<OutgoingAsync>,
    attempt: u32,
}

struct WriteCommand {
    bytes: Bytes,
    out: Option<(Arc<OutgoingAsync>, u32)>,
}

type CloseCallback = Box<dyn FnOnce(&Connection) + Send>;

struct ConnState {
    state: ConnectionState,
    exception: Option<RpcError>,
    requests: HashMap<i32, PendingRequest>,
    next_request_id: i32,
    dispatch_count: usize,
    close_requested: bool,
    last_write: Instant,
    inactive_since: Option<Instant>,
    tasks: Vec<JoinHandle<()>>,
    close_timer: Option<JoinHandle<()>>,
    close_callbacks: Vec<CloseCallback>,
}

impl ConnState {
    fn allocate_request_id(&mut self) -> i32 {
        loop {
            let id = if self.next_request_id <= 0 { 1 } else { self.next_request_id };
            self.next_request_id = id.wrapping_add(1);
            if !self.requests.contains_key(&id) {
                return id;
            }
        }
    }

    fn touch(&mut self) {
        self.inactive_since = if self.requests.is_empty() && self.dispatch_count == 0 {
            Some(Instant::now())
        } else {
            None
        };
    }
}

/// Work to run outside the lock once a connection reaches `Closed`.
struct Finish {
    requests: Vec<PendingRequest>,
    callbacks: Vec<CloseCallback>,
    tasks: Vec<JoinHandle<()>>,
    exception: RpcError,
}

struct Inner {
    id: ConnectionId,
    transceiver: Arc<dyn Transceiver>,
    peer: String,
    incoming: bool,
    datagram: bool,
    settings: ConnectionSettings,
    state: Mutex<ConnState>,
    write_tx: mpsc::UnboundedSender<WriteCommand>,
    write_rx: Mutex<Option<mpsc::UnboundedReceiver<WriteCommand>>>,
    closed: watch::Sender<bool>,
    dispatcher: Mutex<Option<Arc<dyn Dispatcher>>>,
    batch_queue: Arc<BatchRequestQueue>,
}

/// One link to a peer. Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Wraps a transceiver. `incoming` is true on the accepting side.
    pub(crate) fn new(transceiver: Arc<dyn Transceiver>, incoming: bool, settings: ConnectionSettings) -> Self {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let batch_queue = Arc::new(BatchRequestQueue::new(settings.batch_auto_flush_size, None));
        Self {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                peer: transceiver.peer().to_string(),
                datagram: transceiver.is_datagram(),
                transceiver,
                incoming,
                settings,
                state: Mutex::new(ConnState {
                    state: ConnectionState::Initializing,
                    exception: None,
                    requests: HashMap::new(),
                    next_request_id: 1,
                    dispatch_count: 0,
                    close_requested: false,
                    last_write: Instant::now(),
                    inactive_since: None,
                    tasks: Vec::new(),
                    close_timer: None,
                    close_callbacks: Vec::new(),
                }),
                write_tx,
                write_rx: Mutex::new(Some(write_rx)),
                closed,
                dispatcher: Mutex::new(None),
                batch_queue,
            }),
        }
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Description of the peer.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).state
    }

    /// True for connectionless links.
    pub fn is_datagram(&self) -> bool {
        self.inner.datagram
    }

    /// Batch queue shared by fixed proxies bound to this connection.
    pub fn batch_queue(&self) -> &Arc<BatchRequestQueue> {
        &self.inner.batch_queue
    }

    /// Routes incoming requests to `dispatcher`.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        *lock(&self.inner.dispatcher) = Some(dispatcher);
    }

    /// Number of twoway requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.state).requests.len()
    }

    /// True if new requests may be sent on this connection.
    pub fn is_usable(&self) -> bool {
        let st = lock(&self.inner.state);
        st.state == ConnectionState::Active && !st.close_requested && st.exception.is_none()
    }

    /// Fails with the error that closed (or is closing) the connection.
    pub fn throw_exception(&self) -> Result<()> {
        let st = lock(&self.inner.state);
        match &st.exception {
            Some(ex) => Err(ex.clone()),
            None if st.close_requested => Err(self.closed_by_application()),
            None => Ok(()),
        }
    }

    fn closed_by_application(&self) -> RpcError {
        RpcError::ConnectionClosed {
            peer: self.inner.peer.clone(),
            by_application: true,
            reason: "connection closed by the application".to_string(),
        }
    }

    fn terminal_exception(&self) -> RpcError {
        lock(&self.inner.state)
            .exception
            .clone()
            .unwrap_or_else(|| RpcError::ConnectionLost {
                peer: self.inner.peer.clone(),
                reason: "connection closed".to_string(),
            })
    }

    /// Validates the link and starts the connection's tasks.
    ///
    /// The accepting side sends the validate-connection message and the
    /// connecting side checks it, all within the connect timeout.
    pub(crate) async fn start(&self) -> Result<()> {
        let timeout = self.inner.settings.connect_timeout;
        let validated = match tokio::time::timeout(timeout, self.validate()).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::ConnectTimeout {
                peer: self.inner.peer.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };
        let result = validated.and_then(|()| self.activate());
        if let Err(ex) = &result {
            debug!(connection = %self.inner.id, peer = %self.inner.peer, error = %ex, "connection failed to start");
            self.set_state(ConnectionState::Closed, ex.clone());
            let _ = self.inner.transceiver.close().await;
        }
        result
    }

    async fn validate(&self) -> Result<()> {
        {
            let mut st = lock(&self.inner.state);
            if let Some(ex) = &st.exception {
                return Err(ex.clone());
            }
            st.state = ConnectionState::Validating;
        }
        if self.inner.datagram {
            return Ok(());
        }

        if self.inner.incoming {
            self.inner
                .transceiver
                .write_all(&protocol::validate_connection_message())
                .await?;
            lock(&self.inner.state).last_write = Instant::now();
            debug!(peer = %self.inner.peer, "sent validate connection message");
        } else {
            let mut header = [0u8; HEADER_SIZE];
            self.inner.transceiver.read_exact(&mut header).await?;
            let decoded = MessageHeader::decode(&header, self.inner.settings.message_size_max)?;
            if decoded.message_type != MessageType::ValidateConnection {
                return Err(RpcError::ConnectionNotValidated {
                    reason: format!("expected validate connection message, got {:?}", decoded.message_type),
                });
            }
            if decoded.size != HEADER_SIZE {
                return Err(RpcError::IllegalMessageSize {
                    size: decoded.size as i32,
                });
            }
            debug!(peer = %self.inner.peer, "received validate connection message");
        }
        Ok(())
    }

    fn activate(&self) -> Result<()> {
        let rx = lock(&self.inner.write_rx).take();
        let mut st = lock(&self.inner.state);
        if let Some(ex) = &st.exception {
            return Err(ex.clone());
        }
        let Some(rx) = rx else {
            return Err(RpcError::Initialization {
                reason: "connection already started".to_string(),
            });
        };

        let now = Instant::now();
        st.state = ConnectionState::Active;
        st.last_write = now;
        st.inactive_since = Some(now);

        let runtime = &self.inner.settings.runtime;
        runtime.spawn(self.clone().write_loop(rx));
        st.tasks.push(runtime.spawn(self.clone().read_loop()));
        if !self.inner.datagram {
            if let Some(idle) = self.inner.settings.idle_timeout {
                st.tasks
                    .push(runtime.spawn(heartbeat_loop(Arc::downgrade(&self.inner), idle)));
            }
        }
        if let Some(timeout) = self.inner.settings.inactivity_timeout {
            st.tasks
                .push(runtime.spawn(inactivity_loop(Arc::downgrade(&self.inner), timeout)));
        }

        info!(
            connection = %self.inner.id,
            peer = %self.inner.peer,
            incoming = self.inner.incoming,
            "connection established"
        );
        Ok(())
    }

    /// Queues a request (or a batch) for sending.
    ///
    /// Fails with `Retry` if the connection is closing: the request was not
    /// sent and may go out on another connection.
    pub(crate) fn send_async_request(&self, out: &Arc<OutgoingAsync>) -> Result<AsyncStatus> {
        let max = self.inner.settings.message_size_max;
        let size = out.message().len();
        if max > 0 && size > max {
            return Err(RpcError::MessageSizeExceeded { size, max });
        }
        let batch = out.batch_request_num();
        let header_size = if batch.is_some() { HEADER_SIZE } else { REQUEST_HEADER_SIZE };
        if size < header_size {
            return Err(RpcError::Marshal {
                reason: format!("request message of {size} bytes is shorter than its header"),
            });
        }

        let mut st = lock(&self.inner.state);
        if let Some(ex) = &st.exception {
            return Err(RpcError::Retry(Box::new(ex.clone())));
        }
        if st.close_requested {
            return Err(RpcError::Retry(Box::new(self.closed_by_application())));
        }

        out.cancelable(Arc::new(self.clone()))?;
        let attempt = out.attempt();

        let twoway = out.is_twoway() && batch.is_none();
        let slot = if twoway { st.allocate_request_id() } else { 0 };

        let compressor = &self.inner.settings.compressor;
        let compress = out.compress() && compressor.is_enabled();
        let mut os = OutputStream::from_slice(out.message());
        if batch.is_none() {
            os.rewrite_i32(slot, REQUEST_ID_OFFSET)?;
        }
        if compress {
            protocol::set_compression_status(&mut os, CompressionStatus::Supported);
        }
        protocol::finish_message(&mut os)?;
        let mut bytes = os.take();
        if compress {
            if let Some(compressed) = compressor.compress(&bytes) {
                bytes = compressed;
            }
        }

        if twoway {
            st.requests.insert(slot, PendingRequest { out: out.clone(), attempt });
        }
        st.touch();

        let command = WriteCommand {
            bytes,
            out: Some((out.clone(), attempt)),
        };
        if self.inner.write_tx.send(command).is_err() {
            if twoway {
                st.requests.remove(&slot);
            }
            return Err(RpcError::Retry(Box::new(RpcError::ConnectionLost {
                peer: self.inner.peer.clone(),
                reason: "writer stopped".to_string(),
            })));
        }
        debug!(
            connection = %self.inner.id,
            operation = %out.operation(),
            request_id = slot,
            batch_requests = batch.unwrap_or(0),
            "request queued"
        );
        Ok(AsyncStatus::Sent)
    }

    /// Sends this connection's batch queue as one message.
    pub fn flush_batch_requests(&self) -> InvocationFuture {
        let mut os = OutputStream::new();
        let Some(swapped) = self.inner.batch_queue.swap(&mut os) else {
            return InvocationFuture::ready(Ok(Bytes::new()));
        };
        let (out, future) =
            OutgoingAsync::connection_flush_batch(self.clone(), os.take(), swapped.request_num, swapped.compress);
        out.invoke();
        future
    }

    /// Registers `callback` to run once the connection is closed; runs it
    /// immediately if it already is.
    pub fn on_close(&self, callback: impl FnOnce(&Connection) + Send + 'static) {
        {
            let mut st = lock(&self.inner.state);
            if st.state != ConnectionState::Closed {
                st.close_callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    /// Closes gracefully once outstanding invocations complete, then waits
    /// for the connection to reach `Closed`.
    pub async fn close(&self) {
        let finish = {
            let mut st = lock(&self.inner.state);
            if st.state.rank() >= ConnectionState::Closing(CloseInitiator::Application).rank() {
                None
            } else if st.requests.is_empty() {
                let ex = self.closed_by_application();
                self.transition(&mut st, ConnectionState::Closing(CloseInitiator::Application), ex)
            } else {
                debug!(connection = %self.inner.id, pending = st.requests.len(), "close deferred until pending requests complete");
                st.close_requested = true;
                None
            }
        };
        if let Some(finish) = finish {
            self.finish(finish);
        }
        self.closed().await;
    }

    /// Closes immediately; outstanding invocations fail.
    pub fn abort(&self) {
        self.set_state(
            ConnectionState::Closed,
            RpcError::ConnectionAborted {
                peer: self.inner.peer.clone(),
                by_application: true,
                reason: "connection aborted by the application".to_string(),
            },
        );
    }

    /// Starts a runtime-initiated graceful close with `ex`.
    pub(crate) fn destroy(&self, ex: RpcError) {
        self.set_state(ConnectionState::Closing(CloseInitiator::Runtime), ex);
    }

    /// Waits until the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn set_state(&self, new: ConnectionState, ex: RpcError) {
        let finish = {
            let mut st = lock(&self.inner.state);
            self.transition(&mut st, new, ex)
        };
        if let Some(finish) = finish {
            self.finish(finish);
        }
    }

    fn transition(&self, st: &mut ConnState, new: ConnectionState, ex: RpcError) -> Option<Finish> {
        if st.state == ConnectionState::Closed {
            return None;
        }
        if st.exception.is_none() {
            let expected = matches!(
                ex,
                RpcError::CloseConnection { .. }
                    | RpcError::ConnectionClosed { .. }
                    | RpcError::CommunicatorDestroyed
                    | RpcError::ObjectAdapterDeactivated { .. }
            ) || ex.closed_by_application();
            if st.state == ConnectionState::Active && !expected {
                warn!(connection = %self.inner.id, peer = %self.inner.peer, error = %ex, "connection failed");
            } else {
                debug!(connection = %self.inner.id, peer = %self.inner.peer, error = %ex, "connection closing");
            }
            st.exception = Some(ex);
        }

        let mut new = new;
        if new.is_closing() && (self.inner.datagram || st.state.rank() < ConnectionState::Active.rank()) {
            new = ConnectionState::Closed;
        }
        if new.rank() <= st.state.rank() {
            return None;
        }
        let previous = std::mem::replace(&mut st.state, new);
        debug!(connection = %self.inner.id, from = ?previous, to = ?new, "state change");

        match new {
            ConnectionState::Closing(initiator) => {
                if st.dispatch_count == 0 {
                    self.initiate_shutdown(st, initiator);
                }
                None
            }
            ConnectionState::ClosingPending(_) => {
                self.start_close_timer(st);
                None
            }
            ConnectionState::Closed => {
                let mut requests: Vec<(i32, PendingRequest)> = st.requests.drain().collect();
                requests.sort_by_key(|(id, _)| *id);
                let mut tasks = std::mem::take(&mut st.tasks);
                tasks.extend(st.close_timer.take());
                Some(Finish {
                    requests: requests.into_iter().map(|(_, request)| request).collect(),
                    callbacks: std::mem::take(&mut st.close_callbacks),
                    tasks,
                    exception: st
                        .exception
                        .clone()
                        .unwrap_or(RpcError::CommunicatorDestroyed),
                })
            }
            _ => None,
        }
    }

    fn initiate_shutdown(&self, st: &mut ConnState, initiator: CloseInitiator) {
        st.state = ConnectionState::ClosingPending(initiator);
        self.start_close_timer(st);
        debug!(connection = %self.inner.id, peer = %self.inner.peer, "sending close connection message");
        let _ = self.inner.write_tx.send(WriteCommand {
            bytes: protocol::close_connection_message(),
            out: None,
        });
    }

    fn start_close_timer(&self, st: &mut ConnState) {
        if st.close_timer.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.settings.close_timeout;
        st.close_timer = Some(self.inner.settings.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                let connection = Connection::from_inner(inner);
                let ex = RpcError::CloseTimeout {
                    peer: connection.inner.peer.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                connection.set_state(ConnectionState::Closed, ex);
            }
        }));
    }

    fn finish(&self, finish: Finish) {
        let Finish {
            requests,
            callbacks,
            tasks,
            exception,
        } = finish;
        for task in tasks {
            task.abort();
        }
        self.inner.batch_queue.destroy(exception.clone());
        self.inner.closed.send_replace(true);
        info!(
            connection = %self.inner.id,
            peer = %self.inner.peer,
            reason = %exception,
            pending = requests.len(),
            "connection closed"
        );
        for request in requests {
            request.out.attempt_exception(request.attempt, exception.clone());
        }
        for callback in callbacks {
            callback(self);
        }
    }

    fn check_close_requested(&self) {
        let finish = {
            let mut st = lock(&self.inner.state);
            if st.close_requested && st.requests.is_empty() && st.state == ConnectionState::Active {
                let ex = self.closed_by_application();
                self.transition(&mut st, ConnectionState::Closing(CloseInitiator::Application), ex)
            } else {
                None
            }
        };
        if let Some(finish) = finish {
            self.finish(finish);
        }
    }

    async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let transceiver = &self.inner.transceiver;
        match self.inner.settings.idle_timeout {
            Some(idle) if self.inner.settings.idle_check && !self.inner.datagram => {
                match tokio::time::timeout(idle, transceiver.read_exact(buf)).await {
                    Ok(result) => result,
                    Err(_) => Err(RpcError::ConnectionIdle {
                        peer: self.inner.peer.clone(),
                        timeout_secs: idle.as_secs(),
                    }),
                }
            }
            _ => transceiver.read_exact(buf).await,
        }
    }

    async fn read_message(&self) -> Result<(MessageHeader, Bytes)> {
        let mut header = [0u8; HEADER_SIZE];
        self.read_exact(&mut header).await?;
        let decoded = MessageHeader::decode(&header, self.inner.settings.message_size_max)?;
        let mut buf = vec![0u8; decoded.size];
        buf[..HEADER_SIZE].copy_from_slice(&header);
        if decoded.size > HEADER_SIZE {
            self.read_exact(&mut buf[HEADER_SIZE..]).await?;
        }
        Ok((decoded, Bytes::from(buf)))
    }

    async fn read_loop(self) {
        loop {
            let result = match self.read_message().await {
                Ok((header, message)) => self.handle_message(header, message),
                Err(ex) => Err(ex),
            };
            if let Err(ex) = result {
                self.set_state(ConnectionState::Closed, ex);
                return;
            }
            if self.state() == ConnectionState::Closed {
                return;
            }
        }
    }

    fn handle_message(&self, header: MessageHeader, message: Bytes) -> Result<()> {
        let message = if header.compression == CompressionStatus::Compressed {
            self.inner
                .settings
                .compressor
                .decompress(&message, self.inner.settings.message_size_max)?
        } else {
            message
        };
        let mut is = InputStream::new(message);
        is.set_pos(HEADER_SIZE);

        match header.message_type {
            MessageType::ValidateConnection => {
                debug!(connection = %self.inner.id, "received heartbeat");
            }
            MessageType::CloseConnection => {
                if self.inner.datagram {
                    warn!(connection = %self.inner.id, "ignoring close connection message on a datagram connection");
                } else {
                    debug!(connection = %self.inner.id, peer = %self.inner.peer, "peer closed the connection");
                    let ex = RpcError::CloseConnection {
                        peer: self.inner.peer.clone(),
                    };
                    self.set_state(ConnectionState::ClosingPending(CloseInitiator::Peer), ex.clone());
                    self.set_state(ConnectionState::Closed, ex);
                }
            }
            MessageType::Request | MessageType::RequestBatch => {
                if self.state().rank() >= ConnectionState::Closing(CloseInitiator::Peer).rank() {
                    debug!(connection = %self.inner.id, "received request while closing, ignored");
                    return Ok(());
                }
                let requests = if header.message_type == MessageType::Request {
                    let request_id = is.read_i32()?;
                    vec![IncomingRequest::read(&mut is, request_id)?]
                } else {
                    let mut requests = Vec::new();
                    while is.remaining() > 0 {
                        requests.push(IncomingRequest::read(&mut is, 0)?);
                    }
                    requests
                };
                self.dispatch(requests, header.compression != CompressionStatus::NotSupported);
            }
            MessageType::Reply => {
                let request_id = is.read_i32()?;
                let pending = {
                    let mut st = lock(&self.inner.state);
                    let pending = st.requests.remove(&request_id);
                    if pending.is_some() {
                        st.touch();
                    }
                    pending
                };
                match pending {
                    None => {
                        debug!(connection = %self.inner.id, request_id, "ignoring reply for unknown request");
                    }
                    Some(pending) => {
                        let result = message::read_reply_body(&mut is, pending.out.operation());
                        pending.out.attempt_response(pending.attempt, result);
                        self.check_close_requested();
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch(&self, requests: Vec<IncomingRequest>, compress: bool) {
        if requests.is_empty() {
            return;
        }
        {
            let mut st = lock(&self.inner.state);
            st.dispatch_count += requests.len();
            st.inactive_since = None;
        }
        let dispatcher = lock(&self.inner.dispatcher).clone();
        let connection = self.clone();
        self.inner.settings.runtime.spawn(async move {
            for request in requests {
                let response = match &dispatcher {
                    Some(dispatcher) => dispatcher.dispatch(request.clone()).await,
                    None => OutgoingResponse::object_not_exist(),
                };
                if request.expects_reply() {
                    if let Err(ex) = connection.send_response(&request, &response, compress) {
                        warn!(connection = %connection.inner.id, operation = %request.operation, error = %ex, "failed to send reply");
                    }
                }
                connection.dispatch_finished();
            }
        });
    }

    fn send_response(&self, request: &IncomingRequest, response: &OutgoingResponse, compress: bool) -> Result<()> {
        let compressor = &self.inner.settings.compressor;
        let compress = compress && compressor.is_enabled();
        let mut os = message::write_reply_message(request, response)?;
        if compress {
            protocol::set_compression_status(&mut os, CompressionStatus::Supported);
        }
        protocol::finish_message(&mut os)?;
        let mut bytes = os.take();
        if compress {
            if let Some(compressed) = compressor.compress(&bytes) {
                bytes = compressed;
            }
        }
        let st = lock(&self.inner.state);
        if st.state == ConnectionState::Closed {
            return Ok(());
        }
        let _ = self.inner.write_tx.send(WriteCommand { bytes, out: None });
        Ok(())
    }

    fn dispatch_finished(&self) {
        let mut st = lock(&self.inner.state);
        st.dispatch_count = st.dispatch_count.saturating_sub(1);
        if st.dispatch_count == 0 {
            st.touch();
            if let ConnectionState::Closing(initiator) = st.state {
                self.initiate_shutdown(&mut st, initiator);
            }
        }
    }

    async fn write_loop(self, mut rx: mpsc::UnboundedReceiver<WriteCommand>) {
        let mut closed = self.inner.closed.subscribe();
        loop {
            let command = tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            if let Some((out, attempt)) = &command.out {
                if !out.is_pending(*attempt) {
                    continue;
                }
            }
            match self.inner.transceiver.write_all(&command.bytes).await {
                Ok(()) => {
                    lock(&self.inner.state).last_write = Instant::now();
                    if let Some((out, attempt)) = command.out {
                        out.attempt_sent(attempt);
                    }
                }
                Err(ex) => {
                    self.set_state(ConnectionState::Closed, ex);
                    if let Some((out, attempt)) = command.out {
                        out.attempt_exception(attempt, self.terminal_exception());
                    }
                    break;
                }
            }
        }

        rx.close();
        let ex = self.terminal_exception();
        while let Ok(command) = rx.try_recv() {
            if let Some((out, attempt)) = command.out {
                out.attempt_exception(attempt, ex.clone());
            }
        }
        if let Err(ex) = self.inner.transceiver.close().await {
            debug!(connection = %self.inner.id, error = %ex, "transport close failed");
        }
    }
}

impl CancellationHandler for Connection {
    fn request_canceled(&self, out: &Arc<OutgoingAsync>, ex: RpcError) {
        {
            let mut st = lock(&self.inner.state);
            if st.state == ConnectionState::Closed {
                return;
            }
            let id = st
                .requests
                .iter()
                .find(|(_, pending)| Arc::ptr_eq(&pending.out, out))
                .map(|(id, _)| *id);
            if let Some(id) = id {
                st.requests.remove(&id);
                st.touch();
            }
        }
        out.exception(ex);
        self.check_close_requested();
    }
}

async fn heartbeat_loop(weak: Weak<Inner>, idle: Duration) {
    let interval = idle / 2;
    loop {
        let deadline = {
            let Some(inner) = weak.upgrade() else { return };
            let st = lock(&inner.state);
            if st.state.rank() >= ConnectionState::Closing(CloseInitiator::Runtime).rank() {
                return;
            }
            st.last_write + interval
        };
        tokio::time::sleep_until(deadline).await;

        let Some(inner) = weak.upgrade() else { return };
        let mut st = lock(&inner.state);
        if st.state != ConnectionState::Active {
            return;
        }
        let now = Instant::now();
        if now >= st.last_write + interval {
            st.last_write = now;
            debug!(connection = %inner.id, "sending heartbeat");
            let _ = inner.write_tx.send(WriteCommand {
                bytes: protocol::validate_connection_message(),
                out: None,
            });
        }
    }
}

async fn inactivity_loop(weak: Weak<Inner>, timeout: Duration) {
    loop {
        let deadline = {
            let Some(inner) = weak.upgrade() else { return };
            let st = lock(&inner.state);
            if st.state != ConnectionState::Active {
                return;
            }
            match st.inactive_since {
                Some(since) => since + timeout,
                None => Instant::now() + timeout,
            }
        };
        tokio::time::sleep_until(deadline).await;

        let Some(inner) = weak.upgrade() else { return };
        let expired = {
            let st = lock(&inner.state);
            st.state == ConnectionState::Active
                && !st.close_requested
                && st
                    .inactive_since
                    .is_some_and(|since| Instant::now() >= since + timeout)
        };
        if expired {
            let connection = Connection::from_inner(inner);
            info!(connection = %connection.inner.id, peer = %connection.inner.peer, "closing inactive connection");
            let ex = RpcError::ConnectionClosed {
                peer: connection.inner.peer.clone(),
                by_application: false,
                reason: "connection inactive".to_string(),
            };
            connection.set_state(ConnectionState::Closing(CloseInitiator::Runtime), ex);
            return;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::batch::BatchTarget;
    use crate::communicator::Communicator;
    use crate::message::{Identity, OperationMode, ReplyStatus};
    use crate::transport::{memory, Acceptor, Connector};

    pub(crate) fn settings_with(configure: impl FnOnce(&mut RuntimeConfig)) -> ConnectionSettings {
        let mut config = RuntimeConfig::default();
        configure(&mut config);
        ConnectionSettings::new(&config, Arc::new(MessageCompressor::new(true)), Handle::current())
    }

    /// Two started connections joined by an in-memory pipe.
    pub(crate) async fn connected_pair(name: &str) -> (Connection, Connection) {
        connected_pair_with(name, |_| {}).await
    }

    pub(crate) async fn connected_pair_with(
        name: &str,
        configure: impl Fn(&mut RuntimeConfig),
    ) -> (Connection, Connection) {
        connected_pair_split(name, &configure, &configure).await
    }

    async fn connected_pair_split(
        name: &str,
        client_config: impl Fn(&mut RuntimeConfig),
        server_config: impl Fn(&mut RuntimeConfig),
    ) -> (Connection, Connection) {
        let (connector, acceptor) = memory::endpoint(name);
        let (client, server) = tokio::join!(connector.connect(), acceptor.accept());
        let client = Connection::new(client.unwrap(), false, settings_with(client_config));
        let server = Connection::new(server.unwrap(), true, settings_with(server_config));
        let (a, b) = tokio::join!(client.start(), server.start());
        a.unwrap();
        b.unwrap();
        (client, server)
    }

    /// A started client connection whose peer is a bare transceiver.
    async fn raw_peer(name: &str, configure: impl Fn(&mut RuntimeConfig)) -> (Connection, Arc<dyn Transceiver>) {
        let (connector, acceptor) = memory::endpoint(name);
        let (client, raw) = tokio::join!(connector.connect(), acceptor.accept());
        let raw = raw.unwrap();
        let client = Connection::new(client.unwrap(), false, settings_with(configure));
        let validate = protocol::validate_connection_message();
        let (started, written) = tokio::join!(client.start(), raw.write_all(&validate));
        written.unwrap();
        started.unwrap();
        (client, raw)
    }

    async fn read_raw(raw: &Arc<dyn Transceiver>) -> (MessageHeader, InputStream) {
        let mut header = [0u8; HEADER_SIZE];
        raw.read_exact(&mut header).await.unwrap();
        let decoded = MessageHeader::decode(&header, 0).unwrap();
        let mut buf = vec![0u8; decoded.size];
        buf[..HEADER_SIZE].copy_from_slice(&header);
        raw.read_exact(&mut buf[HEADER_SIZE..]).await.unwrap();
        let mut is = InputStream::new(Bytes::from(buf));
        is.set_pos(HEADER_SIZE);
        (decoded, is)
    }

    async fn reply_ok(raw: &Arc<dyn Transceiver>, request: &IncomingRequest, payload: &[u8]) {
        let mut os = message::write_reply_message(request, &OutgoingResponse::ok(payload.to_vec())).unwrap();
        protocol::finish_message(&mut os).unwrap();
        raw.write_all(os.as_slice()).await.unwrap();
    }

    struct NoopTarget;

    impl BatchTarget for NoopTarget {
        fn flush_batch_requests_async(&self) {}
        fn is_compressed(&self) -> bool {
            false
        }
    }

    struct Echo;

    #[async_trait]
    impl Dispatcher for Echo {
        async fn dispatch(&self, request: IncomingRequest) -> OutgoingResponse {
            OutgoingResponse::ok(request.params)
        }
    }

    #[tokio::test]
    async fn test_validation_activates_both_sides() {
        let (client, server) = connected_pair("validate").await;
        assert_eq!(client.state(), ConnectionState::Active);
        assert_eq!(server.state(), ConnectionState::Active);
        assert!(client.is_usable());
        assert_ne!(client.id(), server.id());
    }

    #[tokio::test]
    async fn test_bad_validation_message_rejected() {
        let (connector, acceptor) = memory::endpoint("bad-validate");
        let (client, raw) = tokio::join!(connector.connect(), acceptor.accept());
        let raw = raw.unwrap();
        let client = Connection::new(client.unwrap(), false, settings_with(|_| {}));
        let mut garbage = protocol::validate_connection_message().to_vec();
        garbage[0] = b'X';
        let (started, _) = tokio::join!(client.start(), raw.write_all(&garbage));
        assert!(matches!(started, Err(RpcError::BadMagic { .. })));
        assert_eq!(client.state(), ConnectionState::Closed);

        let (connector, acceptor) = memory::endpoint("wrong-type");
        let (client, raw) = tokio::join!(connector.connect(), acceptor.accept());
        let raw = raw.unwrap();
        let client = Connection::new(client.unwrap(), false, settings_with(|_| {}));
        let close = protocol::close_connection_message();
        let (started, _) = tokio::join!(client.start(), raw.write_all(&close));
        assert!(matches!(started, Err(RpcError::ConnectionNotValidated { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_when_peer_silent() {
        let (connector, acceptor) = memory::endpoint("silent");
        let (client, _raw) = tokio::join!(connector.connect(), acceptor.accept());
        let client = Connection::new(client.unwrap(), false, settings_with(|c| c.connect_timeout_ms = 500));
        assert!(matches!(
            client.start().await,
            Err(RpcError::ConnectTimeout { timeout_ms: 500, .. })
        ));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_request_ids_unique_and_replies_matched() {
        let communicator = Communicator::new(RuntimeConfig::default()).unwrap();
        let (client, raw) = raw_peer("ids", |_| {}).await;
        let proxy = communicator.create_fixed_proxy(Identity::new("obj"), client.clone());

        let futures: Vec<_> = (0..3u8)
            .map(|i| proxy.invoke("op", OperationMode::Normal, &[i], None))
            .collect();

        let mut requests = Vec::new();
        for _ in 0..3 {
            let (header, mut is) = read_raw(&raw).await;
            assert_eq!(header.message_type, MessageType::Request);
            let id = is.read_i32().unwrap();
            requests.push(IncomingRequest::read(&mut is, id).unwrap());
        }
        let mut ids: Vec<i32> = requests.iter().map(|r| r.request_id).collect();
        assert!(ids.iter().all(|id| *id > 0));
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(client.pending_requests(), 3);

        // Reply in reverse order, echoing the single parameter byte.
        for request in requests.iter().rev() {
            reply_ok(&raw, request, &request.params).await;
        }
        for (i, fut) in futures.into_iter().enumerate() {
            assert_eq!(fut.await.unwrap().as_ref(), &[i as u8]);
        }
        assert_eq!(client.pending_requests(), 0);
        communicator.destroy().await;
    }

    #[tokio::test]
    async fn test_unknown_reply_is_ignored() {
        let (client, raw) = raw_peer("unknown-reply", |_| {}).await;
        let request = IncomingRequest {
            request_id: 42,
            identity: Identity::new("x"),
            facet: None,
            operation: "op".into(),
            mode: OperationMode::Normal,
            context: Default::default(),
            params: Bytes::new(),
            size: 0,
        };
        reply_ok(&raw, &request, b"late").await;
        raw.write_all(&protocol::validate_connection_message()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_close_connection_fails_outstanding_request_as_retryable() {
        let communicator = Communicator::new(RuntimeConfig {
            retry_intervals_ms: Vec::new(),
            ..RuntimeConfig::default()
        })
        .unwrap();
        let (client, raw) = raw_peer("peer-close", |_| {}).await;
        let proxy = communicator.create_fixed_proxy(Identity::new("obj"), client.clone());

        let fut = proxy.invoke("op", OperationMode::Normal, b"", None);
        let (header, _) = read_raw(&raw).await;
        assert_eq!(header.message_type, MessageType::Request);
        raw.write_all(&protocol::close_connection_message()).await.unwrap();

        let err = fut.await.unwrap_err();
        assert!(matches!(err, RpcError::CloseConnection { .. }), "{err}");
        client.closed().await;
        assert!(matches!(client.throw_exception(), Err(RpcError::CloseConnection { .. })));
        communicator.destroy().await;
    }

    #[tokio::test]
    async fn test_graceful_close_handshake() {
        let (client, server) = connected_pair("graceful").await;
        client.close().await;
        server.closed().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.throw_exception(),
            Err(RpcError::ConnectionClosed { by_application: true, .. })
        ));
        assert!(matches!(server.throw_exception(), Err(RpcError::CloseConnection { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_timeout_when_peer_never_acknowledges() {
        let (client, raw) = raw_peer("no-ack", |c| c.close_timeout_ms = 500).await;
        let start = Instant::now();
        tokio::time::timeout(Duration::from_secs(5), client.close())
            .await
            .expect("close did not escalate");
        assert!(start.elapsed() >= Duration::from_millis(500));
        // The first close reason is kept over the timeout.
        assert!(matches!(
            client.throw_exception(),
            Err(RpcError::ConnectionClosed { by_application: true, .. })
        ));
        assert_eq!(client.state(), ConnectionState::Closed);

        let (header, _) = read_raw(&raw).await;
        assert_eq!(header.message_type, MessageType::CloseConnection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_timer_armed_only_after_close_sent() {
        let (client, raw) = raw_peer("no-ack-timer", |c| c.close_timeout_ms = 500).await;
        let closing = tokio::spawn({
            let client = client.clone();
            async move { client.close().await }
        });
        let (header, _) = read_raw(&raw).await;
        assert_eq!(header.message_type, MessageType::CloseConnection);
        assert!(lock(&client.inner.state).close_timer.is_some());
        closing.await.unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_does_not_time_out_pending_call() {
        struct Slow;

        #[async_trait]
        impl Dispatcher for Slow {
            async fn dispatch(&self, request: IncomingRequest) -> OutgoingResponse {
                tokio::time::sleep(Duration::from_millis(400)).await;
                OutgoingResponse::ok(request.params)
            }
        }

        let (client, server) = connected_pair_split("slow-close", |c| c.close_timeout_ms = 100, |_| {}).await;
        server.set_dispatcher(Arc::new(Slow));
        let communicator = Communicator::new(RuntimeConfig::default()).unwrap();
        let proxy = communicator.create_fixed_proxy(Identity::new("slow"), client.clone());

        let fut = proxy.invoke("op", OperationMode::Normal, b"late", None);
        while lock(&server.inner.state).dispatch_count == 0 {
            tokio::task::yield_now().await;
        }
        let closing = tokio::spawn({
            let client = client.clone();
            async move { client.close().await }
        });
        while !lock(&client.inner.state).close_requested {
            tokio::task::yield_now().await;
        }
        assert!(lock(&client.inner.state).close_timer.is_none());

        assert_eq!(fut.await.unwrap().as_ref(), b"late");
        closing.await.unwrap();
        assert!(matches!(
            client.throw_exception(),
            Err(RpcError::ConnectionClosed { by_application: true, .. })
        ));
        server.closed().await;
        communicator.destroy().await;
    }

    #[tokio::test]
    async fn test_abort_closes_both_sides() {
        let (client, server) = connected_pair("abort").await;
        client.abort();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.throw_exception(),
            Err(RpcError::ConnectionAborted { by_application: true, .. })
        ));
        server.closed().await;
        assert!(matches!(server.throw_exception(), Err(RpcError::ConnectionLost { .. })));
    }

    #[tokio::test]
    async fn test_on_close_runs_once_closed() {
        let (client, _server) = connected_pair("callbacks").await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        client.on_close(move |c| {
            let _ = tx.send(c.id());
        });
        client.abort();
        assert_eq!(rx.await.unwrap(), client.id());

        let (tx, rx) = tokio::sync::oneshot::channel();
        client.on_close(move |c| {
            let _ = tx.send(c.state());
        });
        assert_eq!(rx.await.unwrap(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sent_on_idle_connection() {
        let (_client, raw) = raw_peer("heartbeat", |c| c.idle_timeout_secs = 2).await;
        let start = Instant::now();
        let (header, _) = tokio::time::timeout(Duration::from_secs(2), read_raw(&raw))
            .await
            .expect("no heartbeat within the idle timeout");
        assert_eq!(header.message_type, MessageType::ValidateConnection);
        assert!(start.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_check_aborts_silent_peer() {
        let (client, _raw) = raw_peer("idle", |c| c.idle_timeout_secs = 3).await;
        tokio::time::timeout(Duration::from_secs(10), client.closed())
            .await
            .expect("idle connection not closed");
        assert!(matches!(client.throw_exception(), Err(RpcError::ConnectionIdle { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_pair_alive() {
        let (client, server) = connected_pair_with("alive", |c| {
            c.idle_timeout_secs = 2;
            c.inactivity_timeout_secs = 0;
        })
        .await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(client.state(), ConnectionState::Active);
        assert_eq!(server.state(), ConnectionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_connection_closed() {
        let (client, server) = connected_pair_split(
            "inactive",
            |c| {
                c.idle_timeout_secs = 2;
                c.inactivity_timeout_secs = 5;
            },
            |c| {
                c.idle_timeout_secs = 2;
                c.inactivity_timeout_secs = 0;
            },
        )
        .await;
        tokio::time::timeout(Duration::from_secs(10), client.closed())
            .await
            .expect("inactive connection not closed");
        assert!(matches!(
            client.throw_exception(),
            Err(RpcError::ConnectionClosed { by_application: false, .. })
        ));
        server.closed().await;
    }

    #[tokio::test]
    async fn test_connection_batch_flush() {
        let (client, raw) = raw_peer("batch", |_| {}).await;
        let queue = client.batch_queue().clone();
        for op in ["a", "b"] {
            let mut os = OutputStream::new();
            queue.prepare_batch_request(&mut os).unwrap();
            let target = message::RequestTarget {
                identity: &Identity::new("obj"),
                facet: None,
                operation: op,
                mode: OperationMode::Normal,
                context: &Default::default(),
            };
            message::write_request_body(&mut os, &target, b"").unwrap();
            queue.finish_batch_request(&mut os, &NoopTarget, op);
        }

        client.flush_batch_requests().await.unwrap();
        let (header, mut is) = read_raw(&raw).await;
        assert_eq!(header.message_type, MessageType::RequestBatch);
        assert_eq!(is.pos(), HEADER_SIZE);
        assert_eq!(IncomingRequest::read(&mut is, 0).unwrap().operation, "a");
        assert_eq!(IncomingRequest::read(&mut is, 0).unwrap().operation, "b");
        assert_eq!(is.remaining(), 0);
        assert!(queue.is_empty());

        // Nothing queued: completes without writing.
        client.flush_batch_requests().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_without_dispatcher_replies_object_not_exist() {
        let (connector, acceptor) = memory::endpoint("no-dispatcher");
        let (raw, server) = tokio::join!(connector.connect(), acceptor.accept());
        let raw = raw.unwrap();
        let server = Connection::new(server.unwrap(), true, settings_with(|_| {}));
        let (started, (validate, _)) = tokio::join!(server.start(), read_raw(&raw));
        started.unwrap();
        assert_eq!(validate.message_type, MessageType::ValidateConnection);

        let mut os = OutputStream::new();
        protocol::write_request_header(&mut os);
        let target = message::RequestTarget {
            identity: &Identity::new("missing"),
            facet: None,
            operation: "op",
            mode: OperationMode::Normal,
            context: &Default::default(),
        };
        message::write_request_body(&mut os, &target, b"").unwrap();
        os.rewrite_i32(7, REQUEST_ID_OFFSET).unwrap();
        protocol::finish_message(&mut os).unwrap();
        raw.write_all(os.as_slice()).await.unwrap();

        let (header, mut is) = read_raw(&raw).await;
        assert_eq!(header.message_type, MessageType::Reply);
        assert_eq!(is.read_i32().unwrap(), 7);
        assert_eq!(is.read_u8().unwrap(), ReplyStatus::ObjectNotExist as u8);
    }

    #[tokio::test]
    async fn test_dispatch_and_compressed_reply() {
        let (client, server) = connected_pair("echo").await;
        server.set_dispatcher(Arc::new(Echo));
        let communicator = Communicator::new(RuntimeConfig::default()).unwrap();
        let proxy = communicator
            .create_fixed_proxy(Identity::new("echo"), client.clone())
            .with_compress(true);
        let payload = vec![9u8; 4096];
        let reply = proxy.invoke("echo", OperationMode::Normal, &payload, None).await.unwrap();
        assert_eq!(reply.as_ref(), payload.as_slice());
        communicator.destroy().await;
    }

    #[tokio::test]
    async fn test_graceful_close_waits_for_dispatch() {
        struct Slow;

        #[async_trait]
        impl Dispatcher for Slow {
            async fn dispatch(&self, request: IncomingRequest) -> OutgoingResponse {
                tokio::time::sleep(Duration::from_millis(50)).await;
                OutgoingResponse::ok(request.params)
            }
        }

        let (client, server) = connected_pair("drain").await;
        server.set_dispatcher(Arc::new(Slow));
        let communicator = Communicator::new(RuntimeConfig::default()).unwrap();
        let proxy = communicator.create_fixed_proxy(Identity::new("slow"), client.clone());
        let fut = proxy.invoke("op", OperationMode::Normal, b"done", None);
        while server.state() == ConnectionState::Active && lock(&server.inner.state).dispatch_count == 0 {
            tokio::task::yield_now().await;
        }
        server.destroy(RpcError::ObjectAdapterDeactivated { name: "test".into() });
        assert_eq!(fut.await.unwrap().as_ref(), b"done");
        server.closed().await;
        client.closed().await;
        communicator.destroy().await;
    }
}
