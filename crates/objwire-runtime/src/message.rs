//! Request and reply bodies.
//!
//! A request body is: identity, facet path (0 or 1 entries), operation name,
//! operation mode byte, context and the parameter encapsulation. A reply body
//! is a status byte followed by a status-dependent payload.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::error::{Result, RpcError};
use crate::protocol::{self, CompressionStatus, MessageType};
use crate::stream::{InputStream, OutputStream};

/// Request context: string key/value pairs sent with every request.
pub type Context = BTreeMap<String, String>;

/// Identity of a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    /// Object name.
    pub name: String,
    /// Optional category.
    pub category: String,
}

impl Identity {
    /// Creates an identity with an empty category.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
        }
    }

    /// Creates an identity with a category.
    pub fn with_category(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    /// Appends the identity to `os`.
    pub fn write(&self, os: &mut OutputStream) -> Result<()> {
        os.write_string(&self.name)?;
        os.write_string(&self.category)
    }

    /// Reads an identity from `is`.
    pub fn read(is: &mut InputStream) -> Result<Self> {
        let name = is.read_string()?;
        let category = is.read_string()?;
        Ok(Self { name, category })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

/// Operation mode byte; determines whether a resend after sending is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum OperationMode {
    /// May change state; never resent once sent.
    #[default]
    Normal = 0,
    /// Does not change state.
    Nonmutating = 1,
    /// Same effect no matter how often it runs.
    Idempotent = 2,
}

impl OperationMode {
    /// True if a request already sent may be sent again.
    pub fn is_idempotent(self) -> bool {
        !matches!(self, OperationMode::Normal)
    }
}

impl TryFrom<u8> for OperationMode {
    type Error = RpcError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(OperationMode::Normal),
            1 => Ok(OperationMode::Nonmutating),
            2 => Ok(OperationMode::Idempotent),
            other => Err(RpcError::Marshal {
                reason: format!("invalid operation mode {}", other),
            }),
        }
    }
}

/// How a proxy delivers its invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvocationMode {
    /// Request with a reply.
    #[default]
    Twoway,
    /// Request without a reply over a stream transport.
    Oneway,
    /// Oneway request queued until the batch is flushed.
    BatchOneway,
    /// Request without a reply over a datagram transport.
    Datagram,
    /// Datagram request queued until the batch is flushed.
    BatchDatagram,
}

impl InvocationMode {
    /// True for the batch modes.
    pub fn is_batch(self) -> bool {
        matches!(self, InvocationMode::BatchOneway | InvocationMode::BatchDatagram)
    }

    /// True if the caller waits for a reply.
    pub fn is_twoway(self) -> bool {
        matches!(self, InvocationMode::Twoway)
    }

    /// True for the datagram modes.
    pub fn is_datagram(self) -> bool {
        matches!(self, InvocationMode::Datagram | InvocationMode::BatchDatagram)
    }
}

fn write_facet(os: &mut OutputStream, facet: Option<&str>) -> Result<()> {
    match facet {
        Some(f) => os.write_string_seq(&[f.to_string()]),
        None => os.write_size(0),
    }
}

fn read_facet(is: &mut InputStream) -> Result<Option<String>> {
    let mut path = is.read_string_seq()?;
    match path.len() {
        0 => Ok(None),
        1 => Ok(path.pop()),
        n => Err(RpcError::Marshal {
            reason: format!("facet path with {} elements", n),
        }),
    }
}

fn write_context(os: &mut OutputStream, context: &Context) -> Result<()> {
    os.write_size(context.len())?;
    for (k, v) in context {
        os.write_string(k)?;
        os.write_string(v)?;
    }
    Ok(())
}

fn read_context(is: &mut InputStream) -> Result<Context> {
    let n = is.read_size()?;
    let mut context = Context::new();
    for _ in 0..n {
        let k = is.read_string()?;
        let v = is.read_string()?;
        context.insert(k, v);
    }
    Ok(context)
}

/// Addressing and call metadata of one request.
#[derive(Debug, Clone, Copy)]
pub struct RequestTarget<'a> {
    /// Target object.
    pub identity: &'a Identity,
    /// Target facet.
    pub facet: Option<&'a str>,
    /// Operation name.
    pub operation: &'a str,
    /// Operation mode.
    pub mode: OperationMode,
    /// Request context.
    pub context: &'a Context,
}

/// Appends a request body (everything after the request id) to `os`.
pub fn write_request_body(os: &mut OutputStream, target: &RequestTarget<'_>, params: &[u8]) -> Result<()> {
    target.identity.write(os)?;
    write_facet(os, target.facet)?;
    os.write_string(target.operation)?;
    os.write_u8(target.mode as u8);
    write_context(os, target.context)?;
    os.write_encapsulation(params)
}

/// A request as seen by the dispatching side.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Request id; 0 for oneway and batched requests.
    pub request_id: i32,
    /// Target object.
    pub identity: Identity,
    /// Target facet.
    pub facet: Option<String>,
    /// Operation name.
    pub operation: String,
    /// Operation mode.
    pub mode: OperationMode,
    /// Request context.
    pub context: Context,
    /// Parameter encapsulation payload.
    pub params: Bytes,
    /// Size in bytes of the request body on the wire.
    pub size: usize,
}

impl IncomingRequest {
    /// Reads one request body from `is`.
    pub fn read(is: &mut InputStream, request_id: i32) -> Result<Self> {
        let start = is.pos();
        let identity = Identity::read(is)?;
        let facet = read_facet(is)?;
        let operation = is.read_string()?;
        let mode = OperationMode::try_from(is.read_u8()?)?;
        let context = read_context(is)?;
        let params = is.read_encapsulation()?;
        Ok(Self {
            request_id,
            identity,
            facet,
            operation,
            mode,
            context,
            params,
            size: is.pos() - start,
        })
    }

    /// True if the caller expects a reply.
    pub fn expects_reply(&self) -> bool {
        self.request_id != 0
    }
}

/// Reply status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    /// Success; payload is the result encapsulation.
    Ok = 0,
    /// User exception; payload is the exception encapsulation.
    UserException = 1,
    /// The object does not exist.
    ObjectNotExist = 2,
    /// The facet does not exist.
    FacetNotExist = 3,
    /// The operation does not exist.
    OperationNotExist = 4,
    /// The dispatch raised a local exception.
    UnknownLocalException = 5,
    /// The dispatch raised an undeclared user exception.
    UnknownUserException = 6,
    /// The dispatch raised some other exception.
    UnknownException = 7,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = RpcError;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::UserException,
            2 => ReplyStatus::ObjectNotExist,
            3 => ReplyStatus::FacetNotExist,
            4 => ReplyStatus::OperationNotExist,
            5 => ReplyStatus::UnknownLocalException,
            6 => ReplyStatus::UnknownUserException,
            7 => ReplyStatus::UnknownException,
            other => return Err(RpcError::UnknownReplyStatus(other)),
        })
    }
}

/// A dispatcher's answer to one request.
#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    /// Reply status.
    pub status: ReplyStatus,
    /// Encapsulation payload for `Ok` and `UserException`.
    pub payload: Bytes,
    /// Description for the `Unknown*` statuses.
    pub message: Option<String>,
}

impl OutgoingResponse {
    fn with_status(status: ReplyStatus) -> Self {
        Self {
            status,
            payload: Bytes::new(),
            message: None,
        }
    }

    /// Successful result.
    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::with_status(ReplyStatus::Ok)
        }
    }

    /// Declared user exception.
    pub fn user_exception(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::with_status(ReplyStatus::UserException)
        }
    }

    /// No servant for the identity.
    pub fn object_not_exist() -> Self {
        Self::with_status(ReplyStatus::ObjectNotExist)
    }

    /// No servant for the facet.
    pub fn facet_not_exist() -> Self {
        Self::with_status(ReplyStatus::FacetNotExist)
    }

    /// The servant lacks the operation.
    pub fn operation_not_exist() -> Self {
        Self::with_status(ReplyStatus::OperationNotExist)
    }

    /// Local exception during dispatch.
    pub fn unknown_local(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::with_status(ReplyStatus::UnknownLocalException)
        }
    }

    /// Undeclared user exception during dispatch.
    pub fn unknown_user(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::with_status(ReplyStatus::UnknownUserException)
        }
    }

    /// Any other failure during dispatch.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::with_status(ReplyStatus::UnknownException)
        }
    }
}

/// Builds a complete reply message for `request`.
///
/// The size field is left for the sender to patch after optional compression.
pub fn write_reply_message(request: &IncomingRequest, response: &OutgoingResponse) -> Result<OutputStream> {
    let mut os = OutputStream::new();
    protocol::write_header(&mut os, MessageType::Reply, CompressionStatus::NotSupported);
    os.write_i32(request.request_id);
    os.write_u8(response.status as u8);
    match response.status {
        ReplyStatus::Ok | ReplyStatus::UserException => {
            os.write_encapsulation(&response.payload)?;
        }
        ReplyStatus::ObjectNotExist | ReplyStatus::FacetNotExist | ReplyStatus::OperationNotExist => {
            request.identity.write(&mut os)?;
            write_facet(&mut os, request.facet.as_deref())?;
            os.write_string(&request.operation)?;
        }
        ReplyStatus::UnknownLocalException
        | ReplyStatus::UnknownUserException
        | ReplyStatus::UnknownException => {
            os.write_string(response.message.as_deref().unwrap_or_default())?;
        }
    }
    Ok(os)
}

/// Decodes a reply body (after the request id) into the invocation result.
pub fn read_reply_body(is: &mut InputStream, operation: &str) -> Result<Bytes> {
    let status = ReplyStatus::try_from(is.read_u8()?)?;
    match status {
        ReplyStatus::Ok => is.read_encapsulation(),
        ReplyStatus::UserException => Err(RpcError::UserException {
            operation: operation.to_string(),
            encapsulation: is.read_encapsulation()?,
        }),
        ReplyStatus::ObjectNotExist | ReplyStatus::FacetNotExist | ReplyStatus::OperationNotExist => {
            let identity = Identity::read(is)?.to_string();
            let facet = read_facet(is)?;
            let operation = is.read_string()?;
            Err(match status {
                ReplyStatus::ObjectNotExist => RpcError::ObjectNotExist {
                    identity,
                    facet,
                    operation,
                },
                ReplyStatus::FacetNotExist => RpcError::FacetNotExist {
                    identity,
                    facet,
                    operation,
                },
                _ => RpcError::OperationNotExist {
                    identity,
                    facet,
                    operation,
                },
            })
        }
        ReplyStatus::UnknownLocalException => Err(RpcError::UnknownLocal {
            message: is.read_string()?,
        }),
        ReplyStatus::UnknownUserException => Err(RpcError::UnknownUser {
            message: is.read_string()?,
        }),
        ReplyStatus::UnknownException => Err(RpcError::Unknown {
            message: is.read_string()?,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::REQUEST_HEADER_SIZE;

    fn sample_request() -> IncomingRequest {
        let identity = Identity::with_category("printer", "office");
        let mut context = Context::new();
        context.insert("trace".into(), "abc".into());
        let mut os = OutputStream::new();
        write_request_body(
            &mut os,
            &RequestTarget {
                identity: &identity,
                facet: Some("color"),
                operation: "print",
                mode: OperationMode::Idempotent,
                context: &context,
            },
            b"page",
        )
        .unwrap();
        let mut is = InputStream::new(os.take());
        IncomingRequest::read(&mut is, 7).unwrap()
    }

    #[test]
    fn test_request_body_fields() {
        let req = sample_request();
        assert_eq!(req.identity.to_string(), "office/printer");
        assert_eq!(req.facet.as_deref(), Some("color"));
        assert_eq!(req.operation, "print");
        assert_eq!(req.mode, OperationMode::Idempotent);
        assert_eq!(req.context.get("trace").map(String::as_str), Some("abc"));
        assert_eq!(&req.params[..], b"page");
        assert!(req.expects_reply());
    }

    #[test]
    fn test_request_body_size_of_minimal_request() {
        let identity = Identity::new("a");
        let mut os = OutputStream::new();
        write_request_body(
            &mut os,
            &RequestTarget {
                identity: &identity,
                facet: None,
                operation: "op1",
                mode: OperationMode::Normal,
                context: &Context::new(),
            },
            &[],
        )
        .unwrap();
        // name(2) + category(1) + facet(1) + op(4) + mode(1) + ctx(1) + encaps(6)
        assert_eq!(os.size(), 16);
    }

    #[test]
    fn test_facet_path_too_long() {
        let mut os = OutputStream::new();
        os.write_string_seq(&["a".into(), "b".into()]).unwrap();
        let mut is = InputStream::new(os.take());
        assert!(read_facet(&mut is).is_err());
    }

    fn reply_body(req: &IncomingRequest, resp: &OutgoingResponse) -> InputStream {
        let mut os = write_reply_message(req, resp).unwrap();
        let body = os.split_off(REQUEST_HEADER_SIZE);
        InputStream::new(body)
    }

    #[test]
    fn test_reply_ok_and_user_exception() {
        let req = sample_request();
        let mut is = reply_body(&req, &OutgoingResponse::ok(Bytes::from_static(b"done")));
        assert_eq!(&read_reply_body(&mut is, "print").unwrap()[..], b"done");

        let mut is = reply_body(&req, &OutgoingResponse::user_exception(Bytes::from_static(b"jam")));
        match read_reply_body(&mut is, "print") {
            Err(RpcError::UserException {
                operation,
                encapsulation,
            }) => {
                assert_eq!(operation, "print");
                assert_eq!(&encapsulation[..], b"jam");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reply_request_failed_carries_target() {
        let req = sample_request();
        let mut is = reply_body(&req, &OutgoingResponse::facet_not_exist());
        match read_reply_body(&mut is, "print") {
            Err(RpcError::FacetNotExist {
                identity,
                facet,
                operation,
            }) => {
                assert_eq!(identity, "office/printer");
                assert_eq!(facet.as_deref(), Some("color"));
                assert_eq!(operation, "print");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reply_unknown_carries_message() {
        let req = sample_request();
        let mut is = reply_body(&req, &OutgoingResponse::unknown_local("disk full"));
        assert!(matches!(
            read_reply_body(&mut is, "print"),
            Err(RpcError::UnknownLocal { message }) if message == "disk full"
        ));
    }

    #[test]
    fn test_reply_status_out_of_range() {
        let mut is = InputStream::new(Bytes::from_static(&[8]));
        let err = read_reply_body(&mut is, "print").unwrap_err();
        assert!(matches!(err, RpcError::UnknownReplyStatus(8)));
        assert_eq!(err.to_string(), "unknown reply status 8");
        assert!(!err.is_retryable_local());
    }

    #[test]
    fn test_invocation_mode_predicates() {
        assert!(InvocationMode::BatchDatagram.is_batch());
        assert!(InvocationMode::BatchDatagram.is_datagram());
        assert!(!InvocationMode::Oneway.is_twoway());
        assert!(OperationMode::Nonmutating.is_idempotent());
        assert!(!OperationMode::Normal.is_idempotent());
    }
}
