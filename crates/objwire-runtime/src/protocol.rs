//! Message framing for the binary object protocol.
//!
//! Every message starts with a fixed 14-byte header:
//!
//! | offset | size | field                          |
//! |--------|------|--------------------------------|
//! | 0      | 4    | magic `I c e P`                |
//! | 4      | 2    | protocol major/minor (1.0)     |
//! | 6      | 2    | encoding major/minor (1.0)     |
//! | 8      | 1    | message type                   |
//! | 9      | 1    | compression status             |
//! | 10     | 4    | total size, i32 little-endian  |
//!
//! Requests and replies follow the header with an i32 request id. A batch
//! request is the header followed directly by the request bodies; the
//! request count stays with the sender.

use bytes::Bytes;

use crate::error::{Result, RpcError};
use crate::stream::OutputStream;

/// Protocol magic.
pub const MAGIC: [u8; 4] = *b"IceP";

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 14;

/// Offset of the compression status byte.
pub const COMPRESSION_OFFSET: usize = 9;

/// Offset of the i32 message size.
pub const SIZE_OFFSET: usize = 10;

/// Offset of the request id following the header.
pub const REQUEST_ID_OFFSET: usize = HEADER_SIZE;

/// Header plus the request id of a request or reply.
pub const REQUEST_HEADER_SIZE: usize = HEADER_SIZE + 4;

/// Size of a batch request header; the bodies follow it directly.
pub const BATCH_REQUEST_HEADER_SIZE: usize = HEADER_SIZE;

/// Messages smaller than this are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 100;

/// Protocol version spoken by this runtime.
pub const PROTOCOL_1_0: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// Protocol encoding spoken by this runtime.
pub const ENCODING_1_0: EncodingVersion = EncodingVersion { major: 1, minor: 0 };

/// Protocol version pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

/// Protocol encoding version pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

/// Message types carried in header byte 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// A single request.
    Request = 0,
    /// Several oneway requests back to back.
    RequestBatch = 1,
    /// Reply to a twoway request.
    Reply = 2,
    /// Connection validation from the accepting side; later reused as heartbeat.
    ValidateConnection = 3,
    /// Graceful close notification.
    CloseConnection = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = RpcError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::RequestBatch),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::ValidateConnection),
            4 => Ok(MessageType::CloseConnection),
            other => Err(RpcError::UnknownMessageType(other)),
        }
    }
}

/// Compression status carried in header byte 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionStatus {
    /// Uncompressed; the sender cannot decompress a reply.
    NotSupported = 0,
    /// Uncompressed; the sender accepts a compressed reply.
    Supported = 1,
    /// Body is compressed.
    Compressed = 2,
}

impl TryFrom<u8> for CompressionStatus {
    type Error = RpcError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(CompressionStatus::NotSupported),
            1 => Ok(CompressionStatus::Supported),
            2 => Ok(CompressionStatus::Compressed),
            other => Err(RpcError::Compression {
                reason: format!("invalid compression status {}", other),
            }),
        }
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type.
    pub message_type: MessageType,
    /// Compression status.
    pub compression: CompressionStatus,
    /// Total message size including the header.
    pub size: usize,
}

impl MessageHeader {
    /// Decodes and validates a header.
    ///
    /// `message_size_max` of 0 disables the size limit.
    pub fn decode(raw: &[u8; HEADER_SIZE], message_size_max: usize) -> Result<Self> {
        if raw[0..4] != MAGIC {
            let mut got = [0u8; 4];
            got.copy_from_slice(&raw[0..4]);
            return Err(RpcError::BadMagic { got });
        }
        if raw[4] != PROTOCOL_1_0.major {
            return Err(RpcError::UnsupportedProtocol {
                major: raw[4],
                minor: raw[5],
            });
        }
        if raw[6] != ENCODING_1_0.major {
            return Err(RpcError::UnsupportedEncoding {
                major: raw[6],
                minor: raw[7],
            });
        }
        let message_type = MessageType::try_from(raw[8])?;
        let compression = CompressionStatus::try_from(raw[COMPRESSION_OFFSET])?;
        let mut size_raw = [0u8; 4];
        size_raw.copy_from_slice(&raw[SIZE_OFFSET..SIZE_OFFSET + 4]);
        let size = i32::from_le_bytes(size_raw);
        if size < HEADER_SIZE as i32 {
            return Err(RpcError::IllegalMessageSize { size });
        }
        let size = size as usize;
        if message_size_max > 0 && size > message_size_max {
            return Err(RpcError::MessageSizeExceeded {
                size,
                max: message_size_max,
            });
        }
        Ok(Self {
            message_type,
            compression,
            size,
        })
    }
}

/// Appends a header with a zero size placeholder.
pub fn write_header(os: &mut OutputStream, message_type: MessageType, compression: CompressionStatus) {
    os.write_blob(&MAGIC);
    os.write_u8(PROTOCOL_1_0.major);
    os.write_u8(PROTOCOL_1_0.minor);
    os.write_u8(ENCODING_1_0.major);
    os.write_u8(ENCODING_1_0.minor);
    os.write_u8(message_type as u8);
    os.write_u8(compression as u8);
    os.write_i32(0);
}

/// Appends a request header with a zero request id placeholder.
pub fn write_request_header(os: &mut OutputStream) {
    write_header(os, MessageType::Request, CompressionStatus::NotSupported);
    os.write_i32(0);
}

/// Appends a batch request header.
pub fn write_batch_request_header(os: &mut OutputStream) {
    write_header(os, MessageType::RequestBatch, CompressionStatus::NotSupported);
}

/// Patches the total size field with the stream's current size.
pub fn finish_message(os: &mut OutputStream) -> Result<()> {
    let size = i32::try_from(os.size()).map_err(|_| RpcError::MessageSizeExceeded {
        size: os.size(),
        max: i32::MAX as usize,
    })?;
    os.rewrite_i32(size, SIZE_OFFSET)
}

/// Sets the compression status byte of a framed message.
pub fn set_compression_status(os: &mut OutputStream, status: CompressionStatus) {
    if os.size() > COMPRESSION_OFFSET {
        os.as_mut_slice()[COMPRESSION_OFFSET] = status as u8;
    }
}

fn header_only(message_type: MessageType) -> Bytes {
    let mut os = OutputStream::new();
    write_header(&mut os, message_type, CompressionStatus::NotSupported);
    // A 14-byte message always fits the size field.
    let _ = finish_message(&mut os);
    os.take()
}

/// The validate-connection message; also used as heartbeat.
pub fn validate_connection_message() -> Bytes {
    header_only(MessageType::ValidateConnection)
}

/// The close-connection message.
pub fn close_connection_message() -> Bytes {
    header_only(MessageType::CloseConnection)
}
