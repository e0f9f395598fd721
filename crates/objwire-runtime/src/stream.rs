//! Output and input byte streams for message marshaling.
//!
//! Only the subset of the encoding needed for message framing is provided:
//! fixed-width integers (little-endian), the compact size encoding, strings,
//! string sequences and encapsulations. Operation parameters travel as opaque
//! encapsulation payloads.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};

/// Encoding version written into every encapsulation header.
pub const ENCAPSULATION_ENCODING: (u8, u8) = (1, 0);

/// Size of an encapsulation header: i32 size plus major and minor version.
pub const ENCAPSULATION_HEADER_SIZE: usize = 6;

/// Growable output buffer with a write cursor at its end.
#[derive(Debug, Default)]
pub struct OutputStream {
    buf: BytesMut,
    encaps: Vec<usize>,
}

impl OutputStream {
    /// Creates an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a stream holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(data),
            encaps: Vec::new(),
        }
    }

    /// Number of bytes written.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Exchanges the contents of two streams.
    pub fn swap(&mut self, other: &mut OutputStream) {
        std::mem::swap(&mut self.buf, &mut other.buf);
        std::mem::swap(&mut self.encaps, &mut other.encaps);
    }

    /// Truncates or zero-extends the stream to `len` bytes.
    pub fn resize(&mut self, len: usize) {
        self.buf.resize(len, 0);
    }

    /// Removes every byte.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.encaps.clear();
    }

    /// Written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable view of the written bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Moves the written bytes out, leaving the stream empty.
    pub fn take(&mut self) -> Bytes {
        self.encaps.clear();
        self.buf.split().freeze()
    }

    /// Removes and returns the bytes from `at` to the end.
    pub fn split_off(&mut self, at: usize) -> Bytes {
        self.buf.split_off(at).freeze()
    }

    /// Writes one byte.
    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Writes a boolean as one byte.
    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    /// Writes a little-endian i32.
    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    /// Overwrites four bytes at `pos` with a little-endian i32.
    pub fn rewrite_i32(&mut self, v: i32, pos: usize) -> Result<()> {
        let end = pos + 4;
        if end > self.buf.len() {
            return Err(RpcError::Marshal {
                reason: format!("rewrite at {} past end of {}-byte stream", pos, self.buf.len()),
            });
        }
        self.buf[pos..end].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    /// Writes raw bytes.
    pub fn write_blob(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Writes a size in the compact encoding: one byte below 255, else 255 and an i32.
    pub fn write_size(&mut self, size: usize) -> Result<()> {
        if size < 255 {
            self.buf.put_u8(size as u8);
        } else {
            let v = i32::try_from(size).map_err(|_| RpcError::Marshal {
                reason: format!("size {} does not fit the wire encoding", size),
            })?;
            self.buf.put_u8(255);
            self.buf.put_i32_le(v);
        }
        Ok(())
    }

    /// Writes a size-prefixed UTF-8 string.
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_size(s.len())?;
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    /// Writes a size-prefixed sequence of strings.
    pub fn write_string_seq(&mut self, seq: &[String]) -> Result<()> {
        self.write_size(seq.len())?;
        for s in seq {
            self.write_string(s)?;
        }
        Ok(())
    }

    /// Opens an encapsulation; its size is patched by `end_encapsulation`.
    pub fn start_encapsulation(&mut self) {
        self.encaps.push(self.buf.len());
        self.buf.put_i32_le(0);
        self.buf.put_u8(ENCAPSULATION_ENCODING.0);
        self.buf.put_u8(ENCAPSULATION_ENCODING.1);
    }

    /// Closes the innermost open encapsulation.
    pub fn end_encapsulation(&mut self) -> Result<()> {
        let start = self.encaps.pop().ok_or_else(|| RpcError::Marshal {
            reason: "end_encapsulation without start_encapsulation".to_string(),
        })?;
        let size = i32::try_from(self.buf.len() - start).map_err(|_| RpcError::Marshal {
            reason: "encapsulation too large".to_string(),
        })?;
        self.rewrite_i32(size, start)
    }

    /// Writes `payload` as a complete encapsulation.
    pub fn write_encapsulation(&mut self, payload: &[u8]) -> Result<()> {
        self.start_encapsulation();
        self.buf.put_slice(payload);
        self.end_encapsulation()
    }

    /// Writes an encapsulation with no payload.
    pub fn write_empty_encapsulation(&mut self) -> Result<()> {
        self.write_encapsulation(&[])
    }
}

/// Read cursor over a received message.
#[derive(Debug, Clone)]
pub struct InputStream {
    buf: Bytes,
    pos: usize,
}

impl InputStream {
    /// Wraps `buf` with the cursor at its start.
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current cursor offset.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Moves the cursor.
    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    /// Bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Total length of the underlying buffer.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(RpcError::Marshal {
                reason: format!(
                    "unexpected end of buffer: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.remaining()
                ),
            });
        }
        Ok(())
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    /// Reads a one-byte boolean.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a little-endian i32.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        let v = i32::from_le_bytes(raw);
        self.pos += 4;
        Ok(v)
    }

    /// Reads `n` raw bytes without copying.
    pub fn read_blob(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        let v = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(v)
    }

    /// Reads a size in the compact encoding.
    pub fn read_size(&mut self) -> Result<usize> {
        let b = self.read_u8()?;
        if b < 255 {
            return Ok(b as usize);
        }
        let v = self.read_i32()?;
        usize::try_from(v).map_err(|_| RpcError::Marshal {
            reason: format!("negative size {}", v),
        })
    }

    /// Reads a size-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_size()?;
        let raw = self.read_blob(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| RpcError::Marshal {
            reason: format!("invalid UTF-8 string: {}", e),
        })
    }

    /// Reads a size-prefixed string sequence.
    pub fn read_string_seq(&mut self) -> Result<Vec<String>> {
        let n = self.read_size()?;
        // Each string costs at least one size byte.
        self.need(n)?;
        (0..n).map(|_| self.read_string()).collect()
    }

    /// Reads an encapsulation and returns its payload.
    pub fn read_encapsulation(&mut self) -> Result<Bytes> {
        let size = self.read_i32()?;
        let size = usize::try_from(size)
            .ok()
            .filter(|s| *s >= ENCAPSULATION_HEADER_SIZE)
            .ok_or_else(|| RpcError::Marshal {
                reason: format!("invalid encapsulation size {}", size),
            })?;
        let major = self.read_u8()?;
        let minor = self.read_u8()?;
        if major != ENCAPSULATION_ENCODING.0 {
            return Err(RpcError::UnsupportedEncoding { major, minor });
        }
        self.read_blob(size - ENCAPSULATION_HEADER_SIZE)
    }

    /// Reads the rest of the buffer.
    pub fn read_rest(&mut self) -> Bytes {
        let v = self.buf.slice(self.pos..);
        self.pos = self.buf.len();
        v
    }
}
