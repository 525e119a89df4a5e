// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 marshalling/unmarshalling utilities
//!
//! All integers are big-endian. Variable-length fields carry an explicit
//! size prefix (`u32` for most blobs, `u16` for PCR selections and handle
//! lists). Buffers grow as needed; no fixed ceiling is imposed here.

use crate::constants::DIGEST_SIZE;
use crate::error::{Error, Result};

/// A 20-byte SHA-1 digest, nonce or authorization value on the wire
pub type Digest = [u8; DIGEST_SIZE];

macro_rules! underflow {
    ($($arg:tt)*) => {
        Err(Error::MalformedResponse(format!($($arg)*)))
    };
}

/// Buffer for building TPM commands
#[derive(Debug, Default, Clone)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.data.push(u8::from(v));
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a blob with a 4-byte size prefix
    pub fn put_sized(&mut self, data: &[u8]) -> Result<()> {
        let size = u32::try_from(data.len())
            .map_err(|_| Error::Encoding(format!("blob of {} bytes is too large", data.len())))?;
        self.put_u32(size);
        self.put_bytes(data);
        Ok(())
    }

    /// Put a blob with a 2-byte size prefix
    pub fn put_sized_u16(&mut self, data: &[u8]) -> Result<()> {
        let size = u16::try_from(data.len())
            .map_err(|_| Error::Encoding(format!("blob of {} bytes is too large", data.len())))?;
        self.put_u16(size);
        self.put_bytes(data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Update a u16 at a specific position (for the tag)
    pub fn update_u16(&mut self, pos: usize, v: u16) {
        self.data[pos..pos + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Update a u32 at a specific position (for size fields)
    pub fn update_u32(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}

/// Buffer for parsing TPM responses
#[derive(Debug)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return underflow!(
                "buffer underflow reading {what}: need {len} bytes, {} remaining",
                self.remaining()
            );
        }
        let v = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => underflow!("invalid boolean value {v}"),
        }
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2, "u16")?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len, "bytes")?.to_vec())
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, "fixed array")?);
        Ok(out)
    }

    pub fn get_digest(&mut self) -> Result<Digest> {
        self.get_array::<DIGEST_SIZE>()
    }

    /// Get a blob with a 4-byte size prefix
    pub fn get_sized(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u32()? as usize;
        self.get_bytes(size)
    }

    /// Get a blob with a 2-byte size prefix
    pub fn get_sized_u16(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        self.get_bytes(size)
    }

    /// Get remaining bytes
    pub fn get_remaining(&mut self) -> Vec<u8> {
        let v = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        v
    }

    /// Skip bytes
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len, "skipped bytes").map(|_| ())
    }

    /// Peek at bytes without advancing position
    pub fn peek_bytes(&self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return underflow!("buffer underflow peeking {len} bytes");
        }
        Ok(&self.data[self.pos..self.pos + len])
    }

    /// Fail if any bytes are left unread
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return underflow!("{} trailing bytes", self.remaining());
        }
        Ok(())
    }
}

/// Trait for types that can be marshalled to TPM format
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()>;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf)?;
        Ok(buf.into_vec())
    }
}

/// Trait for types that can be unmarshalled from TPM format
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self>;

    /// Decode a complete structure, rejecting trailing bytes
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        let value = Self::unmarshal(&mut buf)?;
        buf.finish()?;
        Ok(value)
    }
}

impl Marshal for u8 {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u8(*self);
        Ok(())
    }
}

impl Marshal for u16 {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u16(*self);
        Ok(())
    }
}

impl Marshal for u32 {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u32(*self);
        Ok(())
    }
}

impl Marshal for Digest {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_bytes(self);
        Ok(())
    }
}

impl Unmarshal for u8 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u8()
    }
}

impl Unmarshal for u16 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u16()
    }
}

impl Unmarshal for u32 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u32()
    }
}

impl Unmarshal for Digest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_digest()
    }
}
