//! Deterministic binary encoding for hashed and signed records.
//!
//! Fixed field order, big-endian integers, and `u32` length prefixes on
//! every variable-length field. Each record starts with a length-prefixed
//! type tag so that two record types can never collide on the same bytes.

use super::{hash, Digest, DIGEST_LEN};
use crate::error::CoreError;

/// Appends fields in canonical form.
#[derive(Debug, Default)]
pub struct CanonicalWriter {
    buf: Vec<u8>,
}

impl CanonicalWriter {
    /// Start a record of type `tag`.
    pub fn new(tag: &str) -> Self {
        let mut w = Self { buf: Vec::new() };
        w.put_str(tag);
        w
    }

    /// Append one byte.
    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    /// Append a big-endian `u32`.
    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Append a big-endian `u64`.
    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Append a boolean as one byte.
    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.put_u8(u8::from(v))
    }

    /// Append length-prefixed bytes.
    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        // Records are bounded far below 4 GiB (paths, sequences, JSON payloads).
        let len = u32::try_from(v.len()).unwrap_or(u32::MAX);
        self.put_u32(len);
        self.buf.extend_from_slice(v);
        self
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, v: &str) -> &mut Self {
        self.put_bytes(v.as_bytes())
    }

    /// Append a digest as 32 raw bytes.
    pub fn put_digest(&mut self, v: &Digest) -> &mut Self {
        self.buf.extend_from_slice(v.as_bytes());
        self
    }

    /// Append an optional `u64` as a presence byte plus value.
    pub fn put_opt_u64(&mut self, v: Option<u64>) -> &mut Self {
        match v {
            Some(x) => self.put_u8(1).put_u64(x),
            None => self.put_u8(0),
        }
    }

    /// Finished encoding.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// SHA-256 of the finished encoding.
    pub fn digest(self) -> Digest {
        hash(&self.buf)
    }
}

/// Reads fields written by [`CanonicalWriter`] in the same order.
#[derive(Debug)]
pub struct CanonicalReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> CanonicalReader<'a> {
    /// Start reading a record, checking its type tag.
    pub fn new(buf: &'a [u8], tag: &str) -> Result<Self, CoreError> {
        let mut r = Self { buf, pos: 0 };
        let found = r.get_str()?;
        if found != tag {
            return Err(CoreError::InvalidInput(format!(
                "record tag mismatch: expected {tag}, found {found}"
            )));
        }
        Ok(r)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| CoreError::InvalidInput("truncated record".to_owned()))?;
        let slice = self.buf.get(self.pos..end).unwrap_or_default();
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CoreError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read one byte.
    pub fn get_u8(&mut self) -> Result<u8, CoreError> {
        Ok(self.take_array::<1>()?[0])
    }

    /// Read a big-endian `u32`.
    pub fn get_u32(&mut self) -> Result<u32, CoreError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    /// Read a big-endian `u64`.
    pub fn get_u64(&mut self) -> Result<u64, CoreError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    /// Read a boolean byte.
    pub fn get_bool(&mut self) -> Result<bool, CoreError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CoreError::InvalidInput(format!("bad bool byte {other}"))),
        }
    }

    /// Read length-prefixed bytes.
    pub fn get_bytes(&mut self) -> Result<Vec<u8>, CoreError> {
        let len = usize::try_from(self.get_u32()?)
            .map_err(|_| CoreError::InvalidInput("length overflow".to_owned()))?;
        Ok(self.take(len)?.to_vec())
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn get_str(&mut self) -> Result<String, CoreError> {
        String::from_utf8(self.get_bytes()?)
            .map_err(|e| CoreError::InvalidInput(format!("bad utf-8 field: {e}")))
    }

    /// Read a raw 32-byte digest.
    pub fn get_digest(&mut self) -> Result<Digest, CoreError> {
        Ok(Digest::from_bytes(self.take_array::<DIGEST_LEN>()?))
    }

    /// Read an optional `u64`.
    pub fn get_opt_u64(&mut self) -> Result<Option<u64>, CoreError> {
        if self.get_bool()? {
            Ok(Some(self.get_u64()?))
        } else {
            Ok(None)
        }
    }

    /// Fail if unread bytes remain.
    pub fn finish(self) -> Result<(), CoreError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(CoreError::InvalidInput("trailing bytes after record".to_owned()))
        }
    }
}
