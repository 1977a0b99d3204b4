// SPDX-License-Identifier: MIT

//! The big-endian wire codec shared by every command and response.
//!
//! `Reader` and `Writer` are plain cursors over a byte slice / `Vec<u8>`;
//! every primitive read can fail with [`TpmCoreError::Malformed`] rather
//! than panicking, since the bytes on the read side always originate from
//! an untrusted transport.

use crate::error::{TpmCoreError, TpmResult};
use crate::pool::{Pool, SensitiveBuffer};

/// A cursor for reading big-endian primitives out of a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, command_code: u32) -> TpmResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(TpmCoreError::Malformed {
                command_code,
                context: format!(
                    "expected {n} more bytes at offset {}, only {} remain",
                    self.pos,
                    self.remaining()
                ),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self, command_code: u32) -> TpmResult<u8> {
        Ok(self.take(1, command_code)?[0])
    }

    pub fn read_u16(&mut self, command_code: u32) -> TpmResult<u16> {
        let b = self.take(2, command_code)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self, command_code: u32) -> TpmResult<u32> {
        let b = self.take(4, command_code)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self, command_code: u32) -> TpmResult<u64> {
        let b = self.take(8, command_code)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Reads exactly `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize, command_code: u32) -> TpmResult<&'a [u8]> {
        self.take(n, command_code)
    }

    /// Reads a `TPM2B_*`-shaped field: a `u16` length prefix followed by
    /// that many bytes, copied into plain (non-pooled) memory. Use
    /// [`Reader::read_tpm2b_sensitive`] instead when the field is
    /// secret-bearing.
    pub fn read_tpm2b(&mut self, command_code: u32) -> TpmResult<Vec<u8>> {
        let len = self.read_u16(command_code)? as usize;
        Ok(self.take(len, command_code)?.to_vec())
    }

    /// Reads a `TPM2B_*`-shaped field directly into a pooled, zero-on-drop
    /// buffer. Used for nonces, HMACs, and any other field that must never
    /// linger in ordinary heap memory. An empty field (`size == 0`) is
    /// legal and yields `None` rather than a zero-length pool rent, since
    /// the pool itself refuses those.
    pub fn read_tpm2b_sensitive(&mut self, pool: &Pool, command_code: u32) -> TpmResult<Option<SensitiveBuffer>> {
        let len = self.read_u16(command_code)? as usize;
        let bytes = self.take(len, command_code)?;
        if len == 0 {
            return Ok(None);
        }
        pool.rent_copy(bytes).map(Some)
    }
}

/// A growable big-endian byte buffer for building command bodies.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    #[must_use]
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// The number of bytes written so far, used to patch the command-size
    /// field once the full body is known.
    #[must_use]
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes a `TPM2B_*`-shaped field: a `u16` length prefix followed by
    /// `bytes`. Panics only if `bytes.len()` cannot fit in a `u16`, which
    /// would itself indicate a malformed caller-side structure far larger
    /// than anything the protocol allows.
    pub fn write_tpm2b(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= u16::MAX as usize, "TPM2B field too large");
        self.write_u16(bytes.len() as u16);
        self.write_bytes(bytes);
    }

    /// Writes a `TPM2B_*`-shaped field sourced from pooled sensitive
    /// memory, without ever copying it into an intermediate `Vec<u8>`.
    /// `None` writes the legal empty encoding (two zero bytes).
    pub fn write_tpm2b_sensitive(&mut self, buf: Option<&SensitiveBuffer>) -> TpmResult<()> {
        match buf {
            Some(buf) => buf.with_bytes(|bytes| self.write_tpm2b(bytes)),
            None => {
                self.write_u16(0);
                Ok(())
            }
        }
    }

    /// Overwrites 4 bytes at `offset` with `v`, used to patch in the
    /// `commandSize`/`responseSize` field once the full body length is
    /// known.
    pub fn patch_u32(&mut self, offset: usize, v: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_primitives() {
        let mut w = Writer::new();
        w.write_u8(0xAB);
        w.write_u16(0x1234);
        w.write_u32(0xDEAD_BEEF);
        w.write_u64(0x0102_0304_0506_0708);
        let bytes = w.into_vec();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u8(0).unwrap(), 0xAB);
        assert_eq!(r.read_u16(0).unwrap(), 0x1234);
        assert_eq!(r.read_u32(0).unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_u64(0).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn underflow_is_malformed_not_a_panic() {
        let bytes = [0x00u8, 0x01];
        let mut r = Reader::new(&bytes);
        assert!(matches!(r.read_u32(0x17A), Err(TpmCoreError::Malformed { .. })));
    }

    #[test]
    fn tpm2b_round_trip() {
        let mut w = Writer::new();
        w.write_tpm2b(b"hello");
        let bytes = w.into_vec();
        assert_eq!(bytes, [0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_tpm2b(0).unwrap(), b"hello");
    }

    #[test]
    fn patch_u32_overwrites_in_place() {
        let mut w = Writer::new();
        w.write_u32(0);
        w.write_bytes(&[1, 2, 3, 4]);
        w.patch_u32(0, 8);
        assert_eq!(w.into_vec(), [0, 0, 0, 8, 1, 2, 3, 4]);
    }

    #[test]
    fn sensitive_round_trip_through_pool() {
        let pool = Pool::new();
        let mut w = Writer::new();
        let buf = pool.rent_copy(b"nonceTPM").unwrap();
        w.write_tpm2b_sensitive(Some(&buf)).unwrap();
        let bytes = w.into_vec();

        let mut r = Reader::new(&bytes);
        let decoded = r.read_tpm2b_sensitive(&pool, 0).unwrap().unwrap();
        assert_eq!(decoded.to_vec().unwrap(), b"nonceTPM");
    }

    #[test]
    fn empty_sensitive_tpm2b_round_trips_as_none() {
        let pool = Pool::new();
        let mut w = Writer::new();
        w.write_tpm2b_sensitive(None).unwrap();
        let bytes = w.into_vec();
        assert_eq!(bytes, [0x00, 0x00]);

        let mut r = Reader::new(&bytes);
        assert!(r.read_tpm2b_sensitive(&pool, 0).unwrap().is_none());
    }
}
