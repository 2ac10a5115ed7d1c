// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Big-endian primitive codec.
//!
//! Every persisted structure is built from the operations in this module.
//! `StateWriter` appends to a growable buffer and keeps the patch points of
//! open optional blocks. `StateReader` walks a borrowed slice and never
//! advances past a failed read.

use crate::error::MarshalError;

/// An append-only output buffer.
#[derive(Debug, Default, Clone)]
pub struct StateWriter {
    buf: Vec<u8>,
    pub(crate) blocks: Vec<usize>,
}

impl StateWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer and returns the encoded bytes.
    ///
    /// # Errors
    ///
    /// Returns `BlockNesting` if an optional block was left open.
    pub fn finish(self) -> Result<Vec<u8>, MarshalError> {
        if !self.blocks.is_empty() {
            return Err(MarshalError::BlockNesting("unterminated block"));
        }
        Ok(self.buf)
    }

    pub fn write_u8(&mut self, value: u8) -> usize {
        self.buf.push(value);
        1
    }

    pub fn write_u16(&mut self, value: u16) -> usize {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> usize {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> usize {
        self.write_bytes(&value.to_be_bytes())
    }

    /// Writes a boolean as a single byte.
    pub fn write_bool(&mut self, value: bool) -> usize {
        self.write_u8(u8::from(value))
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> usize {
        self.buf.extend_from_slice(bytes);
        bytes.len()
    }

    /// Writes a `u16` length prefix followed by the bytes.
    ///
    /// # Errors
    ///
    /// Returns `TooLarge` if the slice does not fit a `u16` length.
    pub fn write_sized_array(&mut self, bytes: &[u8]) -> Result<usize, MarshalError> {
        let len = u16::try_from(bytes.len()).map_err(|_| MarshalError::TooLarge {
            name: "array",
            size: bytes.len(),
            max: usize::from(u16::MAX),
        })?;
        Ok(self.write_u16(len) + self.write_bytes(bytes))
    }

    /// Writes a TPM2B buffer whose capacity is `max` bytes.
    ///
    /// # Errors
    ///
    /// Returns `TooLarge` if the buffer exceeds `max`.
    pub fn write_tpm2b(&mut self, bytes: &[u8], max: usize) -> Result<usize, MarshalError> {
        if bytes.len() > max {
            return Err(MarshalError::TooLarge {
                name: "TPM2B",
                size: bytes.len(),
                max,
            });
        }
        self.write_sized_array(bytes)
    }

    /// Overwrites a previously written `u16`.
    ///
    /// # Errors
    ///
    /// Returns `Size` if `offset` does not point at two written bytes.
    pub fn patch_u16(&mut self, offset: usize, value: u16) -> Result<(), MarshalError> {
        let len = self.buf.len();
        let slot = self
            .buf
            .get_mut(offset..offset + 2)
            .ok_or(MarshalError::Size {
                offset,
                needed: 2,
                remaining: len.saturating_sub(offset),
            })?;
        slot.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }
}

/// A bounds-checked cursor over an encoded buffer.
#[derive(Debug, Clone)]
pub struct StateReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> StateReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the bytes consumed so far.
    #[must_use]
    pub fn consumed(&self) -> &'a [u8] {
        &self.buf[..self.pos]
    }

    fn ensure(&self, needed: usize) -> Result<(), MarshalError> {
        if needed > self.remaining() {
            return Err(MarshalError::Size {
                offset: self.pos,
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    /// Reads `len` raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `Size` if fewer than `len` bytes remain.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], MarshalError> {
        self.ensure(len)?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], MarshalError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// # Errors
    ///
    /// Returns `Size` on a short buffer.
    pub fn read_u8(&mut self) -> Result<u8, MarshalError> {
        Ok(self.read_array::<1>()?[0])
    }

    /// # Errors
    ///
    /// Returns `Size` on a short buffer.
    pub fn read_u16(&mut self) -> Result<u16, MarshalError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    /// # Errors
    ///
    /// Returns `Size` on a short buffer.
    pub fn read_u32(&mut self) -> Result<u32, MarshalError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// # Errors
    ///
    /// Returns `Size` on a short buffer.
    pub fn read_u64(&mut self) -> Result<u64, MarshalError> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    /// Reads a one-byte boolean. Any non-zero value is `true`.
    ///
    /// # Errors
    ///
    /// Returns `Size` on a short buffer.
    pub fn read_bool(&mut self) -> Result<bool, MarshalError> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a `u16` length prefix and that many bytes. The cursor stays at
    /// the prefix if the payload is short.
    ///
    /// # Errors
    ///
    /// Returns `Size` if the prefix or the payload is short.
    pub fn read_sized_array(&mut self) -> Result<&'a [u8], MarshalError> {
        let start = self.pos;
        let len = usize::from(self.read_u16()?);
        if let Err(err) = self.ensure(len) {
            self.pos = start;
            return Err(err);
        }
        self.read_bytes(len)
    }

    /// Reads a TPM2B buffer whose capacity is `max` bytes.
    ///
    /// # Errors
    ///
    /// Returns `TooLarge` if the declared size exceeds `max`, or `Size` on a
    /// short buffer.
    pub fn read_tpm2b(&mut self, max: usize) -> Result<Vec<u8>, MarshalError> {
        let start = self.pos;
        let bytes = self.read_sized_array()?;
        if bytes.len() > max {
            self.pos = start;
            return Err(MarshalError::TooLarge {
                name: "TPM2B",
                size: bytes.len(),
                max,
            });
        }
        Ok(bytes.to_vec())
    }

    /// Advances the cursor without interpreting the bytes.
    ///
    /// # Errors
    ///
    /// Returns `Size` if fewer than `len` bytes remain.
    pub fn skip(&mut self, len: usize) -> Result<(), MarshalError> {
        self.read_bytes(len).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let mut w = StateWriter::new();
        w.write_u16(0x0102);
        w.write_u32(0x0304_0506);
        w.write_u64(0x0708_090a_0b0c_0d0e);
        w.write_bool(true);
        assert_eq!(
            w.as_bytes(),
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 1]
        );
    }

    #[test]
    fn test_short_read_does_not_advance() {
        let bytes = [0u8, 1, 2];
        let mut r = StateReader::new(&bytes);
        assert_eq!(r.read_u16().unwrap(), 1);
        let err = r.read_u32().unwrap_err();
        assert_eq!(
            err,
            MarshalError::Size {
                offset: 2,
                needed: 4,
                remaining: 1
            }
        );
        assert_eq!(r.position(), 2);
        assert_eq!(r.read_u8().unwrap(), 2);
    }

    #[test]
    fn test_sized_array_keeps_cursor_on_short_payload() {
        let bytes = [0u8, 4, 0xaa, 0xbb];
        let mut r = StateReader::new(&bytes);
        assert!(r.read_sized_array().is_err());
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn test_tpm2b_limit() {
        let mut w = StateWriter::new();
        assert!(w.write_tpm2b(&[0; 5], 4).is_err());
        w.write_tpm2b(&[7; 4], 4).unwrap();
        let bytes = w.finish().unwrap();
        let mut r = StateReader::new(&bytes);
        assert!(matches!(
            r.clone().read_tpm2b(3),
            Err(MarshalError::TooLarge { size: 4, max: 3, .. })
        ));
        assert_eq!(r.read_tpm2b(4).unwrap(), vec![7; 4]);
        assert!(r.is_empty());
    }

    #[test]
    fn test_patch_u16() {
        let mut w = StateWriter::new();
        w.write_u32(0);
        w.patch_u16(1, 0xbeef).unwrap();
        assert_eq!(w.as_bytes(), &[0, 0xbe, 0xef, 0]);
        assert!(w.patch_u16(3, 1).is_err());
    }
}
