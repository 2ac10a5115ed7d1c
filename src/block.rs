// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Structure headers and skippable optional blocks.

use crate::{
    codec::{StateReader, StateWriter},
    error::MarshalError,
};
use log::{debug, error};

/// Maximum number of simultaneously open optional blocks.
pub const MAX_BLOCK_NESTING: usize = 5;

/// Header in front of every persisted structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvHeader {
    pub version: u16,
    pub magic: u32,
    pub min_version: u16,
}

impl NvHeader {
    /// Writes a header. `min_version` is the oldest reader version that can
    /// interpret the fields that follow.
    pub fn write(w: &mut StateWriter, version: u16, magic: u32, min_version: u16) -> usize {
        let mut written = w.write_u16(version);
        written += w.write_u32(magic);
        if version >= 2 {
            written += w.write_u16(min_version);
        }
        written
    }

    /// Reads and validates a header.
    ///
    /// # Errors
    ///
    /// Returns `BadTag` if the magic does not match, and `BadVersion` if the
    /// writer requires a newer reader than `supported`.
    pub fn read(r: &mut StateReader<'_>, supported: u16, magic: u32) -> Result<Self, MarshalError> {
        let version = r.read_u16()?;
        let found = r.read_u32()?;
        if found != magic {
            error!("Invalid magic. Expected {magic:#010x}, got {found:#010x}");
            return Err(MarshalError::BadTag {
                expected: magic,
                found,
            });
        }
        let min_version = if version >= 2 { r.read_u16()? } else { version };
        if min_version > supported {
            error!(
                "Cannot unmarshal {magic:#010x}: minimum version {min_version} exceeds {supported}"
            );
            return Err(MarshalError::BadVersion {
                magic,
                min_version,
                supported,
            });
        }
        Ok(Self {
            version,
            magic,
            min_version,
        })
    }
}

/// Outcome of reading an optional block marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    /// The payload follows and must be decoded.
    Present,
    /// Neither side has the payload.
    Absent,
    /// The writer had the payload but this build does not use it. The bytes
    /// have already been consumed.
    Skipped,
}

impl Block {
    #[must_use]
    pub fn is_present(self) -> bool {
        self == Self::Present
    }
}

impl StateWriter {
    /// Opens an optional block: a presence flag and a length placeholder that
    /// is patched by [`Self::pop_block`].
    ///
    /// # Errors
    ///
    /// Returns `BlockNesting` if more than [`MAX_BLOCK_NESTING`] blocks are
    /// open.
    pub fn push_block(&mut self, has_block: bool) -> Result<usize, MarshalError> {
        if self.blocks.len() >= MAX_BLOCK_NESTING {
            return Err(MarshalError::BlockNesting("too deep"));
        }
        let written = self.write_bool(has_block);
        self.blocks.push(self.len());
        Ok(written + self.write_u16(0))
    }

    /// Closes the innermost optional block and records its length.
    ///
    /// # Errors
    ///
    /// Returns `BlockNesting` if no block is open, or `TooLarge` if the
    /// payload exceeds a `u16` length.
    pub fn pop_block(&mut self) -> Result<(), MarshalError> {
        let pos = self
            .blocks
            .pop()
            .ok_or(MarshalError::BlockNesting("no open block"))?;
        let size = self.len() - pos - 2;
        let size = u16::try_from(size).map_err(|_| MarshalError::TooLarge {
            name: "optional block",
            size,
            max: usize::from(u16::MAX),
        })?;
        self.patch_u16(pos, size)
    }

    /// Writes an empty block reserved for fields of later versions.
    ///
    /// # Errors
    ///
    /// Returns `BlockNesting` if the nesting limit is reached.
    pub fn write_future_block(&mut self) -> Result<(), MarshalError> {
        self.push_block(true)?;
        self.pop_block()
    }
}

impl StateReader<'_> {
    /// Reads an optional block marker.
    ///
    /// # Errors
    ///
    /// Returns `MissingBlock` if the build needs a payload the writer did not
    /// have, or `Size` if a skipped payload is truncated.
    pub fn read_block(
        &mut self,
        needs_block: bool,
        name: &'static str,
        field: &'static str,
    ) -> Result<Block, MarshalError> {
        let has_block = self.read_bool()?;
        let size = self.read_u16()?;
        match (has_block, needs_block) {
            (false, true) => {
                error!("{name} needs missing {field}");
                Err(MarshalError::MissingBlock { name, field })
            }
            (true, false) => {
                self.skip(usize::from(size))?;
                debug!("{name}: skipped {size} bytes of {field}");
                Ok(Block::Skipped)
            }
            (true, true) => Ok(Block::Present),
            (false, false) => Ok(Block::Absent),
        }
    }

    /// Reads the trailing block of a structure written at `header` version.
    ///
    /// # Errors
    ///
    /// Returns `Size` if the skipped payload is truncated.
    pub fn read_future_block(
        &mut self,
        header: &NvHeader,
        name: &'static str,
        field: &'static str,
    ) -> Result<(), MarshalError> {
        if header.version >= 2 {
            self.read_block(false, name, field)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_v1_has_no_min_version() {
        let mut w = StateWriter::new();
        assert_eq!(NvHeader::write(&mut w, 1, 0x1234_5678, 1), 6);
        let bytes = w.finish().unwrap();
        let hdr = NvHeader::read(&mut StateReader::new(&bytes), 1, 0x1234_5678).unwrap();
        assert_eq!(hdr.version, 1);
    }

    #[test]
    fn test_header_accepts_newer_version_with_old_minimum() {
        let mut w = StateWriter::new();
        NvHeader::write(&mut w, 9, 0xaabb_ccdd, 2);
        let bytes = w.finish().unwrap();
        let hdr = NvHeader::read(&mut StateReader::new(&bytes), 2, 0xaabb_ccdd).unwrap();
        assert_eq!(hdr.version, 9);
        assert_eq!(hdr.min_version, 2);
    }

    #[test]
    fn test_nested_blocks_are_patched() {
        let mut w = StateWriter::new();
        w.push_block(true).unwrap();
        w.write_u32(1);
        w.push_block(true).unwrap();
        w.write_u8(2);
        w.pop_block().unwrap();
        w.pop_block().unwrap();
        let bytes = w.finish().unwrap();
        assert_eq!(bytes, [1, 0, 11, 0, 0, 0, 1, 1, 0, 1, 2]);
    }

    #[test]
    fn test_nesting_limit() {
        let mut w = StateWriter::new();
        for _ in 0..MAX_BLOCK_NESTING {
            w.push_block(true).unwrap();
        }
        assert!(matches!(
            w.push_block(true),
            Err(MarshalError::BlockNesting(_))
        ));
        assert!(w.finish().is_err());
    }

    #[test]
    fn test_skip_unneeded_block() {
        let bytes = [1u8, 0, 2, 0xaa, 0xbb, 0xcc];
        let mut r = StateReader::new(&bytes);
        assert_eq!(r.read_block(false, "TEST", "field").unwrap(), Block::Skipped);
        assert_eq!(r.read_u8().unwrap(), 0xcc);
    }
}
