// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Fixed-capacity NV regions holding length-prefixed records.
//!
//! The index-orderly RAM keeps the data of orderly NV indices between
//! shutdowns. The user NVRAM keeps defined NV indices and persistent
//! objects. Both are walked record by record and both are rebuilt in the
//! capacity of the reading build, which may differ from the writer's.

use crate::{
    block::NvHeader,
    codec::{StateReader, StateWriter},
    config::BuildConfig,
    error::MarshalError,
    marshal::{nv::NvIndex, object::AnyObject, NvMarshal},
};
use log::{debug, error};

pub const INDEX_ORDERLY_RAM_MAGIC: u32 = 0x5346_feab;
pub const USER_NVRAM_MAGIC: u32 = 0x094f_22c3;
const REGION_VERSION: u16 = 2;

/// Size of a record header in the index-orderly RAM: size, handle and
/// attributes.
pub const RAM_HEADER_SIZE: usize = 12;

/// Largest data area accepted for a single NV index.
pub const NV_INDEX_DATA_MAX: usize = 0x10000 + 0x100;

pub const TPM_HT_NV_INDEX: u8 = 0x01;
pub const TPM_HT_PERSISTENT: u8 = 0x81;

/// Returns the handle type, the most significant byte of a handle.
#[must_use]
pub fn handle_type(handle: u32) -> u8 {
    handle.to_be_bytes()[0]
}

/// A zero-initialized byte region with bounds-checked access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arena {
    bytes: Vec<u8>,
}

impl Arena {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity],
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// # Errors
    ///
    /// Returns `Size` if the range is outside the region.
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8], MarshalError> {
        offset
            .checked_add(len)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or(MarshalError::Size {
                offset,
                needed: len,
                remaining: self.capacity().saturating_sub(offset),
            })
    }

    /// # Errors
    ///
    /// Returns `Size` if the range is outside the region.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MarshalError> {
        let capacity = self.capacity();
        let slot = offset
            .checked_add(data.len())
            .and_then(|end| self.bytes.get_mut(offset..end))
            .ok_or(MarshalError::Size {
                offset,
                needed: data.len(),
                remaining: capacity.saturating_sub(offset),
            })?;
        slot.copy_from_slice(data);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `Size` if the range is outside the region.
    pub fn read_u32(&self, offset: usize) -> Result<u32, MarshalError> {
        let mut out = [0u8; 4];
        out.copy_from_slice(self.read(offset, 4)?);
        Ok(u32::from_be_bytes(out))
    }

    /// # Errors
    ///
    /// Returns `Size` if the range is outside the region.
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<(), MarshalError> {
        self.write(offset, &value.to_be_bytes())
    }

    /// Zeroes everything from `offset` to the end.
    pub fn clear_from(&mut self, offset: usize) {
        if let Some(tail) = self.bytes.get_mut(offset..) {
            tail.fill(0);
        }
    }

    fn overflow(&self, region: &'static str, offset: usize, source_size: u64) -> MarshalError {
        error!(
            "{region}: Insufficient space to write to offset {offset}; Source had {source_size} bytes, we have {} bytes.",
            self.capacity()
        );
        MarshalError::Overflow {
            region,
            offset,
            source_size,
            capacity: self.capacity(),
        }
    }
}

fn record_len(name: &'static str, len: usize) -> Result<u32, MarshalError> {
    u32::try_from(len).map_err(|_| MarshalError::TooLarge {
        name,
        size: len,
        max: u32::MAX as usize,
    })
}

/// A record of the index-orderly RAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamRecord {
    pub handle: u32,
    pub attributes: u32,
    pub data: Vec<u8>,
}

/// Region holding the RAM-backed data of orderly NV indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOrderlyRam {
    arena: Arena,
}

impl IndexOrderlyRam {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: Arena::new(capacity),
        }
    }

    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Replaces the whole region with `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `ArrayCount` if `bytes` does not match the capacity.
    pub fn load_raw(&mut self, bytes: &[u8]) -> Result<(), MarshalError> {
        if bytes.len() != self.arena.capacity() {
            error!(
                "s_indexOrderlyRam: Bad array size; expected {}, got {}",
                self.arena.capacity(),
                bytes.len()
            );
            return Err(MarshalError::ArrayCount {
                name: "s_indexOrderlyRam",
                expected: self.arena.capacity(),
                found: bytes.len(),
            });
        }
        self.arena.write(0, bytes)
    }

    /// Offset of the terminating record, or of the end of the usable space.
    fn end(&self) -> Result<usize, MarshalError> {
        let mut offset = 0;
        while offset + RAM_HEADER_SIZE <= self.arena.capacity() {
            let size = self.arena.read_u32(offset)? as usize;
            if size == 0 {
                break;
            }
            if size < RAM_HEADER_SIZE {
                return Err(MarshalError::BadParameter(format!(
                    "INDEX_ORDERLY_RAM: record at {offset} has size {size}"
                )));
            }
            offset += size;
        }
        Ok(offset)
    }

    /// Lists the records.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if a record length is corrupted.
    pub fn records(&self) -> Result<Vec<RamRecord>, MarshalError> {
        let mut records = Vec::new();
        let mut offset = 0;
        while offset + RAM_HEADER_SIZE <= self.arena.capacity() {
            let size = self.arena.read_u32(offset)? as usize;
            if size == 0 {
                break;
            }
            if size < RAM_HEADER_SIZE || offset + size > self.arena.capacity() {
                return Err(MarshalError::BadParameter(format!(
                    "INDEX_ORDERLY_RAM: record at {offset} has size {size}"
                )));
            }
            records.push(RamRecord {
                handle: self.arena.read_u32(offset + 4)?,
                attributes: self.arena.read_u32(offset + 8)?,
                data: self
                    .arena
                    .read(offset + RAM_HEADER_SIZE, size - RAM_HEADER_SIZE)?
                    .to_vec(),
            });
            offset += size;
        }
        Ok(records)
    }

    /// Appends a record.
    ///
    /// # Errors
    ///
    /// Returns `Size` if the record does not fit.
    pub fn insert(&mut self, record: &RamRecord) -> Result<(), MarshalError> {
        let offset = self.end()?;
        let size = RAM_HEADER_SIZE + record.data.len();
        // the record and a terminator, unless the record fills the region
        if offset + size > self.arena.capacity() {
            return Err(MarshalError::Size {
                offset,
                needed: size,
                remaining: self.arena.capacity() - offset,
            });
        }
        self.arena.write_u32(offset, record_len("INDEX_ORDERLY_RAM", size)?)?;
        self.arena.write_u32(offset + 4, record.handle)?;
        self.arena.write_u32(offset + 8, record.attributes)?;
        self.arena.write(offset + RAM_HEADER_SIZE, &record.data)?;
        if offset + size + 4 <= self.arena.capacity() {
            self.arena.write_u32(offset + size, 0)?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `BadParameter` if a record length is corrupted.
    pub fn marshal(&self, w: &mut StateWriter) -> Result<(), MarshalError> {
        NvHeader::write(w, REGION_VERSION, INDEX_ORDERLY_RAM_MAGIC, 1);
        w.write_u32(record_len("INDEX_ORDERLY_RAM", self.arena.capacity())?);
        let mut offset = 0;
        loop {
            let size = self.arena.read_u32(offset)? as usize;
            w.write_u32(record_len("INDEX_ORDERLY_RAM", size)?);
            if size == 0 {
                break;
            }
            if size < RAM_HEADER_SIZE || offset + size > self.arena.capacity() {
                error!("INDEX_ORDERLY_RAM: nrh->size corrupted: {size}");
                return Err(MarshalError::BadParameter(format!(
                    "INDEX_ORDERLY_RAM: record at {offset} has size {size}"
                )));
            }
            w.write_u32(self.arena.read_u32(offset + 4)?);
            w.write_u32(self.arena.read_u32(offset + 8)?);
            let data = self.arena.read(offset + RAM_HEADER_SIZE, size - RAM_HEADER_SIZE)?;
            w.write_sized_array(data)?;
            offset += size;
            // a full region has no terminator
            if offset + RAM_HEADER_SIZE > self.arena.capacity() {
                break;
            }
        }
        w.write_future_block()
    }

    /// Rebuilds the region in a capacity of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Overflow` if the records do not fit.
    pub fn unmarshal(r: &mut StateReader<'_>, capacity: usize) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, REGION_VERSION, INDEX_ORDERLY_RAM_MAGIC)?;
        let source_size = r.read_u32()?;
        let source = source_size as usize;
        let mut ram = Self::new(capacity);
        let arena = &mut ram.arena;
        let mut offset = 0;
        loop {
            if offset + RAM_HEADER_SIZE > source {
                // the writer's region was full and has no terminator
                arena.clear_from(offset);
                break;
            }
            if offset + 4 > capacity {
                return Err(arena.overflow("INDEX_ORDERLY_RAM", offset + 4, source_size.into()));
            }
            let size = r.read_u32()?;
            if size == 0 {
                arena.write_u32(offset, 0)?;
                break;
            }
            if offset + RAM_HEADER_SIZE > capacity {
                return Err(arena.overflow(
                    "INDEX_ORDERLY_RAM",
                    offset + RAM_HEADER_SIZE,
                    source_size.into(),
                ));
            }
            let handle = r.read_u32()?;
            let attributes = r.read_u32()?;
            let datasize = usize::from(r.read_u16()?);
            let end = offset + RAM_HEADER_SIZE + datasize;
            if end > capacity {
                return Err(arena.overflow("INDEX_ORDERLY_RAM", end, source_size.into()));
            }
            arena.write(offset + RAM_HEADER_SIZE, r.read_bytes(datasize)?)?;
            arena.write_u32(offset, record_len("INDEX_ORDERLY_RAM", end - offset)?)?;
            arena.write_u32(offset + 4, handle)?;
            arena.write_u32(offset + 8, attributes)?;
            offset = end;
        }
        r.read_future_block(&hdr, "INDEX_ORDERLY_RAM", "version 3 or later")?;
        Ok(ram)
    }
}

/// A decoded user-NVRAM record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NvEntry {
    Index { index: NvIndex, data: Vec<u8> },
    Object { handle: u32, object: AnyObject },
}

impl NvEntry {
    #[must_use]
    pub fn handle(&self) -> u32 {
        match self {
            Self::Index { index, .. } => index.nv_index,
            Self::Object { handle, .. } => *handle,
        }
    }
}

/// Region holding NV indices and persistent objects.
///
/// Record layout: entry size `u32`, handle `u32`, then for an NV index a
/// `u16` length, the encoded index and its data, and for a persistent object
/// the encoded object. A zero entry size ends the list and is followed by
/// the `u64` maximum counter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNvram {
    arena: Arena,
}

impl UserNvram {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: Arena::new(capacity),
        }
    }

    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    fn end(&self) -> Result<usize, MarshalError> {
        let mut offset = 0;
        loop {
            let size = self.arena.read_u32(offset)? as usize;
            if size == 0 {
                return Ok(offset);
            }
            if size < 8 {
                return Err(MarshalError::BadParameter(format!(
                    "USER_NVRAM: record at {offset} has size {size}"
                )));
            }
            offset += size;
        }
    }

    /// # Errors
    ///
    /// Returns `Size` if the region is corrupted.
    pub fn max_count(&self) -> Result<u64, MarshalError> {
        let offset = self.end()? + 4;
        let mut out = [0u8; 8];
        out.copy_from_slice(self.arena.read(offset, 8)?);
        Ok(u64::from_be_bytes(out))
    }

    /// # Errors
    ///
    /// Returns `Size` if the region is corrupted.
    pub fn set_max_count(&mut self, value: u64) -> Result<(), MarshalError> {
        let offset = self.end()? + 4;
        self.arena.write(offset, &value.to_be_bytes())
    }

    fn decode_entry(
        &self,
        offset: usize,
        size: usize,
        config: &BuildConfig,
    ) -> Result<NvEntry, MarshalError> {
        let handle = self.arena.read_u32(offset + 4)?;
        let payload = self.arena.read(offset + 8, size - 8)?;
        let mut r = StateReader::new(payload);
        match handle_type(handle) {
            TPM_HT_NV_INDEX => {
                let len = usize::from(r.read_u16()?);
                let index = NvIndex::unmarshal(&mut StateReader::new(r.read_bytes(len)?), config)?;
                let data = r.read_bytes(r.remaining())?.to_vec();
                Ok(NvEntry::Index { index, data })
            }
            TPM_HT_PERSISTENT => Ok(NvEntry::Object {
                handle,
                object: AnyObject::unmarshal(&mut r, config)?,
            }),
            _ => {
                error!("USER_NVRAM: Corrupted handle: {handle:08x}");
                Err(MarshalError::Handle(handle))
            }
        }
    }

    /// Lists the records.
    ///
    /// # Errors
    ///
    /// Returns `Handle` for a record of unknown type, or another
    /// `MarshalError` for a corrupted record.
    pub fn entries(&self, config: &BuildConfig) -> Result<Vec<NvEntry>, MarshalError> {
        let mut entries = Vec::new();
        let mut offset = 0;
        loop {
            let size = self.arena.read_u32(offset)? as usize;
            if size == 0 {
                return Ok(entries);
            }
            if size < 8 {
                return Err(MarshalError::BadParameter(format!(
                    "USER_NVRAM: record at {offset} has size {size}"
                )));
            }
            entries.push(self.decode_entry(offset, size, config)?);
            offset += size;
        }
    }

    fn encode_payload(entry: &NvEntry, config: &BuildConfig) -> Result<Vec<u8>, MarshalError> {
        let mut w = StateWriter::new();
        match entry {
            NvEntry::Index { index, data } => {
                let mut iw = StateWriter::new();
                index.marshal(&mut iw, config)?;
                w.write_sized_array(&iw.finish()?)?;
                w.write_bytes(data);
            }
            NvEntry::Object { object, .. } => object.marshal(&mut w, config)?,
        }
        w.finish()
    }

    /// Writes a record at `offset` and returns the offset past it.
    fn put_entry(
        &mut self,
        offset: usize,
        handle: u32,
        payload: &[u8],
    ) -> Result<usize, MarshalError> {
        let size = 8 + payload.len();
        self.arena.write_u32(offset, record_len("USER_NVRAM", size)?)?;
        self.arena.write_u32(offset + 4, handle)?;
        self.arena.write(offset + 8, payload)?;
        Ok(offset + size)
    }

    fn put_tail(&mut self, offset: usize, max_count: u64) -> Result<(), MarshalError> {
        self.arena.write_u32(offset, 0)?;
        self.arena.write(offset + 4, &max_count.to_be_bytes())
    }

    /// Appends a record.
    ///
    /// # Errors
    ///
    /// Returns `Size` if the record does not fit, or `Handle` if the handle
    /// type does not match the entry.
    pub fn insert(&mut self, entry: &NvEntry, config: &BuildConfig) -> Result<(), MarshalError> {
        let handle = entry.handle();
        let expected = match entry {
            NvEntry::Index { .. } => TPM_HT_NV_INDEX,
            NvEntry::Object { .. } => TPM_HT_PERSISTENT,
        };
        if handle_type(handle) != expected {
            return Err(MarshalError::Handle(handle));
        }
        let payload = Self::encode_payload(entry, config)?;
        let offset = self.end()?;
        let max_count = self.max_count()?;
        let needed = 8 + payload.len() + 4 + 8;
        if offset + needed > self.arena.capacity() {
            return Err(MarshalError::Size {
                offset,
                needed,
                remaining: self.arena.capacity() - offset,
            });
        }
        let end = self.put_entry(offset, handle, &payload)?;
        self.put_tail(end, max_count)
    }

    /// # Errors
    ///
    /// Returns `Handle` for a record of unknown type, or another
    /// `MarshalError` for a corrupted record.
    pub fn marshal(&self, w: &mut StateWriter, config: &BuildConfig) -> Result<(), MarshalError> {
        NvHeader::write(w, REGION_VERSION, USER_NVRAM_MAGIC, 1);
        w.write_u64(self.arena.capacity() as u64);
        let mut offset = 0;
        loop {
            let size = self.arena.read_u32(offset)? as usize;
            w.write_u32(record_len("USER_NVRAM", size)?);
            if size == 0 {
                break;
            }
            if size < 8 {
                return Err(MarshalError::BadParameter(format!(
                    "USER_NVRAM: record at {offset} has size {size}"
                )));
            }
            w.write_u32(self.arena.read_u32(offset + 4)?);
            match self.decode_entry(offset, size, config)? {
                NvEntry::Index { index, data } => {
                    index.marshal(w, config)?;
                    w.write_u32(record_len("USER_NVRAM", data.len())?);
                    w.write_bytes(&data);
                }
                NvEntry::Object { object, .. } => object.marshal(w, config)?,
            }
            offset += size;
        }
        let mut max_count = [0u8; 8];
        max_count.copy_from_slice(self.arena.read(offset + 4, 8)?);
        w.write_u64(u64::from_be_bytes(max_count));
        w.write_future_block()
    }

    /// Rebuilds the region in a capacity of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Overflow` if the records do not fit, `Handle` for a record
    /// of unknown type and `TooLarge` for an oversized NV index.
    pub fn unmarshal(
        r: &mut StateReader<'_>,
        config: &BuildConfig,
        capacity: usize,
    ) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, REGION_VERSION, USER_NVRAM_MAGIC)?;
        let source_size = r.read_u64()?;
        let mut nvram = Self::new(capacity);
        let mut offset = 0;
        let mut count = 0;
        loop {
            if offset + 4 > capacity {
                return Err(nvram.arena.overflow("USER_NVRAM", offset + 4, source_size));
            }
            let entrysize = r.read_u32()?;
            if entrysize == 0 {
                break;
            }
            let handle = r.read_u32()?;
            let payload = match handle_type(handle) {
                TPM_HT_NV_INDEX => {
                    let index = NvIndex::unmarshal(r, config)?;
                    let mut iw = StateWriter::new();
                    index.marshal(&mut iw, config)?;
                    let encoded = iw.finish()?;
                    let header_end = offset + 8 + 2 + encoded.len();
                    if header_end > capacity {
                        return Err(nvram.arena.overflow("USER_NVRAM", header_end, source_size));
                    }
                    let datasize = r.read_u32()? as usize;
                    if datasize > NV_INDEX_DATA_MAX {
                        error!("datasize for NV_INDEX too large: {datasize}");
                        return Err(MarshalError::TooLarge {
                            name: "NV_INDEX data",
                            size: datasize,
                            max: NV_INDEX_DATA_MAX,
                        });
                    }
                    if header_end + datasize > capacity {
                        return Err(nvram.arena.overflow(
                            "USER_NVRAM",
                            header_end + datasize,
                            source_size,
                        ));
                    }
                    let mut w = StateWriter::new();
                    w.write_sized_array(&encoded)?;
                    w.write_bytes(r.read_bytes(datasize)?);
                    w.finish()?
                }
                TPM_HT_PERSISTENT => {
                    let object = AnyObject::unmarshal(r, config)?;
                    let mut w = StateWriter::new();
                    object.marshal(&mut w, config)?;
                    w.finish()?
                }
                _ => {
                    error!("USER_NVRAM: Read handle {handle:#010x} of unknown type");
                    return Err(MarshalError::Handle(handle));
                }
            };
            let end = offset + 8 + payload.len();
            if end > capacity {
                return Err(nvram.arena.overflow("USER_NVRAM", end, source_size));
            }
            offset = nvram.put_entry(offset, handle, &payload)?;
            count += 1;
        }
        if offset + 4 + 8 > capacity {
            return Err(nvram.arena.overflow("USER_NVRAM", offset + 12, source_size));
        }
        let max_count = r.read_u64()?;
        nvram.put_tail(offset, max_count)?;
        debug!("USER_NVRAM: {count} records, {offset} of {capacity} bytes");
        r.read_future_block(&hdr, "USER_NVRAM", "version 3 or later")?;
        Ok(nvram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_bounds() {
        let mut arena = Arena::new(8);
        assert!(arena.write(6, &[1, 2, 3]).is_err());
        arena.write_u32(4, 0xaabb_ccdd).unwrap();
        assert_eq!(arena.read_u32(4).unwrap(), 0xaabb_ccdd);
        assert!(arena.read(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_orderly_ram_roundtrip() {
        let mut ram = IndexOrderlyRam::new(64);
        let record = RamRecord {
            handle: 0x0100_0001,
            attributes: 0x0400_0000,
            data: vec![1, 2, 3, 4, 5],
        };
        ram.insert(&record).unwrap();

        let mut w = StateWriter::new();
        ram.marshal(&mut w).unwrap();
        let bytes = w.finish().unwrap();
        let out = IndexOrderlyRam::unmarshal(&mut StateReader::new(&bytes), 64).unwrap();
        assert_eq!(out.records().unwrap(), vec![record]);
        assert_eq!(out, ram);
    }

    #[test]
    fn test_full_orderly_ram_has_no_terminator() {
        let mut ram = IndexOrderlyRam::new(20);
        ram.insert(&RamRecord {
            handle: 0x0100_0002,
            attributes: 0,
            data: vec![9; 8],
        })
        .unwrap();
        let mut w = StateWriter::new();
        ram.marshal(&mut w).unwrap();
        let bytes = w.finish().unwrap();
        let out = IndexOrderlyRam::unmarshal(&mut StateReader::new(&bytes), 32).unwrap();
        assert_eq!(out.records().unwrap().len(), 1);
        assert_eq!(out.arena().capacity(), 32);
    }

    #[test]
    fn test_orderly_ram_overflow() {
        let mut ram = IndexOrderlyRam::new(64);
        ram.insert(&RamRecord {
            handle: 0x0100_0003,
            attributes: 0,
            data: vec![0; 40],
        })
        .unwrap();
        let mut w = StateWriter::new();
        ram.marshal(&mut w).unwrap();
        let bytes = w.finish().unwrap();
        let err = IndexOrderlyRam::unmarshal(&mut StateReader::new(&bytes), 32).unwrap_err();
        assert_eq!(
            err,
            MarshalError::Overflow {
                region: "INDEX_ORDERLY_RAM",
                offset: 52,
                source_size: 64,
                capacity: 32,
            }
        );
    }

    #[test]
    fn test_unknown_handle_type() {
        let config = BuildConfig::default();
        let mut w = StateWriter::new();
        NvHeader::write(&mut w, REGION_VERSION, USER_NVRAM_MAGIC, 1);
        w.write_u64(1024);
        w.write_u32(16);
        w.write_u32(0x4000_0001);
        let bytes = w.finish().unwrap();
        let err = UserNvram::unmarshal(&mut StateReader::new(&bytes), &config, 1024).unwrap_err();
        assert_eq!(err, MarshalError::Handle(0x4000_0001));
    }
}
