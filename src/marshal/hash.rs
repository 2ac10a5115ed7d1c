// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! In-progress hash computations of hash, HMAC and event sequences.

use super::{count_u16, read_array_count, read_fixed_bytes, TPM_ALG_NULL};
use crate::{
    block::NvHeader,
    codec::{StateReader, StateWriter},
    error::MarshalError,
};
use log::error;
use tpm2_protocol::data::TpmAlgId;

pub const HASH_STATE_SHA1_MAGIC: u32 = 0x19d4_6f50;
pub const HASH_STATE_SHA256_MAGIC: u32 = 0x6ea0_59d0;
pub const HASH_STATE_SHA384_MAGIC: u32 = 0x1481_4b08;
pub const HASH_STATE_SHA512_MAGIC: u32 = 0x269e_8ae0;
pub const ANY_HASH_STATE_MAGIC: u32 = 0x349d_494b;
pub const HASH_STATE_MAGIC: u32 = 0x5628_78a2;
const HASH_STATE_VERSION: u16 = 2;

pub const SHA1_BLOCK_SIZE: usize = 64;
pub const SHA256_BLOCK_SIZE: usize = 64;
pub const SHA512_BLOCK_SIZE: usize = 128;
const SHA2_WORDS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sha1State {
    pub h: [u32; 5],
    pub nl: u32,
    pub nh: u32,
    pub data: [u8; SHA1_BLOCK_SIZE],
    pub num: u32,
}

impl Default for Sha1State {
    fn default() -> Self {
        Self {
            h: [0; 5],
            nl: 0,
            nh: 0,
            data: [0; SHA1_BLOCK_SIZE],
            num: 0,
        }
    }
}

impl Sha1State {
    fn marshal(&self, w: &mut StateWriter) -> Result<(), MarshalError> {
        NvHeader::write(w, HASH_STATE_VERSION, HASH_STATE_SHA1_MAGIC, 1);
        for h in self.h {
            w.write_u32(h);
        }
        w.write_u32(self.nl);
        w.write_u32(self.nh);
        w.write_sized_array(&self.data)?;
        w.write_u32(self.num);
        w.write_future_block()
    }

    fn unmarshal(r: &mut StateReader<'_>) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, HASH_STATE_VERSION, HASH_STATE_SHA1_MAGIC)?;
        let mut h = [0; 5];
        for word in &mut h {
            *word = r.read_u32()?;
        }
        let nl = r.read_u32()?;
        let nh = r.read_u32()?;
        let data = read_fixed_bytes(r, "HASH_STATE_SHA1 data")?;
        let num = r.read_u32()?;
        r.read_future_block(&hdr, "HASH_STATE_SHA1", "version 3 or later")?;
        Ok(Self {
            h,
            nl,
            nh,
            data,
            num,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sha256State {
    pub h: [u32; SHA2_WORDS],
    pub nl: u32,
    pub nh: u32,
    pub data: [u8; SHA256_BLOCK_SIZE],
    pub num: u32,
    pub md_len: u32,
}

impl Default for Sha256State {
    fn default() -> Self {
        Self {
            h: [0; SHA2_WORDS],
            nl: 0,
            nh: 0,
            data: [0; SHA256_BLOCK_SIZE],
            num: 0,
            md_len: 32,
        }
    }
}

impl Sha256State {
    fn marshal(&self, w: &mut StateWriter) -> Result<(), MarshalError> {
        NvHeader::write(w, HASH_STATE_VERSION, HASH_STATE_SHA256_MAGIC, 1);
        w.write_u16(count_u16("HASH_STATE h", SHA2_WORDS)?);
        for h in self.h {
            w.write_u32(h);
        }
        w.write_u32(self.nl);
        w.write_u32(self.nh);
        w.write_sized_array(&self.data)?;
        w.write_u32(self.num);
        w.write_u32(self.md_len);
        w.write_future_block()
    }

    fn unmarshal(r: &mut StateReader<'_>) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, HASH_STATE_VERSION, HASH_STATE_SHA256_MAGIC)?;
        read_array_count(r, "HASH_STATE_SHA256 h", SHA2_WORDS)?;
        let mut h = [0; SHA2_WORDS];
        for word in &mut h {
            *word = r.read_u32()?;
        }
        let nl = r.read_u32()?;
        let nh = r.read_u32()?;
        let data = read_fixed_bytes(r, "HASH_STATE_SHA256 data")?;
        let num = r.read_u32()?;
        let md_len = r.read_u32()?;
        r.read_future_block(&hdr, "HASH_STATE_SHA256", "version 3 or later")?;
        Ok(Self {
            h,
            nl,
            nh,
            data,
            num,
            md_len,
        })
    }
}

/// SHA-384 and SHA-512 share one state layout with different magics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sha512State {
    pub h: [u64; SHA2_WORDS],
    pub nl: u64,
    pub nh: u64,
    pub data: [u8; SHA512_BLOCK_SIZE],
    pub num: u32,
    pub md_len: u32,
}

impl Default for Sha512State {
    fn default() -> Self {
        Self {
            h: [0; SHA2_WORDS],
            nl: 0,
            nh: 0,
            data: [0; SHA512_BLOCK_SIZE],
            num: 0,
            md_len: 64,
        }
    }
}

impl Sha512State {
    fn magic(alg: TpmAlgId) -> u32 {
        if alg == TpmAlgId::Sha384 {
            HASH_STATE_SHA384_MAGIC
        } else {
            HASH_STATE_SHA512_MAGIC
        }
    }

    fn marshal(&self, w: &mut StateWriter, alg: TpmAlgId) -> Result<(), MarshalError> {
        NvHeader::write(w, HASH_STATE_VERSION, Self::magic(alg), 1);
        w.write_u16(count_u16("HASH_STATE h", SHA2_WORDS)?);
        for h in self.h {
            w.write_u64(h);
        }
        w.write_u64(self.nl);
        w.write_u64(self.nh);
        w.write_sized_array(&self.data)?;
        w.write_u32(self.num);
        w.write_u32(self.md_len);
        w.write_future_block()
    }

    fn unmarshal(r: &mut StateReader<'_>, alg: TpmAlgId) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, HASH_STATE_VERSION, Self::magic(alg))?;
        read_array_count(r, "HASH_STATE_SHA512 h", SHA2_WORDS)?;
        let mut h = [0; SHA2_WORDS];
        for word in &mut h {
            *word = r.read_u64()?;
        }
        let nl = r.read_u64()?;
        let nh = r.read_u64()?;
        let data = read_fixed_bytes(r, "HASH_STATE_SHA512 u.p")?;
        let num = r.read_u32()?;
        let md_len = r.read_u32()?;
        r.read_future_block(&hdr, "HASH_STATE_SHA512", "version 3 or later")?;
        Ok(Self {
            h,
            nl,
            nh,
            data,
            num,
            md_len,
        })
    }
}

/// Algorithm-specific state. `Null` marks an unused slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AnyHashState {
    #[default]
    Null,
    Sha1(Sha1State),
    Sha256(Sha256State),
    Sha384(Sha512State),
    Sha512(Sha512State),
}

impl AnyHashState {
    /// Empty state for `alg`.
    #[must_use]
    pub fn new(alg: TpmAlgId) -> Self {
        match alg {
            TpmAlgId::Sha1 => Self::Sha1(Sha1State::default()),
            TpmAlgId::Sha256 => Self::Sha256(Sha256State::default()),
            TpmAlgId::Sha384 => Self::Sha384(Sha512State {
                md_len: 48,
                ..Sha512State::default()
            }),
            TpmAlgId::Sha512 => Self::Sha512(Sha512State::default()),
            _ => Self::Null,
        }
    }

    #[must_use]
    pub fn alg(&self) -> u16 {
        match self {
            Self::Null => TPM_ALG_NULL,
            Self::Sha1(_) => TpmAlgId::Sha1 as u16,
            Self::Sha256(_) => TpmAlgId::Sha256 as u16,
            Self::Sha384(_) => TpmAlgId::Sha384 as u16,
            Self::Sha512(_) => TpmAlgId::Sha512 as u16,
        }
    }

    fn marshal(&self, w: &mut StateWriter) -> Result<(), MarshalError> {
        NvHeader::write(w, HASH_STATE_VERSION, ANY_HASH_STATE_MAGIC, 1);
        match self {
            Self::Null => {}
            Self::Sha1(state) => state.marshal(w)?,
            Self::Sha256(state) => state.marshal(w)?,
            Self::Sha384(state) => state.marshal(w, TpmAlgId::Sha384)?,
            Self::Sha512(state) => state.marshal(w, TpmAlgId::Sha512)?,
        }
        w.write_future_block()
    }

    fn unmarshal(r: &mut StateReader<'_>, alg: Option<TpmAlgId>) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, HASH_STATE_VERSION, ANY_HASH_STATE_MAGIC)?;
        let state = match alg {
            Some(TpmAlgId::Sha1) => Self::Sha1(Sha1State::unmarshal(r)?),
            Some(TpmAlgId::Sha256) => Self::Sha256(Sha256State::unmarshal(r)?),
            Some(TpmAlgId::Sha384) => Self::Sha384(Sha512State::unmarshal(r, TpmAlgId::Sha384)?),
            Some(TpmAlgId::Sha512) => Self::Sha512(Sha512State::unmarshal(r, TpmAlgId::Sha512)?),
            _ => Self::Null,
        };
        r.read_future_block(&hdr, "ANY_HASH_STATE", "version 3 or later")?;
        Ok(state)
    }
}

/// A hash or HMAC computation in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashState {
    pub state_type: u8,
    pub state: AnyHashState,
}

impl HashState {
    /// # Errors
    ///
    /// Returns `BlockNesting` if the writer has too many open blocks.
    pub fn marshal(&self, w: &mut StateWriter) -> Result<(), MarshalError> {
        NvHeader::write(w, HASH_STATE_VERSION, HASH_STATE_MAGIC, 1);
        w.write_u8(self.state_type);
        w.write_u16(self.state.alg());
        self.state.marshal(w)?;
        w.write_future_block()
    }

    /// # Errors
    ///
    /// Returns `BadParameter` if the hash algorithm is unknown.
    pub fn unmarshal(r: &mut StateReader<'_>) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, HASH_STATE_VERSION, HASH_STATE_MAGIC)?;
        let state_type = r.read_u8()?;
        let hash_alg = r.read_u16()?;
        let alg = super::hash_alg(hash_alg);
        if alg.is_none() && hash_alg != TPM_ALG_NULL {
            error!("Could not get hash function interface for hashAlg {hash_alg:#06x}");
            return Err(MarshalError::BadParameter(format!(
                "HASH_STATE: unknown hashAlg {hash_alg:#06x}"
            )));
        }
        let state = AnyHashState::unmarshal(r, alg)?;
        r.read_future_block(&hdr, "HASH_STATE", "version 3 or later")?;
        Ok(Self { state_type, state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(state: &HashState) -> HashState {
        let mut w = StateWriter::new();
        state.marshal(&mut w).unwrap();
        let bytes = w.finish().unwrap();
        let mut r = StateReader::new(&bytes);
        let out = HashState::unmarshal(&mut r).unwrap();
        assert!(r.is_empty());
        out
    }

    #[test]
    fn test_sha384_uses_own_magic() {
        let state = HashState {
            state_type: 1,
            state: AnyHashState::new(TpmAlgId::Sha384),
        };
        let mut w = StateWriter::new();
        state.marshal(&mut w).unwrap();
        let bytes = w.finish().unwrap();
        let magic = HASH_STATE_SHA384_MAGIC.to_be_bytes();
        assert!(bytes.windows(4).any(|win| win == magic));
        assert_eq!(roundtrip(&state), state);
    }

    #[test]
    fn test_null_state_has_no_body() {
        let state = HashState::default();
        assert_eq!(roundtrip(&state), state);
    }

    #[test]
    fn test_unknown_alg_is_rejected() {
        let mut w = StateWriter::new();
        NvHeader::write(&mut w, HASH_STATE_VERSION, HASH_STATE_MAGIC, 1);
        w.write_u8(0);
        w.write_u16(0x0006);
        let bytes = w.finish().unwrap();
        let err = HashState::unmarshal(&mut StateReader::new(&bytes)).unwrap_err();
        assert!(matches!(err, MarshalError::BadParameter(_)));
    }
}
