// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use super::{read_clock, write_clock, DIGEST_SIZE_MAX, NAME_SIZE_MAX, TPM_ALG_NULL};
use crate::{
    block::NvHeader,
    codec::{StateReader, StateWriter},
    error::MarshalError,
};

pub const SESSION_MAGIC: u32 = 0x44be_9f45;
pub const SESSION_SLOT_MAGIC: u32 = 0x3664_aebc;
const SESSION_VERSION: u16 = 2;

pub const TPM_ALG_XOR: u16 = 0x000a;

/// Symmetric algorithm of a session. `key_bits` is the hash algorithm for
/// XOR obfuscation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymDef {
    pub algorithm: u16,
    pub key_bits: u16,
    pub mode: u16,
}

impl Default for SymDef {
    fn default() -> Self {
        Self {
            algorithm: TPM_ALG_NULL,
            key_bits: 0,
            mode: 0,
        }
    }
}

impl SymDef {
    fn marshal(&self, w: &mut StateWriter) {
        w.write_u16(self.algorithm);
        if self.algorithm != TPM_ALG_NULL {
            w.write_u16(self.key_bits);
            if self.algorithm != TPM_ALG_XOR {
                w.write_u16(self.mode);
            }
        }
    }

    fn unmarshal(r: &mut StateReader<'_>) -> Result<Self, MarshalError> {
        let mut def = Self {
            algorithm: r.read_u16()?,
            ..Self::default()
        };
        if def.algorithm != TPM_ALG_NULL {
            def.key_bits = r.read_u16()?;
            if def.algorithm != TPM_ALG_XOR {
                def.mode = r.read_u16()?;
            }
        }
        Ok(def)
    }
}

/// An authorization, policy or trial session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub attributes: u32,
    pub pcr_counter: u32,
    pub start_time: u64,
    pub timeout: u64,
    pub epoch: u64,
    pub command_code: u32,
    pub auth_hash_alg: u16,
    pub command_locality: u8,
    pub symmetric: SymDef,
    pub session_key: Vec<u8>,
    pub nonce_tpm: Vec<u8>,
    pub bound_entity: Vec<u8>,
    pub audit_digest: Vec<u8>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            attributes: 0,
            pcr_counter: 0,
            start_time: 0,
            timeout: 0,
            epoch: 0,
            command_code: 0,
            auth_hash_alg: TPM_ALG_NULL,
            command_locality: 0,
            symmetric: SymDef::default(),
            session_key: Vec::new(),
            nonce_tpm: Vec::new(),
            bound_entity: Vec::new(),
            audit_digest: Vec::new(),
        }
    }
}

impl Session {
    fn marshal(&self, w: &mut StateWriter) -> Result<(), MarshalError> {
        NvHeader::write(w, SESSION_VERSION, SESSION_MAGIC, 1);
        w.write_u32(self.attributes);
        w.write_u32(self.pcr_counter);
        w.write_u64(self.start_time);
        w.write_u64(self.timeout);
        write_clock(w, self.epoch);
        w.write_u32(self.command_code);
        w.write_u16(self.auth_hash_alg);
        w.write_u8(self.command_locality);
        self.symmetric.marshal(w);
        w.write_tpm2b(&self.session_key, DIGEST_SIZE_MAX)?;
        w.write_tpm2b(&self.nonce_tpm, DIGEST_SIZE_MAX)?;
        w.write_tpm2b(&self.bound_entity, NAME_SIZE_MAX)?;
        w.write_tpm2b(&self.audit_digest, DIGEST_SIZE_MAX)?;
        w.write_future_block()
    }

    fn unmarshal(r: &mut StateReader<'_>) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, SESSION_VERSION, SESSION_MAGIC)?;
        let session = Self {
            attributes: r.read_u32()?,
            pcr_counter: r.read_u32()?,
            start_time: r.read_u64()?,
            timeout: r.read_u64()?,
            epoch: read_clock(r, "SESSION")?,
            command_code: r.read_u32()?,
            auth_hash_alg: r.read_u16()?,
            command_locality: r.read_u8()?,
            symmetric: SymDef::unmarshal(r)?,
            session_key: r.read_tpm2b(DIGEST_SIZE_MAX)?,
            nonce_tpm: r.read_tpm2b(DIGEST_SIZE_MAX)?,
            bound_entity: r.read_tpm2b(NAME_SIZE_MAX)?,
            audit_digest: r.read_tpm2b(DIGEST_SIZE_MAX)?,
        };
        r.read_future_block(&hdr, "SESSION", "version 3 or later")?;
        Ok(session)
    }
}

/// A loaded-session slot. `None` marks a free slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSlot {
    pub session: Option<Session>,
}

impl SessionSlot {
    /// # Errors
    ///
    /// Returns `TooLarge` if a session buffer exceeds its capacity.
    pub fn marshal(&self, w: &mut StateWriter) -> Result<(), MarshalError> {
        NvHeader::write(w, SESSION_VERSION, SESSION_SLOT_MAGIC, 1);
        w.write_bool(self.session.is_some());
        let Some(session) = &self.session else {
            return Ok(());
        };
        session.marshal(w)?;
        w.write_future_block()
    }

    /// # Errors
    ///
    /// Returns `BadParameter` if the session epoch has an unexpected width.
    pub fn unmarshal(r: &mut StateReader<'_>) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, SESSION_VERSION, SESSION_SLOT_MAGIC)?;
        if !r.read_bool()? {
            return Ok(Self::default());
        }
        let session = Session::unmarshal(r)?;
        r.read_future_block(&hdr, "SESSION_SLOT", "version 3 or later")?;
        Ok(Self {
            session: Some(session),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_slot_ends_after_flag() {
        let mut w = StateWriter::new();
        SessionSlot::default().marshal(&mut w).unwrap();
        let bytes = w.finish().unwrap();
        assert_eq!(bytes.len(), 9);
        let mut r = StateReader::new(&bytes);
        assert_eq!(SessionSlot::unmarshal(&mut r).unwrap(), SessionSlot::default());
        assert!(r.is_empty());
    }

    #[test]
    fn test_xor_symdef_has_no_mode() {
        let def = SymDef {
            algorithm: TPM_ALG_XOR,
            key_bits: 0x000b,
            mode: 0,
        };
        let mut w = StateWriter::new();
        def.marshal(&mut w);
        assert_eq!(w.as_bytes(), &[0x00, 0x0a, 0x00, 0x0b]);
    }

    #[test]
    fn test_occupied_slot_roundtrip() {
        let slot = SessionSlot {
            session: Some(Session {
                attributes: 0x11,
                epoch: 42,
                command_code: 0x0000_0153,
                auth_hash_alg: 0x000b,
                symmetric: SymDef {
                    algorithm: 0x0006,
                    key_bits: 128,
                    mode: 0x0043,
                },
                nonce_tpm: vec![7; 32],
                ..Session::default()
            }),
        };
        let mut w = StateWriter::new();
        slot.marshal(&mut w).unwrap();
        let bytes = w.finish().unwrap();
        assert_eq!(SessionSlot::unmarshal(&mut StateReader::new(&bytes)).unwrap(), slot);
    }
}
