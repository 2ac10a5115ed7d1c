// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Data cleared on TPM2_Startup(CLEAR) and on TPM reset.

use super::{
    count_u16, read_array_count,
    pcr::{PcrAuthValue, PcrSave, PcrSelectionList},
    read_seed_compat_level, write_seed_compat_level, NvMarshal, DIGEST_SIZE_MAX,
    SEED_COMPAT_LEVEL_ORIGINAL, TPM_ALG_NULL,
};
use crate::{
    block::NvHeader,
    codec::{StateReader, StateWriter},
    config::BuildConfig,
    error::MarshalError,
};
use log::error;

pub const STATE_CLEAR_DATA_MAGIC: u32 = 0x9889_7667;
pub const STATE_CLEAR_DATA_VERSION: u16 = 2;
pub const STATE_RESET_DATA_MAGIC: u32 = 0x0110_2332;
pub const STATE_RESET_DATA_VERSION: u16 = 4;

/// Size of the ECC commit bitmap in bytes.
pub const COMMIT_ARRAY_SIZE: usize = 16;

/// Context slot mask of version 3 and older, which stored 8-bit slots.
pub const CONTEXT_SLOT_MASK_8: u16 = 0x00ff;
pub const CONTEXT_SLOT_MASK_16: u16 = 0xffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateClearData {
    pub sh_enable: bool,
    pub eh_enable: bool,
    pub ph_enable_nv: bool,
    pub platform_alg: u16,
    pub platform_policy: Vec<u8>,
    pub platform_auth: Vec<u8>,
    pub pcr_save: PcrSave,
    pub pcr_auth_values: PcrAuthValue,
}

impl StateClearData {
    /// # Errors
    ///
    /// Returns `BadParameter` if the configuration lists a non-hash bank.
    pub fn new(config: &BuildConfig) -> Result<Self, MarshalError> {
        Ok(Self {
            sh_enable: true,
            eh_enable: true,
            ph_enable_nv: true,
            platform_alg: TPM_ALG_NULL,
            platform_policy: Vec::new(),
            platform_auth: Vec::new(),
            pcr_save: PcrSave::new(config)?,
            pcr_auth_values: PcrAuthValue::new(config),
        })
    }

    /// # Errors
    ///
    /// Returns `TooLarge` if a buffer exceeds its capacity.
    pub fn marshal(&self, w: &mut StateWriter, config: &BuildConfig) -> Result<(), MarshalError> {
        NvHeader::write(w, STATE_CLEAR_DATA_VERSION, STATE_CLEAR_DATA_MAGIC, 1);
        w.write_bool(self.sh_enable);
        w.write_bool(self.eh_enable);
        w.write_bool(self.ph_enable_nv);
        w.write_u16(self.platform_alg);
        w.write_tpm2b(&self.platform_policy, DIGEST_SIZE_MAX)?;
        w.write_tpm2b(&self.platform_auth, DIGEST_SIZE_MAX)?;
        self.pcr_save.marshal(w, config)?;
        self.pcr_auth_values.marshal(w, config)?;
        w.write_future_block()
    }

    /// Decodes the data. The saved PCRs are checked against `allocation`,
    /// the allocation that was in effect when the data was written.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if a bank active in `allocation` is missing.
    pub fn unmarshal(
        r: &mut StateReader<'_>,
        config: &BuildConfig,
        allocation: &PcrSelectionList,
    ) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, STATE_CLEAR_DATA_VERSION, STATE_CLEAR_DATA_MAGIC)?;
        let data = Self {
            sh_enable: r.read_bool()?,
            eh_enable: r.read_bool()?,
            ph_enable_nv: r.read_bool()?,
            platform_alg: r.read_u16()?,
            platform_policy: r.read_tpm2b(DIGEST_SIZE_MAX)?,
            platform_auth: r.read_tpm2b(DIGEST_SIZE_MAX)?,
            pcr_save: PcrSave::unmarshal(r, config, allocation)?,
            pcr_auth_values: PcrAuthValue::unmarshal(r, config)?,
        };
        r.read_future_block(&hdr, "STATE_CLEAR_DATA", "version 3 or later")?;
        Ok(data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateResetData {
    pub null_proof: Vec<u8>,
    pub null_seed: Vec<u8>,
    pub clear_count: u32,
    pub object_context_id: u64,
    pub context_array: Vec<u16>,
    pub context_slot_mask: u16,
    pub context_counter: u64,
    pub command_audit_digest: Vec<u8>,
    pub restart_count: u32,
    pub pcr_counter: u32,
    pub commit_counter: u64,
    pub commit_nonce: Vec<u8>,
    pub commit_array: [u8; COMMIT_ARRAY_SIZE],
    pub null_seed_compat_level: u8,
}

impl StateResetData {
    #[must_use]
    pub fn new(config: &BuildConfig) -> Self {
        Self {
            null_proof: Vec::new(),
            null_seed: Vec::new(),
            clear_count: 0,
            object_context_id: 0,
            context_array: vec![0; config.max_active_sessions],
            context_slot_mask: CONTEXT_SLOT_MASK_16,
            context_counter: 0,
            command_audit_digest: Vec::new(),
            restart_count: 0,
            pcr_counter: 0,
            commit_counter: 0,
            commit_nonce: Vec::new(),
            commit_array: [0; COMMIT_ARRAY_SIZE],
            null_seed_compat_level: SEED_COMPAT_LEVEL_ORIGINAL,
        }
    }
}

impl NvMarshal for StateResetData {
    fn marshal(&self, w: &mut StateWriter, config: &BuildConfig) -> Result<(), MarshalError> {
        NvHeader::write(w, STATE_RESET_DATA_VERSION, STATE_RESET_DATA_MAGIC, 4);
        w.write_tpm2b(&self.null_proof, config.proof_size)?;
        w.write_tpm2b(&self.null_seed, config.primary_seed_size)?;
        w.write_u32(self.clear_count);
        w.write_u64(self.object_context_id);

        w.write_u16(count_u16("STATE_RESET_DATA contextArray", self.context_array.len())?);
        for slot in &self.context_array {
            w.write_u16(*slot);
        }
        // an uninitialized mask is written as the 16-bit one
        let mask = match self.context_slot_mask {
            CONTEXT_SLOT_MASK_8 => CONTEXT_SLOT_MASK_8,
            _ => CONTEXT_SLOT_MASK_16,
        };
        w.write_u16(mask);

        w.write_u64(self.context_counter);
        w.write_tpm2b(&self.command_audit_digest, DIGEST_SIZE_MAX)?;
        w.write_u32(self.restart_count);
        w.write_u32(self.pcr_counter);

        w.push_block(config.alg_ecc)?;
        if config.alg_ecc {
            w.write_u64(self.commit_counter);
            w.write_tpm2b(&self.commit_nonce, DIGEST_SIZE_MAX)?;
            w.write_sized_array(&self.commit_array)?;
        }
        w.pop_block()?;

        w.push_block(true)?;
        write_seed_compat_level(w, self.null_seed_compat_level);
        w.write_future_block()?;
        w.pop_block()
    }

    fn unmarshal(r: &mut StateReader<'_>, config: &BuildConfig) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, STATE_RESET_DATA_VERSION, STATE_RESET_DATA_MAGIC)?;
        let mut data = Self::new(config);
        data.null_proof = r.read_tpm2b(config.proof_size)?;
        data.null_seed = r.read_tpm2b(config.primary_seed_size)?;
        data.clear_count = r.read_u32()?;
        data.object_context_id = r.read_u64()?;

        read_array_count(r, "STATE_RESET_DATA contextArray", config.max_active_sessions)?;
        if hdr.version <= 3 {
            for slot in &mut data.context_array {
                *slot = u16::from(r.read_u8()?);
            }
            data.context_slot_mask = CONTEXT_SLOT_MASK_8;
        } else {
            for slot in &mut data.context_array {
                *slot = r.read_u16()?;
            }
            data.context_slot_mask = r.read_u16()?;
            if data.context_slot_mask != CONTEXT_SLOT_MASK_16
                && data.context_slot_mask != CONTEXT_SLOT_MASK_8
            {
                error!(
                    "STATE_RESET_DATA: s_ContextSlotMask has bad value: {:#06x}",
                    data.context_slot_mask
                );
                return Err(MarshalError::BadParameter(format!(
                    "STATE_RESET_DATA: bad context slot mask {:#06x}",
                    data.context_slot_mask
                )));
            }
        }

        data.context_counter = r.read_u64()?;
        data.command_audit_digest = r.read_tpm2b(DIGEST_SIZE_MAX)?;
        data.restart_count = r.read_u32()?;
        data.pcr_counter = r.read_u32()?;

        if r
            .read_block(config.alg_ecc, "STATE_RESET_DATA", "commitCounter")?
            .is_present()
        {
            data.commit_counter = r.read_u64()?;
            data.commit_nonce = r.read_tpm2b(DIGEST_SIZE_MAX)?;
            read_array_count(r, "STATE_RESET_DATA commitArray", COMMIT_ARRAY_SIZE)?;
            data.commit_array.copy_from_slice(r.read_bytes(COMMIT_ARRAY_SIZE)?);
        }

        if hdr.version >= 2
            && r
                .read_block(hdr.version >= 3, "STATE_RESET_DATA", "version 3 or later")?
                .is_present()
        {
            data.null_seed_compat_level = read_seed_compat_level(r, "nullSeed")?;
            r.read_block(false, "STATE_RESET_DATA", "version 4 or later")?;
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_context_slot_mask() {
        let config = BuildConfig::default();
        let data = StateResetData {
            context_slot_mask: CONTEXT_SLOT_MASK_8,
            ..StateResetData::new(&config)
        };
        let mut w = StateWriter::new();
        data.marshal(&mut w, &config).unwrap();
        let mut bytes = w.finish().unwrap();

        // header, two empty TPM2Bs, clearCount, objectContextID, count, array
        let offset = 8 + 2 + 2 + 4 + 8 + 2 + 2 * config.max_active_sessions;
        assert_eq!(&bytes[offset..offset + 2], &[0x00, 0xff]);
        bytes[offset] = 0x12;
        let err = StateResetData::unmarshal(&mut StateReader::new(&bytes), &config).unwrap_err();
        assert!(matches!(err, MarshalError::BadParameter(_)));
    }

    #[test]
    fn test_uninitialized_mask_written_as_16_bit() {
        let config = BuildConfig::default();
        let data = StateResetData {
            context_slot_mask: 0,
            ..StateResetData::new(&config)
        };
        let mut w = StateWriter::new();
        data.marshal(&mut w, &config).unwrap();
        let bytes = w.finish().unwrap();
        let out = StateResetData::unmarshal(&mut StateReader::new(&bytes), &config).unwrap();
        assert_eq!(out.context_slot_mask, CONTEXT_SLOT_MASK_16);
    }
}
