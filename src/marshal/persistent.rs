// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Hierarchy seeds, auth values, counters and policies that survive every
//! kind of reset.

use super::{
    copy_growable,
    pcr::{PcrPolicy, PcrSelectionList},
    read_clock, read_seed_compat_level, write_clock, write_seed_compat_level, NvMarshal,
    DIGEST_SIZE_MAX, SEED_COMPAT_LEVEL_ORIGINAL, TPM_ALG_NULL,
};
use crate::{
    block::NvHeader,
    codec::{StateReader, StateWriter},
    config::BuildConfig,
    error::MarshalError,
    shadow::ShadowState,
};
use log::debug;

pub const PERSISTENT_DATA_MAGIC: u32 = 0x1221_3443;
pub const PERSISTENT_DATA_VERSION: u16 = 4;

pub const TPM_SU_CLEAR: u16 = 0x0000;
pub const TPM_SU_STATE: u16 = 0x0001;
pub const TPM_SU_NONE: u16 = 0xffff;
/// Set in `orderly_state` while a shutdown is being prepared.
pub const PRE_SHUTDOWN_NV_STATE: u16 = 0x8000;
pub const TPM_SU_STATE_MASK: u16 = !PRE_SHUTDOWN_NV_STATE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentData {
    pub disable_clear: bool,
    pub owner_alg: u16,
    pub endorsement_alg: u16,
    pub lockout_alg: u16,
    pub owner_policy: Vec<u8>,
    pub endorsement_policy: Vec<u8>,
    pub lockout_policy: Vec<u8>,
    pub owner_auth: Vec<u8>,
    pub endorsement_auth: Vec<u8>,
    pub lockout_auth: Vec<u8>,
    pub ep_seed: Vec<u8>,
    pub sp_seed: Vec<u8>,
    pub pp_seed: Vec<u8>,
    pub ph_proof: Vec<u8>,
    pub sh_proof: Vec<u8>,
    pub eh_proof: Vec<u8>,
    pub total_reset_count: u64,
    pub reset_count: u32,
    pub pcr_policies: PcrPolicy,
    /// Allocation requested for the next TPM reset.
    pub pcr_allocated: PcrSelectionList,
    pub pp_list: Vec<u8>,
    pub failed_tries: u32,
    pub max_tries: u32,
    pub recovery_time: u32,
    pub lockout_recovery: u32,
    pub lock_out_auth_enabled: bool,
    pub orderly_state: u16,
    pub audit_commands: Vec<u8>,
    pub audit_hash_alg: u16,
    pub audit_counter: u64,
    pub algorithm_set: u32,
    pub firmware_v1: u32,
    pub firmware_v2: u32,
    pub time_epoch: u64,
    pub ep_seed_compat_level: u8,
    pub sp_seed_compat_level: u8,
    pub pp_seed_compat_level: u8,
}

impl PersistentData {
    /// Zeroed data sized for `config`.
    #[must_use]
    pub fn new(config: &BuildConfig) -> Self {
        Self {
            disable_clear: false,
            owner_alg: TPM_ALG_NULL,
            endorsement_alg: TPM_ALG_NULL,
            lockout_alg: TPM_ALG_NULL,
            owner_policy: Vec::new(),
            endorsement_policy: Vec::new(),
            lockout_policy: Vec::new(),
            owner_auth: Vec::new(),
            endorsement_auth: Vec::new(),
            lockout_auth: Vec::new(),
            ep_seed: Vec::new(),
            sp_seed: Vec::new(),
            pp_seed: Vec::new(),
            ph_proof: Vec::new(),
            sh_proof: Vec::new(),
            eh_proof: Vec::new(),
            total_reset_count: 0,
            reset_count: 0,
            pcr_policies: PcrPolicy::new(config),
            pcr_allocated: PcrSelectionList::all(config),
            pp_list: vec![0; config.pp_list_size],
            failed_tries: 0,
            max_tries: 3,
            recovery_time: 1000,
            lockout_recovery: 1000,
            lock_out_auth_enabled: true,
            orderly_state: TPM_SU_NONE,
            audit_commands: vec![0; config.audit_commands_size],
            audit_hash_alg: TPM_ALG_NULL,
            audit_counter: 0,
            algorithm_set: 0,
            firmware_v1: 0,
            firmware_v2: 0,
            time_epoch: 0,
            ep_seed_compat_level: SEED_COMPAT_LEVEL_ORIGINAL,
            sp_seed_compat_level: SEED_COMPAT_LEVEL_ORIGINAL,
            pp_seed_compat_level: SEED_COMPAT_LEVEL_ORIGINAL,
        }
    }

    /// True if the last shutdown saved the reset and clear data.
    #[must_use]
    pub fn saved_su_state(&self) -> bool {
        self.orderly_state & TPM_SU_STATE_MASK == TPM_SU_STATE
    }

    /// Appends the encoding. `live` is the allocation currently in effect,
    /// written alongside the requested one.
    ///
    /// # Errors
    ///
    /// Returns `TooLarge` if a buffer exceeds its capacity.
    pub fn marshal(
        &self,
        w: &mut StateWriter,
        config: &BuildConfig,
        live: &PcrSelectionList,
    ) -> Result<(), MarshalError> {
        NvHeader::write(w, PERSISTENT_DATA_VERSION, PERSISTENT_DATA_MAGIC, 4);
        w.write_bool(self.disable_clear);
        w.write_u16(self.owner_alg);
        w.write_u16(self.endorsement_alg);
        w.write_u16(self.lockout_alg);
        for digest in [
            &self.owner_policy,
            &self.endorsement_policy,
            &self.lockout_policy,
            &self.owner_auth,
            &self.endorsement_auth,
            &self.lockout_auth,
        ] {
            w.write_tpm2b(digest, DIGEST_SIZE_MAX)?;
        }
        for seed in [&self.ep_seed, &self.sp_seed, &self.pp_seed] {
            w.write_tpm2b(seed, config.primary_seed_size)?;
        }
        for proof in [&self.ph_proof, &self.sh_proof, &self.eh_proof] {
            w.write_tpm2b(proof, config.proof_size)?;
        }
        w.write_u64(self.total_reset_count);
        w.write_u32(self.reset_count);

        let has_policies = config.num_policy_pcr_group > 0;
        w.push_block(has_policies)?;
        if has_policies {
            self.pcr_policies.marshal(w, config)?;
        }
        w.pop_block()?;

        self.pcr_allocated.marshal(w)?;
        w.write_sized_array(&self.pp_list)?;
        w.write_u32(self.failed_tries);
        w.write_u32(self.max_tries);
        w.write_u32(self.recovery_time);
        w.write_u32(self.lockout_recovery);
        w.write_bool(self.lock_out_auth_enabled);
        w.write_u16(self.orderly_state);
        w.write_sized_array(&self.audit_commands)?;
        w.write_u16(self.audit_hash_alg);
        w.write_u64(self.audit_counter);
        w.write_u32(self.algorithm_set);
        w.write_u32(self.firmware_v1);
        w.write_u32(self.firmware_v2);
        write_clock(w, self.time_epoch);

        w.push_block(true)?;
        live.marshal(w)?;
        w.push_block(true)?;
        write_seed_compat_level(w, self.ep_seed_compat_level);
        write_seed_compat_level(w, self.sp_seed_compat_level);
        write_seed_compat_level(w, self.pp_seed_compat_level);
        w.write_future_block()?;
        w.pop_block()?;
        w.pop_block()
    }

    /// Decodes the data and stages the allocation that was live at write
    /// time in `shadow`. Streams older than version 3 did not record it and
    /// stage the requested allocation instead.
    ///
    /// # Errors
    ///
    /// Returns a `MarshalError` on a truncated or inconsistent stream.
    pub fn unmarshal(
        r: &mut StateReader<'_>,
        config: &BuildConfig,
        shadow: &mut ShadowState,
    ) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, PERSISTENT_DATA_VERSION, PERSISTENT_DATA_MAGIC)?;
        let mut data = Self::new(config);
        data.disable_clear = r.read_bool()?;
        data.owner_alg = r.read_u16()?;
        data.endorsement_alg = r.read_u16()?;
        data.lockout_alg = r.read_u16()?;
        data.owner_policy = r.read_tpm2b(DIGEST_SIZE_MAX)?;
        data.endorsement_policy = r.read_tpm2b(DIGEST_SIZE_MAX)?;
        data.lockout_policy = r.read_tpm2b(DIGEST_SIZE_MAX)?;
        data.owner_auth = r.read_tpm2b(DIGEST_SIZE_MAX)?;
        data.endorsement_auth = r.read_tpm2b(DIGEST_SIZE_MAX)?;
        data.lockout_auth = r.read_tpm2b(DIGEST_SIZE_MAX)?;
        data.ep_seed = r.read_tpm2b(config.primary_seed_size)?;
        data.sp_seed = r.read_tpm2b(config.primary_seed_size)?;
        data.pp_seed = r.read_tpm2b(config.primary_seed_size)?;
        data.ph_proof = r.read_tpm2b(config.proof_size)?;
        data.sh_proof = r.read_tpm2b(config.proof_size)?;
        data.eh_proof = r.read_tpm2b(config.proof_size)?;
        data.total_reset_count = r.read_u64()?;
        data.reset_count = r.read_u32()?;

        if r
            .read_block(config.num_policy_pcr_group > 0, "PERSISTENT_DATA", "pcrPolicies")?
            .is_present()
        {
            data.pcr_policies = PcrPolicy::unmarshal(r, config)?;
        }

        data.pcr_allocated = PcrSelectionList::unmarshal(r, config)?;
        shadow.stage_pcr_allocation(data.pcr_allocated.clone());

        let copied = copy_growable(&mut data.pp_list, r.read_sized_array()?);
        debug!("PERSISTENT_DATA: ppList: {copied} bytes");
        data.failed_tries = r.read_u32()?;
        data.max_tries = r.read_u32()?;
        data.recovery_time = r.read_u32()?;
        data.lockout_recovery = r.read_u32()?;
        data.lock_out_auth_enabled = r.read_bool()?;
        data.orderly_state = r.read_u16()?;
        let copied = copy_growable(&mut data.audit_commands, r.read_sized_array()?);
        debug!("PERSISTENT_DATA: auditCommands: {copied} bytes");
        data.audit_hash_alg = r.read_u16()?;
        data.audit_counter = r.read_u64()?;
        data.algorithm_set = r.read_u32()?;
        data.firmware_v1 = r.read_u32()?;
        data.firmware_v2 = r.read_u32()?;
        data.time_epoch = read_clock(r, "PERSISTENT_DATA")?;

        if hdr.version >= 2
            && r
                .read_block(hdr.version >= 3, "PERSISTENT_DATA", "version 3 or later")?
                .is_present()
        {
            shadow.stage_pcr_allocation(PcrSelectionList::unmarshal(r, config)?);
            if r
                .read_block(hdr.version >= 4, "PERSISTENT_DATA", "version 4 or later")?
                .is_present()
            {
                data.ep_seed_compat_level = read_seed_compat_level(r, "EPSeed")?;
                data.sp_seed_compat_level = read_seed_compat_level(r, "SPSeed")?;
                data.pp_seed_compat_level = read_seed_compat_level(r, "PPSeed")?;
                r.read_block(false, "PERSISTENT_DATA", "version 5 or later")?;
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm2_protocol::data::TpmAlgId;

    #[test]
    fn test_live_allocation_is_staged() {
        let config = BuildConfig::default();
        let data = PersistentData::new(&config);
        let live = PcrSelectionList::with_active(&config, &[TpmAlgId::Sha1]);

        let mut w = StateWriter::new();
        data.marshal(&mut w, &config, &live).unwrap();
        let bytes = w.finish().unwrap();

        let mut shadow = ShadowState::new();
        let out = PersistentData::unmarshal(&mut StateReader::new(&bytes), &config, &mut shadow)
            .unwrap();
        assert_eq!(out.pcr_allocated, data.pcr_allocated);
        assert_eq!(shadow.pending(), Some(&live));
    }

    #[test]
    fn test_growable_arrays_follow_build_size() {
        let writer = BuildConfig {
            pp_list_size: 24,
            ..BuildConfig::default()
        };
        let mut data = PersistentData::new(&writer);
        data.pp_list = (1..=24).collect();
        let live = PcrSelectionList::all(&writer);
        let mut w = StateWriter::new();
        data.marshal(&mut w, &writer, &live).unwrap();
        let bytes = w.finish().unwrap();

        let reader = BuildConfig::default();
        let out = PersistentData::unmarshal(
            &mut StateReader::new(&bytes),
            &reader,
            &mut ShadowState::new(),
        )
        .unwrap();
        assert_eq!(out.pp_list, (1..=16).collect::<Vec<u8>>());
    }

    #[test]
    fn test_su_state_ignores_pre_shutdown_flag() {
        let mut data = PersistentData::new(&BuildConfig::default());
        data.orderly_state = TPM_SU_STATE | PRE_SHUTDOWN_NV_STATE;
        assert!(data.saved_su_state());
        data.orderly_state = TPM_SU_NONE;
        assert!(!data.saved_su_state());
    }
}
