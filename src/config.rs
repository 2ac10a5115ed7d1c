// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Build profile of a TPM instance.
//!
//! The values decide array sizes and optional blocks in the persisted
//! format, and they are recorded in the compile-constant manifest so that a
//! build with incompatible assumptions refuses the state.

use tpm2_protocol::data::TpmAlgId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// Implemented PCR banks, in marshalling order.
    pub pcr_banks: Vec<TpmAlgId>,
    pub alg_rsa: bool,
    pub alg_ecc: bool,
    /// Carry the dictionary-attack timers across orderly shutdowns.
    pub accumulate_self_heal_timer: bool,
    pub implementation_pcr: usize,
    pub platform_pcr: usize,
    pub num_static_pcr: usize,
    pub drtm_pcr: u32,
    pub hcrtm_pcr: u32,
    pub num_localities: u32,
    pub max_handle_num: u32,
    pub max_active_sessions: usize,
    pub max_loaded_sessions: usize,
    pub max_session_num: usize,
    pub max_loaded_objects: usize,
    pub min_evict_objects: u32,
    pub num_policy_pcr_group: usize,
    pub num_authvalue_pcr_group: usize,
    pub primary_seed_size: usize,
    pub proof_size: usize,
    pub max_context_size: u32,
    pub nv_memory_size: u32,
    /// Capacity of the index-orderly RAM region.
    pub ram_index_space: usize,
    /// Capacity of the user NVRAM region.
    pub user_nvram_size: usize,
    pub pp_list_size: usize,
    pub audit_commands_size: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            pcr_banks: vec![
                TpmAlgId::Sha1,
                TpmAlgId::Sha256,
                TpmAlgId::Sha384,
                TpmAlgId::Sha512,
            ],
            alg_rsa: true,
            alg_ecc: true,
            accumulate_self_heal_timer: true,
            implementation_pcr: 24,
            platform_pcr: 24,
            num_static_pcr: 16,
            drtm_pcr: 17,
            hcrtm_pcr: 0,
            num_localities: 5,
            max_handle_num: 3,
            max_active_sessions: 64,
            max_loaded_sessions: 3,
            max_session_num: 3,
            max_loaded_objects: 3,
            min_evict_objects: 7,
            num_policy_pcr_group: 1,
            num_authvalue_pcr_group: 1,
            primary_seed_size: 64,
            proof_size: 64,
            max_context_size: 2680,
            nv_memory_size: 131_072,
            ram_index_space: 512,
            user_nvram_size: 122_880,
            pp_list_size: 16,
            audit_commands_size: 16,
        }
    }
}

impl BuildConfig {
    /// Number of implemented hash algorithms.
    #[must_use]
    pub fn hash_count(&self) -> usize {
        self.pcr_banks.len()
    }

    #[must_use]
    pub fn has_bank(&self, alg: TpmAlgId) -> bool {
        self.pcr_banks.contains(&alg)
    }

    /// Smallest valid `sizeofSelect` of a PCR selection.
    #[must_use]
    pub fn pcr_select_min(&self) -> usize {
        self.platform_pcr.div_ceil(8)
    }

    /// Largest valid `sizeofSelect` of a PCR selection.
    #[must_use]
    pub fn pcr_select_max(&self) -> usize {
        self.implementation_pcr.div_ceil(8)
    }
}
