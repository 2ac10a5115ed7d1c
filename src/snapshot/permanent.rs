// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use super::read_trailing_magic;
use crate::{
    arena::{IndexOrderlyRam, UserNvram},
    block::NvHeader,
    codec::{StateReader, StateWriter},
    config::BuildConfig,
    error::MarshalError,
    manifest::{read_manifest, write_manifest},
    marshal::{
        orderly::OrderlyData,
        pcr::PcrSelectionList,
        persistent::PersistentData,
        state::{StateClearData, StateResetData},
        NvMarshal,
    },
    shadow::ShadowState,
};
use log::{debug, info};

pub const PERSISTENT_ALL_MAGIC: u32 = 0xab36_4723;
pub const PERSISTENT_ALL_VERSION: u16 = 3;

/// Everything stored in the permanent blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentState {
    pub persistent: PersistentData,
    pub orderly: OrderlyData,
    pub reset: StateResetData,
    pub clear: StateClearData,
    pub index_orderly_ram: IndexOrderlyRam,
    pub user_nvram: UserNvram,
}

impl PermanentState {
    /// State of a freshly manufactured instance.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if the configuration lists a non-hash bank.
    pub fn new(config: &BuildConfig) -> Result<Self, MarshalError> {
        Ok(Self {
            persistent: PersistentData::new(config),
            orderly: OrderlyData::default(),
            reset: StateResetData::new(config),
            clear: StateClearData::new(config)?,
            index_orderly_ram: IndexOrderlyRam::new(config.ram_index_space),
            user_nvram: UserNvram::new(config.user_nvram_size),
        })
    }
}

/// Encodes the permanent blob. The reset and clear data are included only
/// when the last shutdown saved them.
///
/// # Errors
///
/// Returns a `MarshalError` if a structure does not fit its persisted
/// layout.
pub fn marshal_permanent(
    state: &PermanentState,
    config: &BuildConfig,
    live: &PcrSelectionList,
) -> Result<Vec<u8>, MarshalError> {
    let mut w = StateWriter::new();
    NvHeader::write(&mut w, PERSISTENT_ALL_VERSION, PERSISTENT_ALL_MAGIC, 3);
    write_manifest(&mut w, config)?;
    state.persistent.marshal(&mut w, config, live)?;
    state.orderly.marshal(&mut w, config)?;
    if state.persistent.saved_su_state() {
        state.reset.marshal(&mut w, config)?;
        state.clear.marshal(&mut w, config)?;
    }
    state.index_orderly_ram.marshal(&mut w)?;
    state.user_nvram.marshal(&mut w, config)?;
    w.write_future_block()?;
    w.write_u32(PERSISTENT_ALL_MAGIC);
    let bytes = w.finish()?;
    debug!("PERSISTENT_ALL: {} bytes", bytes.len());
    Ok(bytes)
}

/// Decodes the permanent blob. The PCR allocation of the blob is staged in
/// `shadow` and the staged value is what the saved PCRs are checked
/// against.
///
/// # Errors
///
/// Returns a `MarshalError` on any decode failure. Nothing decoded so far is
/// returned in that case.
pub fn unmarshal_permanent(
    bytes: &[u8],
    config: &BuildConfig,
    shadow: &mut ShadowState,
    live: &PcrSelectionList,
) -> Result<PermanentState, MarshalError> {
    let mut r = StateReader::new(bytes);
    let hdr = NvHeader::read(&mut r, PERSISTENT_ALL_VERSION, PERSISTENT_ALL_MAGIC)?;
    read_manifest(&mut r, config)?;
    let persistent = PersistentData::unmarshal(&mut r, config, shadow)?;
    // older blobs always carried the reset and clear data
    let read_su_state = hdr.version < 3 || persistent.saved_su_state();
    let orderly = OrderlyData::unmarshal(&mut r, config)?;
    let (reset, clear) = if read_su_state {
        let reset = StateResetData::unmarshal(&mut r, config)?;
        let clear = StateClearData::unmarshal(&mut r, config, shadow.allocation(live))?;
        (reset, clear)
    } else {
        (StateResetData::new(config), StateClearData::new(config)?)
    };
    let index_orderly_ram = IndexOrderlyRam::unmarshal(&mut r, config.ram_index_space)?;
    let user_nvram = UserNvram::unmarshal(&mut r, config, config.user_nvram_size)?;
    r.read_future_block(&hdr, "PERSISTENT_ALL", "version 4 or later")?;
    read_trailing_magic(&mut r, "PERSISTENT_ALL", PERSISTENT_ALL_MAGIC)?;
    info!(
        "PERSISTENT_ALL: restored version {} state, resetCount {}",
        hdr.version, persistent.reset_count
    );
    Ok(PermanentState {
        persistent,
        orderly,
        reset,
        clear,
        index_orderly_ram,
        user_nvram,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        marshal::persistent::{TPM_SU_CLEAR, TPM_SU_STATE},
    };

    fn encode(state: &PermanentState, config: &BuildConfig) -> Vec<u8> {
        marshal_permanent(state, config, &PcrSelectionList::all(config)).unwrap()
    }

    #[test]
    fn test_reset_and_clear_follow_orderly_state() {
        let config = BuildConfig::default();
        let mut state = PermanentState::new(&config).unwrap();
        state.persistent.orderly_state = TPM_SU_CLEAR;
        let without = encode(&state, &config);
        state.persistent.orderly_state = TPM_SU_STATE;
        let with = encode(&state, &config);
        assert!(with.len() > without.len());
    }

    #[test]
    fn test_bad_trailing_magic() {
        let config = BuildConfig::default();
        let state = PermanentState::new(&config).unwrap();
        let mut bytes = encode(&state, &config);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let err = unmarshal_permanent(
            &bytes,
            &config,
            &mut ShadowState::new(),
            &PcrSelectionList::all(&config),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadTag);
    }
}
