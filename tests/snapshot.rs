// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use nvstate::{
    arena::{handle_type, NvEntry, RamRecord, UserNvram, TPM_HT_NV_INDEX},
    codec::{StateReader, StateWriter},
    marshal::{
        nv::{NvIndex, TPMA_NV_ORDERLY},
        object::{AnyObject, Object, ObjectBody, ATTR_OCCUPIED},
        pcr::PcrSelectionList,
        persistent::TPM_SU_STATE,
    },
    shadow::ShadowState,
    snapshot::{
        marshal_permanent, marshal_volatile, unmarshal_permanent, unmarshal_volatile,
        PermanentState, VolatileState,
    },
    BuildConfig, ErrorKind, MarshalError,
};
use proptest::prelude::*;
use rstest::{fixture, rstest};
use tpm2_protocol::data::TpmAlgId;

#[fixture]
fn config() -> BuildConfig {
    BuildConfig::default()
}

fn decode(
    bytes: &[u8],
    config: &BuildConfig,
) -> Result<(PermanentState, ShadowState), MarshalError> {
    let mut shadow = ShadowState::new();
    let live = PcrSelectionList::all(config);
    let state = unmarshal_permanent(bytes, config, &mut shadow, &live)?;
    Ok((state, shadow))
}

fn nv_index(handle: u32, attributes: u32) -> NvIndex {
    NvIndex {
        nv_index: handle,
        name_alg: TpmAlgId::Sha256 as u16,
        attributes,
        auth_policy: vec![0x5a; 32],
        data_size: 16,
        auth_value: b"password".to_vec(),
    }
}

#[rstest]
fn test_persistent_data_scenario(config: BuildConfig) {
    let allocation = PcrSelectionList::with_active(&config, &[TpmAlgId::Sha256]);
    let mut state = PermanentState::new(&config).unwrap();
    state.persistent.owner_auth = (1..=20).collect();
    state.persistent.reset_count = 7;
    state.persistent.pcr_allocated = allocation.clone();

    let bytes = marshal_permanent(&state, &config, &allocation).unwrap();
    let (out, shadow) = decode(&bytes, &config).unwrap();

    assert_eq!(out.persistent.owner_auth, (1..=20).collect::<Vec<u8>>());
    assert_eq!(out.persistent.reset_count, 7);
    assert_eq!(out.persistent.pcr_allocated, allocation);
    assert_eq!(
        out.persistent.pcr_allocated.active_banks(),
        vec![TpmAlgId::Sha256 as u16]
    );
    assert_eq!(shadow.pending(), Some(&allocation));
}

#[rstest]
fn test_minimal_blob_has_no_records(config: BuildConfig) {
    let state = PermanentState::new(&config).unwrap();
    assert_eq!(state.user_nvram.arena().read_u32(0).unwrap(), 0);
    let bytes = marshal_permanent(&state, &config, &PcrSelectionList::all(&config)).unwrap();
    let (out, _) = decode(&bytes, &config).unwrap();
    assert!(out.user_nvram.entries(&config).unwrap().is_empty());
    assert!(out.index_orderly_ram.records().unwrap().is_empty());
}

#[rstest]
fn test_orderly_state_carries_reset_and_clear(config: BuildConfig) {
    let mut state = PermanentState::new(&config).unwrap();
    state.persistent.orderly_state = TPM_SU_STATE;
    state.reset.clear_count = 11;
    state.reset.restart_count = 3;
    state.clear.sh_enable = true;
    let bytes = marshal_permanent(&state, &config, &PcrSelectionList::all(&config)).unwrap();
    let (out, _) = decode(&bytes, &config).unwrap();
    assert_eq!(out.reset.clear_count, 11);
    assert_eq!(out.reset.restart_count, 3);
    assert!(out.clear.sh_enable);
}

#[rstest]
fn test_user_nvram_walk_preserves_order(config: BuildConfig) {
    let mut state = PermanentState::new(&config).unwrap();
    let entries = vec![
        NvEntry::Index {
            index: nv_index(0x0100_0001, 0),
            data: (0..16).collect(),
        },
        NvEntry::Object {
            handle: 0x8100_0001,
            object: AnyObject {
                attributes: ATTR_OCCUPIED,
                body: ObjectBody::Key(Box::new(Object {
                    public_area: vec![0x00, 0x01, 0x00, 0x0b],
                    evict_handle: 0x8100_0001,
                    ..Object::default()
                })),
            },
        },
        NvEntry::Index {
            index: nv_index(0x0100_0002, 0),
            data: vec![0xee; 3],
        },
    ];
    for entry in &entries {
        state.user_nvram.insert(entry, &config).unwrap();
    }
    state.user_nvram.set_max_count(42).unwrap();

    let bytes = marshal_permanent(&state, &config, &PcrSelectionList::all(&config)).unwrap();
    let (out, _) = decode(&bytes, &config).unwrap();
    let found = out.user_nvram.entries(&config).unwrap();
    assert_eq!(found.len(), entries.len());
    assert_eq!(
        found.iter().map(NvEntry::handle).collect::<Vec<_>>(),
        vec![0x0100_0001, 0x8100_0001, 0x0100_0002]
    );
    assert_eq!(out.user_nvram.max_count().unwrap(), 42);
}

#[rstest]
fn test_user_nvram_overflow_reports_offset(config: BuildConfig) {
    let mut nvram = UserNvram::new(config.user_nvram_size);
    let entry = NvEntry::Index {
        index: nv_index(0x0100_0001, 0),
        data: vec![0x11; 200],
    };
    nvram.insert(&entry, &config).unwrap();
    let mut w = StateWriter::new();
    nvram.marshal(&mut w, &config).unwrap();
    let bytes = w.finish().unwrap();

    let err = UserNvram::unmarshal(&mut StateReader::new(&bytes), &config, 128).unwrap_err();
    match err {
        MarshalError::Overflow {
            region,
            offset,
            source_size,
            capacity,
        } => {
            assert_eq!(region, "USER_NVRAM");
            assert!(offset > capacity);
            assert_eq!(capacity, 128);
            assert_eq!(source_size, config.user_nvram_size as u64);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[rstest]
fn test_user_nvram_rejects_mismatched_handle(config: BuildConfig) {
    let mut nvram = UserNvram::new(config.user_nvram_size);
    let entry = NvEntry::Index {
        index: nv_index(0x8100_0001, 0),
        data: Vec::new(),
    };
    assert!(matches!(
        nvram.insert(&entry, &config),
        Err(MarshalError::Handle(0x8100_0001))
    ));
    assert_eq!(handle_type(0x0100_0001), TPM_HT_NV_INDEX);
}

#[rstest]
fn test_index_orderly_ram_survives_volatile(config: BuildConfig) {
    let mut perm = PermanentState::new(&config).unwrap();
    let record = RamRecord {
        handle: 0x0100_0003,
        attributes: TPMA_NV_ORDERLY,
        data: vec![1, 2, 3, 4, 5, 6, 7, 8],
    };
    perm.index_orderly_ram.insert(&record).unwrap();
    let volatile = VolatileState::new(&config).unwrap();
    let bytes = marshal_volatile(&volatile, &perm, &config).unwrap();

    let shadow = ShadowState::new();
    let live = PcrSelectionList::all(&config);
    let restore =
        unmarshal_volatile(&bytes, &config, &perm.persistent, &shadow, &live).unwrap();
    assert_eq!(restore.index_orderly_ram.records().unwrap(), vec![record]);
}

#[rstest]
fn test_incompatible_build_is_refused(config: BuildConfig) {
    let state = PermanentState::new(&config).unwrap();
    let bytes = marshal_permanent(&state, &config, &PcrSelectionList::all(&config)).unwrap();
    let reader = BuildConfig {
        max_session_num: config.max_session_num + 1,
        ..config
    };
    let err = decode(&bytes, &reader).unwrap_err();
    assert!(matches!(
        err,
        MarshalError::Constant {
            name: "MAX_SESSION_NUM",
            ..
        }
    ));
}

fn permanent_blob() -> Vec<u8> {
    let config = BuildConfig::default();
    let mut state = PermanentState::new(&config).unwrap();
    state.persistent.orderly_state = TPM_SU_STATE;
    state.persistent.ep_seed = vec![0x42; 64];
    state
        .user_nvram
        .insert(
            &NvEntry::Index {
                index: nv_index(0x0100_0001, 0),
                data: vec![0x33; 8],
            },
            &config,
        )
        .unwrap();
    marshal_permanent(&state, &config, &PcrSelectionList::all(&config)).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_truncated_permanent_blob(index in any::<prop::sample::Index>()) {
        let config = BuildConfig::default();
        let bytes = permanent_blob();
        let cut = index.index(bytes.len());
        let err = decode(&bytes[..cut], &config).unwrap_err();
        prop_assert_eq!(err.kind(), ErrorKind::Size, "cut at {}: {:?}", cut, err);
    }
}
