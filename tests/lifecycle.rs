// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use nvstate::{
    crypto::SoftwareHash,
    marshal::pcr::PcrSelectionList,
    snapshot::{
        marshal_save_state,
        save::{HandleEntry, NvFlags, PcrValues},
        unmarshal_save_state, HandleKind, SaveState,
    },
    store::{FileStore, MemoryStore, NvramStore},
    BuildConfig, MarshalError, PowerOnState, StateError, StoreError, TpmEngine,
    TpmInstanceContext,
};
use proptest::prelude::*;
use rstest::rstest;
use tempfile::TempDir;
use tpm2_protocol::data::TpmAlgId;

fn file_context(dir: &TempDir, engine: TpmEngine) -> TpmInstanceContext<FileStore> {
    TpmInstanceContext::new(
        BuildConfig::default(),
        engine,
        "vm0",
        FileStore::new(dir.path()),
    )
    .unwrap()
}

#[test]
fn test_file_store_roundtrip() {
    let dir = TempDir::new().unwrap();
    let mut store = FileStore::new(dir.path());
    assert_eq!(store.load("vm0", "tpm2-permall").unwrap(), None);
    store.store("vm0", "tpm2-permall", b"first").unwrap();
    store.store("vm0", "tpm2-permall", b"second").unwrap();
    assert_eq!(
        store.load("vm0", "tpm2-permall").unwrap(),
        Some(b"second".to_vec())
    );
    assert!(dir.path().join("vm0").join("tpm2-permall").exists());
    assert!(!dir.path().join("vm0").join(".tpm2-permall.tmp").exists());

    store.delete("vm0", "tpm2-permall", true).unwrap();
    assert!(matches!(
        store.delete("vm0", "tpm2-permall", true),
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.load("../vm0", "tpm2-permall"),
        Err(StoreError::InvalidName(_))
    ));
}

#[rstest]
#[case(TpmEngine::Tpm2, "tpm2-permall")]
#[case(TpmEngine::Tpm12, "tpm-permall")]
fn test_power_cycle(#[case] engine: TpmEngine, #[case] blob: &str) {
    let dir = TempDir::new().unwrap();
    let mut ctx = file_context(&dir, engine);
    assert_eq!(ctx.power_on().unwrap(), PowerOnState::Manufactured);
    ctx.permanent_mut().unwrap().persistent.reset_count = 5;
    ctx.permanent_mut().unwrap().persistent.sp_seed = vec![0x5a; 64];
    ctx.store_permanent().unwrap();
    assert!(dir.path().join("vm0").join(blob).exists());

    let mut ctx = file_context(&dir, engine);
    assert_eq!(ctx.power_on().unwrap(), PowerOnState::Restored);
    assert_eq!(ctx.permanent().unwrap().persistent.reset_count, 5);

    ctx.store_volatile().unwrap();
    let mut ctx = file_context(&dir, engine);
    assert_eq!(ctx.power_on().unwrap(), PowerOnState::Resumed);
    assert_eq!(ctx.permanent().unwrap().persistent.sp_seed, vec![0x5a; 64]);
}

#[test]
fn test_volatile_of_other_seed_is_dropped() {
    let mut ctx = TpmInstanceContext::new(
        BuildConfig::default(),
        TpmEngine::Tpm2,
        "0",
        MemoryStore::new(),
    )
    .unwrap();
    ctx.power_on().unwrap();
    ctx.store_permanent().unwrap();
    ctx.store_volatile().unwrap();

    // a new endorsement seed invalidates the saved volatile state
    ctx.permanent_mut().unwrap().persistent.ep_seed = vec![0x01; 64];
    ctx.store_permanent().unwrap();
    assert_eq!(ctx.power_on().unwrap(), PowerOnState::Restored);
}

#[test]
fn test_requested_allocation_stays_pending() {
    let config = BuildConfig::default();
    let all = PcrSelectionList::all(&config);
    let sha256 = PcrSelectionList::with_active(&config, &[TpmAlgId::Sha256]);
    let mut ctx =
        TpmInstanceContext::new(config, TpmEngine::Tpm2, "0", MemoryStore::new()).unwrap();
    ctx.power_on().unwrap();
    ctx.permanent_mut().unwrap().persistent.pcr_allocated = sha256.clone();
    ctx.store_permanent().unwrap();

    assert_eq!(ctx.power_on().unwrap(), PowerOnState::Restored);
    assert_eq!(ctx.pcr_allocation(), &all);
    assert_eq!(ctx.permanent().unwrap().persistent.pcr_allocated, sha256);
}

#[test]
fn test_save_state_roundtrip_through_context() {
    let mut ctx = TpmInstanceContext::new(
        BuildConfig::default(),
        TpmEngine::Tpm2,
        "0",
        MemoryStore::new(),
    )
    .unwrap();
    ctx.power_on().unwrap();
    ctx.handles_mut().push(HandleEntry {
        handle: 0x8000_0000,
        kind: HandleKind::Object,
    });
    ctx.save_state().unwrap();
    ctx.handles_mut().clear();
    assert!(ctx.restore_save_state().unwrap());
    assert_eq!(ctx.handles().len(), 1);

    let name = TpmEngine::Tpm2.blob_name("savestate");
    let mut bytes = ctx.store().load("0", &name).unwrap().unwrap();
    bytes[0] ^= 0xff;
    ctx.store_mut().store("0", &name, &bytes).unwrap();
    assert!(!ctx.restore_save_state().unwrap());
    assert_eq!(ctx.store().load("0", &name).unwrap(), None);
}

#[test]
fn test_failure_mode_is_sticky() {
    let dir = TempDir::new().unwrap();
    let mut store = FileStore::new(dir.path());
    store.store("vm0", "tpm2-permall", &[0u8; 16]).unwrap();
    let mut ctx = file_context(&dir, TpmEngine::Tpm2);
    assert!(matches!(ctx.power_on(), Err(StateError::FailureMode(_))));
    assert!(ctx.failure_info().is_some());
    assert!(matches!(ctx.power_on(), Err(StateError::FailureMode(_))));
    assert!(matches!(ctx.save_state(), Err(StateError::FailureMode(_))));
}

fn save_state_blob() -> Vec<u8> {
    let state = SaveState {
        pcrs: vec![
            PcrValues {
                alg: TpmAlgId::Sha1,
                values: vec![vec![0x10; 20]; 4],
            },
            PcrValues {
                alg: TpmAlgId::Sha256,
                values: vec![vec![0x20; 32]; 4],
            },
        ],
        sh_enable: true,
        eh_enable: true,
        ph_enable_nv: false,
        handles: vec![HandleEntry {
            handle: 0x0200_0001,
            kind: HandleKind::Session,
        }],
        nv_flags: vec![NvFlags {
            nv_index: 0x0100_0010,
            flags: 1,
        }],
    };
    marshal_save_state(&state, &SoftwareHash).unwrap()
}

proptest! {
    #[test]
    fn test_save_state_byte_flip(index in any::<prop::sample::Index>(), mask in 1u8..=255) {
        let mut bytes = save_state_blob();
        // the digest trailer is a u16 size and a SHA-256 digest
        let body = bytes.len() - 34;
        let at = index.index(body);
        bytes[at] ^= mask;
        let err = unmarshal_save_state(&bytes, &SoftwareHash).unwrap_err();
        prop_assert_eq!(err, MarshalError::Integrity);
    }
}
