// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! The save-state blob written by TPM2_Shutdown(STATE).
//!
//! The blob ends with a SHA-256 digest over everything before it, and the
//! digest is verified before any field is decoded.

use crate::{
    block::NvHeader,
    codec::{StateReader, StateWriter},
    config::BuildConfig,
    crypto::HashProvider,
    engine::TpmEngine,
    error::MarshalError,
    marshal::{
        count_u16, digest_size, hash_alg,
        pcr::{Pcr, PcrSelectionList},
        DIGEST_SIZE_MAX,
    },
};
use log::{debug, error};
use tpm2_protocol::data::TpmAlgId;

pub const SAVE_STATE_MAGIC: u32 = 0x5a7e_57a7;
pub const SAVE_STATE_VERSION: u16 = 1;

const INTEGRITY_ALG: TpmAlgId = TpmAlgId::Sha256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Object,
    Session,
}

impl HandleKind {
    fn to_u8(self) -> u8 {
        match self {
            Self::Object => 0,
            Self::Session => 1,
        }
    }

    fn from_u8(value: u8) -> Result<Self, MarshalError> {
        match value {
            0 => Ok(Self::Object),
            1 => Ok(Self::Session),
            _ => Err(MarshalError::BadParameter(format!(
                "SAVE_STATE: unknown handle kind {value}"
            ))),
        }
    }
}

/// A loaded key or session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleEntry {
    pub handle: u32,
    pub kind: HandleKind,
}

/// Volatile attribute bits of an NV index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvFlags {
    pub nv_index: u32,
    pub flags: u32,
}

/// Saved values of one bank, in ascending PCR order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrValues {
    pub alg: TpmAlgId,
    pub values: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveState {
    pub pcrs: Vec<PcrValues>,
    pub sh_enable: bool,
    pub eh_enable: bool,
    pub ph_enable_nv: bool,
    pub handles: Vec<HandleEntry>,
    pub nv_flags: Vec<NvFlags>,
}

impl SaveState {
    /// Collects the values of the PCRs that survive a TPM2_Startup(STATE),
    /// for each bank active in `allocation`.
    #[must_use]
    pub fn capture_pcrs(
        pcrs: &[Pcr],
        engine: TpmEngine,
        allocation: &PcrSelectionList,
    ) -> Vec<PcrValues> {
        let saved = engine.saved_pcrs(pcrs.len());
        allocation
            .active_banks()
            .into_iter()
            .filter_map(hash_alg)
            .map(|alg| PcrValues {
                alg,
                values: saved
                    .iter()
                    .filter_map(|i| pcrs[*i].banks.iter().find(|bank| bank.alg == alg))
                    .map(|bank| bank.data.clone())
                    .collect(),
            })
            .collect()
    }

    /// Writes the saved values back into `pcrs`. Resettable PCRs are left
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` for a bank this build does not implement or
    /// `allocation` does not activate, `ArrayCount` if a bank carries a
    /// different number of PCRs and `Size` for a value of the wrong length.
    pub fn restore_pcrs(
        &self,
        pcrs: &mut [Pcr],
        engine: TpmEngine,
        config: &BuildConfig,
        allocation: &PcrSelectionList,
    ) -> Result<(), MarshalError> {
        let active = allocation.active_banks();
        let saved = engine.saved_pcrs(pcrs.len());
        for bank in &self.pcrs {
            if !config.has_bank(bank.alg) {
                return Err(MarshalError::BadParameter(format!(
                    "SAVE_STATE: bank {:?} is not implemented",
                    bank.alg
                )));
            }
            if !active.contains(&(bank.alg as u16)) {
                error!("SAVE_STATE: bank {:?} is not allocated", bank.alg);
                return Err(MarshalError::BadParameter(format!(
                    "SAVE_STATE: bank {:?} is not allocated",
                    bank.alg
                )));
            }
            if bank.values.len() != saved.len() {
                return Err(MarshalError::ArrayCount {
                    name: "SAVE_STATE pcrs",
                    expected: saved.len(),
                    found: bank.values.len(),
                });
            }
            let size = digest_size(bank.alg)?;
            for (i, value) in saved.iter().zip(&bank.values) {
                let Some(dst) = pcrs[*i].banks.iter_mut().find(|b| b.alg == bank.alg) else {
                    continue;
                };
                if value.len() != size {
                    return Err(MarshalError::TooLarge {
                        name: "SAVE_STATE pcr value",
                        size: value.len(),
                        max: size,
                    });
                }
                dst.data.copy_from_slice(value);
            }
        }
        Ok(())
    }
}

fn write_count(w: &mut StateWriter, name: &'static str, len: usize) -> Result<(), MarshalError> {
    w.write_u16(count_u16(name, len)?);
    Ok(())
}

/// Encodes the save state and appends its digest.
///
/// # Errors
///
/// Returns a `MarshalError` if a field does not fit, or if the digest
/// cannot be computed.
pub fn marshal_save_state(
    state: &SaveState,
    hasher: &dyn HashProvider,
) -> Result<Vec<u8>, MarshalError> {
    let mut w = StateWriter::new();
    NvHeader::write(&mut w, SAVE_STATE_VERSION, SAVE_STATE_MAGIC, 1);

    write_count(&mut w, "SAVE_STATE banks", state.pcrs.len())?;
    for bank in &state.pcrs {
        w.write_u16(bank.alg as u16);
        write_count(&mut w, "SAVE_STATE pcrs", bank.values.len())?;
        for value in &bank.values {
            w.write_tpm2b(value, DIGEST_SIZE_MAX)?;
        }
    }

    w.write_bool(state.sh_enable);
    w.write_bool(state.eh_enable);
    w.write_bool(state.ph_enable_nv);

    write_count(&mut w, "SAVE_STATE handles", state.handles.len())?;
    for entry in &state.handles {
        w.write_u32(entry.handle);
        w.write_u8(entry.kind.to_u8());
    }

    write_count(&mut w, "SAVE_STATE nvFlags", state.nv_flags.len())?;
    for entry in &state.nv_flags {
        w.write_u32(entry.nv_index);
        w.write_u32(entry.flags);
    }
    w.write_future_block()?;

    let digest = hasher.hash(INTEGRITY_ALG, w.as_bytes())?;
    w.write_tpm2b(&digest, DIGEST_SIZE_MAX)?;
    w.finish()
}

/// Splits off and verifies the trailing digest.
fn verify_digest<'a>(
    bytes: &'a [u8],
    hasher: &dyn HashProvider,
) -> Result<&'a [u8], MarshalError> {
    let size = digest_size(INTEGRITY_ALG)?;
    let trailer = size + 2;
    if bytes.len() < trailer {
        return Err(MarshalError::Size {
            offset: 0,
            needed: trailer,
            remaining: bytes.len(),
        });
    }
    let (body, tail) = bytes.split_at(bytes.len() - trailer);
    let mut r = StateReader::new(tail);
    let stored = r.read_sized_array()?;
    if stored.len() != size {
        error!("SAVE_STATE: digest has {} bytes, expected {size}", stored.len());
        return Err(MarshalError::Integrity);
    }
    if hasher.hash(INTEGRITY_ALG, body)? != stored {
        error!("SAVE_STATE: digest mismatch");
        return Err(MarshalError::Integrity);
    }
    Ok(body)
}

/// Verifies the digest and decodes the save state.
///
/// # Errors
///
/// Returns `Integrity` if the digest does not match, or another
/// `MarshalError` on a decode failure.
pub fn unmarshal_save_state(
    bytes: &[u8],
    hasher: &dyn HashProvider,
) -> Result<SaveState, MarshalError> {
    let body = verify_digest(bytes, hasher)?;
    let mut r = StateReader::new(body);
    NvHeader::read(&mut r, SAVE_STATE_VERSION, SAVE_STATE_MAGIC)?;

    let banks = r.read_u16()?;
    let mut pcrs = Vec::with_capacity(usize::from(banks));
    for _ in 0..banks {
        let id = r.read_u16()?;
        let alg = hash_alg(id).ok_or_else(|| {
            error!("SAVE_STATE: unsupported hash algorithm {id:#06x}");
            MarshalError::BadParameter(format!("SAVE_STATE: unsupported hash algorithm {id:#06x}"))
        })?;
        let count = r.read_u16()?;
        let values = (0..count)
            .map(|_| r.read_tpm2b(DIGEST_SIZE_MAX))
            .collect::<Result<Vec<_>, _>>()?;
        pcrs.push(PcrValues { alg, values });
    }

    let sh_enable = r.read_bool()?;
    let eh_enable = r.read_bool()?;
    let ph_enable_nv = r.read_bool()?;

    let count = r.read_u16()?;
    let handles = (0..count)
        .map(|_| {
            Ok(HandleEntry {
                handle: r.read_u32()?,
                kind: HandleKind::from_u8(r.read_u8()?)?,
            })
        })
        .collect::<Result<Vec<_>, MarshalError>>()?;

    let count = r.read_u16()?;
    let nv_flags = (0..count)
        .map(|_| {
            Ok(NvFlags {
                nv_index: r.read_u32()?,
                flags: r.read_u32()?,
            })
        })
        .collect::<Result<Vec<_>, MarshalError>>()?;

    r.read_block(false, "SAVE_STATE", "version 2 or later")?;
    if !r.is_empty() {
        return Err(MarshalError::BadParameter(format!(
            "SAVE_STATE: {} trailing bytes",
            r.remaining()
        )));
    }
    debug!(
        "SAVE_STATE: {} banks, {} handles, {} NV flags",
        pcrs.len(),
        handles.len(),
        nv_flags.len()
    );
    Ok(SaveState {
        pcrs,
        sh_enable,
        eh_enable,
        ph_enable_nv,
        handles,
        nv_flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftwareHash;

    fn sample() -> SaveState {
        SaveState {
            pcrs: vec![PcrValues {
                alg: TpmAlgId::Sha256,
                values: vec![vec![0xab; 32]; 2],
            }],
            sh_enable: true,
            eh_enable: false,
            ph_enable_nv: true,
            handles: vec![
                HandleEntry {
                    handle: 0x8000_0001,
                    kind: HandleKind::Object,
                },
                HandleEntry {
                    handle: 0x0200_0000,
                    kind: HandleKind::Session,
                },
            ],
            nv_flags: vec![NvFlags {
                nv_index: 0x0100_0001,
                flags: 0x2000_0000,
            }],
        }
    }

    #[test]
    fn test_save_state_roundtrip() {
        let state = sample();
        let bytes = marshal_save_state(&state, &SoftwareHash).unwrap();
        assert_eq!(unmarshal_save_state(&bytes, &SoftwareHash).unwrap(), state);
    }

    #[test]
    fn test_digest_checked_before_decode() {
        let mut bytes = marshal_save_state(&sample(), &SoftwareHash).unwrap();
        // corrupt the magic, which a structural decode would report as a tag error
        bytes[2] ^= 0xff;
        assert_eq!(
            unmarshal_save_state(&bytes, &SoftwareHash).unwrap_err(),
            MarshalError::Integrity
        );
    }

    #[test]
    fn test_pcr_capture_skips_resettable() {
        let config = BuildConfig {
            pcr_banks: vec![TpmAlgId::Sha256],
            ..BuildConfig::default()
        };
        let mut pcrs: Vec<Pcr> = (0..24).map(|_| Pcr::new(&config).unwrap()).collect();
        pcrs[16].banks[0].data.fill(0x16);
        pcrs[17].banks[0].data.fill(0x17);
        let allocation = PcrSelectionList::all(&config);
        let values = SaveState::capture_pcrs(&pcrs, TpmEngine::Tpm2, &allocation);
        assert_eq!(values[0].values.len(), 22);
        assert_eq!(values[0].values[16], vec![0x17; 32]);

        let state = SaveState {
            pcrs: values,
            ..sample()
        };
        let mut restored: Vec<Pcr> = (0..24).map(|_| Pcr::new(&config).unwrap()).collect();
        state
            .restore_pcrs(&mut restored, TpmEngine::Tpm2, &config, &allocation)
            .unwrap();
        assert_eq!(restored[17], pcrs[17]);
        assert_ne!(restored[16], pcrs[16]);
    }

    #[test]
    fn test_pcr_capture_follows_allocation() {
        let config = BuildConfig::default();
        let sha256 = PcrSelectionList::with_active(&config, &[TpmAlgId::Sha256]);
        let pcrs: Vec<Pcr> = (0..24).map(|_| Pcr::new(&config).unwrap()).collect();
        let values = SaveState::capture_pcrs(&pcrs, TpmEngine::Tpm2, &sha256);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].alg, TpmAlgId::Sha256);
        assert_eq!(values[0].values.len(), 22);

        let state = SaveState {
            pcrs: values,
            ..sample()
        };
        let mut restored = pcrs.clone();
        state
            .restore_pcrs(&mut restored, TpmEngine::Tpm2, &config, &sha256)
            .unwrap();

        let sha1 = PcrSelectionList::with_active(&config, &[TpmAlgId::Sha1]);
        let err = state
            .restore_pcrs(&mut restored, TpmEngine::Tpm2, &config, &sha1)
            .unwrap_err();
        assert!(matches!(err, MarshalError::BadParameter(_)));
    }
}
