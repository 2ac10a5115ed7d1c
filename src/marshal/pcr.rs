// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! PCR allocation, PCR banks, PCR policies and PCR auth values.

use super::{
    count_u16, digest_size, hash_alg, read_array_count, read_array_size, NvMarshal,
    DIGEST_SIZE_MAX, TPM_ALG_NULL,
};
use crate::{
    block::NvHeader,
    codec::{StateReader, StateWriter},
    config::BuildConfig,
    error::MarshalError,
};
use log::error;
use tpm2_protocol::data::TpmAlgId;

pub const PCR_POLICY_MAGIC: u32 = 0x176b_e626;
pub const PCR_POLICY_VERSION: u16 = 2;
pub const PCR_SAVE_MAGIC: u32 = 0x7372_eabc;
pub const PCR_SAVE_VERSION: u16 = 2;
pub const PCR_MAGIC: u32 = 0xe95f_0387;
pub const PCR_VERSION: u16 = 2;
pub const PCR_AUTHVALUE_MAGIC: u32 = 0x6be8_2eaf;
pub const PCR_AUTHVALUE_VERSION: u16 = 2;

/// Selected PCRs of one bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSelection {
    pub hash: u16,
    pub select: Vec<u8>,
}

/// A PCR allocation: which banks are active and which of their PCRs exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcrSelectionList {
    pub selections: Vec<PcrSelection>,
}

impl PcrSelectionList {
    /// Allocates every PCR of every implemented bank.
    #[must_use]
    pub fn all(config: &BuildConfig) -> Self {
        Self::with_active(config, &config.pcr_banks)
    }

    /// Allocates every PCR of `active` and leaves the other implemented
    /// banks empty.
    #[must_use]
    pub fn with_active(config: &BuildConfig, active: &[TpmAlgId]) -> Self {
        let len = config.pcr_select_max();
        let selections = config
            .pcr_banks
            .iter()
            .map(|alg| {
                let mut select = vec![0u8; len];
                if active.contains(alg) {
                    for (i, byte) in select.iter_mut().enumerate() {
                        let bits = config.implementation_pcr.saturating_sub(i * 8).min(8);
                        *byte = u8::try_from((1u16 << bits) - 1).unwrap_or(u8::MAX);
                    }
                }
                PcrSelection {
                    hash: *alg as u16,
                    select,
                }
            })
            .collect();
        Self { selections }
    }

    /// Returns the banks that have at least one PCR allocated.
    #[must_use]
    pub fn active_banks(&self) -> Vec<u16> {
        self.selections
            .iter()
            .filter(|s| s.select.iter().any(|b| *b != 0))
            .map(|s| s.hash)
            .collect()
    }

    /// # Errors
    ///
    /// Returns `TooLarge` if a selection does not fit its persisted width.
    pub fn marshal(&self, w: &mut StateWriter) -> Result<(), MarshalError> {
        w.write_u32(u32::from(count_u16(
            "TPML_PCR_SELECTION",
            self.selections.len(),
        )?));
        for selection in &self.selections {
            w.write_u16(selection.hash);
            let size = u8::try_from(selection.select.len()).map_err(|_| MarshalError::TooLarge {
                name: "TPMS_PCR_SELECTION",
                size: selection.select.len(),
                max: usize::from(u8::MAX),
            })?;
            w.write_u8(size);
            w.write_bytes(&selection.select);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `TooLarge` for more selections than hash algorithms,
    /// `BadParameter` for an unknown hash and `Value` for a malformed select
    /// size.
    pub fn unmarshal(r: &mut StateReader<'_>, config: &BuildConfig) -> Result<Self, MarshalError> {
        let count = r.read_u32()? as usize;
        if count > config.hash_count() {
            return Err(MarshalError::TooLarge {
                name: "TPML_PCR_SELECTION",
                size: count,
                max: config.hash_count(),
            });
        }
        let mut selections = Vec::with_capacity(count);
        for _ in 0..count {
            let hash = r.read_u16()?;
            if hash_alg(hash).is_none() {
                error!("TPMS_PCR_SELECTION: unknown hash {hash:#06x}");
                return Err(MarshalError::BadParameter(format!(
                    "TPMS_PCR_SELECTION: unknown hash {hash:#06x}"
                )));
            }
            let size = usize::from(r.read_u8()?);
            if size < config.pcr_select_min() || size > config.pcr_select_max() {
                return Err(MarshalError::Value(format!(
                    "TPMS_PCR_SELECTION: bad sizeofSelect {size}"
                )));
            }
            let select = r.read_bytes(size)?.to_vec();
            selections.push(PcrSelection { hash, select });
        }
        Ok(Self { selections })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrPolicyEntry {
    pub hash_alg: u16,
    pub policy: Vec<u8>,
}

/// Policies of the PCR policy groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrPolicy {
    pub entries: Vec<PcrPolicyEntry>,
}

impl PcrPolicy {
    #[must_use]
    pub fn new(config: &BuildConfig) -> Self {
        let entry = PcrPolicyEntry {
            hash_alg: TPM_ALG_NULL,
            policy: Vec::new(),
        };
        Self {
            entries: vec![entry; config.num_policy_pcr_group],
        }
    }
}

impl NvMarshal for PcrPolicy {
    fn marshal(&self, w: &mut StateWriter, _config: &BuildConfig) -> Result<(), MarshalError> {
        NvHeader::write(w, PCR_POLICY_VERSION, PCR_POLICY_MAGIC, 1);
        w.write_u16(count_u16("PCR_POLICY", self.entries.len())?);
        for entry in &self.entries {
            w.write_u16(entry.hash_alg);
            w.write_tpm2b(&entry.policy, DIGEST_SIZE_MAX)?;
        }
        w.write_future_block()
    }

    fn unmarshal(r: &mut StateReader<'_>, config: &BuildConfig) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, PCR_POLICY_VERSION, PCR_POLICY_MAGIC)?;
        read_array_size(r, "PCR_POLICY", config.num_policy_pcr_group)?;
        let mut entries = Vec::with_capacity(config.num_policy_pcr_group);
        for _ in 0..config.num_policy_pcr_group {
            let hash_alg = r.read_u16()?;
            let policy = r.read_tpm2b(DIGEST_SIZE_MAX)?;
            entries.push(PcrPolicyEntry { hash_alg, policy });
        }
        r.read_future_block(&hdr, "PCR_POLICY", "version 3 or later")?;
        Ok(Self { entries })
    }
}

/// Register contents of one bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrBank {
    pub alg: TpmAlgId,
    pub data: Vec<u8>,
}

fn zeroed_banks(config: &BuildConfig, registers: usize) -> Result<Vec<PcrBank>, MarshalError> {
    config
        .pcr_banks
        .iter()
        .map(|alg| {
            Ok(PcrBank {
                alg: *alg,
                data: vec![0; registers * digest_size(*alg)?],
            })
        })
        .collect()
}

fn marshal_banks(
    w: &mut StateWriter,
    name: &'static str,
    config: &BuildConfig,
    banks: &[PcrBank],
    registers: usize,
) -> Result<(), MarshalError> {
    for alg in &config.pcr_banks {
        let size = registers * digest_size(*alg)?;
        let zeroes;
        let data = match banks.iter().find(|bank| bank.alg == *alg) {
            Some(bank) => &bank.data,
            None => {
                zeroes = vec![0; size];
                &zeroes
            }
        };
        if data.len() != size {
            return Err(MarshalError::BadParameter(format!(
                "{name}: bank {alg:?} holds {} bytes, expected {size}",
                data.len()
            )));
        }
        w.write_u16(*alg as u16);
        w.write_sized_array(data)?;
    }
    w.write_u16(TPM_ALG_NULL);
    Ok(())
}

fn unmarshal_banks(
    r: &mut StateReader<'_>,
    name: &'static str,
    config: &BuildConfig,
    allocation: &PcrSelectionList,
    registers: usize,
) -> Result<Vec<PcrBank>, MarshalError> {
    let mut banks = zeroed_banks(config, registers)?;
    let mut needed = allocation.active_banks();
    loop {
        let algid = r.read_u16()?;
        if algid == TPM_ALG_NULL {
            break;
        }
        let Some(bank) = banks.iter_mut().find(|bank| bank.alg as u16 == algid) else {
            error!("{name}: Unsupported algid {algid:#06x}");
            return Err(MarshalError::BadParameter(format!(
                "{name}: unsupported algid {algid:#06x}"
            )));
        };
        needed.retain(|alg| *alg != algid);
        let found = usize::from(r.read_u16()?);
        if found != bank.data.len() {
            error!(
                "{name}: Bad size for PCRs for hash {algid:#06x}; Expected {}, got {found}",
                bank.data.len()
            );
            return Err(MarshalError::BadParameter(format!(
                "{name}: bad size {found} for hash {algid:#06x}"
            )));
        }
        bank.data.copy_from_slice(r.read_bytes(found)?);
    }
    if let Some(alg) = needed.first() {
        error!("{name}: Missing data for hash algorithm {alg:#06x}");
        return Err(MarshalError::BadParameter(format!(
            "{name}: missing data for hash algorithm {alg:#06x}"
        )));
    }
    Ok(banks)
}

/// Saved values of the static PCRs of every bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSave {
    pub banks: Vec<PcrBank>,
}

impl PcrSave {
    /// # Errors
    ///
    /// Returns `BadParameter` if the configuration lists a non-hash bank.
    pub fn new(config: &BuildConfig) -> Result<Self, MarshalError> {
        Ok(Self {
            banks: zeroed_banks(config, config.num_static_pcr)?,
        })
    }

    /// # Errors
    ///
    /// Returns `BadParameter` if a bank has the wrong size.
    pub fn marshal(&self, w: &mut StateWriter, config: &BuildConfig) -> Result<(), MarshalError> {
        NvHeader::write(w, PCR_SAVE_VERSION, PCR_SAVE_MAGIC, 1);
        w.write_u16(count_u16("PCR_SAVE", config.num_static_pcr)?);
        marshal_banks(w, "PCR_SAVE", config, &self.banks, config.num_static_pcr)?;
        w.write_future_block()
    }

    /// Decodes the saved PCRs. Every bank active in `allocation` must be
    /// present in the stream.
    ///
    /// # Errors
    ///
    /// Returns `ArraySize` for a different static PCR count and
    /// `BadParameter` for unknown, malformed or missing banks.
    pub fn unmarshal(
        r: &mut StateReader<'_>,
        config: &BuildConfig,
        allocation: &PcrSelectionList,
    ) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, PCR_SAVE_VERSION, PCR_SAVE_MAGIC)?;
        read_array_size(r, "PCR_SAVE NUM_STATIC_PCR", config.num_static_pcr)?;
        let banks = unmarshal_banks(r, "PCR_SAVE", config, allocation, config.num_static_pcr)?;
        r.read_future_block(&hdr, "PCR_SAVE", "version 3 or later")?;
        Ok(Self { banks })
    }
}

/// A single PCR across all banks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcr {
    pub banks: Vec<PcrBank>,
}

impl Pcr {
    /// # Errors
    ///
    /// Returns `BadParameter` if the configuration lists a non-hash bank.
    pub fn new(config: &BuildConfig) -> Result<Self, MarshalError> {
        Ok(Self {
            banks: zeroed_banks(config, 1)?,
        })
    }

    /// # Errors
    ///
    /// Returns `BadParameter` if a bank has the wrong size.
    pub fn marshal(&self, w: &mut StateWriter, config: &BuildConfig) -> Result<(), MarshalError> {
        NvHeader::write(w, PCR_VERSION, PCR_MAGIC, 1);
        marshal_banks(w, "PCR", config, &self.banks, 1)?;
        w.write_future_block()
    }

    /// # Errors
    ///
    /// Returns `BadParameter` for unknown, malformed or missing banks.
    pub fn unmarshal(
        r: &mut StateReader<'_>,
        config: &BuildConfig,
        allocation: &PcrSelectionList,
    ) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, PCR_VERSION, PCR_MAGIC)?;
        let banks = unmarshal_banks(r, "PCR", config, allocation, 1)?;
        r.read_future_block(&hdr, "PCR", "version 3 or later")?;
        Ok(Self { banks })
    }
}

/// Auth values of the PCR auth groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrAuthValue {
    pub auth: Vec<Vec<u8>>,
}

impl PcrAuthValue {
    #[must_use]
    pub fn new(config: &BuildConfig) -> Self {
        Self {
            auth: vec![Vec::new(); config.num_authvalue_pcr_group],
        }
    }
}

impl NvMarshal for PcrAuthValue {
    fn marshal(&self, w: &mut StateWriter, _config: &BuildConfig) -> Result<(), MarshalError> {
        NvHeader::write(w, PCR_AUTHVALUE_VERSION, PCR_AUTHVALUE_MAGIC, 1);
        w.write_u16(count_u16("PCR_AUTHVALUE", self.auth.len())?);
        for auth in &self.auth {
            w.write_tpm2b(auth, DIGEST_SIZE_MAX)?;
        }
        w.write_future_block()
    }

    fn unmarshal(r: &mut StateReader<'_>, config: &BuildConfig) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, PCR_AUTHVALUE_VERSION, PCR_AUTHVALUE_MAGIC)?;
        read_array_count(r, "PCR_AUTHVALUE auth", config.num_authvalue_pcr_group)?;
        let auth = (0..config.num_authvalue_pcr_group)
            .map(|_| r.read_tpm2b(DIGEST_SIZE_MAX))
            .collect::<Result<Vec<_>, _>>()?;
        r.read_future_block(&hdr, "PCR_AUTHVALUE", "version 3 or later")?;
        Ok(Self { auth })
    }
}
