// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use super::{NvMarshal, DIGEST_SIZE_MAX, TPM_ALG_NULL};
use crate::{
    block::NvHeader,
    codec::{StateReader, StateWriter},
    config::BuildConfig,
    error::MarshalError,
};

pub const NV_INDEX_MAGIC: u32 = 0x2547_265a;
pub const NV_INDEX_VERSION: u16 = 2;

pub const TPMA_NV_ORDERLY: u32 = 1 << 26;

/// Public area and auth value of an NV index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvIndex {
    pub nv_index: u32,
    pub name_alg: u16,
    pub attributes: u32,
    pub auth_policy: Vec<u8>,
    pub data_size: u16,
    pub auth_value: Vec<u8>,
}

impl Default for NvIndex {
    fn default() -> Self {
        Self {
            nv_index: 0,
            name_alg: TPM_ALG_NULL,
            attributes: 0,
            auth_policy: Vec::new(),
            data_size: 0,
            auth_value: Vec::new(),
        }
    }
}

impl NvIndex {
    #[must_use]
    pub fn is_orderly(&self) -> bool {
        self.attributes & TPMA_NV_ORDERLY != 0
    }
}

impl NvMarshal for NvIndex {
    fn marshal(&self, w: &mut StateWriter, _config: &BuildConfig) -> Result<(), MarshalError> {
        NvHeader::write(w, NV_INDEX_VERSION, NV_INDEX_MAGIC, 1);
        w.write_u32(self.nv_index);
        w.write_u16(self.name_alg);
        w.write_u32(self.attributes);
        w.write_tpm2b(&self.auth_policy, DIGEST_SIZE_MAX)?;
        w.write_u16(self.data_size);
        w.write_tpm2b(&self.auth_value, DIGEST_SIZE_MAX)?;
        w.write_future_block()
    }

    fn unmarshal(r: &mut StateReader<'_>, _config: &BuildConfig) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, NV_INDEX_VERSION, NV_INDEX_MAGIC)?;
        let index = Self {
            nv_index: r.read_u32()?,
            name_alg: r.read_u16()?,
            attributes: r.read_u32()?,
            auth_policy: r.read_tpm2b(DIGEST_SIZE_MAX)?,
            data_size: r.read_u16()?,
            auth_value: r.read_tpm2b(DIGEST_SIZE_MAX)?,
        };
        r.read_future_block(&hdr, "NV_INDEX", "version 3 or later")?;
        Ok(index)
    }
}
