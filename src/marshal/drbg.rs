// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use super::{count_u16, read_array_size, NvMarshal};
use crate::{
    block::NvHeader,
    codec::{StateReader, StateWriter},
    config::BuildConfig,
    error::MarshalError,
};

pub const DRBG_STATE_MAGIC: u32 = 0x6fe8_3ea1;
pub const DRBG_STATE_VERSION: u16 = 2;

pub const DRBG_SEED_SIZE: usize = 48;
pub const DRBG_LAST_VALUE_COUNT: usize = 4;

/// State of the deterministic random bit generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrbgState {
    pub reseed_counter: u64,
    pub magic: u32,
    pub seed: [u8; DRBG_SEED_SIZE],
    pub last_value: [u32; DRBG_LAST_VALUE_COUNT],
}

impl Default for DrbgState {
    fn default() -> Self {
        Self {
            reseed_counter: 0,
            magic: 0,
            seed: [0; DRBG_SEED_SIZE],
            last_value: [0; DRBG_LAST_VALUE_COUNT],
        }
    }
}

impl NvMarshal for DrbgState {
    fn marshal(&self, w: &mut StateWriter, _config: &BuildConfig) -> Result<(), MarshalError> {
        NvHeader::write(w, DRBG_STATE_VERSION, DRBG_STATE_MAGIC, 1);
        w.write_u64(self.reseed_counter);
        w.write_u32(self.magic);
        w.write_sized_array(&self.seed)?;
        w.write_u16(count_u16("DRBG_STATE lastValue", DRBG_LAST_VALUE_COUNT)?);
        for value in self.last_value {
            w.write_u32(value);
        }
        w.write_future_block()
    }

    fn unmarshal(r: &mut StateReader<'_>, _config: &BuildConfig) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, DRBG_STATE_VERSION, DRBG_STATE_MAGIC)?;
        let reseed_counter = r.read_u64()?;
        let magic = r.read_u32()?;

        read_array_size(r, "DRBG_STATE seed", DRBG_SEED_SIZE)?;
        let mut seed = [0; DRBG_SEED_SIZE];
        seed.copy_from_slice(r.read_bytes(DRBG_SEED_SIZE)?);

        read_array_size(r, "DRBG_STATE lastValue", DRBG_LAST_VALUE_COUNT)?;
        let mut last_value = [0; DRBG_LAST_VALUE_COUNT];
        for value in &mut last_value {
            *value = r.read_u32()?;
        }

        r.read_future_block(&hdr, "DRBG_STATE", "version 3 or later")?;
        Ok(Self {
            reseed_counter,
            magic,
            seed,
            last_value,
        })
    }
}
