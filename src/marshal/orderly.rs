// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use super::{drbg::DrbgState, NvMarshal};
use crate::{
    block::NvHeader,
    codec::{StateReader, StateWriter},
    config::BuildConfig,
    error::MarshalError,
};

pub const ORDERLY_DATA_MAGIC: u32 = 0x5665_7887;
pub const ORDERLY_DATA_VERSION: u16 = 2;

/// Data saved on an orderly shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderlyData {
    pub clock: u64,
    pub clock_safe: u8,
    pub drbg_state: DrbgState,
    pub self_heal_timer: u64,
    pub lockout_timer: u64,
    pub time: u64,
}

impl NvMarshal for OrderlyData {
    fn marshal(&self, w: &mut StateWriter, config: &BuildConfig) -> Result<(), MarshalError> {
        NvHeader::write(w, ORDERLY_DATA_VERSION, ORDERLY_DATA_MAGIC, 1);
        w.write_u64(self.clock);
        w.write_u8(self.clock_safe);
        self.drbg_state.marshal(w, config)?;

        w.push_block(config.accumulate_self_heal_timer)?;
        if config.accumulate_self_heal_timer {
            w.write_u64(self.self_heal_timer);
            w.write_u64(self.lockout_timer);
            w.write_u64(self.time);
        }
        w.pop_block()?;

        w.write_future_block()
    }

    fn unmarshal(r: &mut StateReader<'_>, config: &BuildConfig) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, ORDERLY_DATA_VERSION, ORDERLY_DATA_MAGIC)?;
        let mut data = Self {
            clock: r.read_u64()?,
            clock_safe: r.read_u8()?,
            drbg_state: DrbgState::unmarshal(r, config)?,
            ..Self::default()
        };
        if r
            .read_block(config.accumulate_self_heal_timer, "ORDERLY_DATA", "selfHealTimer")?
            .is_present()
        {
            data.self_heal_timer = r.read_u64()?;
            data.lockout_timer = r.read_u64()?;
            data.time = r.read_u64()?;
        }
        r.read_future_block(&hdr, "ORDERLY_DATA", "version 3 or later")?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timers_dropped_by_build_without_them() {
        let writer = BuildConfig::default();
        let data = OrderlyData {
            clock: 1000,
            clock_safe: 1,
            self_heal_timer: 5,
            lockout_timer: 6,
            time: 7,
            ..OrderlyData::default()
        };
        let mut w = StateWriter::new();
        data.marshal(&mut w, &writer).unwrap();
        let bytes = w.finish().unwrap();

        let reader = BuildConfig {
            accumulate_self_heal_timer: false,
            ..BuildConfig::default()
        };
        let mut r = StateReader::new(&bytes);
        let out = OrderlyData::unmarshal(&mut r, &reader).unwrap();
        assert!(r.is_empty());
        assert_eq!(out.clock, 1000);
        assert_eq!(out.self_heal_timer, 0);
    }

    #[test]
    fn test_missing_timers_are_fatal() {
        let writer = BuildConfig {
            accumulate_self_heal_timer: false,
            ..BuildConfig::default()
        };
        let mut w = StateWriter::new();
        OrderlyData::default().marshal(&mut w, &writer).unwrap();
        let bytes = w.finish().unwrap();
        let err = OrderlyData::unmarshal(&mut StateReader::new(&bytes), &BuildConfig::default())
            .unwrap_err();
        assert!(matches!(err, MarshalError::MissingBlock { .. }));
    }
}
