// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! TPM family of an instance.

use std::fmt;

pub const PERMANENT_BLOB: &str = "permall";
pub const VOLATILE_BLOB: &str = "volatilestate";
pub const SAVE_STATE_BLOB: &str = "savestate";

/// PCRs that the PC client profile resets on TPM2_PCR_Reset: the debug PCR
/// and the application PCR.
const TPM2_RESETTABLE_PCRS: [usize; 2] = [16, 23];

/// TPM 1.2 resets every PCR from 16 on.
const TPM12_RESETTABLE_PCRS: [usize; 8] = [16, 17, 18, 19, 20, 21, 22, 23];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TpmEngine {
    Tpm12,
    #[default]
    Tpm2,
}

impl TpmEngine {
    /// Prefix of the NVRAM blob names.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Tpm12 => "tpm-",
            Self::Tpm2 => "tpm2-",
        }
    }

    /// Returns the store name of a blob.
    #[must_use]
    pub fn blob_name(self, blob: &str) -> String {
        format!("{}{blob}", self.prefix())
    }

    /// PCRs excluded from the save state.
    #[must_use]
    pub fn resettable_pcrs(self) -> &'static [usize] {
        match self {
            Self::Tpm12 => &TPM12_RESETTABLE_PCRS,
            Self::Tpm2 => &TPM2_RESETTABLE_PCRS,
        }
    }

    #[must_use]
    pub fn is_resettable(self, pcr: usize) -> bool {
        self.resettable_pcrs().contains(&pcr)
    }

    /// Indices below `count` that the save state carries.
    #[must_use]
    pub fn saved_pcrs(self, count: usize) -> Vec<usize> {
        (0..count).filter(|pcr| !self.is_resettable(*pcr)).collect()
    }
}

impl fmt::Display for TpmEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tpm12 => write!(f, "TPM 1.2"),
            Self::Tpm2 => write!(f, "TPM 2.0"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_names() {
        assert_eq!(TpmEngine::Tpm2.blob_name(PERMANENT_BLOB), "tpm2-permall");
        assert_eq!(TpmEngine::Tpm12.blob_name(SAVE_STATE_BLOB), "tpm-savestate");
    }

    #[test]
    fn test_saved_pcrs() {
        assert_eq!(TpmEngine::Tpm2.saved_pcrs(24).len(), 22);
        assert_eq!(TpmEngine::Tpm12.saved_pcrs(24), (0..16).collect::<Vec<_>>());
    }
}
