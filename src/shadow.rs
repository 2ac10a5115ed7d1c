// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Values decoded during a restore that take effect only after the whole
//! restore has succeeded.

use crate::marshal::pcr::PcrSelectionList;
use log::debug;

/// Staged PCR allocation of an in-progress restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShadowState {
    pcr_allocated: Option<PcrSelectionList>,
}

impl ShadowState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages the allocation that was live when the permanent state was
    /// written. A later call replaces an earlier one.
    pub fn stage_pcr_allocation(&mut self, value: PcrSelectionList) {
        self.pcr_allocated = Some(value);
    }

    /// Returns the staged allocation, if any.
    #[must_use]
    pub fn pending(&self) -> Option<&PcrSelectionList> {
        self.pcr_allocated.as_ref()
    }

    /// Returns the allocation PCR decoders validate against: the staged one
    /// if present, otherwise `live`.
    #[must_use]
    pub fn allocation<'a>(&'a self, live: &'a PcrSelectionList) -> &'a PcrSelectionList {
        self.pcr_allocated.as_ref().unwrap_or(live)
    }

    /// Moves the staged allocation into `live`. Returns `true` if a value was
    /// staged.
    pub fn commit(&mut self, live: &mut PcrSelectionList) -> bool {
        match self.pcr_allocated.take() {
            Some(value) => {
                debug!("shadow: committing PCR allocation {:04x?}", value.active_banks());
                *live = value;
                true
            }
            None => false,
        }
    }

    /// Drops the staged allocation of a failed restore.
    pub fn discard(&mut self) {
        self.pcr_allocated = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use tpm2_protocol::data::TpmAlgId;

    #[test]
    fn test_commit_is_one_shot() {
        let config = BuildConfig::default();
        let mut live = PcrSelectionList::all(&config);
        let staged = PcrSelectionList::with_active(&config, &[TpmAlgId::Sha256]);

        let mut shadow = ShadowState::new();
        assert!(!shadow.commit(&mut live));

        shadow.stage_pcr_allocation(staged.clone());
        assert_eq!(shadow.allocation(&live), &staged);
        assert_ne!(live, staged);

        assert!(shadow.commit(&mut live));
        assert_eq!(live, staged);
        assert!(shadow.pending().is_none());
        assert!(!shadow.commit(&mut live));
    }

    #[test]
    fn test_allocation_falls_back_to_live() {
        let config = BuildConfig::default();
        let live = PcrSelectionList::all(&config);
        let shadow = ShadowState::new();
        assert_eq!(shadow.allocation(&live), &live);
    }
}
