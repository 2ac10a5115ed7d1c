// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Per-instance TPM state and its lifecycle.

use crate::{
    config::BuildConfig,
    crypto::{HashProvider, SoftwareHash},
    engine::{TpmEngine, PERMANENT_BLOB, SAVE_STATE_BLOB, VOLATILE_BLOB},
    error::{MarshalError, StateError},
    marshal::pcr::PcrSelectionList,
    shadow::ShadowState,
    snapshot::{
        marshal_permanent, marshal_save_state, marshal_volatile,
        save::{HandleEntry, NvFlags},
        unmarshal_permanent, unmarshal_save_state, unmarshal_volatile, PermanentState,
        SaveState, VolatileState,
    },
    store::NvramStore,
};
use log::{error, info, warn};
use std::fmt;

/// Function, line and code of the failure that stopped the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    pub function: u32,
    pub line: u32,
    pub code: u32,
    pub reason: String,
}

impl fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "function {:#x} line {} code {:#05x}: {}",
            self.function, self.line, self.code, self.reason
        )
    }
}

/// How an instance came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOnState {
    /// No permanent state existed and a fresh one was created.
    Manufactured,
    /// Permanent state was restored and the volatile state cold-started.
    Restored,
    /// Both permanent and volatile state were restored.
    Resumed,
}

/// All state of a single TPM instance.
pub struct TpmInstanceContext<S: NvramStore> {
    config: BuildConfig,
    engine: TpmEngine,
    instance_id: String,
    store: S,
    hasher: Box<dyn HashProvider>,
    permanent: Option<PermanentState>,
    volatile: VolatileState,
    shadow: ShadowState,
    pcr_allocation: PcrSelectionList,
    handles: Vec<HandleEntry>,
    nv_flags: Vec<NvFlags>,
    failure: Option<FailureInfo>,
}

impl<S: NvramStore> TpmInstanceContext<S> {
    /// # Errors
    ///
    /// Returns a `StateError` if the configuration lists a non-hash bank.
    pub fn new(
        config: BuildConfig,
        engine: TpmEngine,
        instance_id: &str,
        store: S,
    ) -> Result<Self, StateError> {
        let volatile = VolatileState::new(&config)?;
        let pcr_allocation = PcrSelectionList::all(&config);
        Ok(Self {
            config,
            engine,
            instance_id: instance_id.to_string(),
            store,
            hasher: Box::new(SoftwareHash),
            permanent: None,
            volatile,
            shadow: ShadowState::new(),
            pcr_allocation,
            handles: Vec::new(),
            nv_flags: Vec::new(),
            failure: None,
        })
    }

    /// Replaces the hash provider of the save-state digest.
    #[must_use]
    pub fn with_hasher(mut self, hasher: Box<dyn HashProvider>) -> Self {
        self.hasher = hasher;
        self
    }

    #[must_use]
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> TpmEngine {
        self.engine
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    #[must_use]
    pub fn permanent(&self) -> Option<&PermanentState> {
        self.permanent.as_ref()
    }

    pub fn permanent_mut(&mut self) -> Option<&mut PermanentState> {
        self.permanent.as_mut()
    }

    #[must_use]
    pub fn volatile(&self) -> &VolatileState {
        &self.volatile
    }

    pub fn volatile_mut(&mut self) -> &mut VolatileState {
        &mut self.volatile
    }

    /// The PCR allocation in effect.
    #[must_use]
    pub fn pcr_allocation(&self) -> &PcrSelectionList {
        &self.pcr_allocation
    }

    #[must_use]
    pub fn handles(&self) -> &[HandleEntry] {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut Vec<HandleEntry> {
        &mut self.handles
    }

    #[must_use]
    pub fn nv_flags(&self) -> &[NvFlags] {
        &self.nv_flags
    }

    pub fn nv_flags_mut(&mut self) -> &mut Vec<NvFlags> {
        &mut self.nv_flags
    }

    /// Returns the failure record. This is the only query that answers in
    /// failure mode.
    #[must_use]
    pub fn failure_info(&self) -> Option<&FailureInfo> {
        self.failure.as_ref()
    }

    /// Stops the instance. Everything but [`Self::failure_info`] fails from
    /// now on.
    pub fn enter_failure_mode(&mut self, info: FailureInfo) {
        error!("{}: entering failure mode: {info}", self.instance_id);
        self.volatile.in_failure_mode = true;
        self.volatile.fail_function = info.function;
        self.volatile.fail_line = info.line;
        self.volatile.fail_code = info.code;
        self.failure = Some(info);
    }

    fn check_running(&self) -> Result<(), StateError> {
        match &self.failure {
            Some(info) => Err(StateError::FailureMode(info.to_string())),
            None => Ok(()),
        }
    }

    fn blob_name(&self, blob: &str) -> String {
        self.engine.blob_name(blob)
    }

    /// Loads the permanent state and, if present, the volatile state.
    ///
    /// A permanent blob that fails to decode puts the instance into failure
    /// mode. A volatile blob that fails to decode is dropped and the
    /// instance cold-starts.
    ///
    /// # Errors
    ///
    /// Returns `FailureMode` if the permanent state is unusable, or `Store`
    /// if a blob cannot be read.
    pub fn power_on(&mut self) -> Result<PowerOnState, StateError> {
        self.check_running()?;
        self.shadow.discard();

        let name = self.blob_name(PERMANENT_BLOB);
        let Some(bytes) = self.store.load(&self.instance_id, &name)? else {
            info!("{}: no permanent state, manufacturing", self.instance_id);
            self.permanent = Some(PermanentState::new(&self.config)?);
            self.volatile = VolatileState::new(&self.config)?;
            self.pcr_allocation = PcrSelectionList::all(&self.config);
            return Ok(PowerOnState::Manufactured);
        };

        let mut permanent =
            match unmarshal_permanent(&bytes, &self.config, &mut self.shadow, &self.pcr_allocation)
            {
                Ok(permanent) => permanent,
                Err(e) => {
                    self.shadow.discard();
                    let info = FailureInfo {
                        function: 0,
                        line: 0,
                        code: e.to_tpm_rc(),
                        reason: format!("permanent state: {e}"),
                    };
                    self.enter_failure_mode(info.clone());
                    return Err(StateError::FailureMode(info.to_string()));
                }
            };

        let mut state = PowerOnState::Restored;
        let name = self.blob_name(VOLATILE_BLOB);
        match self.store.load(&self.instance_id, &name)? {
            Some(bytes) => match unmarshal_volatile(
                &bytes,
                &self.config,
                &permanent.persistent,
                &self.shadow,
                &self.pcr_allocation,
            ) {
                Ok(restore) => {
                    permanent.orderly = restore.orderly;
                    permanent.clear = restore.clear;
                    permanent.reset = restore.reset;
                    permanent.index_orderly_ram = restore.index_orderly_ram;
                    self.volatile = restore.state;
                    state = PowerOnState::Resumed;
                }
                Err(e) => {
                    warn!("{}: dropping volatile state: {e}", self.instance_id);
                    self.volatile = VolatileState::new(&self.config)?;
                }
            },
            None => self.volatile = VolatileState::new(&self.config)?,
        }

        self.shadow.commit(&mut self.pcr_allocation);
        self.permanent = Some(permanent);

        if self.volatile.in_failure_mode {
            self.enter_failure_mode(FailureInfo {
                function: self.volatile.fail_function,
                line: self.volatile.fail_line,
                code: self.volatile.fail_code,
                reason: "restored in failure mode".to_string(),
            });
        }
        info!("{}: {state:?}", self.instance_id);
        Ok(state)
    }

    fn loaded(&self) -> Result<&PermanentState, StateError> {
        self.check_running()?;
        self.permanent.as_ref().ok_or(StateError::NotLoaded)
    }

    /// Writes the permanent blob.
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` before [`Self::power_on`], or a `StateError` if
    /// the state cannot be encoded or stored.
    pub fn store_permanent(&mut self) -> Result<(), StateError> {
        let bytes = marshal_permanent(self.loaded()?, &self.config, &self.pcr_allocation)?;
        let name = self.blob_name(PERMANENT_BLOB);
        self.store.store(&self.instance_id, &name, &bytes)?;
        Ok(())
    }

    /// Writes the volatile blob.
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` before [`Self::power_on`], or a `StateError` if
    /// the state cannot be encoded or stored.
    pub fn store_volatile(&mut self) -> Result<(), StateError> {
        let bytes = marshal_volatile(&self.volatile, self.loaded()?, &self.config)?;
        let name = self.blob_name(VOLATILE_BLOB);
        self.store.store(&self.instance_id, &name, &bytes)?;
        Ok(())
    }

    /// Writes the save-state blob.
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` before [`Self::power_on`], or a `StateError` if
    /// the state cannot be encoded or stored.
    pub fn save_state(&mut self) -> Result<(), StateError> {
        let clear = &self.loaded()?.clear;
        let pcrs = SaveState::capture_pcrs(&self.volatile.pcrs, self.engine, &self.pcr_allocation);
        let state = SaveState {
            pcrs,
            sh_enable: clear.sh_enable,
            eh_enable: clear.eh_enable,
            ph_enable_nv: clear.ph_enable_nv,
            handles: self.handles.clone(),
            nv_flags: self.nv_flags.clone(),
        };
        let bytes = marshal_save_state(&state, self.hasher.as_ref())?;
        let name = self.blob_name(SAVE_STATE_BLOB);
        self.store.store(&self.instance_id, &name, &bytes)?;
        Ok(())
    }

    fn apply_save_state(&mut self, bytes: &[u8]) -> Result<(), MarshalError> {
        let state = unmarshal_save_state(bytes, self.hasher.as_ref())?;
        let mut pcrs = self.volatile.pcrs.clone();
        state.restore_pcrs(&mut pcrs, self.engine, &self.config, &self.pcr_allocation)?;
        self.volatile.pcrs = pcrs;
        if let Some(permanent) = &mut self.permanent {
            permanent.clear.sh_enable = state.sh_enable;
            permanent.clear.eh_enable = state.eh_enable;
            permanent.clear.ph_enable_nv = state.ph_enable_nv;
        }
        self.handles = state.handles;
        self.nv_flags = state.nv_flags;
        Ok(())
    }

    /// Restores the save-state blob. Returns `false` if there is no usable
    /// saved context, in which case a corrupt blob is removed.
    ///
    /// # Errors
    ///
    /// Returns `NotLoaded` before [`Self::power_on`], or `Store` if the blob
    /// cannot be accessed.
    pub fn restore_save_state(&mut self) -> Result<bool, StateError> {
        self.loaded()?;
        let name = self.blob_name(SAVE_STATE_BLOB);
        let Some(bytes) = self.store.load(&self.instance_id, &name)? else {
            return Ok(false);
        };
        if let Err(e) = self.apply_save_state(&bytes) {
            warn!("{}: dropping saved context: {e}", self.instance_id);
            self.store.delete(&self.instance_id, &name, false)?;
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn context() -> TpmInstanceContext<MemoryStore> {
        TpmInstanceContext::new(
            BuildConfig::default(),
            TpmEngine::Tpm2,
            "0",
            MemoryStore::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_store_before_power_on() {
        let mut ctx = context();
        assert!(matches!(ctx.store_permanent(), Err(StateError::NotLoaded)));
    }

    #[test]
    fn test_corrupt_permanent_enters_failure_mode() {
        let mut ctx = context();
        ctx.store_mut()
            .store("0", "tpm2-permall", &[0xde, 0xad])
            .unwrap();
        assert!(matches!(ctx.power_on(), Err(StateError::FailureMode(_))));
        let info = ctx.failure_info().unwrap();
        assert_eq!(info.code, crate::error::TPM_RC_SIZE);
        assert!(matches!(ctx.store_volatile(), Err(StateError::FailureMode(_))));
    }

    #[test]
    fn test_missing_save_state() {
        let mut ctx = context();
        ctx.power_on().unwrap();
        assert!(!ctx.restore_save_state().unwrap());
    }
}
