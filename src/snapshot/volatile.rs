// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! The volatile blob: process-wide state that is lost on power loss, with
//! copies of the orderly, clear and reset data.

use super::{read_trailing_magic, PermanentState};
use crate::{
    arena::IndexOrderlyRam,
    block::NvHeader,
    codec::{StateReader, StateWriter},
    config::BuildConfig,
    error::MarshalError,
    marshal::{
        count_u16,
        object::AnyObject,
        orderly::OrderlyData,
        pcr::{Pcr, PcrSelectionList},
        persistent::PersistentData,
        read_array_count,
        session::SessionSlot,
        state::{StateClearData, StateResetData},
        NvMarshal, DIGEST_SIZE_MAX,
    },
    shadow::ShadowState,
};
use log::{debug, error};

pub const VOLATILE_STATE_MAGIC: u32 = 0x4563_7889;
pub const VOLATILE_STATE_VERSION: u16 = 4;

const NAME: &str = "Volatile state";

/// Per-command session bookkeeping of one authorization slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionHandleEntry {
    pub handle: u32,
    pub attributes: u8,
    pub associated_handle: u32,
    pub nonce_caller: Vec<u8>,
    pub input_auth_value: Vec<u8>,
}

impl SessionHandleEntry {
    fn marshal(&self, w: &mut StateWriter) -> Result<(), MarshalError> {
        w.write_u32(self.handle);
        w.write_u8(self.attributes);
        w.write_u32(self.associated_handle);
        w.write_tpm2b(&self.nonce_caller, DIGEST_SIZE_MAX)?;
        w.write_tpm2b(&self.input_auth_value, DIGEST_SIZE_MAX)?;
        Ok(())
    }

    fn unmarshal(r: &mut StateReader<'_>) -> Result<Self, MarshalError> {
        Ok(Self {
            handle: r.read_u32()?,
            attributes: r.read_u8()?,
            associated_handle: r.read_u32()?,
            nonce_caller: r.read_tpm2b(DIGEST_SIZE_MAX)?,
            input_auth_value: r.read_tpm2b(DIGEST_SIZE_MAX)?,
        })
    }
}

/// Volatile state of an instance.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolatileState {
    pub exclusive_audit_session: u32,
    pub time: u64,
    pub ph_enable: bool,
    pub pcr_reconfig: bool,
    pub drtm_handle: u32,
    pub drtm_pre_startup: bool,
    pub startup_locality3: bool,
    pub da_used: bool,
    pub power_was_lost: bool,
    pub prev_orderly_state: u16,
    pub nv_ok: bool,
    pub platform_unique_details: Vec<u8>,
    pub manufactured: bool,
    pub initialized: bool,
    pub session_handles: Vec<SessionHandleEntry>,
    pub encrypt_session_index: u32,
    pub decrypt_session_index: u32,
    pub audit_session_index: u32,
    pub cp_hash_for_command_audit: Vec<u8>,
    pub da_pending_on_nv: bool,
    /// Dictionary-attack timers, persisted here only when they are not
    /// accumulated in the orderly data.
    pub self_heal_timer: u64,
    pub lockout_timer: u64,
    pub evict_nv_end: u32,
    pub max_counter: u64,
    pub objects: Vec<AnyObject>,
    pub pcrs: Vec<Pcr>,
    pub sessions: Vec<SessionSlot>,
    pub oldest_saved_session: u32,
    pub free_session_slots: u32,
    pub in_failure_mode: bool,
    pub tpm_established: bool,
    pub fail_function: u32,
    pub fail_line: u32,
    pub fail_code: u32,
    pub real_time_previous: u64,
    pub tpm_time: u64,
    pub timer_reset: bool,
    pub timer_stopped: bool,
    pub adjust_rate: u32,
    pub real_time: u64,
    pub host_monotonic: u64,
    pub suspended_elapsed_time: u64,
    pub last_system_time: u64,
    pub last_reported_time: u64,
}

impl VolatileState {
    /// State after a cold start.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if the configuration lists a non-hash bank.
    pub fn new(config: &BuildConfig) -> Result<Self, MarshalError> {
        Ok(Self {
            exclusive_audit_session: 0,
            time: 0,
            ph_enable: true,
            pcr_reconfig: false,
            drtm_handle: 0,
            drtm_pre_startup: false,
            startup_locality3: false,
            da_used: false,
            power_was_lost: true,
            prev_orderly_state: 0,
            nv_ok: true,
            platform_unique_details: Vec::new(),
            manufactured: true,
            initialized: false,
            session_handles: vec![SessionHandleEntry::default(); config.max_session_num],
            encrypt_session_index: 0,
            decrypt_session_index: 0,
            audit_session_index: 0,
            cp_hash_for_command_audit: Vec::new(),
            da_pending_on_nv: false,
            self_heal_timer: 0,
            lockout_timer: 0,
            evict_nv_end: 0,
            max_counter: 0,
            objects: vec![AnyObject::default(); config.max_loaded_objects],
            pcrs: (0..config.implementation_pcr)
                .map(|_| Pcr::new(config))
                .collect::<Result<_, _>>()?,
            sessions: vec![SessionSlot::default(); config.max_loaded_sessions],
            oldest_saved_session: 0,
            free_session_slots: 0,
            in_failure_mode: false,
            tpm_established: false,
            fail_function: 0,
            fail_line: 0,
            fail_code: 0,
            real_time_previous: 0,
            tpm_time: 0,
            timer_reset: true,
            timer_stopped: true,
            adjust_rate: 0,
            real_time: 0,
            host_monotonic: 0,
            suspended_elapsed_time: 0,
            last_system_time: 0,
            last_reported_time: 0,
        })
    }
}

/// A decoded volatile blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolatileRestore {
    pub state: VolatileState,
    pub orderly: OrderlyData,
    pub clear: StateClearData,
    pub reset: StateResetData,
    pub index_orderly_ram: IndexOrderlyRam,
    /// Blobs before version 4 reported times in real time.
    pub times_are_realtime: bool,
}

fn write_count(w: &mut StateWriter, name: &'static str, len: usize) -> Result<(), MarshalError> {
    w.write_u16(count_u16(name, len)?);
    Ok(())
}

fn marshal_globals(
    w: &mut StateWriter,
    state: &VolatileState,
    perm: &PermanentState,
    config: &BuildConfig,
) -> Result<(), MarshalError> {
    w.write_u32(state.exclusive_audit_session);
    w.write_u64(state.time);
    w.write_bool(state.ph_enable);
    w.write_bool(state.pcr_reconfig);
    w.write_u32(state.drtm_handle);
    w.write_bool(state.drtm_pre_startup);
    w.write_bool(state.startup_locality3);

    w.push_block(true)?;
    w.write_bool(state.da_used);
    w.pop_block()?;

    w.write_bool(state.power_was_lost);
    w.write_u16(state.prev_orderly_state);
    w.write_bool(state.nv_ok);
    w.write_tpm2b(&state.platform_unique_details, DIGEST_SIZE_MAX)?;

    perm.orderly.marshal(w, config)?;
    perm.clear.marshal(w, config)?;
    perm.reset.marshal(w, config)?;

    w.write_bool(state.manufactured);
    w.write_bool(state.initialized);
    Ok(())
}

fn marshal_tables(
    w: &mut StateWriter,
    state: &VolatileState,
    perm: &PermanentState,
    config: &BuildConfig,
) -> Result<(), MarshalError> {
    w.push_block(true)?;
    write_count(w, "s_sessionHandles", state.session_handles.len())?;
    for entry in &state.session_handles {
        entry.marshal(w)?;
    }
    w.write_u32(state.encrypt_session_index);
    w.write_u32(state.decrypt_session_index);
    w.write_u32(state.audit_session_index);
    w.push_block(true)?;
    w.write_tpm2b(&state.cp_hash_for_command_audit, DIGEST_SIZE_MAX)?;
    w.pop_block()?;
    w.write_bool(state.da_pending_on_nv);
    w.pop_block()?;

    w.push_block(true)?;
    let separate_timers = !config.accumulate_self_heal_timer;
    w.push_block(separate_timers)?;
    if separate_timers {
        w.write_u64(state.self_heal_timer);
        w.write_u64(state.lockout_timer);
    }
    w.pop_block()?;
    w.pop_block()?;

    w.push_block(true)?;
    w.write_u32(state.evict_nv_end);
    w.write_sized_array(perm.index_orderly_ram.arena().as_bytes())?;
    w.write_u64(state.max_counter);
    w.pop_block()?;

    w.push_block(true)?;
    write_count(w, "s_objects", state.objects.len())?;
    for object in &state.objects {
        object.marshal(w, config)?;
    }
    w.pop_block()?;

    w.push_block(true)?;
    write_count(w, "s_pcrs", state.pcrs.len())?;
    for pcr in &state.pcrs {
        pcr.marshal(w, config)?;
    }
    w.pop_block()?;

    w.push_block(true)?;
    write_count(w, "s_sessions", state.sessions.len())?;
    for slot in &state.sessions {
        slot.marshal(w)?;
    }
    w.write_u32(state.oldest_saved_session);
    w.write_u32(state.free_session_slots);
    w.pop_block()
}

fn marshal_tail(
    w: &mut StateWriter,
    state: &VolatileState,
    persistent: &PersistentData,
    config: &BuildConfig,
) -> Result<(), MarshalError> {
    w.write_bool(state.in_failure_mode);
    w.write_bool(state.tpm_established);

    w.push_block(true)?;
    w.write_u32(state.fail_function);
    w.write_u32(state.fail_line);
    w.write_u32(state.fail_code);
    w.pop_block()?;

    w.push_block(true)?;
    w.write_u64(state.real_time_previous);
    w.write_u64(state.tpm_time);
    w.pop_block()?;

    w.write_bool(state.timer_reset);
    w.write_bool(state.timer_stopped);
    w.write_u32(state.adjust_rate);
    w.write_u64(state.real_time);

    // the blob is only valid with the permanent state it was written with
    w.push_block(true)?;
    for seed in [&persistent.ep_seed, &persistent.sp_seed, &persistent.pp_seed] {
        w.write_tpm2b(seed, config.primary_seed_size)?;
    }
    w.push_block(true)?;
    w.write_u64(state.host_monotonic);
    w.write_u64(state.suspended_elapsed_time);
    w.write_u64(state.last_system_time);
    w.write_u64(state.last_reported_time);
    w.write_future_block()?;
    w.pop_block()?;
    w.pop_block()
}

/// Encodes the volatile blob. The orderly, clear and reset data and the
/// index-orderly RAM are taken from `perm`.
///
/// # Errors
///
/// Returns a `MarshalError` if a structure does not fit its persisted
/// layout.
pub fn marshal_volatile(
    state: &VolatileState,
    perm: &PermanentState,
    config: &BuildConfig,
) -> Result<Vec<u8>, MarshalError> {
    let mut w = StateWriter::new();
    NvHeader::write(&mut w, VOLATILE_STATE_VERSION, VOLATILE_STATE_MAGIC, 1);
    marshal_globals(&mut w, state, perm, config)?;
    marshal_tables(&mut w, state, perm, config)?;
    marshal_tail(&mut w, state, &perm.persistent, config)?;
    w.write_u32(VOLATILE_STATE_MAGIC);
    let bytes = w.finish()?;
    debug!("{NAME}: {} bytes", bytes.len());
    Ok(bytes)
}

fn check_seed(
    r: &mut StateReader<'_>,
    config: &BuildConfig,
    name: &'static str,
    expected: &[u8],
) -> Result<(), MarshalError> {
    let seed = r.read_tpm2b(config.primary_seed_size)?;
    if seed != expected {
        error!("VolatileState_TailV3: {name} does not match");
        return Err(MarshalError::Value(format!("{NAME}: {name} does not match")));
    }
    Ok(())
}

struct Decoder<'a, 'b> {
    r: StateReader<'a>,
    config: &'b BuildConfig,
    shadow: &'b ShadowState,
    live: &'b PcrSelectionList,
}

impl Decoder<'_, '_> {
    fn globals(&mut self, state: &mut VolatileState) -> Result<(), MarshalError> {
        let r = &mut self.r;
        state.exclusive_audit_session = r.read_u32()?;
        state.time = r.read_u64()?;
        state.ph_enable = r.read_bool()?;
        state.pcr_reconfig = r.read_bool()?;
        state.drtm_handle = r.read_u32()?;
        state.drtm_pre_startup = r.read_bool()?;
        state.startup_locality3 = r.read_bool()?;
        if r.read_block(true, NAME, "g_daUsed")?.is_present() {
            state.da_used = r.read_bool()?;
        }
        state.power_was_lost = r.read_bool()?;
        state.prev_orderly_state = r.read_u16()?;
        state.nv_ok = r.read_bool()?;
        state.platform_unique_details = r.read_tpm2b(DIGEST_SIZE_MAX)?;
        Ok(())
    }

    fn session_process(&mut self, state: &mut VolatileState) -> Result<(), MarshalError> {
        let r = &mut self.r;
        if !r.read_block(true, NAME, "s_sessionHandles")?.is_present() {
            return Ok(());
        }
        read_array_count(r, "s_sessionHandles", self.config.max_session_num)?;
        state.session_handles = (0..self.config.max_session_num)
            .map(|_| SessionHandleEntry::unmarshal(r))
            .collect::<Result<_, _>>()?;
        state.encrypt_session_index = r.read_u32()?;
        state.decrypt_session_index = r.read_u32()?;
        state.audit_session_index = r.read_u32()?;
        if r.read_block(true, NAME, "s_cpHashForCommandAudit")?.is_present() {
            state.cp_hash_for_command_audit = r.read_tpm2b(DIGEST_SIZE_MAX)?;
        }
        state.da_pending_on_nv = r.read_bool()?;
        Ok(())
    }

    fn dictionary_attack(&mut self, state: &mut VolatileState) -> Result<(), MarshalError> {
        let r = &mut self.r;
        if r.read_block(true, NAME, "DA")?.is_present()
            && r
                .read_block(
                    !self.config.accumulate_self_heal_timer,
                    NAME,
                    "s_selfHealTimer",
                )?
                .is_present()
        {
            state.self_heal_timer = r.read_u64()?;
            state.lockout_timer = r.read_u64()?;
        }
        Ok(())
    }

    fn nv(&mut self, state: &mut VolatileState) -> Result<Option<IndexOrderlyRam>, MarshalError> {
        let r = &mut self.r;
        if !r.read_block(true, NAME, "s_evictNvEnd")?.is_present() {
            return Ok(None);
        }
        state.evict_nv_end = r.read_u32()?;
        let mut ram = IndexOrderlyRam::new(self.config.ram_index_space);
        ram.load_raw(r.read_sized_array()?)?;
        state.max_counter = r.read_u64()?;
        Ok(Some(ram))
    }

    fn objects(&mut self, state: &mut VolatileState) -> Result<(), MarshalError> {
        let r = &mut self.r;
        if !r.read_block(true, NAME, "s_objects")?.is_present() {
            return Ok(());
        }
        read_array_count(r, "s_objects", self.config.max_loaded_objects)?;
        state.objects = (0..self.config.max_loaded_objects)
            .map(|_| AnyObject::unmarshal(r, self.config))
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    fn pcrs(&mut self, state: &mut VolatileState) -> Result<(), MarshalError> {
        let r = &mut self.r;
        if !r.read_block(true, NAME, "s_pcrs")?.is_present() {
            return Ok(());
        }
        read_array_count(r, "s_pcrs", self.config.implementation_pcr)?;
        let allocation = self.shadow.allocation(self.live);
        state.pcrs = (0..self.config.implementation_pcr)
            .map(|_| Pcr::unmarshal(r, self.config, allocation))
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    fn sessions(&mut self, state: &mut VolatileState) -> Result<(), MarshalError> {
        let r = &mut self.r;
        if !r.read_block(true, NAME, "s_sessions")?.is_present() {
            return Ok(());
        }
        read_array_count(r, "s_sessions", self.config.max_loaded_sessions)?;
        state.sessions = (0..self.config.max_loaded_sessions)
            .map(|_| SessionSlot::unmarshal(r))
            .collect::<Result<_, _>>()?;
        state.oldest_saved_session = r.read_u32()?;
        state.free_session_slots = r.read_u32()?;
        Ok(())
    }

    fn tail(
        &mut self,
        state: &mut VolatileState,
        hdr: &NvHeader,
        persistent: &PersistentData,
    ) -> Result<(), MarshalError> {
        let r = &mut self.r;
        state.in_failure_mode = r.read_bool()?;
        state.tpm_established = r.read_bool()?;
        if r.read_block(true, NAME, "s_failFunction")?.is_present() {
            state.fail_function = r.read_u32()?;
            state.fail_line = r.read_u32()?;
            state.fail_code = r.read_u32()?;
        }
        if r.read_block(true, NAME, "s_realTimePrevious")?.is_present() {
            state.real_time_previous = r.read_u64()?;
            state.tpm_time = r.read_u64()?;
        }
        state.timer_reset = r.read_bool()?;
        state.timer_stopped = r.read_bool()?;
        state.adjust_rate = r.read_u32()?;
        state.real_time = r.read_u64()?;

        if hdr.version >= 2
            && r
                .read_block(hdr.version >= 3, NAME, "version 3 or later")?
                .is_present()
        {
            check_seed(r, self.config, "EPSeed", &persistent.ep_seed)?;
            check_seed(r, self.config, "SPSeed", &persistent.sp_seed)?;
            check_seed(r, self.config, "PPSeed", &persistent.pp_seed)?;
            if r
                .read_block(hdr.version >= 4, NAME, "version 4 or later")?
                .is_present()
            {
                state.host_monotonic = r.read_u64()?;
                state.suspended_elapsed_time = r.read_u64()?;
                state.last_system_time = r.read_u64()?;
                state.last_reported_time = r.read_u64()?;
                r.read_block(false, NAME, "version 5 or later")?;
            }
        }
        read_trailing_magic(r, NAME, VOLATILE_STATE_MAGIC)
    }
}

/// Decodes the volatile blob. Its seeds must match `persistent`, and its
/// PCR banks are checked against the allocation staged in `shadow`.
///
/// # Errors
///
/// Returns `Value` if the blob belongs to different permanent state, or
/// another `MarshalError` on any decode failure.
pub fn unmarshal_volatile(
    bytes: &[u8],
    config: &BuildConfig,
    persistent: &PersistentData,
    shadow: &ShadowState,
    live: &PcrSelectionList,
) -> Result<VolatileRestore, MarshalError> {
    let mut d = Decoder {
        r: StateReader::new(bytes),
        config,
        shadow,
        live,
    };
    let hdr = NvHeader::read(&mut d.r, VOLATILE_STATE_VERSION, VOLATILE_STATE_MAGIC)?;
    let mut state = VolatileState::new(config)?;
    d.globals(&mut state)?;
    let orderly = OrderlyData::unmarshal(&mut d.r, config)?;
    let clear = StateClearData::unmarshal(&mut d.r, config, shadow.allocation(live))?;
    let reset = StateResetData::unmarshal(&mut d.r, config)?;
    state.manufactured = d.r.read_bool()?;
    state.initialized = d.r.read_bool()?;
    d.session_process(&mut state)?;
    d.dictionary_attack(&mut state)?;
    let index_orderly_ram = d
        .nv(&mut state)?
        .unwrap_or_else(|| IndexOrderlyRam::new(config.ram_index_space));
    d.objects(&mut state)?;
    d.pcrs(&mut state)?;
    d.sessions(&mut state)?;
    d.tail(&mut state, &hdr, persistent)?;
    let times_are_realtime = hdr.version <= 3;
    debug!(
        "{NAME}: restored version {}, times are realtime: {times_are_realtime}",
        hdr.version
    );
    Ok(VolatileRestore {
        state,
        orderly,
        clear,
        reset,
        index_orderly_ram,
        times_are_realtime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn fixture(config: &BuildConfig) -> (VolatileState, PermanentState) {
        let mut perm = PermanentState::new(config).unwrap();
        perm.persistent.ep_seed = vec![0x11; 32];
        perm.persistent.sp_seed = vec![0x22; 32];
        perm.persistent.pp_seed = vec![0x33; 32];
        let mut state = VolatileState::new(config).unwrap();
        state.fail_line = 451;
        state.last_reported_time = 0x1234;
        (state, perm)
    }

    #[test]
    fn test_volatile_roundtrip() {
        let config = BuildConfig::default();
        let (state, perm) = fixture(&config);
        let live = PcrSelectionList::all(&config);
        let bytes = marshal_volatile(&state, &perm, &config).unwrap();
        let out =
            unmarshal_volatile(&bytes, &config, &perm.persistent, &ShadowState::new(), &live)
                .unwrap();
        assert_eq!(out.state, state);
        assert_eq!(out.reset, perm.reset);
        assert_eq!(out.index_orderly_ram, perm.index_orderly_ram);
        assert!(!out.times_are_realtime);
    }

    #[test]
    fn test_seed_tie() {
        let config = BuildConfig::default();
        let (state, mut perm) = fixture(&config);
        let bytes = marshal_volatile(&state, &perm, &config).unwrap();
        perm.persistent.sp_seed[0] ^= 0xff;
        let err = unmarshal_volatile(
            &bytes,
            &config,
            &perm.persistent,
            &ShadowState::new(),
            &PcrSelectionList::all(&config),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Value);
    }

    #[test]
    fn test_object_count_mismatch() {
        let writer = BuildConfig {
            max_loaded_objects: 4,
            ..BuildConfig::default()
        };
        let (state, perm) = fixture(&writer);
        let bytes = marshal_volatile(&state, &perm, &writer).unwrap();
        let reader = BuildConfig::default();
        let err = unmarshal_volatile(
            &bytes,
            &reader,
            &perm.persistent,
            &ShadowState::new(),
            &PcrSelectionList::all(&reader),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MarshalError::ArrayCount {
                name: "s_objects",
                expected: 3,
                found: 4
            }
        ));
    }
}
