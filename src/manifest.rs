// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Compile-constant manifest.
//!
//! The first structure inside the permanent state. It records the build
//! profile of the writer as an ordered list of `u32` values. A reader
//! compares every value against its own profile before trusting anything
//! that follows. Position in the list, not name, identifies an entry, and
//! entries are only ever appended.

use crate::{
    block::NvHeader,
    codec::{StateReader, StateWriter},
    config::BuildConfig,
    error::MarshalError,
};
use log::error;
use std::fmt;
use tpm2_protocol::data::TpmAlgId;

pub const MANIFEST_MAGIC: u32 = 0xc9ea_6431;
pub const MANIFEST_VERSION: u16 = 3;

/// Number of entries written by manifest versions 1 and 2.
pub const MANIFEST_V2_ENTRIES: usize = 88;
/// Number of entries written by manifest version 3.
pub const MANIFEST_V3_ENTRIES: usize = 120;

/// Acceptance policy of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// The stream value must equal the build value.
    Equal,
    /// The stream value must not exceed the build value.
    LessOrEqual,
    /// The stream value must be at least the build value.
    GreaterOrEqual,
    DontCare,
}

impl CompareOp {
    /// Checks a value read from the stream against the build value.
    #[must_use]
    pub fn accepts(self, value: u32, constant: u32) -> bool {
        match self {
            Self::Equal => value == constant,
            Self::LessOrEqual => value <= constant,
            Self::GreaterOrEqual => value >= constant,
            Self::DontCare => true,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Equal => "=",
            Self::LessOrEqual => "<=",
            Self::GreaterOrEqual => ">=",
            Self::DontCare => "*",
        };
        write!(f, "{op}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileConstant {
    pub name: &'static str,
    pub value: u32,
    pub op: CompareOp,
}

/// Returns the number of entries a manifest of `version` carries.
///
/// # Errors
///
/// Returns `ManifestVersion` for versions this build does not know.
pub fn expected_entries(version: u16) -> Result<usize, MarshalError> {
    match version {
        1 | 2 => Ok(MANIFEST_V2_ENTRIES),
        3 => Ok(MANIFEST_V3_ENTRIES),
        _ => Err(MarshalError::ManifestVersion {
            found: version,
            supported: MANIFEST_VERSION,
        }),
    }
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Builds the manifest of `config`.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn compile_constants(config: &BuildConfig) -> Vec<CompileConstant> {
    use CompareOp::{Equal as EQ, LessOrEqual as LE};

    let rsa = u32::from(config.alg_rsa);
    let ecc = u32::from(config.alg_ecc);
    let bank = |alg: TpmAlgId| u32::from(config.has_bank(alg));

    let table: [(&'static str, u32, CompareOp); MANIFEST_V3_ENTRIES] = [
        ("ALG_RSA", rsa, EQ),
        ("ALG_SHA1", bank(TpmAlgId::Sha1), EQ),
        ("ALG_HMAC", 1, EQ),
        ("ALG_TDES", 1, LE),
        ("ALG_AES", 1, EQ),
        ("ALG_MGF1", 1, EQ),
        ("ALG_XOR", 1, EQ),
        ("ALG_KEYEDHASH", 1, EQ),
        ("ALG_SHA256", bank(TpmAlgId::Sha256), EQ),
        ("ALG_SHA384", bank(TpmAlgId::Sha384), EQ),
        ("ALG_SHA512", bank(TpmAlgId::Sha512), EQ),
        ("ALG_SM3_256", 0, EQ),
        ("ALG_SM4", 0, EQ),
        ("ALG_RSASSA", rsa, EQ),
        ("ALG_RSAES", rsa, EQ),
        ("ALG_RSAPSS", rsa, EQ),
        ("ALG_OAEP", rsa, EQ),
        ("ALG_ECC", ecc, EQ),
        ("ALG_ECDH", ecc, EQ),
        ("ALG_ECDSA", ecc, EQ),
        ("ALG_ECDAA", ecc, EQ),
        ("ALG_SM2", 0, LE),
        ("ALG_ECSCHNORR", ecc, EQ),
        ("ALG_ECMQV", ecc, LE),
        ("ALG_SYMCIPHER", 1, EQ),
        ("ALG_KDF1_SP800_56A", 1, EQ),
        ("ALG_KDF2", 0, LE),
        ("ALG_KDF1_SP800_108", 1, EQ),
        ("ALG_CMAC", 1, LE),
        ("ALG_CTR", 1, EQ),
        ("ALG_OFB", 1, EQ),
        ("ALG_CBC", 1, EQ),
        ("ALG_CFB", 1, EQ),
        ("ALG_ECB", 1, EQ),
        ("MAX_RSA_KEY_BITS", 3072 * rsa, LE),
        ("MAX_TDES_KEY_BITS", 192, EQ),
        ("MAX_AES_KEY_BITS", 256, EQ),
        ("MAX_SM4_KEY_BITS", 128, EQ),
        ("MAX_CAMELLIA_KEY_BITS", 128, EQ),
        ("ECC_NIST_P192", 0, LE),
        ("ECC_NIST_P224", 0, LE),
        ("ECC_NIST_P256", ecc, LE),
        ("ECC_NIST_P384", ecc, LE),
        ("ECC_NIST_P521", ecc, LE),
        ("ECC_BN_P256", ecc, LE),
        ("ECC_BN_P638", ecc, LE),
        ("ECC_SM2_P256", ecc, LE),
        ("MAX_ECC_KEY_BITS", 638 * ecc, LE),
        ("HASH_ALIGNMENT", 4, EQ),
        ("SYM_ALIGNMENT", 4, EQ),
        ("IMPLEMENTATION_PCR", to_u32(config.implementation_pcr), EQ),
        ("PLATFORM_PCR", to_u32(config.platform_pcr), EQ),
        ("DRTM_PCR", config.drtm_pcr, EQ),
        ("HCRTM_PCR", config.hcrtm_pcr, EQ),
        ("NUM_LOCALITIES", config.num_localities, EQ),
        ("MAX_HANDLE_NUM", config.max_handle_num, EQ),
        ("MAX_ACTIVE_SESSIONS", to_u32(config.max_active_sessions), EQ),
        ("MAX_LOADED_SESSIONS", to_u32(config.max_loaded_sessions), EQ),
        ("MAX_SESSION_NUM", to_u32(config.max_session_num), EQ),
        ("MAX_LOADED_OBJECTS", to_u32(config.max_loaded_objects), EQ),
        ("MIN_EVICT_OBJECTS", config.min_evict_objects, LE),
        ("NUM_POLICY_PCR_GROUP", to_u32(config.num_policy_pcr_group), EQ),
        ("NUM_AUTHVALUE_PCR_GROUP", to_u32(config.num_authvalue_pcr_group), EQ),
        ("MAX_CONTEXT_SIZE", config.max_context_size, LE),
        ("MAX_DIGEST_BUFFER", 1024, EQ),
        ("MAX_NV_INDEX_SIZE", 2048, EQ),
        ("MAX_NV_BUFFER_SIZE", 1024, EQ),
        ("MAX_CAP_BUFFER", 1024, EQ),
        ("NV_MEMORY_SIZE", config.nv_memory_size, LE),
        ("MIN_COUNTER_INDICES", 8, EQ),
        ("NUM_STATIC_PCR", to_u32(config.num_static_pcr), EQ),
        ("MAX_ALG_LIST_SIZE", 64, EQ),
        ("PRIMARY_SEED_SIZE", to_u32(config.primary_seed_size), EQ),
        ("CONTEXT_ENCRYPT_ALGORITHM", u32::from(TpmAlgId::Aes as u16), EQ),
        ("NV_CLOCK_UPDATE_INTERVAL", 22, EQ),
        ("NUM_POLICY_PCR", 1, EQ),
        ("ORDERLY_BITS", 3, EQ),
        ("MAX_SYM_DATA", 128, EQ),
        ("MAX_RNG_ENTROPY_SIZE", 64, EQ),
        ("RAM_INDEX_SPACE", to_u32(config.ram_index_space), EQ),
        ("RSA_DEFAULT_PUBLIC_EXPONENT", 0x0001_0001, EQ),
        ("ENABLE_PCR_NO_INCREMENT", 1, EQ),
        ("CRT_FORMAT_RSA", 1, EQ),
        ("VENDOR_COMMAND_COUNT", 0, EQ),
        ("MAX_VENDOR_BUFFER_SIZE", 1024, EQ),
        ("TPM_MAX_DERIVATION_BITS", 8192, EQ),
        ("PROOF_SIZE", to_u32(config.proof_size), EQ),
        ("HASH_COUNT", to_u32(config.hash_count()), EQ),
        ("AES_128", 1, LE),
        ("AES_192", 0, LE),
        ("AES_256", 1, LE),
        ("SM4_128", 0, LE),
        ("ALG_CAMELLIA", 1, LE),
        ("CAMELLIA_128", 1, LE),
        ("CAMELLIA_192", 0, LE),
        ("CAMELLIA_256", 1, LE),
        ("ALG_SHA3_256", 0, LE),
        ("ALG_SHA3_384", 0, LE),
        ("ALG_SHA3_512", 0, LE),
        ("RSA_1024", rsa, LE),
        ("RSA_2048", rsa, LE),
        ("RSA_3072", rsa, LE),
        ("RSA_4096", 0, LE),
        ("RSA_16384", 0, LE),
        ("RH_ACT_0", 0, LE),
        ("RH_ACT_1", 0, LE),
        ("RH_ACT_2", 0, LE),
        ("RH_ACT_3", 0, LE),
        ("RH_ACT_4", 0, LE),
        ("RH_ACT_5", 0, LE),
        ("RH_ACT_6", 0, LE),
        ("RH_ACT_7", 0, LE),
        ("RH_ACT_8", 0, LE),
        ("RH_ACT_9", 0, LE),
        ("RH_ACT_A", 0, LE),
        ("RH_ACT_B", 0, LE),
        ("RH_ACT_C", 0, LE),
        ("RH_ACT_D", 0, LE),
        ("RH_ACT_E", 0, LE),
        ("RH_ACT_F", 0, LE),
    ];

    table
        .into_iter()
        .map(|(name, value, op)| CompileConstant { name, value, op })
        .collect()
}

/// Writes the manifest of `config`.
///
/// # Errors
///
/// Returns `BlockNesting` if the trailing block cannot be opened.
pub fn write_manifest(w: &mut StateWriter, config: &BuildConfig) -> Result<(), MarshalError> {
    let table = compile_constants(config);
    NvHeader::write(w, MANIFEST_VERSION, MANIFEST_MAGIC, 1);
    w.write_u32(to_u32(table.len()));
    for entry in &table {
        w.write_u32(entry.value);
    }
    w.write_future_block()
}

/// Reads a manifest and checks it against `config`.
///
/// A stream whose entry count does not match its manifest version is
/// rejected.
///
/// # Errors
///
/// Returns `ManifestVersion` for an unknown manifest version, `ArrayCount`
/// for a count mismatch, and `Constant` for the first entry that fails its
/// policy.
pub fn read_manifest(r: &mut StateReader<'_>, config: &BuildConfig) -> Result<(), MarshalError> {
    let hdr = NvHeader::read(r, MANIFEST_VERSION, MANIFEST_MAGIC)?;
    let expected = expected_entries(hdr.version).inspect_err(|_| {
        error!(
            "Unsupported PA_COMPILE_CONSTANTS version {}. Supporting up to version {MANIFEST_VERSION}",
            hdr.version
        );
    })?;
    let found = r.read_u32()? as usize;
    if found != expected {
        error!(
            "PA_COMPILE_CONSTANTS v{} has non-matching number of elements; found {found}, expected {expected}",
            hdr.version
        );
        return Err(MarshalError::ArrayCount {
            name: "PA_COMPILE_CONSTANTS",
            expected,
            found,
        });
    }
    let table = compile_constants(config);
    for entry in table.iter().take(expected) {
        let value = r.read_u32()?;
        if !entry.op.accepts(value, entry.value) {
            let err = MarshalError::Constant {
                name: entry.name,
                value,
                op: entry.op,
                constant: entry.value,
                version: hdr.version,
            };
            error!("{err}");
            return Err(err);
        }
    }
    r.read_future_block(&hdr, "PA_COMPILE_CONSTANTS", "version 4 or later")
}
