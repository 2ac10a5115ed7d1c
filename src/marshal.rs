// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Encoders and decoders of the persisted TPM structures.
//!
//! Every structure starts with an [`NvHeader`](crate::block::NvHeader) and
//! ends with an optional block reserved for fields of later versions.

pub mod drbg;
pub mod hash;
pub mod nv;
pub mod object;
pub mod orderly;
pub mod pcr;
pub mod persistent;
pub mod session;
pub mod state;

use crate::{
    codec::{StateReader, StateWriter},
    config::BuildConfig,
    error::MarshalError,
};
use log::error;
use tpm2_protocol::data::TpmAlgId;

/// Capacity of digest, auth and nonce buffers.
pub const DIGEST_SIZE_MAX: usize = 64;
/// Capacity of a name: an algorithm identifier and a digest.
pub const NAME_SIZE_MAX: usize = DIGEST_SIZE_MAX + 2;
/// Capacity of a hash block, used for HMAC keys.
pub const HASH_BLOCK_SIZE_MAX: usize = 128;
/// Capacity of the opaque public and sensitive areas of an object.
pub const OPAQUE_AREA_MAX: usize = 2048;

pub const TPM_ALG_NULL: u16 = 0x0010;

pub const SEED_COMPAT_LEVEL_ORIGINAL: u8 = 0;
pub const SEED_COMPAT_LEVEL_LAST: u8 = 1;

/// Width in bytes of the persisted clock values.
pub const CLOCK_SIZE: u8 = 8;

/// Hash algorithms that can carry persisted state.
pub const HASH_ALGS: [TpmAlgId; 4] = [
    TpmAlgId::Sha1,
    TpmAlgId::Sha256,
    TpmAlgId::Sha384,
    TpmAlgId::Sha512,
];

/// A structure with a configuration-dependent persisted layout.
pub trait NvMarshal: Sized {
    /// Appends the encoding of `self`.
    ///
    /// # Errors
    ///
    /// Returns a `MarshalError` if a field does not fit its persisted width.
    fn marshal(&self, w: &mut StateWriter, config: &BuildConfig) -> Result<(), MarshalError>;

    /// Decodes a value.
    ///
    /// # Errors
    ///
    /// Returns a `MarshalError` if the stream is truncated or inconsistent
    /// with `config`.
    fn unmarshal(r: &mut StateReader<'_>, config: &BuildConfig) -> Result<Self, MarshalError>;
}

/// Maps an algorithm identifier to a known hash algorithm.
#[must_use]
pub fn hash_alg(id: u16) -> Option<TpmAlgId> {
    HASH_ALGS.iter().copied().find(|alg| *alg as u16 == id)
}

/// Returns the digest size of a hash algorithm.
///
/// # Errors
///
/// Returns `BadParameter` if `alg` is not a hash algorithm.
pub fn digest_size(alg: TpmAlgId) -> Result<usize, MarshalError> {
    tpm2_protocol::tpm_hash_size(&alg)
        .ok_or_else(|| MarshalError::BadParameter(format!("not a hash algorithm: {alg:?}")))
}

/// Copies the overlapping prefix of `src` into `dst` and zeroes the rest.
///
/// Returns the number of bytes copied.
pub fn copy_growable(dst: &mut [u8], src: &[u8]) -> usize {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
    dst[n..].fill(0);
    n
}

/// Converts an in-memory length into a `u16` count.
///
/// # Errors
///
/// Returns `TooLarge` if the length does not fit.
pub fn count_u16(name: &'static str, len: usize) -> Result<u16, MarshalError> {
    u16::try_from(len).map_err(|_| MarshalError::TooLarge {
        name,
        size: len,
        max: usize::from(u16::MAX),
    })
}

/// Reads a `u16` element count that must match exactly, failing with a size
/// error.
///
/// # Errors
///
/// Returns `ArraySize` on mismatch.
pub fn read_array_size(
    r: &mut StateReader<'_>,
    name: &'static str,
    expected: usize,
) -> Result<(), MarshalError> {
    let found = usize::from(r.read_u16()?);
    if found != expected {
        error!("Non-matching {name} array size. Expected {expected}, got {found}");
        return Err(MarshalError::ArraySize {
            name,
            expected,
            found,
        });
    }
    Ok(())
}

/// Reads a `u16` element count that must match exactly, failing with a
/// parameter error.
///
/// # Errors
///
/// Returns `ArrayCount` on mismatch.
pub fn read_array_count(
    r: &mut StateReader<'_>,
    name: &'static str,
    expected: usize,
) -> Result<(), MarshalError> {
    let found = usize::from(r.read_u16()?);
    if found != expected {
        error!("{name}: Bad array size; expected {expected}, got {found}");
        return Err(MarshalError::ArrayCount {
            name,
            expected,
            found,
        });
    }
    Ok(())
}

/// Reads a fixed-size byte array preceded by its `u16` size.
///
/// # Errors
///
/// Returns `ArrayCount` if the size differs from `N`.
pub fn read_fixed_bytes<const N: usize>(
    r: &mut StateReader<'_>,
    name: &'static str,
) -> Result<[u8; N], MarshalError> {
    read_array_count(r, name, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(r.read_bytes(N)?);
    Ok(out)
}

pub fn write_seed_compat_level(w: &mut StateWriter, level: u8) -> usize {
    w.write_u8(level)
}

/// # Errors
///
/// Returns `CompatLevel` if the level is newer than this build.
pub fn read_seed_compat_level(
    r: &mut StateReader<'_>,
    name: &'static str,
) -> Result<u8, MarshalError> {
    let found = r.read_u8()?;
    if found > SEED_COMPAT_LEVEL_LAST {
        error!("{name}: Unsupported seed compatibility level {found}");
        return Err(MarshalError::CompatLevel {
            name,
            found,
            last: SEED_COMPAT_LEVEL_LAST,
        });
    }
    Ok(found)
}

/// Writes a clock value prefixed by its width.
pub fn write_clock(w: &mut StateWriter, value: u64) -> usize {
    w.write_u8(CLOCK_SIZE) + w.write_u64(value)
}

/// # Errors
///
/// Returns `BadParameter` if the stored width is not 64 bits.
pub fn read_clock(r: &mut StateReader<'_>, name: &'static str) -> Result<u64, MarshalError> {
    let clocksize = r.read_u8()?;
    if clocksize != CLOCK_SIZE {
        error!("{name}: Unexpected clocksize for epoch; Expected {CLOCK_SIZE}, got {clocksize}");
        return Err(MarshalError::BadParameter(format!(
            "{name}: unexpected clock size {clocksize}"
        )));
    }
    r.read_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_growable_truncates() {
        let mut dst = [0xffu8; 3];
        assert_eq!(copy_growable(&mut dst, &[1, 2, 3, 4, 5]), 3);
        assert_eq!(dst, [1, 2, 3]);
    }

    #[test]
    fn test_copy_growable_zero_fills() {
        let mut dst = [0xffu8; 5];
        assert_eq!(copy_growable(&mut dst, &[1, 2]), 2);
        assert_eq!(dst, [1, 2, 0, 0, 0]);
    }

    #[test]
    fn test_hash_alg_lookup() {
        assert_eq!(hash_alg(TpmAlgId::Sha256 as u16), Some(TpmAlgId::Sha256));
        assert_eq!(hash_alg(TPM_ALG_NULL), None);
    }
}
