// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::error::MarshalError;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tpm2_protocol::data::TpmAlgId;

/// Computes digests for the integrity checks of saved state.
pub trait HashProvider {
    /// Returns the digest of `data`.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if `alg` is not supported.
    fn hash(&self, alg: TpmAlgId, data: &[u8]) -> Result<Vec<u8>, MarshalError>;
}

/// Hash provider backed by the RustCrypto hashes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareHash;

impl HashProvider for SoftwareHash {
    fn hash(&self, alg: TpmAlgId, data: &[u8]) -> Result<Vec<u8>, MarshalError> {
        macro_rules! do_hash {
            ($digest:ty) => {{
                Ok(<$digest as Digest>::digest(data).to_vec())
            }};
        }

        match alg {
            TpmAlgId::Sha1 => do_hash!(Sha1),
            TpmAlgId::Sha256 => do_hash!(Sha256),
            TpmAlgId::Sha384 => do_hash!(Sha384),
            TpmAlgId::Sha512 => do_hash!(Sha512),
            _ => Err(MarshalError::BadParameter(format!(
                "unsupported hash algorithm: {alg:?}"
            ))),
        }
    }
}
