// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Loaded and persistent objects.
//!
//! The public and sensitive areas are carried as opaque TPM2B buffers. The
//! slot attributes decide whether a slot holds a key object or a hash
//! sequence.

use super::{
    read_array_size, read_seed_compat_level, write_seed_compat_level, NvMarshal,
    DIGEST_SIZE_MAX, HASH_BLOCK_SIZE_MAX, NAME_SIZE_MAX, OPAQUE_AREA_MAX,
    SEED_COMPAT_LEVEL_ORIGINAL, TPM_ALG_NULL,
};
use crate::{
    block::NvHeader,
    codec::{StateReader, StateWriter},
    config::BuildConfig,
    error::MarshalError,
    marshal::{count_u16, hash::HashState},
};
use log::error;

pub const BN_PRIME_T_MAGIC: u32 = 0x2fe7_36ab;
pub const PRIVATE_EXPONENT_T_MAGIC: u32 = 0x0854_eab2;
pub const HASH_OBJECT_MAGIC: u32 = 0xb874_fe38;
pub const HASH_OBJECT_VERSION: u16 = 3;
pub const OBJECT_MAGIC: u32 = 0x75be_73af;
pub const OBJECT_VERSION: u16 = 3;
pub const ANY_OBJECT_MAGIC: u32 = 0xfe9a_3974;
const VERSION_2: u16 = 2;

/// Half of the largest supported RSA modulus.
pub const PRIME_SIZE_MAX: usize = 256;

pub const ATTR_HMAC_SEQ: u32 = 1 << 8;
pub const ATTR_HASH_SEQ: u32 = 1 << 9;
pub const ATTR_EVENT_SEQ: u32 = 1 << 10;
pub const ATTR_OCCUPIED: u32 = 1 << 16;

/// A CRT component of an RSA private key, as big-endian 32-bit words.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BnPrime {
    pub words: Vec<u32>,
}

impl BnPrime {
    fn marshal(&self, w: &mut StateWriter) -> Result<(), MarshalError> {
        let numbytes = self.words.len() * 4;
        if numbytes > PRIME_SIZE_MAX {
            return Err(MarshalError::TooLarge {
                name: "BN_PRIME_T",
                size: numbytes,
                max: PRIME_SIZE_MAX,
            });
        }
        NvHeader::write(w, VERSION_2, BN_PRIME_T_MAGIC, 1);
        w.write_u16(count_u16("BN_PRIME_T", numbytes)?);
        for word in &self.words {
            w.write_u32(*word);
        }
        w.write_future_block()
    }

    fn unmarshal(r: &mut StateReader<'_>) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, VERSION_2, BN_PRIME_T_MAGIC)?;
        let numbytes = usize::from(r.read_u16()?);
        if numbytes > PRIME_SIZE_MAX {
            error!("bn_prime_t: Require size larger {numbytes} than allocated {PRIME_SIZE_MAX}");
            return Err(MarshalError::TooLarge {
                name: "BN_PRIME_T",
                size: numbytes,
                max: PRIME_SIZE_MAX,
            });
        }
        let words = (0..numbytes.div_ceil(4))
            .map(|_| r.read_u32())
            .collect::<Result<Vec<_>, _>>()?;
        r.read_future_block(&hdr, "BN_PRIME_T", "version 3 or later")?;
        Ok(Self { words })
    }
}

/// CRT form of an RSA private exponent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivateExponent {
    pub q: BnPrime,
    pub dp: BnPrime,
    pub dq: BnPrime,
    pub q_inv: BnPrime,
}

impl PrivateExponent {
    fn marshal(&self, w: &mut StateWriter) -> Result<(), MarshalError> {
        NvHeader::write(w, VERSION_2, PRIVATE_EXPONENT_T_MAGIC, 1);
        for prime in [&self.q, &self.dp, &self.dq, &self.q_inv] {
            prime.marshal(w)?;
        }
        w.write_future_block()
    }

    fn unmarshal(r: &mut StateReader<'_>) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, VERSION_2, PRIVATE_EXPONENT_T_MAGIC)?;
        let exponent = Self {
            q: BnPrime::unmarshal(r)?,
            dp: BnPrime::unmarshal(r)?,
            dq: BnPrime::unmarshal(r)?,
            q_inv: BnPrime::unmarshal(r)?,
        };
        r.read_future_block(&hdr, "PRIVATE_EXPONENT_T", "version 3 or later")?;
        Ok(exponent)
    }
}

/// A key or data object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub public_area: Vec<u8>,
    pub sensitive: Vec<u8>,
    pub private_exponent: PrivateExponent,
    pub qualified_name: Vec<u8>,
    pub evict_handle: u32,
    pub name: Vec<u8>,
    pub seed_compat_level: u8,
}

impl Default for Object {
    fn default() -> Self {
        Self {
            public_area: Vec::new(),
            sensitive: Vec::new(),
            private_exponent: PrivateExponent::default(),
            qualified_name: Vec::new(),
            evict_handle: 0,
            name: Vec::new(),
            seed_compat_level: SEED_COMPAT_LEVEL_ORIGINAL,
        }
    }
}

impl NvMarshal for Object {
    fn marshal(&self, w: &mut StateWriter, config: &BuildConfig) -> Result<(), MarshalError> {
        NvHeader::write(w, OBJECT_VERSION, OBJECT_MAGIC, 3);
        w.write_tpm2b(&self.public_area, OPAQUE_AREA_MAX)?;
        w.write_tpm2b(&self.sensitive, OPAQUE_AREA_MAX)?;

        w.push_block(config.alg_rsa)?;
        if config.alg_rsa {
            self.private_exponent.marshal(w)?;
        }
        w.pop_block()?;

        w.write_tpm2b(&self.qualified_name, NAME_SIZE_MAX)?;
        w.write_u32(self.evict_handle);
        w.write_tpm2b(&self.name, NAME_SIZE_MAX)?;

        w.push_block(true)?;
        write_seed_compat_level(w, self.seed_compat_level);
        w.write_future_block()?;
        w.pop_block()
    }

    fn unmarshal(r: &mut StateReader<'_>, config: &BuildConfig) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, OBJECT_VERSION, OBJECT_MAGIC)?;
        let public_area = r.read_tpm2b(OPAQUE_AREA_MAX)?;
        let sensitive = r.read_tpm2b(OPAQUE_AREA_MAX)?;

        let private_exponent = if r
            .read_block(config.alg_rsa, "OBJECT", "privateExponent")?
            .is_present()
        {
            PrivateExponent::unmarshal(r)?
        } else {
            PrivateExponent::default()
        };

        let qualified_name = r.read_tpm2b(NAME_SIZE_MAX)?;
        let evict_handle = r.read_u32()?;
        let name = r.read_tpm2b(NAME_SIZE_MAX)?;

        let mut seed_compat_level = SEED_COMPAT_LEVEL_ORIGINAL;
        if hdr.version >= 2
            && r
                .read_block(hdr.version >= 3, "OBJECT", "version 3 or later")?
                .is_present()
        {
            seed_compat_level = read_seed_compat_level(r, "OBJECT seedCompatLevel")?;
            r.read_block(false, "OBJECT", "version 4 or later")?;
        }

        Ok(Self {
            public_area,
            sensitive,
            private_exponent,
            qualified_name,
            evict_handle,
            name,
            seed_compat_level,
        })
    }
}

/// State of a hash, HMAC or event sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceState {
    None,
    Hash(Vec<HashState>),
    Hmac { state: HashState, key: Vec<u8> },
}

/// An object slot used by a running sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashObject {
    pub object_type: u16,
    pub name_alg: u16,
    pub object_attributes: u32,
    pub auth: Vec<u8>,
    pub state: SequenceState,
}

impl Default for HashObject {
    fn default() -> Self {
        Self {
            object_type: TPM_ALG_NULL,
            name_alg: TPM_ALG_NULL,
            object_attributes: 0,
            auth: Vec::new(),
            state: SequenceState::None,
        }
    }
}

impl HashObject {
    /// Encodes a sequence object whose slot carries `attributes`.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if the sequence state does not match the
    /// slot's sequence bits, `ArraySize` if the number of hash states differs
    /// from the implemented hash count and `TooLarge` if the auth value or
    /// HMAC key exceeds its capacity.
    pub fn marshal(
        &self,
        w: &mut StateWriter,
        config: &BuildConfig,
        attributes: u32,
    ) -> Result<(), MarshalError> {
        let hash_seq = attributes & (ATTR_HASH_SEQ | ATTR_EVENT_SEQ) != 0;
        let hmac_seq = !hash_seq && attributes & ATTR_HMAC_SEQ != 0;
        match &self.state {
            SequenceState::Hash(states) if hash_seq => {
                if states.len() != config.hash_count() {
                    error!(
                        "HASH_OBJECT: {} hash states, {} implemented",
                        states.len(),
                        config.hash_count()
                    );
                    return Err(MarshalError::ArraySize {
                        name: "HASH_OBJECT hashState",
                        expected: config.hash_count(),
                        found: states.len(),
                    });
                }
            }
            SequenceState::Hmac { .. } if hmac_seq => {}
            SequenceState::None if !hash_seq && !hmac_seq => {}
            _ => {
                return Err(MarshalError::BadParameter(format!(
                    "HASH_OBJECT: sequence state does not match attributes {attributes:#010x}"
                )))
            }
        }

        NvHeader::write(w, HASH_OBJECT_VERSION, HASH_OBJECT_MAGIC, 1);
        w.write_u16(self.object_type);
        w.write_u16(self.name_alg);
        w.write_u32(self.object_attributes);
        w.write_tpm2b(&self.auth, DIGEST_SIZE_MAX)?;
        match &self.state {
            SequenceState::Hash(states) => {
                w.write_u16(count_u16("HASH_OBJECT hashState", states.len())?);
                for state in states {
                    state.marshal(w)?;
                }
            }
            SequenceState::Hmac { state, key } => {
                state.marshal(w)?;
                w.write_tpm2b(key, HASH_BLOCK_SIZE_MAX)?;
            }
            SequenceState::None => {}
        }
        w.write_future_block()
    }

    /// Decodes a sequence object whose slot carries `attributes`.
    ///
    /// # Errors
    ///
    /// Returns `ArraySize` if the number of hash states differs from the
    /// implemented hash count.
    pub fn unmarshal(
        r: &mut StateReader<'_>,
        config: &BuildConfig,
        attributes: u32,
    ) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, HASH_OBJECT_VERSION, HASH_OBJECT_MAGIC)?;
        let object_type = r.read_u16()?;
        let name_alg = r.read_u16()?;
        let object_attributes = r.read_u32()?;
        let auth = r.read_tpm2b(DIGEST_SIZE_MAX)?;

        // eventSeq states were only written from version 3 on
        let state = if attributes & ATTR_HASH_SEQ != 0
            || (attributes & ATTR_EVENT_SEQ != 0 && hdr.version >= 3)
        {
            read_array_size(r, "HASH_OBJECT hashState", config.hash_count())?;
            let states = (0..config.hash_count())
                .map(|_| HashState::unmarshal(r))
                .collect::<Result<Vec<_>, _>>()?;
            SequenceState::Hash(states)
        } else if attributes & ATTR_HMAC_SEQ != 0 {
            let state = HashState::unmarshal(r)?;
            let key = r.read_tpm2b(HASH_BLOCK_SIZE_MAX)?;
            SequenceState::Hmac { state, key }
        } else {
            SequenceState::None
        };

        r.read_future_block(&hdr, "HASH_OBJECT", "version 3 or later")?;
        Ok(Self {
            object_type,
            name_alg,
            object_attributes,
            auth,
            state,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectBody {
    Empty,
    Key(Box<Object>),
    Sequence(Box<HashObject>),
}

/// An object slot: its attributes and, when occupied, its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnyObject {
    pub attributes: u32,
    pub body: ObjectBody,
}

impl Default for AnyObject {
    fn default() -> Self {
        Self {
            attributes: 0,
            body: ObjectBody::Empty,
        }
    }
}

impl AnyObject {
    #[must_use]
    pub fn is_occupied(&self) -> bool {
        self.attributes & ATTR_OCCUPIED != 0
    }

    #[must_use]
    pub fn is_sequence(&self) -> bool {
        self.attributes & (ATTR_HMAC_SEQ | ATTR_HASH_SEQ | ATTR_EVENT_SEQ) != 0
    }
}

impl NvMarshal for AnyObject {
    fn marshal(&self, w: &mut StateWriter, config: &BuildConfig) -> Result<(), MarshalError> {
        NvHeader::write(w, VERSION_2, ANY_OBJECT_MAGIC, 1);
        w.write_u32(self.attributes);
        if self.is_occupied() {
            match &self.body {
                ObjectBody::Sequence(seq) if self.is_sequence() => {
                    seq.marshal(w, config, self.attributes)?;
                }
                ObjectBody::Key(object) if !self.is_sequence() => {
                    object.marshal(w, config)?;
                }
                _ => {
                    return Err(MarshalError::BadParameter(
                        "ANY_OBJECT: body does not match slot attributes".into(),
                    ))
                }
            }
        }
        w.write_future_block()
    }

    fn unmarshal(r: &mut StateReader<'_>, config: &BuildConfig) -> Result<Self, MarshalError> {
        let hdr = NvHeader::read(r, VERSION_2, ANY_OBJECT_MAGIC)?;
        let mut slot = Self {
            attributes: r.read_u32()?,
            body: ObjectBody::Empty,
        };
        if slot.is_occupied() {
            slot.body = if slot.is_sequence() {
                let seq = HashObject::unmarshal(r, config, slot.attributes)?;
                ObjectBody::Sequence(Box::new(seq))
            } else {
                ObjectBody::Key(Box::new(Object::unmarshal(r, config)?))
            };
        }
        r.read_future_block(&hdr, "ANY_OBJECT", "version 3 or later")?;
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::hash::AnyHashState;
    use tpm2_protocol::data::TpmAlgId;

    fn encode(slot: &AnyObject, config: &BuildConfig) -> Vec<u8> {
        let mut w = StateWriter::new();
        slot.marshal(&mut w, config).unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn test_key_object_roundtrip() {
        let config = BuildConfig::default();
        let slot = AnyObject {
            attributes: ATTR_OCCUPIED,
            body: ObjectBody::Key(Box::new(Object {
                public_area: vec![0x00, 0x01, 0x00, 0x0b],
                private_exponent: PrivateExponent {
                    q: BnPrime {
                        words: vec![0xdead_beef, 1],
                    },
                    ..PrivateExponent::default()
                },
                evict_handle: 0x8100_0001,
                name: vec![0x00, 0x0b, 0xaa],
                seed_compat_level: 1,
                ..Object::default()
            })),
        };
        let bytes = encode(&slot, &config);
        let out = AnyObject::unmarshal(&mut StateReader::new(&bytes), &config).unwrap();
        assert_eq!(out, slot);
    }

    #[test]
    fn test_rsa_block_skipped_without_rsa() {
        let config = BuildConfig::default();
        let slot = AnyObject {
            attributes: ATTR_OCCUPIED,
            body: ObjectBody::Key(Box::default()),
        };
        let bytes = encode(&slot, &config);
        let reader_config = BuildConfig {
            alg_rsa: false,
            ..BuildConfig::default()
        };
        let out = AnyObject::unmarshal(&mut StateReader::new(&bytes), &reader_config).unwrap();
        assert_eq!(out, slot);
    }

    #[test]
    fn test_hash_sequence_state_count() {
        let config = BuildConfig::default();
        let states = config
            .pcr_banks
            .iter()
            .map(|alg| HashState {
                state_type: 1,
                state: AnyHashState::new(*alg),
            })
            .collect();
        let slot = AnyObject {
            attributes: ATTR_OCCUPIED | ATTR_HASH_SEQ,
            body: ObjectBody::Sequence(Box::new(HashObject {
                state: SequenceState::Hash(states),
                ..HashObject::default()
            })),
        };
        let bytes = encode(&slot, &config);
        assert_eq!(
            AnyObject::unmarshal(&mut StateReader::new(&bytes), &config).unwrap(),
            slot
        );

        let smaller = BuildConfig {
            pcr_banks: vec![TpmAlgId::Sha256],
            ..BuildConfig::default()
        };
        let err = AnyObject::unmarshal(&mut StateReader::new(&bytes), &smaller).unwrap_err();
        assert!(matches!(err, MarshalError::ArraySize { .. }));
    }

    #[test]
    fn test_sequence_layout_checked_on_encode() {
        let config = BuildConfig::default();
        let hmac_with_hash_states = AnyObject {
            attributes: ATTR_OCCUPIED | ATTR_HMAC_SEQ,
            body: ObjectBody::Sequence(Box::new(HashObject {
                state: SequenceState::Hash(Vec::new()),
                ..HashObject::default()
            })),
        };
        let mut w = StateWriter::new();
        assert!(matches!(
            hmac_with_hash_states.marshal(&mut w, &config),
            Err(MarshalError::BadParameter(_))
        ));

        let hash_without_state = AnyObject {
            attributes: ATTR_OCCUPIED | ATTR_EVENT_SEQ,
            body: ObjectBody::Sequence(Box::default()),
        };
        assert!(matches!(
            hash_without_state.marshal(&mut StateWriter::new(), &config),
            Err(MarshalError::BadParameter(_))
        ));

        let one_state = AnyObject {
            attributes: ATTR_OCCUPIED | ATTR_HASH_SEQ,
            body: ObjectBody::Sequence(Box::new(HashObject {
                state: SequenceState::Hash(vec![HashState {
                    state_type: 1,
                    state: AnyHashState::new(TpmAlgId::Sha256),
                }]),
                ..HashObject::default()
            })),
        };
        assert_eq!(
            one_state.marshal(&mut StateWriter::new(), &config),
            Err(MarshalError::ArraySize {
                name: "HASH_OBJECT hashState",
                expected: config.hash_count(),
                found: 1,
            })
        );
    }

    #[test]
    fn test_hmac_sequence_roundtrip() {
        let config = BuildConfig::default();
        let slot = AnyObject {
            attributes: ATTR_OCCUPIED | ATTR_HMAC_SEQ,
            body: ObjectBody::Sequence(Box::new(HashObject {
                state: SequenceState::Hmac {
                    state: HashState {
                        state_type: 2,
                        state: AnyHashState::new(TpmAlgId::Sha256),
                    },
                    key: vec![0x6b; 64],
                },
                ..HashObject::default()
            })),
        };
        let bytes = encode(&slot, &config);
        assert_eq!(
            AnyObject::unmarshal(&mut StateReader::new(&bytes), &config).unwrap(),
            slot
        );
    }

    #[test]
    fn test_oversized_prime_rejected_on_encode() {
        let prime = BnPrime {
            words: vec![7; PRIME_SIZE_MAX / 4 + 1],
        };
        let mut w = StateWriter::new();
        assert_eq!(
            prime.marshal(&mut w),
            Err(MarshalError::TooLarge {
                name: "BN_PRIME_T",
                size: 260,
                max: PRIME_SIZE_MAX,
            })
        );
        assert!(w.finish().unwrap().is_empty());

        let largest = BnPrime {
            words: vec![7; PRIME_SIZE_MAX / 4],
        };
        let mut w = StateWriter::new();
        largest.marshal(&mut w).unwrap();
        let bytes = w.finish().unwrap();
        assert_eq!(BnPrime::unmarshal(&mut StateReader::new(&bytes)).unwrap(), largest);
    }

    #[test]
    fn test_unoccupied_slot_has_no_body() {
        let config = BuildConfig::default();
        let bytes = encode(&AnyObject::default(), &config);
        assert_eq!(bytes.len(), 8 + 4 + 3);
    }
}
