// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::manifest::CompareOp;
use std::io::Error as IoError;
use thiserror::Error;

pub const TPM_RC_BAD_TAG: u32 = 0x01E;
pub const TPM_RC_VALUE: u32 = 0x084;
pub const TPM_RC_HANDLE: u32 = 0x08B;
pub const TPM_RC_SIZE: u32 = 0x095;
pub const TPM_RC_INTEGRITY: u32 = 0x09F;
pub const TPM_RC_BAD_PARAMETER: u32 = 0x0AE;
pub const TPM_RC_BAD_VERSION: u32 = 0x0AF;

/// Coarse classification of a decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Size,
    BadTag,
    BadVersion,
    BadParameter,
    Integrity,
    Handle,
    Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error("offset {offset}: need {needed} bytes, {remaining} remaining")]
    Size {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("{name}: size {size} exceeds maximum {max}")]
    TooLarge {
        name: &'static str,
        size: usize,
        max: usize,
    },

    #[error("{name}: non-matching array size; expected {expected}, got {found}")]
    ArraySize {
        name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{name}: bad array size; expected {expected}, got {found}")]
    ArrayCount {
        name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{region}: insufficient space at offset {offset}; source had {source_size} bytes, we have {capacity} bytes")]
    Overflow {
        region: &'static str,
        offset: usize,
        source_size: u64,
        capacity: usize,
    },

    #[error("bad magic: expected {expected:#010x}, got {found:#010x}")]
    BadTag { expected: u32, found: u32 },

    #[error("{magic:#010x}: minimum version {min_version} exceeds supported version {supported}")]
    BadVersion {
        magic: u32,
        min_version: u16,
        supported: u16,
    },

    #[error("unsupported manifest version {found}, supporting up to {supported}")]
    ManifestVersion { found: u16, supported: u16 },

    #[error("{name}: seed compatibility level {found} exceeds {last}")]
    CompatLevel {
        name: &'static str,
        found: u8,
        last: u8,
    },

    #[error("{name} needs missing {field}")]
    MissingBlock {
        name: &'static str,
        field: &'static str,
    },

    #[error("unexpected value for {name}; its value {value} is not {op} {constant} (version: {version})")]
    Constant {
        name: &'static str,
        value: u32,
        op: CompareOp,
        constant: u32,
        version: u16,
    },

    #[error("{0}")]
    BadParameter(String),

    #[error("integrity digest mismatch")]
    Integrity,

    #[error("unknown handle type: {0:#010x}")]
    Handle(u32),

    #[error("{0}")]
    Value(String),

    #[error("optional block nesting: {0}")]
    BlockNesting(&'static str),
}

impl MarshalError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Size { .. }
            | Self::TooLarge { .. }
            | Self::ArraySize { .. }
            | Self::Overflow { .. } => ErrorKind::Size,
            Self::BadTag { .. } => ErrorKind::BadTag,
            Self::BadVersion { .. } | Self::ManifestVersion { .. } | Self::CompatLevel { .. } => {
                ErrorKind::BadVersion
            }
            Self::ArrayCount { .. }
            | Self::MissingBlock { .. }
            | Self::Constant { .. }
            | Self::BadParameter(_)
            | Self::BlockNesting(_) => ErrorKind::BadParameter,
            Self::Integrity => ErrorKind::Integrity,
            Self::Handle(_) => ErrorKind::Handle,
            Self::Value(_) => ErrorKind::Value,
        }
    }

    /// Maps the error to the response code the command engine reports.
    #[must_use]
    pub fn to_tpm_rc(&self) -> u32 {
        match self.kind() {
            ErrorKind::Size => TPM_RC_SIZE,
            ErrorKind::BadTag => TPM_RC_BAD_TAG,
            ErrorKind::BadVersion => TPM_RC_BAD_VERSION,
            ErrorKind::BadParameter => TPM_RC_BAD_PARAMETER,
            ErrorKind::Integrity => TPM_RC_INTEGRITY,
            ErrorKind::Handle => TPM_RC_HANDLE,
            ErrorKind::Value => TPM_RC_VALUE,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("'{0}': not found")]
    NotFound(String),

    #[error("'{0}': {1}")]
    File(String, #[source] IoError),

    #[error("invalid blob name: {0}")]
    InvalidName(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("marshal: {0}")]
    Marshal(#[from] MarshalError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("TPM is in failure mode: {0}")]
    FailureMode(String),

    #[error("volatile state requires loaded permanent state")]
    NotLoaded,
}
