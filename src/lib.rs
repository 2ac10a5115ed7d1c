// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Versioned persistence of software TPM state.
//!
//! The crate encodes the permanent, volatile and save-state blobs of a TPM
//! instance. Every structure carries a version and a magic, and optional
//! blocks let a build skip fields written by a newer one. A manifest of
//! build constants is stored with the permanent state so that an
//! incompatible build refuses it.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]

pub mod arena;
pub mod block;
pub mod codec;
pub mod config;
pub mod context;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod marshal;
pub mod shadow;
pub mod snapshot;
pub mod store;

pub use crate::{
    config::BuildConfig,
    context::{FailureInfo, PowerOnState, TpmInstanceContext},
    engine::TpmEngine,
    error::{ErrorKind, MarshalError, StateError, StoreError},
};
