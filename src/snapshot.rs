// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Top-level state blobs.
//!
//! A permanent blob is required for the instance to come up. Volatile and
//! save-state blobs are optional and a failure to decode them only drops
//! the restore.

pub mod permanent;
pub mod save;
pub mod volatile;

pub use permanent::{marshal_permanent, unmarshal_permanent, PermanentState};
pub use save::{marshal_save_state, unmarshal_save_state, HandleKind, SaveState};
pub use volatile::{marshal_volatile, unmarshal_volatile, VolatileRestore, VolatileState};

use crate::{codec::StateReader, error::MarshalError};
use log::error;

/// Reads the plain magic that ends a top-level blob.
fn read_trailing_magic(
    r: &mut StateReader<'_>,
    name: &'static str,
    magic: u32,
) -> Result<(), MarshalError> {
    let found = r.read_u32()?;
    if found != magic {
        error!("{name}: Invalid magic at end. Expected {magic:#010x}, got {found:#010x}");
        return Err(MarshalError::BadTag {
            expected: magic,
            found,
        });
    }
    Ok(())
}
