//! NV indices backing sealed keys, and the on-disk object that refers to them.
//!
//! Every sealed key owns one small "PIN index". TPM NV space is tiny and
//! shared by everything on the machine, so an index must be undefined when
//! the key that owns it is deleted.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::command::{CommandError, Hierarchy, NvPublic, Tpm2Commands};
use super::{auth_fail, Result, TpmConnection, TpmError};

pub const PIN_INDEX_FIRST: u32 = 0x0180_0000;
pub const PIN_INDEX_LAST: u32 = 0x01bf_ffff;
const PIN_INDEX_SIZE: u16 = 8;
/// Handles asked for per capability query when looking for a free index.
const HANDLE_BATCH: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinIndexOwner {
    Owner,
    Platform,
}

impl PinIndexOwner {
    pub fn hierarchy(self) -> Hierarchy {
        match self {
            PinIndexOwner::Owner => Hierarchy::Owner,
            PinIndexOwner::Platform => Hierarchy::Platform,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinIndex {
    pub handle: u32,
    pub owner: PinIndexOwner,
}

fn is_pin_index(handle: u32) -> bool {
    (PIN_INDEX_FIRST..=PIN_INDEX_LAST).contains(&handle)
}

/// First handle in the PIN range nothing is using.
fn free_pin_index<T: Tpm2Commands + ?Sized>(tpm: &mut T) -> Result<u32> {
    let mut candidate = PIN_INDEX_FIRST;
    loop {
        let used = tpm.handles(candidate, HANDLE_BATCH)?;
        for handle in &used {
            match handle.cmp(&candidate) {
                std::cmp::Ordering::Equal => candidate += 1,
                std::cmp::Ordering::Greater => return Ok(candidate),
                std::cmp::Ordering::Less => {}
            }
        }
        if (used.len() as u32) < HANDLE_BATCH || !is_pin_index(candidate) {
            break;
        }
    }
    match is_pin_index(candidate) {
        true => Ok(candidate),
        false => Err(CommandError::ResourceExhausted.into()),
    }
}

/// Defines a PIN index protected by `auth` and initialises it, at `handle` or
/// at the first free handle in the PIN range. `auth` is sent encrypted in the
/// connection's HMAC session.
pub fn define_pin_index<T: Tpm2Commands>(
    conn: &mut TpmConnection<T>,
    handle: Option<u32>,
    owner: PinIndexOwner,
    auth: &[u8],
) -> Result<PinIndex> {
    let handle = match handle {
        Some(handle) if !is_pin_index(handle) => return Err(TpmError::InvalidPinIndex(handle)),
        Some(handle) => handle,
        None => free_pin_index(conn)?,
    };
    let hierarchy = owner.hierarchy();
    let public = NvPublic {
        index: handle,
        size: PIN_INDEX_SIZE,
        hierarchy,
        written: false,
    };
    let session = conn.hmac_session();
    conn.nv_define_space(hierarchy, &public, auth, session)
        .map_err(auth_fail(hierarchy))?;

    if let Err(e) = conn.nv_write(handle, auth, &[0; PIN_INDEX_SIZE as usize], 0) {
        if let Err(e) = conn.nv_undefine_space(hierarchy, handle) {
            log::warn!("Failed to undefine PIN index {:#010x}: {}", handle, e);
        }
        return Err(e.into());
    }

    log::info!("Defined PIN index {:#010x}", handle);
    Ok(PinIndex { handle, owner })
}

pub fn undefine_pin_index<T: Tpm2Commands + ?Sized>(tpm: &mut T, index: &PinIndex) -> Result<()> {
    let hierarchy = index.owner.hierarchy();
    tpm.nv_undefine_space(hierarchy, index.handle)
        .map_err(auth_fail(hierarchy))?;
    log::info!("Undefined PIN index {:#010x}", index.handle);
    Ok(())
}

#[derive(Error, Debug)]
pub enum SealedKeyError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid sealed key object: {0}")]
    Format(#[from] serde_yaml::Error),
    #[error(transparent)]
    Tpm(#[from] TpmError),
}

/// A sealed disk key as stored on disk: the PIN index it owns plus the
/// opaque sealed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKeyObject {
    pub pin_index_handle: u32,
    pub pin_index_owner: PinIndexOwner,
    #[serde(with = "hex_bytes")]
    pub sealed_payload: Vec<u8>,
}

impl SealedKeyObject {
    pub fn new(pin_index: PinIndex, sealed_payload: Vec<u8>) -> Self {
        Self {
            pin_index_handle: pin_index.handle,
            pin_index_owner: pin_index.owner,
            sealed_payload,
        }
    }

    pub fn pin_index(&self) -> PinIndex {
        PinIndex {
            handle: self.pin_index_handle,
            owner: self.pin_index_owner,
        }
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, SealedKeyError> {
        let data = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), SealedKeyError> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(de::Error::custom)
    }
}

/// Deletes the sealed key at `path` and the PIN index it owns.
///
/// The index is undefined first and the file is only removed once that
/// worked. An index that is already gone is fine.
pub fn delete_sealed_key<T: Tpm2Commands + ?Sized>(
    tpm: &mut T,
    path: impl AsRef<Path>,
) -> Result<(), SealedKeyError> {
    let path = path.as_ref();
    let key = SealedKeyObject::read(path)?;

    match undefine_pin_index(tpm, &key.pin_index()) {
        Ok(()) => {}
        Err(TpmError::Command(CommandError::HandleNotFound(handle))) => {
            log::debug!("PIN index {:#010x} was already undefined", handle)
        }
        Err(e) => {
            log::warn!("Keeping {} while its PIN index is defined", path.display());
            return Err(e.into());
        }
    }
    fs::remove_file(path)?;
    Ok(())
}
