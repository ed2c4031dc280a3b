//! JSON snapshots of the whole chain state.

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::contracts::MeetupState;
use crate::ledger::{AccountId, Ledger};
use crate::runtime::ChainMeta;

pub const SNAPSHOT_VERSION: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot state_root mismatch: recorded {expected}, computed {actual}")]
    RootMismatch { expected: String, actual: String },
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u8),
    #[error("snapshot belongs to contract {found}, expected {expected}")]
    ContractMismatch { expected: String, found: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub version: u8,
    pub contract_address: String,
    pub meta: ChainMeta,
    pub ledger: Ledger,
    pub nonces: BTreeMap<AccountId, u64>,
    pub contract: Option<MeetupState>,
    /// Hex SHA-256 merkle root over balances and meetings.
    pub state_root: String,
}

/// Written to a sibling `.tmp` file, then renamed over `path`.
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(snapshot)?)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// `Ok(None)` when no snapshot has been written yet.
pub fn load(path: &Path) -> Result<Option<Snapshot>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "snapshot".into());
    name.push(".tmp");
    path.with_file_name(name)
}
