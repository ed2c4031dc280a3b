//! Defaults and resolved settings for the node and the client.

use std::{path::PathBuf, time::Duration};

use crate::ledger::{AccountId, Amount};

pub const DEFAULT_NODE_ADDR: &str = "127.0.0.1:3013";
pub const DEFAULT_CONTRACT: &str = "ct_22kwNCS9VmzRCcmjCU5189w42uKNerd5Fh9JGLFxsP8svCDUbF";
pub const DEFAULT_STATE_FILE: &str = "meetup-state.json";
pub const DEFAULT_KEY_FILE: &str = "meetup-key.json";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    pub bind: String,
    pub contract: String,
    /// `None` keeps state in memory only.
    pub state_path: Option<PathBuf>,
    /// Applied only when a fresh chain is created.
    pub emissions: Vec<(AccountId, Amount)>,
    pub deploy: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_NODE_ADDR.to_string(),
            contract: DEFAULT_CONTRACT.to_string(),
            state_path: Some(PathBuf::from(DEFAULT_STATE_FILE)),
            emissions: Vec::new(),
            deploy: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub node: String,
    pub contract: String,
    pub key_path: PathBuf,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            node: DEFAULT_NODE_ADDR.to_string(),
            contract: DEFAULT_CONTRACT.to_string(),
            key_path: PathBuf::from(DEFAULT_KEY_FILE),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Parses `<account>=<amount>`.
pub fn parse_emission(s: &str) -> Result<(AccountId, Amount), String> {
    let (account, amount) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <account>=<amount>, got {s:?}"))?;
    let account = account.trim();
    if account.is_empty() {
        return Err(format!("missing account in {s:?}"));
    }
    let amount = amount
        .trim()
        .parse::<Amount>()
        .map_err(|e| format!("invalid amount in {s:?}: {e}"))?;
    Ok((account.to_string(), amount))
}
