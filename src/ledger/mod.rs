//! Base-currency accounts, the value-movement log and the merkle tree the
//! state root is built from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type AccountId = String;
pub type Amount = u64;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds in account {account}: need {needed}, have {available}")]
    InsufficientFunds {
        account: AccountId,
        needed: Amount,
        available: Amount,
    },
    #[error("unknown account {account}")]
    UnknownAccount { account: AccountId },
    #[error("balance overflow in account {account}")]
    Overflow { account: AccountId },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Emission {
        to: AccountId,
        amount: Amount,
        reason: String,
    },
    Transfer {
        from: AccountId,
        to: AccountId,
        amount: Amount,
        memo: Option<String>,
    },
}

/// Base-currency balances plus the append-only log of value movements.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ledger {
    pub accounts: BTreeMap<AccountId, Amount>,
    pub events: Vec<LedgerEvent>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, account: &str) -> Amount {
        self.accounts.get(account).copied().unwrap_or(0)
    }

    pub fn emit(&mut self, to: &AccountId, amount: Amount, reason: &str) -> Result<(), LedgerError> {
        self.credit_account(to, amount)?;
        self.events.push(LedgerEvent::Emission {
            to: to.clone(),
            amount,
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub fn credit_account(&mut self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let balance = self.accounts.entry(account.clone()).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow {
                account: account.clone(),
            })?;
        Ok(())
    }

    /// Debiting nothing always succeeds, even from an account never credited.
    pub fn debit_account(&mut self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        if amount == 0 {
            return Ok(());
        }
        let balance =
            self.accounts
                .get_mut(account)
                .ok_or_else(|| LedgerError::UnknownAccount {
                    account: account.clone(),
                })?;
        if *balance < amount {
            return Err(LedgerError::InsufficientFunds {
                account: account.clone(),
                needed: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        Ok(())
    }

    pub fn transfer(
        &mut self,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
        memo: Option<String>,
    ) -> Result<(), LedgerError> {
        // credit side must fit before anything is debited
        if from != to && self.balance(to).checked_add(amount).is_none() {
            return Err(LedgerError::Overflow { account: to.clone() });
        }
        self.debit_account(from, amount)?;
        self.credit_account(to, amount)?;
        self.events.push(LedgerEvent::Transfer {
            from: from.clone(),
            to: to.clone(),
            amount,
            memo,
        });
        Ok(())
    }

    /// One leaf per account, in key order, then one for the whole event log.
    pub fn leaves(&self) -> Vec<[u8; 32]> {
        let mut leaves: Vec<[u8; 32]> = self
            .accounts
            .iter()
            .map(|(account, amount)| Leaf::new(b"acct").str(account).u64(*amount).finish())
            .collect();
        leaves.push(self.log_leaf());
        leaves
    }

    /// Chains every event in order, so dropping or editing one changes it.
    fn log_leaf(&self) -> [u8; 32] {
        let mut leaf = Leaf::new(b"log").u64(self.events.len() as u64);
        for event in &self.events {
            leaf = match event {
                LedgerEvent::Emission { to, amount, reason } => {
                    leaf.bytes(b"emit").str(to).u64(*amount).str(reason)
                }
                LedgerEvent::Transfer {
                    from,
                    to,
                    amount,
                    memo,
                } => leaf
                    .bytes(b"xfer")
                    .str(from)
                    .str(to)
                    .u64(*amount)
                    .u64(memo.is_some() as u64)
                    .str(memo.as_deref().unwrap_or("")),
            };
        }
        leaf.finish()
    }
}

/// Domain-tagged SHA-256 over length-prefixed fields.
pub struct Leaf(Sha256);

impl Leaf {
    pub fn new(tag: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(tag);
        Leaf(hasher)
    }

    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.0.update(bytes);
        self
    }

    pub fn str(self, s: &str) -> Self {
        self.u64(s.len() as u64).bytes(s.as_bytes())
    }

    pub fn u64(self, n: u64) -> Self {
        self.bytes(&n.to_le_bytes())
    }

    pub fn finish(self) -> [u8; 32] {
        self.0.finalize().into()
    }
}

/// Pairs nodes level by level; an odd node is carried up unchanged.
pub fn build_merkle(leaves: Vec<[u8; 32]>) -> [u8; 32] {
    let mut level = leaves;
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => Leaf::new(b"node").bytes(left).bytes(right).finish(),
                [single] => *single,
                _ => Leaf::new(b"node").finish(),
            })
            .collect();
    }
    level
        .first()
        .copied()
        .unwrap_or_else(|| Leaf::new(b"meetup-ledger-empty").finish())
}
