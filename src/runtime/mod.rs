//! Executes calls against the injected chain state.
//!
//! A committing call runs on scratch copies of the ledger and contract state;
//! they replace the live state only once every step has succeeded.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::contracts::{self, CallContext, ContractError, MeetupState, ReturnValue};
use crate::identity::{Call, IdentityError, SignedCall};
use crate::ledger::{build_merkle, AccountId, Amount, Leaf, Ledger, LedgerError, LedgerEvent};
use crate::store::{Snapshot, StoreError, SNAPSHOT_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("stale nonce for {account}: expected {expected}, got {got}")]
    StaleNonce {
        account: AccountId,
        expected: u64,
        got: u64,
    },
    #[error("unknown contract {0}")]
    UnknownContract(String),
}

impl RuntimeError {
    /// Stable name used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::Contract(err) => err.kind(),
            RuntimeError::Ledger(LedgerError::InsufficientFunds { .. }) => "insufficient_funds",
            RuntimeError::Ledger(LedgerError::UnknownAccount { .. }) => "unknown_account",
            RuntimeError::Ledger(LedgerError::Overflow { .. }) => "balance_overflow",
            RuntimeError::Identity(_) => "bad_signature",
            RuntimeError::StaleNonce { .. } => "stale_nonce",
            RuntimeError::UnknownContract(_) => "unknown_contract",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainMeta {
    pub height: u64,
    pub timestamp: u64,
    pub last_call: Option<String>,
}

/// What a committed call did.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub call: String,
    pub height: u64,
    pub ret: ReturnValue,
    pub events: Vec<LedgerEvent>,
}

#[derive(Clone, Debug)]
pub struct Runtime {
    contract_address: String,
    meta: ChainMeta,
    ledger: Ledger,
    nonces: BTreeMap<AccountId, u64>,
    contract: Option<MeetupState>,
}

impl Runtime {
    pub fn new(contract_address: impl Into<String>) -> Self {
        Self {
            contract_address: contract_address.into(),
            meta: ChainMeta::default(),
            ledger: Ledger::new(),
            nonces: BTreeMap::new(),
            contract: None,
        }
    }

    /// Fresh chain with the given emissions and the contract deployed.
    pub fn genesis(
        contract_address: impl Into<String>,
        emissions: &[(AccountId, Amount)],
    ) -> Result<Self, RuntimeError> {
        let mut runtime = Self::new(contract_address);
        for (account, amount) in emissions {
            runtime.emit(account, *amount, "genesis")?;
        }
        runtime.deploy()?;
        Ok(runtime)
    }

    /// Mints base currency outside any call.
    pub fn emit(&mut self, to: &AccountId, amount: Amount, reason: &str) -> Result<(), RuntimeError> {
        self.ledger.emit(to, amount, reason)?;
        info!(account = %to, amount, reason, "emission");
        Ok(())
    }

    /// Runs `init` as part of deployment, outside any signed call.
    pub fn deploy(&mut self) -> Result<(), RuntimeError> {
        let ctx = CallContext {
            caller: self.contract_address.clone(),
            value: 0,
        };
        let exec = contracts::execute(self.contract.as_ref(), &ctx, &contracts::Entrypoint::Init)?;
        self.contract = exec.state;
        info!(contract = %self.contract_address, "contract deployed");
        Ok(())
    }

    pub fn contract_address(&self) -> &str {
        &self.contract_address
    }

    pub fn meta(&self) -> &ChainMeta {
        &self.meta
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn contract_state(&self) -> Option<&MeetupState> {
        self.contract.as_ref()
    }

    pub fn balance(&self, account: &str) -> Amount {
        self.ledger.balance(account)
    }

    /// Nonce the next committing call from `account` must carry.
    pub fn next_nonce(&self, account: &str) -> u64 {
        self.nonces.get(account).map_or(1, |n| n + 1)
    }

    /// Covers balances, the event log, nonces, chain meta and contract state.
    pub fn state_root(&self) -> [u8; 32] {
        let mut leaves = self.ledger.leaves();
        leaves.extend(
            self.nonces
                .iter()
                .map(|(account, nonce)| Leaf::new(b"nonce").str(account).u64(*nonce).finish()),
        );
        leaves.push(
            Leaf::new(b"meta")
                .str(&self.contract_address)
                .u64(self.meta.height)
                .u64(self.meta.timestamp)
                .str(self.meta.last_call.as_deref().unwrap_or(""))
                .finish(),
        );
        if let Some(contract) = &self.contract {
            leaves.extend(contract.leaves());
        }
        build_merkle(leaves)
    }

    fn check_contract(&self, call: &Call) -> Result<(), RuntimeError> {
        if call.contract != self.contract_address {
            return Err(RuntimeError::UnknownContract(call.contract.clone()));
        }
        Ok(())
    }

    /// Dry run: nothing is committed, mutations included.
    pub fn call_static(&self, call: &Call) -> Result<ReturnValue, RuntimeError> {
        self.check_contract(call)?;
        let available = self.ledger.balance(&call.caller);
        if call.value > available {
            return Err(LedgerError::InsufficientFunds {
                account: call.caller.clone(),
                needed: call.value,
                available,
            }
            .into());
        }
        let ctx = CallContext {
            caller: call.caller.clone(),
            value: call.value,
        };
        let exec = contracts::execute(self.contract.as_ref(), &ctx, &call.entrypoint)?;
        debug!(entrypoint = call.entrypoint.name(), "static call");
        Ok(exec.ret)
    }

    pub fn commit(&mut self, signed: &SignedCall, timestamp: u64) -> Result<Receipt, RuntimeError> {
        let call = &signed.call;
        let entrypoint = call.entrypoint.name();
        match self.try_commit(signed, timestamp) {
            Ok(receipt) => {
                info!(
                    entrypoint,
                    caller = %call.caller,
                    value = call.value,
                    height = receipt.height,
                    "call committed"
                );
                Ok(receipt)
            }
            Err(err) => {
                warn!(entrypoint, caller = %call.caller, error = %err, "call aborted");
                Err(err)
            }
        }
    }

    fn try_commit(&mut self, signed: &SignedCall, timestamp: u64) -> Result<Receipt, RuntimeError> {
        let call = &signed.call;
        self.check_contract(call)?;
        signed.verify()?;

        let expected = self.next_nonce(&call.caller);
        if call.nonce != expected {
            return Err(RuntimeError::StaleNonce {
                account: call.caller.clone(),
                expected,
                got: call.nonce,
            });
        }

        let mut ledger = self.ledger.clone();
        let first_event = ledger.events.len();
        if call.value > 0 {
            ledger.transfer(
                &call.caller,
                &self.contract_address,
                call.value,
                Some(format!("{} attached value", call.entrypoint.name())),
            )?;
        }

        let ctx = CallContext {
            caller: call.caller.clone(),
            value: call.value,
        };
        let exec = contracts::execute(self.contract.as_ref(), &ctx, &call.entrypoint)?;
        for spend in exec.spends.iter().filter(|spend| spend.amount > 0) {
            ledger.transfer(
                &self.contract_address,
                &spend.to,
                spend.amount,
                Some(format!("{} payout", call.entrypoint.name())),
            )?;
        }

        let digest = hex::encode(signed.digest());
        let events = ledger.events[first_event..].to_vec();
        self.ledger = ledger;
        if let Some(state) = exec.state {
            self.contract = Some(state);
        }
        self.nonces.insert(call.caller.clone(), call.nonce);
        self.meta.height += 1;
        self.meta.timestamp = timestamp;
        self.meta.last_call = Some(digest.clone());

        Ok(Receipt {
            call: digest,
            height: self.meta.height,
            ret: exec.ret,
            events,
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            contract_address: self.contract_address.clone(),
            meta: self.meta.clone(),
            ledger: self.ledger.clone(),
            nonces: self.nonces.clone(),
            contract: self.contract.clone(),
            state_root: hex::encode(self.state_root()),
        }
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, StoreError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::UnsupportedVersion(snapshot.version));
        }
        let runtime = Self {
            contract_address: snapshot.contract_address,
            meta: snapshot.meta,
            ledger: snapshot.ledger,
            nonces: snapshot.nonces,
            contract: snapshot.contract,
        };
        let actual = hex::encode(runtime.state_root());
        if actual != snapshot.state_root {
            return Err(StoreError::RootMismatch {
                expected: snapshot.state_root,
                actual,
            });
        }
        Ok(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::contracts::{Entrypoint, NewMeeting};
    use crate::identity::Keypair;

    const CONTRACT: &str = "ct_runtime_test";

    struct Account {
        keypair: Keypair,
        nonce: u64,
    }

    impl Account {
        fn new() -> Self {
            Self {
                keypair: Keypair::generate(),
                nonce: 0,
            }
        }

        fn id(&self) -> AccountId {
            self.keypair.account()
        }

        fn call(&mut self, entrypoint: Entrypoint, value: Amount) -> SignedCall {
            self.nonce += 1;
            self.keypair.sign(Call {
                contract: CONTRACT.into(),
                caller: self.id(),
                nonce: self.nonce,
                value,
                entrypoint,
            })
        }
    }

    fn meetup(capacity: u64, ticket_price: Amount) -> Entrypoint {
        Entrypoint::CreateMeeting(NewMeeting {
            name: "rust night".into(),
            date: "2024-05-01".into(),
            time: "19:00".into(),
            capacity,
            ticket_price,
            image: "img.png".into(),
            address1: "Main St 1".into(),
            address2: "".into(),
        })
    }

    fn setup(capacity: u64, ticket_price: Amount) -> (Runtime, Account, Account) {
        let creator = Account::new();
        let buyer = Account::new();
        let mut runtime =
            Runtime::genesis(CONTRACT, &[(creator.id(), 0), (buyer.id(), 1_000)]).unwrap();
        let mut creator = creator;
        runtime.commit(&creator.call(meetup(capacity, ticket_price), 0), 1).unwrap();
        runtime
            .commit(&creator.call(Entrypoint::OpenMeeting { meeting_id: 0 }, 0), 2)
            .unwrap();
        (runtime, creator, buyer)
    }

    fn meeting(runtime: &Runtime) -> crate::contracts::Meeting {
        runtime
            .contract_state()
            .unwrap()
            .get_meeting(0)
            .unwrap()
            .clone()
    }

    #[test]
    fn purchase_pays_the_creator() {
        let (mut runtime, creator, mut buyer) = setup(10, 7);
        let receipt = runtime
            .commit(
                &buyer.call(
                    Entrypoint::BuyTicket {
                        meeting_id: 0,
                        quantity: 3,
                    },
                    21,
                ),
                3,
            )
            .unwrap();
        assert_eq!(runtime.balance(&buyer.id()), 979);
        assert_eq!(runtime.balance(&creator.id()), 21);
        assert_eq!(runtime.balance(CONTRACT), 0);
        assert_eq!(receipt.events.len(), 2);
        assert_eq!(receipt.height, 3);
        assert_eq!(meeting(&runtime).capacity, 7);
        assert_eq!(runtime.meta().timestamp, 3);
    }

    #[test]
    fn aborted_call_leaves_everything_untouched() {
        let (mut runtime, _creator, mut buyer) = setup(2, 5);
        let root = runtime.state_root();
        let meta = runtime.meta().clone();
        let events = runtime.ledger().events.clone();

        let err = runtime
            .commit(
                &buyer.call(
                    Entrypoint::BuyTicket {
                        meeting_id: 0,
                        quantity: 3,
                    },
                    15,
                ),
                9,
            )
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient_capacity");
        assert_eq!(runtime.state_root(), root);
        assert_eq!(runtime.meta(), &meta);
        assert_eq!(runtime.ledger().events, events);
        assert_eq!(runtime.balance(&buyer.id()), 1_000);
        assert_eq!(runtime.balance(CONTRACT), 0);
        // the nonce was not consumed
        assert_eq!(runtime.next_nonce(&buyer.id()), 1);

        let err = runtime
            .commit(
                &buyer.call(
                    Entrypoint::BuyTicket {
                        meeting_id: 0,
                        quantity: 1,
                    },
                    4,
                ),
                9,
            )
            .unwrap_err();
        assert_eq!(err.kind(), "stale_nonce");
    }

    #[test]
    fn underpayment_and_missing_funds_abort() {
        let (mut runtime, _creator, mut buyer) = setup(5, 5);
        buyer.nonce = 0;
        let err = runtime
            .commit(
                &buyer.call(
                    Entrypoint::BuyTicket {
                        meeting_id: 0,
                        quantity: 2,
                    },
                    9,
                ),
                4,
            )
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient_payment");
        assert_eq!(runtime.balance(&buyer.id()), 1_000);

        buyer.nonce = 0;
        let err = runtime
            .commit(
                &buyer.call(
                    Entrypoint::BuyTicket {
                        meeting_id: 0,
                        quantity: 1,
                    },
                    5_000,
                ),
                4,
            )
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient_funds");
    }

    #[test]
    fn replayed_call_is_rejected() {
        let (mut runtime, _creator, mut buyer) = setup(5, 1);
        let signed = buyer.call(
            Entrypoint::BuyTicket {
                meeting_id: 0,
                quantity: 1,
            },
            1,
        );
        runtime.commit(&signed, 5).unwrap();
        let err = runtime.commit(&signed, 6).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::StaleNonce {
                expected: 2,
                got: 1,
                ..
            }
        ));
        assert_eq!(meeting(&runtime).capacity, 4);
    }

    #[test]
    fn forged_and_misrouted_calls_are_rejected() {
        let (mut runtime, _creator, mut buyer) = setup(5, 1);
        let mut forged = buyer.call(Entrypoint::CloseMeeting { meeting_id: 0 }, 0);
        forged.call.caller = Keypair::generate().account();
        assert_eq!(runtime.commit(&forged, 5).unwrap_err().kind(), "bad_signature");

        buyer.nonce = 0;
        let mut call = buyer.call(Entrypoint::CloseMeeting { meeting_id: 0 }, 0).call;
        call.contract = "ct_other".into();
        let misrouted = buyer.keypair.sign(call);
        assert_eq!(
            runtime.commit(&misrouted, 5).unwrap_err().kind(),
            "unknown_contract"
        );
        assert!(meeting(&runtime).opened);
    }

    #[test]
    fn static_calls_never_commit() {
        let (runtime, _creator, buyer) = setup(5, 1);
        let before = runtime.state_root();
        let ret = runtime
            .call_static(&Call {
                contract: CONTRACT.into(),
                caller: buyer.id(),
                nonce: 0,
                value: 2,
                entrypoint: Entrypoint::BuyTicket {
                    meeting_id: 0,
                    quantity: 2,
                },
            })
            .unwrap();
        assert_eq!(ret, ReturnValue::Unit);
        assert_eq!(runtime.state_root(), before);

        let ret = runtime
            .call_static(&Call {
                contract: CONTRACT.into(),
                caller: String::new(),
                nonce: 0,
                value: 0,
                entrypoint: Entrypoint::GetMeetingsLength,
            })
            .unwrap();
        assert_eq!(ret, ReturnValue::Int(1));
    }

    #[test]
    fn uninitialized_contract_rejects_calls_until_init() {
        let mut runtime = Runtime::new(CONTRACT);
        let mut alice = Account::new();
        let err = runtime
            .commit(&alice.call(meetup(1, 1), 0), 1)
            .unwrap_err();
        assert_eq!(err.kind(), "uninitialized");

        alice.nonce = 0;
        runtime.commit(&alice.call(Entrypoint::Init, 0), 1).unwrap();
        let err = runtime.commit(&alice.call(Entrypoint::Init, 0), 2).unwrap_err();
        assert_eq!(err.kind(), "already_initialized");
        assert!(runtime.deploy().is_err());
    }

    #[test]
    fn snapshot_restores_the_same_root() {
        let (runtime, _creator, _buyer) = setup(5, 1);
        let snapshot = runtime.snapshot();
        let restored = Runtime::from_snapshot(snapshot.clone()).unwrap();
        assert_eq!(restored.state_root(), runtime.state_root());

        let mut meeting_edit = snapshot.clone();
        if let Some(contract) = meeting_edit.contract.as_mut() {
            contract.meetings.get_mut(&0).unwrap().capacity = 500;
        }
        let mut nonce_reset = snapshot.clone();
        for nonce in nonce_reset.nonces.values_mut() {
            *nonce = 0;
        }
        let mut log_cleared = snapshot.clone();
        log_cleared.ledger.events.clear();
        let mut height_edit = snapshot.clone();
        height_edit.meta.height = 999;
        let mut last_call_edit = snapshot;
        last_call_edit.meta.last_call = None;

        for tampered in [meeting_edit, nonce_reset, log_cleared, height_edit, last_call_edit] {
            assert!(matches!(
                Runtime::from_snapshot(tampered).unwrap_err(),
                StoreError::RootMismatch { .. }
            ));
        }
    }

    #[test]
    fn restored_chain_still_rejects_replays() {
        let (mut runtime, _creator, mut buyer) = setup(5, 1);
        let signed = buyer.call(
            Entrypoint::BuyTicket {
                meeting_id: 0,
                quantity: 1,
            },
            1,
        );
        runtime.commit(&signed, 5).unwrap();

        let mut restored = Runtime::from_snapshot(runtime.snapshot()).unwrap();
        assert_eq!(restored.commit(&signed, 6).unwrap_err().kind(), "stale_nonce");
        assert_eq!(restored.next_nonce(&buyer.id()), 2);
    }

    #[test]
    fn free_purchase_on_a_fresh_chain() {
        let mut creator = Account::new();
        let mut buyer = Account::new();
        let mut runtime =
            Runtime::genesis(CONTRACT, &[(creator.id(), 0), (buyer.id(), 0)]).unwrap();
        runtime.commit(&creator.call(meetup(5, 0), 0), 1).unwrap();
        runtime
            .commit(&creator.call(Entrypoint::OpenMeeting { meeting_id: 0 }, 0), 2)
            .unwrap();

        let receipt = runtime
            .commit(
                &buyer.call(
                    Entrypoint::BuyTicket {
                        meeting_id: 0,
                        quantity: 2,
                    },
                    0,
                ),
                3,
            )
            .unwrap();
        assert!(receipt.events.is_empty());
        assert_eq!(meeting(&runtime).capacity, 3);
        assert_eq!(
            meeting(&runtime).ticket(&buyer.id()).map(|t| t.quantity),
            Some(2)
        );

        // zero quantity with nothing attached is accepted too
        runtime
            .commit(
                &buyer.call(
                    Entrypoint::BuyTicket {
                        meeting_id: 0,
                        quantity: 0,
                    },
                    0,
                ),
                4,
            )
            .unwrap();
        assert_eq!(meeting(&runtime).capacity, 3);
        assert_eq!(runtime.balance(CONTRACT), 0);
    }
}
