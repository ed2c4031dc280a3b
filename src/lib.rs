//! Ticketed-event ledger.
//!
//! * [`contracts`]: the meetup state machine (meetings, tickets, open/close).
//! * [`ledger`]: base-currency balances, transfer log and merkle root.
//! * [`runtime`]: atomic execution of signed calls against injected state.
//! * [`identity`]: Ed25519 accounts and signed calls.
//! * [`rpc`]: line-delimited JSON frames, transports and the node server.
//! * [`store`]: JSON snapshots with root verification.
//! * [`adapter`]: client queries, mutations and the meeting view model.

pub mod adapter;
pub mod config;
pub mod contracts;
pub mod identity;
pub mod ledger;
pub mod logging;
pub mod rpc;
pub mod runtime;
pub mod store;
