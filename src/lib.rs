//! Custodial wallet state store and transaction lifecycle engine.
//!
//! The crate owns three durable JSON documents (wallets, transaction
//! history, notification markers), a password-based cipher protecting every
//! wallet secret at rest, and a JSON-RPC ledger client that builds, signs,
//! and submits token transactions and waits for finality. The
//! [`engine::TransactionEngine`] composes them into a crash-tolerant
//! transfer pipeline; [`engine::AccountProvisioner`] creates and seeds
//! first wallets idempotently.
//!
//! Authentication, command parsing, and the chat transport all live in the
//! embedding application. This core trusts the identities it is handed and
//! exposes the [`chain::Ledger`] and [`notify::Notifier`] traits as the
//! seams to the outside world.

pub mod chain;
pub mod cipher;
pub mod config;
pub mod engine;
pub mod error;
pub mod eth;
pub mod notify;
pub mod records;
pub mod store;
pub mod types;

pub use chain::{Ledger, LedgerClient};
pub use config::Config;
pub use engine::{AccountProvisioner, TransactionEngine};
pub use error::{Error, Result};
pub use notify::{NotificationLedger, Notifier};
pub use records::TransactionLog;
pub use store::{ReferralRegistry, WalletStore};
pub use types::{
    format_base_units, parse_amount, Account, Address, Secret, TransactionRecord, TxHash, Wallet,
    WalletKey,
};
