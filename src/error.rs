use thiserror::Error;

use crate::types::TxHash;

/// Crate-wide error taxonomy.
///
/// Every failure a caller can observe is one of these variants; nothing is
/// collapsed into a stringly generic error, and no variant ever carries
/// secret material.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration, or an unreachable ledger endpoint.
    /// Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A ciphertext could not be decrypted with the supplied password.
    /// The wallet has no usable key; never retried with the same input.
    #[error("decryption failed: no usable secret")]
    Decrypt,

    /// Unknown identity or out-of-range wallet index.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller-supplied amount that does not parse as a decimal quantity or
    /// does not fit the configured precision.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// The node rejected a submission because the nonce was already
    /// consumed by a concurrent transaction from the same sender.
    #[error("stale nonce: a concurrent transaction consumed the sequence number")]
    NonceConflict,

    /// The network rejected the transaction. Surfaced verbatim, not retried.
    #[error("ledger rejected transaction: {0}")]
    LedgerRejected(String),

    /// No receipt observed within the configured bound. The outcome is
    /// unknown, not failed: the transaction may still confirm later.
    #[error("no receipt for {0} within the timeout; outcome unknown")]
    ReceiptTimeout(TxHash),

    /// Transport or node fault talking to the ledger endpoint.
    #[error("ledger rpc error: {0}")]
    Rpc(String),

    /// Outbound notification could not be delivered. Logged by the engine
    /// and swallowed; never fails the enclosing transfer.
    #[error("notification delivery failed: {0}")]
    NotificationDelivery(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
