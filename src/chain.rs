//! JSON-RPC client for the distributed ledger.
//!
//! [`LedgerClient`] builds, signs, and submits transactions, waits for
//! finality with a bounded timeout, and reads balances. The [`Ledger`] trait
//! is the seam the engine depends on, so the whole pipeline can run against
//! a mock in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::eth::{self, LegacyTransaction};
use crate::types::{Address, Receipt, TxHash};

/// Ledger operations the transaction engine depends on.
///
/// Mutating calls read the sender's current nonce, sign with the supplied
/// secret, and submit; they return as soon as the node accepts the raw
/// transaction. Finality is a separate, bounded [`Ledger::await_receipt`].
/// Balance reads are point-in-time and never cached.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Submit a token `transfer(recipient, amount)` from the sender wallet.
    async fn transfer_token(
        &self,
        sender_secret: &str,
        sender: Address,
        recipient: Address,
        amount: u128,
    ) -> Result<TxHash>;

    /// Buy tokens with native currency via `buyTokens(referrer)`.
    async fn purchase_with_native(
        &self,
        sender_secret: &str,
        sender: Address,
        amount_wei: u128,
        referrer: Address,
    ) -> Result<TxHash>;

    /// Plain native-currency transfer.
    async fn send_native(
        &self,
        sender_secret: &str,
        sender: Address,
        recipient: Address,
        amount_wei: u128,
    ) -> Result<TxHash>;

    /// Block until the transaction is finalized or the configured bound
    /// elapses ([`Error::ReceiptTimeout`]: outcome unknown, not failed).
    async fn await_receipt(&self, hash: TxHash) -> Result<Receipt>;

    async fn token_balance(&self, owner: Address) -> Result<u128>;
    async fn native_balance(&self, owner: Address) -> Result<u128>;
}

/// JSON-RPC implementation of [`Ledger`] against a configured endpoint and
/// token contract.
#[derive(Debug)]
pub struct LedgerClient {
    http: reqwest::Client,
    rpc_url: String,
    chain_id: u64,
    gas_price: u128,
    gas_limit_native_transfer: u64,
    gas_limit_token_transfer: u64,
    gas_limit_buy: u64,
    token_contract: Address,
    receipt_timeout: Duration,
    receipt_poll_interval: Duration,
    /// Per-sender locks: nonce read, sign, and submit are serialized per
    /// address so two concurrent transfers from one wallet never read the
    /// same sequence number.
    nonce_locks: DashMap<Address, Arc<Mutex<()>>>,
}

impl LedgerClient {
    /// Connect to the configured endpoint and verify it answers with the
    /// expected chain id. An unreachable or mismatched endpoint is fatal.
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = Self {
            http: reqwest::Client::new(),
            rpc_url: config.rpc_url.clone(),
            chain_id: config.chain_id,
            gas_price: config.gas_price,
            gas_limit_native_transfer: config.gas_limit_native_transfer,
            gas_limit_token_transfer: config.gas_limit_token_transfer,
            gas_limit_buy: config.gas_limit_buy,
            token_contract: config.token_contract,
            receipt_timeout: config.receipt_timeout,
            receipt_poll_interval: config.receipt_poll_interval,
            nonce_locks: DashMap::new(),
        };

        let reported = client
            .rpc_call("eth_chainId", json!([]))
            .await
            .map_err(|e| Error::Config(format!("ledger endpoint unreachable: {e}")))?;
        let reported = parse_quantity(&reported)? as u64;
        if reported != config.chain_id {
            return Err(Error::Config(format!(
                "chain id mismatch: endpoint reports {reported}, configured {}",
                config.chain_id
            )));
        }
        tracing::info!(chain_id = reported, url = %config.rpc_url, "connected to ledger");
        Ok(client)
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Rpc(format!("{method}: {e}")))?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::Rpc(format!("{method}: malformed response: {e}")))?;

        if let Some(err) = payload.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown node error")
                .to_string();
            return Err(Error::Rpc(message));
        }
        payload
            .get("result")
            .cloned()
            .ok_or_else(|| Error::Rpc(format!("{method}: missing result")))
    }

    /// Current transaction count including pending submissions, so
    /// back-to-back transfers from one sender serialize onto fresh nonces.
    async fn transaction_count(&self, sender: Address) -> Result<u64> {
        let result = self
            .rpc_call(
                "eth_getTransactionCount",
                json!([sender.to_checksum(), "pending"]),
            )
            .await?;
        Ok(parse_quantity(&result)? as u64)
    }

    async fn send_raw(&self, raw: &[u8]) -> Result<TxHash> {
        let result = self
            .rpc_call(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await
            .map_err(|e| match e {
                Error::Rpc(message) => classify_submit_error(&message),
                other => other,
            })?;
        result
            .as_str()
            .ok_or_else(|| Error::Rpc("non-string transaction hash".into()))?
            .parse()
    }

    /// Nonce-read, sign, submit under the sender's lock, retrying exactly
    /// once with a refreshed nonce on a stale-nonce conflict.
    async fn submit<F>(&self, secret: &str, sender: Address, build: F) -> Result<TxHash>
    where
        F: Fn(u64) -> LegacyTransaction,
    {
        let lock = self
            .nonce_locks
            .entry(sender)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut retried = false;
        loop {
            let nonce = self.transaction_count(sender).await?;
            let raw = build(nonce).sign(secret, self.chain_id)?;
            match self.send_raw(&raw).await {
                Ok(hash) => return Ok(hash),
                Err(Error::NonceConflict) if !retried => {
                    tracing::warn!(sender = %sender, nonce, "stale nonce, retrying once");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Ledger for LedgerClient {
    async fn transfer_token(
        &self,
        sender_secret: &str,
        sender: Address,
        recipient: Address,
        amount: u128,
    ) -> Result<TxHash> {
        let contract = self.token_contract;
        let gas_price = self.gas_price;
        let gas_limit = self.gas_limit_token_transfer;
        self.submit(sender_secret, sender, move |nonce| LegacyTransaction {
            nonce,
            gas_price,
            gas_limit,
            to: Some(contract),
            value: 0,
            data: eth::encode_transfer(recipient, amount),
        })
        .await
    }

    async fn purchase_with_native(
        &self,
        sender_secret: &str,
        sender: Address,
        amount_wei: u128,
        referrer: Address,
    ) -> Result<TxHash> {
        let contract = self.token_contract;
        let gas_price = self.gas_price;
        let gas_limit = self.gas_limit_buy;
        self.submit(sender_secret, sender, move |nonce| LegacyTransaction {
            nonce,
            gas_price,
            gas_limit,
            to: Some(contract),
            value: amount_wei,
            data: eth::encode_buy_tokens(referrer),
        })
        .await
    }

    async fn send_native(
        &self,
        sender_secret: &str,
        sender: Address,
        recipient: Address,
        amount_wei: u128,
    ) -> Result<TxHash> {
        let gas_price = self.gas_price;
        let gas_limit = self.gas_limit_native_transfer;
        self.submit(sender_secret, sender, move |nonce| LegacyTransaction {
            nonce,
            gas_price,
            gas_limit,
            to: Some(recipient),
            value: amount_wei,
            data: Vec::new(),
        })
        .await
    }

    async fn await_receipt(&self, hash: TxHash) -> Result<Receipt> {
        let deadline = Instant::now() + self.receipt_timeout;
        loop {
            let result = self
                .rpc_call("eth_getTransactionReceipt", json!([hash.to_string()]))
                .await?;
            if !result.is_null() {
                let receipt: Receipt = serde_json::from_value(result)?;
                if !receipt.succeeded() {
                    return Err(Error::LedgerRejected(format!("transaction {hash} reverted")));
                }
                return Ok(receipt);
            }
            if Instant::now() >= deadline {
                return Err(Error::ReceiptTimeout(hash));
            }
            tokio::time::sleep(self.receipt_poll_interval).await;
        }
    }

    async fn token_balance(&self, owner: Address) -> Result<u128> {
        let result = self
            .rpc_call(
                "eth_call",
                json!([
                    {
                        "to": self.token_contract.to_checksum(),
                        "data": format!("0x{}", hex::encode(eth::encode_balance_of(owner))),
                    },
                    "latest",
                ]),
            )
            .await?;
        let word = result
            .as_str()
            .ok_or_else(|| Error::Rpc("non-string balance".into()))?;
        eth::uint_from_word(word).ok_or_else(|| Error::Rpc(format!("unparseable balance: {word}")))
    }

    async fn native_balance(&self, owner: Address) -> Result<u128> {
        let result = self
            .rpc_call("eth_getBalance", json!([owner.to_checksum(), "latest"]))
            .await?;
        parse_quantity(&result)
    }
}

/// Map a node's submission error onto the taxonomy: stale-nonce conflicts
/// are retryable exactly once, everything else is a rejection surfaced
/// verbatim.
fn classify_submit_error(message: &str) -> Error {
    let lowered = message.to_lowercase();
    if lowered.contains("nonce too low")
        || lowered.contains("already known")
        || lowered.contains("replacement transaction")
        || lowered.contains("same nonce")
    {
        Error::NonceConflict
    } else {
        Error::LedgerRejected(message.to_string())
    }
}

/// Parse a JSON-RPC hex quantity ("0x...") into u128.
fn parse_quantity(value: &Value) -> Result<u128> {
    let s = value
        .as_str()
        .ok_or_else(|| Error::Rpc(format!("expected hex quantity, got {value}")))?;
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    u128::from_str_radix(stripped, 16).map_err(|_| Error::Rpc(format!("bad hex quantity: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_errors_are_classified() {
        assert!(matches!(
            classify_submit_error("nonce too low: next nonce 7"),
            Error::NonceConflict
        ));
        assert!(matches!(
            classify_submit_error("already known"),
            Error::NonceConflict
        ));
        assert!(matches!(
            classify_submit_error("insufficient funds for gas * price + value"),
            Error::LedgerRejected(_)
        ));
    }

    #[test]
    fn quantities_parse() {
        assert_eq!(parse_quantity(&json!("0x0")).unwrap(), 0);
        assert_eq!(parse_quantity(&json!("0x539")).unwrap(), 1337);
        assert!(parse_quantity(&json!(42)).is_err());
        assert!(parse_quantity(&json!("0xzz")).is_err());
    }
}
