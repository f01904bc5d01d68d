//! Core data model: identities, wallets, accounts, transaction records.
//!
//! The wallet exists in two deliberately distinct shapes. [`Wallet`] is the
//! in-memory form and holds the plaintext secret (or the opaque ciphertext
//! when the per-wallet decrypt failed). [`StoredWallet`] is the durable form
//! and only ever holds ciphertext. Neither converts to the other without
//! going through the cipher, so persisting a plaintext secret is a type
//! error, not a bug waiting to happen.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::Error;
use crate::eth::keccak256;

/// Opaque external user identifier (e.g. a chat-platform snowflake).
/// This core never authenticates identities; it only keys state by them.
pub type Identity = String;

// ============ Address ============

/// 20-byte ledger address. Displayed and serialized in EIP-55 checksummed
/// form; parsed from hex of any case.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The zero address, used as the "no referrer" sentinel on-chain.
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// EIP-55 mixed-case checksum encoding.
    pub fn to_checksum(&self) -> String {
        let lower = hex::encode(self.0);
        let digest = keccak256(lower.as_bytes());
        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (i, c) in lower.chars().enumerate() {
            let nibble = (digest[i / 2] >> (4 * (1 - i % 2))) & 0x0f;
            if c.is_ascii_alphabetic() && nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_checksum())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_checksum())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped)
            .map_err(|_| Error::Config(format!("invalid address: {s}")))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| Error::Config(format!("invalid address length: {s}")))?;
        Ok(Address(arr))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_checksum())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============ TxHash ============

/// 32-byte transaction hash, serialized as 0x-prefixed lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHash(pub [u8; 32]);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash(0x{})", hex::encode(self.0))
    }
}

impl FromStr for TxHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes =
            hex::decode(stripped).map_err(|_| Error::Rpc(format!("invalid tx hash: {s}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Rpc(format!("invalid tx hash length: {s}")))?;
        Ok(TxHash(arr))
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============ Secret ============

/// Plaintext private key material. Zeroized on drop, opaque in Debug output,
/// and deliberately not serializable.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

// ============ Wallet / Account ============

/// Key material state of an in-memory wallet.
#[derive(Debug, Clone)]
pub enum WalletKey {
    /// Decrypted plaintext secret, usable for signing.
    Plain(Secret),
    /// The at-rest ciphertext did not decrypt with the wallet's own
    /// password. Held opaque so a later save never destroys it; the wallet
    /// is unusable for signing.
    Locked(String),
}

/// In-memory wallet.
///
/// Invariant: `address` is the deterministic address derived from the
/// plaintext secret. It is set at creation or import and never edited.
#[derive(Debug, Clone)]
pub struct Wallet {
    pub address: Address,
    pub name: String,
    pub key: WalletKey,
    pub secret_password: String,
    pub referrer: Option<Identity>,
}

impl Wallet {
    /// The plaintext secret, or `None` for a locked wallet.
    pub fn secret(&self) -> Option<&Secret> {
        match &self.key {
            WalletKey::Plain(secret) => Some(secret),
            WalletKey::Locked(_) => None,
        }
    }
}

/// Durable wallet document. `private_key` is the base64 ciphertext produced
/// by the cipher; the plaintext never appears in this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredWallet {
    pub private_key: String,
    pub address: Address,
    pub name: String,
    #[serde(default)]
    pub referrer: Option<Identity>,
    pub password: String,
}

/// In-memory account: one chat identity, its contact hints from the login
/// flow, and an ordered wallet list. Wallet 0 is the funding/referral wallet.
#[derive(Debug, Clone, Default)]
pub struct Account {
    pub email: Option<String>,
    pub origin_ip: Option<String>,
    pub wallets: Vec<Wallet>,
}

/// Durable account document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAccount {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "ip")]
    pub origin_ip: Option<String>,
    #[serde(default)]
    pub wallets: Vec<StoredWallet>,
}

// ============ Transaction record ============

/// Canonical record of a confirmed transfer, appended per-identity.
/// Append-only: never mutated, never deleted. `value` is in token base units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: TxHash,
    pub from: Address,
    pub to: Address,
    pub value: u128,
    pub recorded_at: DateTime<Utc>,
}

/// Finality confirmation for a submitted transaction, as reported by the
/// ledger node, including emitted events.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: TxHash,
    /// "0x1" on success, "0x0" when the transaction reverted.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        !matches!(self.status.as_deref(), Some("0x0"))
    }
}

/// One emitted event inside a receipt.
#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<String>,
    pub data: String,
}

/// Decoded `Transfer(from, to, value)` event from a receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub from: Address,
    pub to: Address,
    pub value: u128,
}

/// Scale a whole-unit amount by the configured decimal precision.
pub fn to_base_units(whole: u64, decimals: u32) -> u128 {
    u128::from(whole) * 10u128.pow(decimals)
}

/// Parse a caller-supplied decimal amount ("10", "0.5", ".25") into base
/// units, exactly. Rejects more fractional digits than the precision allows
/// rather than rounding.
pub fn parse_amount(input: &str, decimals: u32) -> Result<u128, Error> {
    let trimmed = input.trim();
    let (whole, frac) = match trimmed.split_once('.') {
        Some((w, f)) => (w, f),
        None => (trimmed, ""),
    };
    let digits_only =
        |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if !(digits_only(whole) || whole.is_empty()) || !(digits_only(frac) || frac.is_empty()) {
        return Err(Error::InvalidAmount(trimmed.to_string()));
    }
    if whole.is_empty() && frac.is_empty() {
        return Err(Error::InvalidAmount(trimmed.to_string()));
    }
    if frac.len() > decimals as usize {
        return Err(Error::InvalidAmount(format!(
            "{trimmed}: at most {decimals} decimal places"
        )));
    }

    let scale = 10u128.pow(decimals);
    let whole_units: u128 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| Error::InvalidAmount(trimmed.to_string()))?
    };
    let frac_units: u128 = if frac.is_empty() {
        0
    } else {
        let parsed: u128 = frac
            .parse()
            .map_err(|_| Error::InvalidAmount(trimmed.to_string()))?;
        parsed * 10u128.pow(decimals - frac.len() as u32)
    };
    whole_units
        .checked_mul(scale)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(|| Error::InvalidAmount(format!("{trimmed}: out of range")))
}

/// Render a base-unit amount as a decimal string, trimming trailing zeros
/// ("10", "0.5", "0.000000000000000042").
pub fn format_base_units(value: u128, decimals: u32) -> String {
    let scale = 10u128.pow(decimals);
    let whole = value / scale;
    let frac = value % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac_digits = format!("{frac:0width$}", width = decimals as usize);
    format!("{whole}.{}", frac_digits.trim_end_matches('0'))
}
