use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{Address, Secret};

/// Runtime configuration. Everything here is external to the core's logic:
/// endpoint, gas policy, grant sizes, contract location, document paths.
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON-RPC endpoint of the ledger node.
    pub rpc_url: String,
    pub chain_id: u64,

    /// Flat gas price in wei applied to every transaction kind.
    pub gas_price: u128,
    /// Gas allowance for a plain native-currency transfer.
    pub gas_limit_native_transfer: u64,
    /// Gas allowance for a token `transfer` call.
    pub gas_limit_token_transfer: u64,
    /// Gas allowance for a `buyTokens` purchase.
    pub gas_limit_buy: u64,

    /// Token contract address and decimal precision.
    pub token_contract: Address,
    pub token_decimals: u32,
    pub token_symbol: String,

    /// Treasury account funding newly provisioned wallets.
    pub treasury_address: Address,
    pub treasury_secret: Secret,
    /// Starting native-currency grant, in wei.
    pub native_grant: u128,
    /// Starting token grant, in base units.
    pub token_grant: u128,

    /// Directory holding the durable documents.
    pub data_dir: PathBuf,

    /// Bound on waiting for a transaction receipt.
    pub receipt_timeout: Duration,
    pub receipt_poll_interval: Duration,
}

const WEI_PER_GWEI: u128 = 1_000_000_000;
const WEI_PER_COIN: u128 = 1_000_000_000_000_000_000;

fn require(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(Error::Config(format!("missing env var: {name}"))),
    }
}

fn int_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} must be an integer"))),
        _ => Ok(default),
    }
}

impl Config {
    /// Build configuration from the environment. Missing required variables
    /// (treasury account, token contract) are fatal.
    pub fn from_env() -> Result<Self> {
        let token_decimals = checked_decimals(int_or("TOKEN_DECIMALS", 18)?)?;
        let gas_price_gwei: u128 = int_or("GAS_PRICE_GWEI", 50)?;
        let native_grant_whole: u128 = int_or("INITIAL_ETH_GRANT", 1)?;
        let token_grant_whole: u128 = int_or("INITIAL_TOKEN_GRANT", 1000)?;

        Ok(Self {
            rpc_url: env::var("WEB3_PROVIDER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:7545".into()),
            chain_id: int_or("CHAIN_ID", 1337)?,
            gas_price: gas_price_gwei * WEI_PER_GWEI,
            gas_limit_native_transfer: int_or("GAS_LIMIT_ETH_TRANSFER", 21_000)?,
            gas_limit_token_transfer: int_or("GAS_LIMIT_TRANSFER", 500_000)?,
            gas_limit_buy: int_or("GAS_LIMIT_BUY", 210_000)?,
            token_contract: require("CONTRACT_ADDRESS")?.parse()?,
            token_decimals,
            token_symbol: env::var("TOKEN_SYMBOL").unwrap_or_else(|_| "ORV".into()),
            treasury_address: require("MAIN_ACCOUNT_ADDRESS")?.parse()?,
            treasury_secret: Secret::new(normalize_secret(&require(
                "MAIN_ACCOUNT_PRIVATE_KEY",
            )?)?),
            native_grant: native_grant_whole
                .checked_mul(WEI_PER_COIN)
                .ok_or_else(|| Error::Config("INITIAL_ETH_GRANT out of range".into()))?,
            token_grant: token_grant_whole
                .checked_mul(10u128.pow(token_decimals))
                .ok_or_else(|| Error::Config("INITIAL_TOKEN_GRANT out of range".into()))?,
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            receipt_timeout: Duration::from_secs(int_or("RECEIPT_TIMEOUT_SECS", 120)?),
            receipt_poll_interval: Duration::from_millis(int_or(
                "RECEIPT_POLL_INTERVAL_MS",
                1000,
            )?),
        })
    }

    pub fn users_file(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }

    pub fn referral_codes_file(&self) -> PathBuf {
        self.data_dir.join("referral_codes.json")
    }

    pub fn transactions_file(&self) -> PathBuf {
        self.data_dir.join("transactions.json")
    }

    pub fn notifications_file(&self) -> PathBuf {
        self.data_dir.join("notifications.json")
    }
}

/// A decimal precision beyond 38 would overflow `10u128.pow` when scaling
/// amounts; no real token comes close.
fn checked_decimals(value: u32) -> Result<u32> {
    if value > 38 {
        return Err(Error::Config(format!(
            "TOKEN_DECIMALS must be at most 38, got {value}"
        )));
    }
    Ok(value)
}

/// Normalize a hex private key: trim, require 0x prefix, require 32 bytes.
pub fn normalize_secret(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let with_prefix = if trimmed.starts_with("0x") {
        trimmed.to_string()
    } else {
        format!("0x{trimmed}")
    };
    if with_prefix.len() != 66 || hex::decode(&with_prefix[2..]).is_err() {
        return Err(Error::Config("private key must be 32-byte hex".into()));
    }
    Ok(with_prefix)
}
