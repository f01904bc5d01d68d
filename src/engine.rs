//! Transfer pipeline and account provisioning.
//!
//! [`TransactionEngine`] drives the five-step transfer: resolve the sender's
//! secret, submit, await finality, record, notify. Each step commits before
//! the next starts, so a crash leaves at most one step unreplayed and the
//! notification ledger keeps replays from double-messaging a recipient.
//! [`AccountProvisioner`] creates first wallets idempotently and funds them
//! from the treasury on a best-effort basis.

use std::sync::Arc;

use chrono::Utc;

use crate::chain::Ledger;
use crate::cipher;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::eth;
use crate::notify::{NotificationLedger, Notifier};
use crate::records::TransactionLog;
use crate::store::{ReferralRegistry, WalletStore};
use crate::types::{
    format_base_units, Account, Address, Secret, TransactionRecord, Wallet, WalletKey,
};

pub struct TransactionEngine {
    config: Config,
    store: Arc<WalletStore>,
    ledger: Arc<dyn Ledger>,
    log: Arc<TransactionLog>,
    notifications: Arc<NotificationLedger>,
    notifier: Arc<dyn Notifier>,
}

impl TransactionEngine {
    pub fn new(
        config: Config,
        store: Arc<WalletStore>,
        ledger: Arc<dyn Ledger>,
        log: Arc<TransactionLog>,
        notifications: Arc<NotificationLedger>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            log,
            notifications,
            notifier,
        }
    }

    /// Pull the wallet and its plaintext secret, or fail before anything
    /// touches the network.
    async fn usable_wallet(&self, identity: &str, index: usize) -> Result<(Wallet, Secret)> {
        let wallet = self.store.wallet(identity, index).await?;
        let secret = wallet.secret().cloned().ok_or(Error::Decrypt)?;
        Ok((wallet, secret))
    }

    /// Send `amount` token base units from one of the identity's wallets.
    /// Callers converting user input use [`crate::types::parse_amount`], so
    /// fractional amounts like "0.5" arrive here exact.
    ///
    /// Returns the canonical record, which has been appended to the sender's
    /// history before any notification is attempted. Notification failures
    /// are logged and never fail the transfer.
    pub async fn execute_transfer(
        &self,
        identity: &str,
        wallet_index: usize,
        recipient: Address,
        amount: u128,
    ) -> Result<TransactionRecord> {
        let (wallet, secret) = self.usable_wallet(identity, wallet_index).await?;

        let hash = self
            .ledger
            .transfer_token(secret.expose(), wallet.address, recipient, amount)
            .await?;
        tracing::info!(identity, %hash, "transfer submitted");

        let receipt = self.ledger.await_receipt(hash).await?;

        // Prefer the contract's own Transfer event; fall back to what we
        // submitted when the receipt carries no decodable log.
        let record = match eth::decode_transfer(&receipt, self.config.token_contract) {
            Some(event) => TransactionRecord {
                hash,
                from: event.from,
                to: event.to,
                value: event.value,
                recorded_at: Utc::now(),
            },
            None => TransactionRecord {
                hash,
                from: wallet.address,
                to: recipient,
                value: amount,
                recorded_at: Utc::now(),
            },
        };
        self.log.append(identity, record.clone()).await?;
        tracing::info!(identity, %hash, value = record.value, "transfer recorded");

        self.notify_recipient(&record).await;
        Ok(record)
    }

    /// Tell the recipient, if they are one of ours and have not already been
    /// told about this hash. Every failure here is logged and swallowed.
    async fn notify_recipient(&self, record: &TransactionRecord) {
        let Some(recipient_identity) = self.store.find_identity_by_address(record.to).await else {
            return;
        };
        if self
            .notifications
            .has_notified(&recipient_identity, record.hash)
            .await
        {
            return;
        }

        let amount = format_base_units(record.value, self.config.token_decimals);
        let message = format!(
            "You received {amount} {} from {}",
            self.config.token_symbol, record.from
        );
        if let Err(e) = self.notifier.deliver(&recipient_identity, &message).await {
            tracing::warn!(identity = %recipient_identity, hash = %record.hash, error = %e,
                "notification delivery failed");
            return;
        }
        if let Err(e) = self
            .notifications
            .record_notified(&recipient_identity, record.hash)
            .await
        {
            tracing::warn!(identity = %recipient_identity, hash = %record.hash, error = %e,
                "failed to persist notification marker");
        }
    }

    /// Buy tokens with `amount_wei` of native currency from the identity's
    /// primary wallet. The on-chain referrer is the primary-wallet address
    /// of the recorded referrer identity, or the zero address when there is
    /// none.
    pub async fn purchase_tokens(&self, identity: &str, amount_wei: u128) -> Result<TransactionRecord> {
        let (wallet, secret) = self.usable_wallet(identity, 0).await?;
        let referrer_address = match &wallet.referrer {
            Some(referrer_identity) => self
                .store
                .wallet(referrer_identity, 0)
                .await
                .map(|w| w.address)
                .unwrap_or(Address::ZERO),
            None => Address::ZERO,
        };

        let hash = self
            .ledger
            .purchase_with_native(secret.expose(), wallet.address, amount_wei, referrer_address)
            .await?;
        tracing::info!(identity, %hash, "purchase submitted");

        let receipt = self.ledger.await_receipt(hash).await?;
        let record = match eth::decode_transfer(&receipt, self.config.token_contract) {
            Some(event) => TransactionRecord {
                hash,
                from: event.from,
                to: event.to,
                value: event.value,
                recorded_at: Utc::now(),
            },
            None => TransactionRecord {
                hash,
                from: self.config.token_contract,
                to: wallet.address,
                value: 0,
                recorded_at: Utc::now(),
            },
        };
        self.log.append(identity, record.clone()).await?;
        Ok(record)
    }

    /// Import an externally held secret as a new named wallet. The address
    /// is derived from the secret, never taken from the caller.
    pub async fn import_wallet(&self, identity: &str, secret: &str, name: &str) -> Result<Address> {
        let normalized = crate::config::normalize_secret(secret)?;
        let address = eth::address_of(&normalized)?;
        let wallet = Wallet {
            address,
            name: name.to_string(),
            key: WalletKey::Plain(Secret::new(normalized)),
            secret_password: cipher::generate_wallet_password(),
            referrer: None,
        };
        self.store.upsert_wallet(identity, wallet).await?;
        tracing::info!(identity, %address, "wallet imported");
        Ok(address)
    }

    /// Record a referral for the identity's primary wallet by code.
    pub async fn apply_referral(
        &self,
        identity: &str,
        code: &str,
        registry: &ReferralRegistry,
    ) -> Result<()> {
        let referrer = registry
            .resolve(code)
            .ok_or_else(|| Error::NotFound(format!("unknown referral code {code}")))?;
        self.store.set_referrer(identity, referrer.clone()).await
    }

    /// Point-in-time native and token balances summed across all of the
    /// identity's wallets.
    pub async fn total_balances(&self, identity: &str) -> Result<(u128, u128)> {
        let account: Account = self.store.account(identity).await?;
        let mut native = 0u128;
        let mut token = 0u128;
        for wallet in &account.wallets {
            native += self.ledger.native_balance(wallet.address).await?;
            token += self.ledger.token_balance(wallet.address).await?;
        }
        Ok((native, token))
    }

    /// Confirmed transfer history for the identity, oldest first.
    pub async fn history(&self, identity: &str) -> Vec<TransactionRecord> {
        self.log.for_identity(identity).await
    }
}

/// Creates an identity's first wallet exactly once and seeds it from the
/// treasury.
pub struct AccountProvisioner {
    config: Config,
    store: Arc<WalletStore>,
    ledger: Arc<dyn Ledger>,
}

impl AccountProvisioner {
    pub fn new(config: Config, store: Arc<WalletStore>, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            config,
            store,
            ledger,
        }
    }

    /// Provision the identity if it has no wallet yet, returning the
    /// primary wallet either way. Key generation happens outside the store
    /// lock; the check-and-create is atomic, so a lost race discards the
    /// spare key material and grants are attempted at most once per
    /// identity.
    ///
    /// Grants are best effort: a treasury failure is logged and the account
    /// stands, unfunded.
    pub async fn provision_account(
        &self,
        identity: &str,
        email: Option<String>,
        origin_ip: Option<String>,
    ) -> Result<Wallet> {
        let (secret, address) = eth::generate_keypair();
        let wallet = Wallet {
            address,
            name: "Wallet 1".to_string(),
            key: WalletKey::Plain(secret),
            secret_password: cipher::generate_wallet_password(),
            referrer: None,
        };

        let created = self
            .store
            .create_account_if_absent(identity, email, origin_ip, wallet.clone())
            .await?;
        if !created {
            tracing::debug!(identity, "already provisioned");
            return self.store.wallet(identity, 0).await;
        }
        tracing::info!(identity, %address, "account provisioned");

        self.fund(identity, address).await;
        Ok(wallet)
    }

    async fn fund(&self, identity: &str, address: Address) {
        let treasury_secret = self.config.treasury_secret.expose();
        if let Err(e) = self
            .ledger
            .send_native(
                treasury_secret,
                self.config.treasury_address,
                address,
                self.config.native_grant,
            )
            .await
        {
            tracing::warn!(identity, error = %e, "native grant failed");
        }
        if let Err(e) = self
            .ledger
            .transfer_token(
                treasury_secret,
                self.config.treasury_address,
                address,
                self.config.token_grant,
            )
            .await
        {
            tracing::warn!(identity, error = %e, "token grant failed");
        }
    }
}
