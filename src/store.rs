//! Authoritative wallet store.
//!
//! Owns the in-memory identity→account map and its durable JSON document.
//! The two representations are never the same: a save always encrypts every
//! plaintext secret through [`crate::cipher`], a load always decrypts. Every
//! mutation runs a full read-modify-write cycle under one mutex, so two
//! concurrent provisioning attempts can never both observe "no wallet" and
//! overwrite each other's save; `reload` can never interleave with an
//! in-flight save.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::cipher;
use crate::error::{Error, Result};
use crate::types::{Account, Address, Identity, StoredAccount, StoredWallet, Wallet, WalletKey};

pub struct WalletStore {
    path: PathBuf,
    inner: Mutex<HashMap<Identity, Account>>,
}

impl WalletStore {
    /// Open the store, decrypting the durable document into memory.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let accounts = read_document(&path).await?;
        tracing::info!(accounts = accounts.len(), path = %path.display(), "wallet store loaded");
        Ok(Self {
            path,
            inner: Mutex::new(accounts),
        })
    }

    /// Cloned snapshot of the current in-memory map.
    pub async fn get(&self) -> HashMap<Identity, Account> {
        self.inner.lock().await.clone()
    }

    /// Re-read durable storage, discarding any in-memory state that was
    /// never saved. Held under the same mutex as `save`, so the two can
    /// never interleave.
    pub async fn reload(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        *guard = read_document(&self.path).await?;
        Ok(())
    }

    /// Persist the current in-memory map, re-encrypting every secret.
    pub async fn save(&self) -> Result<()> {
        let guard = self.inner.lock().await;
        write_document(&self.path, &guard).await
    }

    pub async fn account(&self, identity: &str) -> Result<Account> {
        self.inner
            .lock()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no account for identity {identity}")))
    }

    pub async fn wallet(&self, identity: &str, index: usize) -> Result<Wallet> {
        let guard = self.inner.lock().await;
        let account = guard
            .get(identity)
            .ok_or_else(|| Error::NotFound(format!("no account for identity {identity}")))?;
        account
            .wallets
            .get(index)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("identity {identity} has no wallet {index}")))
    }

    /// Insert the wallet under the identity, creating the account when the
    /// identity is new (imported wallets may arrive before provisioning).
    pub async fn upsert_wallet(&self, identity: &str, wallet: Wallet) -> Result<()> {
        let mut guard = self.inner.lock().await;
        guard
            .entry(identity.to_string())
            .or_default()
            .wallets
            .push(wallet);
        write_document(&self.path, &guard).await
    }

    /// Atomic check-and-create used by provisioning. Returns `false` without
    /// touching anything when the identity already has at least one wallet.
    pub async fn create_account_if_absent(
        &self,
        identity: &str,
        email: Option<String>,
        origin_ip: Option<String>,
        wallet: Wallet,
    ) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        if guard
            .get(identity)
            .map(|a| !a.wallets.is_empty())
            .unwrap_or(false)
        {
            return Ok(false);
        }
        guard.insert(
            identity.to_string(),
            Account {
                email,
                origin_ip,
                wallets: vec![wallet],
            },
        );
        write_document(&self.path, &guard).await?;
        Ok(true)
    }

    pub async fn rename_wallet(&self, identity: &str, index: usize, new_name: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let wallet = guard
            .get_mut(identity)
            .ok_or_else(|| Error::NotFound(format!("no account for identity {identity}")))?
            .wallets
            .get_mut(index)
            .ok_or_else(|| Error::NotFound(format!("identity {identity} has no wallet {index}")))?;
        wallet.name = new_name.to_string();
        write_document(&self.path, &guard).await
    }

    /// Point the identity's primary wallet at a referrer identity.
    pub async fn set_referrer(&self, identity: &str, referrer: Identity) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let wallet = guard
            .get_mut(identity)
            .ok_or_else(|| Error::NotFound(format!("no account for identity {identity}")))?
            .wallets
            .get_mut(0)
            .ok_or_else(|| Error::NotFound(format!("identity {identity} has no wallets")))?;
        wallet.referrer = Some(referrer);
        write_document(&self.path, &guard).await
    }

    /// Reverse lookup: which identity owns this address, if any.
    pub async fn find_identity_by_address(&self, address: Address) -> Option<Identity> {
        let guard = self.inner.lock().await;
        guard.iter().find_map(|(identity, account)| {
            account
                .wallets
                .iter()
                .any(|w| w.address == address)
                .then(|| identity.clone())
        })
    }
}

/// Decrypt the durable document into the in-memory model. A wallet whose
/// ciphertext does not decrypt with its own password is kept as
/// [`WalletKey::Locked`] and the rest of the load proceeds.
async fn read_document(path: &Path) -> Result<HashMap<Identity, Account>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let json = tokio::fs::read_to_string(path).await?;
    let stored: HashMap<Identity, StoredAccount> = serde_json::from_str(&json)?;

    let mut accounts = HashMap::with_capacity(stored.len());
    for (identity, stored_account) in stored {
        let mut account = Account {
            email: stored_account.email,
            origin_ip: stored_account.origin_ip,
            wallets: Vec::with_capacity(stored_account.wallets.len()),
        };
        for stored_wallet in stored_account.wallets {
            let key = match cipher::decrypt(&stored_wallet.private_key, &stored_wallet.password) {
                Ok(plaintext) => WalletKey::Plain(crate::types::Secret::new(plaintext)),
                Err(_) => {
                    tracing::warn!(
                        identity = %identity,
                        address = %stored_wallet.address,
                        "wallet secret failed to decrypt; marking unusable"
                    );
                    WalletKey::Locked(stored_wallet.private_key)
                }
            };
            account.wallets.push(Wallet {
                address: stored_wallet.address,
                name: stored_wallet.name,
                key,
                secret_password: stored_wallet.password,
                referrer: stored_wallet.referrer,
            });
        }
        accounts.insert(identity, account);
    }
    Ok(accounts)
}

/// Encrypt the in-memory model into the durable document and write it
/// atomically (temp file + rename). The document never contains plaintext.
async fn write_document(path: &Path, accounts: &HashMap<Identity, Account>) -> Result<()> {
    let mut stored: HashMap<&str, StoredAccount> = HashMap::with_capacity(accounts.len());
    for (identity, account) in accounts {
        let wallets = account
            .wallets
            .iter()
            .map(|wallet| StoredWallet {
                private_key: match &wallet.key {
                    WalletKey::Plain(secret) => {
                        cipher::encrypt(secret.expose(), &wallet.secret_password)
                    }
                    WalletKey::Locked(ciphertext) => ciphertext.clone(),
                },
                address: wallet.address,
                name: wallet.name.clone(),
                referrer: wallet.referrer.clone(),
                password: wallet.secret_password.clone(),
            })
            .collect();
        stored.insert(
            identity.as_str(),
            StoredAccount {
                email: account.email.clone(),
                origin_ip: account.origin_ip.clone(),
                wallets,
            },
        );
    }

    let json = serde_json::to_string_pretty(&stored)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("tmp");
    tokio::fs::write(&temp_path, &json).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

// ============ Referral registry ============

/// Read-only map of referral codes to the identities that own them.
/// Managed externally; this core only consults it.
pub struct ReferralRegistry {
    codes: HashMap<String, Identity>,
}

impl ReferralRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let codes = if path.exists() {
            let json = tokio::fs::read_to_string(path).await?;
            serde_json::from_str(&json)?
        } else {
            tracing::info!(path = %path.display(), "no referral codes file; registry empty");
            HashMap::new()
        };
        Ok(Self { codes })
    }

    pub fn resolve(&self, code: &str) -> Option<&Identity> {
        self.codes.get(code)
    }
}
