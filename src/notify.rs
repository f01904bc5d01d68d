//! Recipient notifications and their idempotence ledger.
//!
//! The ledger records which transaction hashes an identity has already been
//! told about, so a crash-and-replay of a transfer pipeline never produces a
//! duplicate message. Recording is durable before the engine moves on.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::types::{Identity, TxHash};

/// Outbound delivery channel for recipient notifications. The transport
/// (chat platform, email, webhook) lives outside this core.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, identity: &str, message: &str) -> Result<()>;
}

/// Durable set of (identity, transaction hash) pairs already notified.
pub struct NotificationLedger {
    path: PathBuf,
    inner: Mutex<HashMap<Identity, HashSet<String>>>,
}

impl NotificationLedger {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let seen = if path.exists() {
            let json = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&json)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            inner: Mutex::new(seen),
        })
    }

    pub async fn has_notified(&self, identity: &str, hash: TxHash) -> bool {
        self.inner
            .lock()
            .await
            .get(identity)
            .map(|hashes| hashes.contains(&hash.to_string()))
            .unwrap_or(false)
    }

    /// Mark the pair as notified and persist. Idempotent: marking an
    /// already-notified pair is a no-op.
    pub async fn record_notified(&self, identity: &str, hash: TxHash) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inserted = guard
            .entry(identity.to_string())
            .or_default()
            .insert(hash.to_string());
        if !inserted {
            return Ok(());
        }

        let json = serde_json::to_string_pretty(&*guard)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn records_are_idempotent_and_durable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notifications.json");
        let hash = TxHash([9u8; 32]);

        {
            let ledger = NotificationLedger::open(&path).await.unwrap();
            assert!(!ledger.has_notified("u1", hash).await);
            ledger.record_notified("u1", hash).await.unwrap();
            ledger.record_notified("u1", hash).await.unwrap();
            assert!(ledger.has_notified("u1", hash).await);
        }

        let ledger = NotificationLedger::open(&path).await.unwrap();
        assert!(ledger.has_notified("u1", hash).await);
        assert!(!ledger.has_notified("u2", hash).await);
        assert!(!ledger.has_notified("u1", TxHash([8u8; 32])).await);
    }
}
