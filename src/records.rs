//! Append-only transaction history, keyed by identity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::error::Result;
use crate::types::{Identity, TransactionRecord};

/// Durable per-identity transaction log. Records are appended after a
/// transfer confirms and are never mutated or deleted.
pub struct TransactionLog {
    path: PathBuf,
    inner: Mutex<HashMap<Identity, Vec<TransactionRecord>>>,
}

impl TransactionLog {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            let json = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&json)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            inner: Mutex::new(records),
        })
    }

    /// Append a confirmed record under the identity and persist.
    pub async fn append(&self, identity: &str, record: TransactionRecord) -> Result<()> {
        let mut guard = self.inner.lock().await;
        guard
            .entry(identity.to_string())
            .or_default()
            .push(record);
        write_document(&self.path, &guard).await
    }

    /// Full history for one identity, oldest first. Unknown identities have
    /// an empty history, not an error.
    pub async fn for_identity(&self, identity: &str) -> Vec<TransactionRecord> {
        self.inner
            .lock()
            .await
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }
}

async fn write_document(
    path: &Path,
    records: &HashMap<Identity, Vec<TransactionRecord>>,
) -> Result<()> {
    let json = serde_json::to_string_pretty(records)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("tmp");
    tokio::fs::write(&temp_path, &json).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}
