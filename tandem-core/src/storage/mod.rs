// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable coordinator records.
//!
//! [`CoordinatorStorage`] is the only surface the driver, pipeline and
//! server see. [`KvStorage`] implements it once over any [`StorageBackend`],
//! so the in-memory and redb variants share record handling.

mod backend;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub use backend::{
    MemoryBackend, RedbBackend, StorageBackend, ALL_TABLES, NONCES_TABLE, SESSIONS_TABLE,
    WALLET_BACKUPS_TABLE, WALLET_SHARES_TABLE,
};

use crate::error::{Result, TandemError};
use crate::types::ProtocolKind;

/// Encrypted server share for one wallet. The share is never stored in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletShareRecord {
    pub wallet_id: String,
    pub app_id: Option<String>,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    /// Hex-encoded compressed group key.
    pub public_key: Option<String>,
    pub encrypted_server_share: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewWalletShare {
    pub wallet_id: String,
    pub app_id: Option<String>,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub public_key: Option<String>,
    pub encrypted_server_share: String,
}

/// Fields left `None` keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletShareUpdate {
    pub app_id: Option<String>,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub public_key: Option<String>,
    pub encrypted_server_share: Option<String>,
}

/// Custodial backup fragment plus the third-party ciphertext metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBackupRecord {
    pub wallet_id: String,
    pub ciphertext_kind: String,
    pub ciphertext_curve: String,
    pub ciphertext_scheme: String,
    pub ciphertext_key_id: String,
    pub threshold: u32,
    pub share_count: u32,
    /// Base64.
    pub label: String,
    /// Base64.
    pub blob: String,
    pub encrypted_coordinator_fragment: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWalletBackup {
    pub wallet_id: String,
    pub ciphertext_kind: String,
    pub ciphertext_curve: String,
    pub ciphertext_scheme: String,
    pub ciphertext_key_id: String,
    pub threshold: u32,
    pub share_count: u32,
    pub label: String,
    pub blob: String,
    pub encrypted_coordinator_fragment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub wallet_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: ProtocolKind,
    pub state: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[async_trait]
pub trait CoordinatorStorage: Send + Sync {
    async fn get_wallet_share(&self, wallet_id: &str) -> Result<Option<WalletShareRecord>>;
    /// Creates or replaces the record for `share.wallet_id`.
    async fn save_wallet_share(&self, share: NewWalletShare) -> Result<WalletShareRecord>;
    /// Fails with [`TandemError::WalletNotFound`] when nothing is stored; keeps `created_at`.
    async fn update_wallet_share(
        &self,
        wallet_id: &str,
        update: WalletShareUpdate,
    ) -> Result<WalletShareRecord>;

    /// Expired records read as absent.
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;
    async fn save_session(&self, record: SessionRecord) -> Result<()>;
    async fn delete_session(&self, session_id: &str) -> Result<()>;

    /// Zero when no counter has been written.
    async fn get_nonce(&self, wallet_id: &str) -> Result<u64>;
    async fn set_nonce(&self, wallet_id: &str, value: u64) -> Result<()>;

    async fn get_wallet_backup(&self, wallet_id: &str) -> Result<Option<WalletBackupRecord>>;
    /// Creates or replaces the backup for `backup.wallet_id`; keeps `created_at`.
    async fn upsert_wallet_backup(&self, backup: NewWalletBackup) -> Result<WalletBackupRecord>;
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| TandemError::storage(format!("corrupt record: {e}")))
}

fn read<T: DeserializeOwned>(
    backend: &dyn StorageBackend,
    table: &str,
    key: &str,
) -> Result<Option<T>> {
    backend
        .get(table, key.as_bytes())?
        .map(|bytes| decode(&bytes))
        .transpose()
}

fn write<T: Serialize>(
    backend: &dyn StorageBackend,
    table: &str,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    backend.put(table, key.as_bytes(), &bytes)
}

/// Typed records over a key/value backend.
pub struct KvStorage<B> {
    backend: Arc<B>,
}

pub type MemoryStorage = KvStorage<MemoryBackend>;
pub type RedbStorage = KvStorage<RedbBackend>;

impl<B> Clone for KvStorage<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl KvStorage<MemoryBackend> {
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }
}

impl KvStorage<RedbBackend> {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(RedbBackend::open(path)?))
    }
}

impl<B: StorageBackend + 'static> KvStorage<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Direct backend access, bypassing record semantics.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&B) -> Result<T> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || op(&backend))
            .await
            .map_err(|e| TandemError::storage(format!("storage task failed: {e}")))?
    }
}

#[async_trait]
impl<B: StorageBackend + 'static> CoordinatorStorage for KvStorage<B> {
    async fn get_wallet_share(&self, wallet_id: &str) -> Result<Option<WalletShareRecord>> {
        let wallet_id = wallet_id.to_string();
        self.blocking(move |b| read(b, WALLET_SHARES_TABLE, &wallet_id))
            .await
    }

    async fn save_wallet_share(&self, share: NewWalletShare) -> Result<WalletShareRecord> {
        self.blocking(move |b| {
            let now = Utc::now();
            let record = WalletShareRecord {
                wallet_id: share.wallet_id,
                app_id: share.app_id,
                user_id: share.user_id,
                device_id: share.device_id,
                public_key: share.public_key,
                encrypted_server_share: share.encrypted_server_share,
                created_at: now,
                updated_at: now,
            };
            write(b, WALLET_SHARES_TABLE, &record.wallet_id, &record)?;
            debug!(wallet_id = %record.wallet_id, "wallet share saved");
            Ok(record)
        })
        .await
    }

    async fn update_wallet_share(
        &self,
        wallet_id: &str,
        update: WalletShareUpdate,
    ) -> Result<WalletShareRecord> {
        let wallet_id = wallet_id.to_string();
        self.blocking(move |b| {
            let mut record: WalletShareRecord = read(b, WALLET_SHARES_TABLE, &wallet_id)?
                .ok_or_else(|| TandemError::WalletNotFound(wallet_id.clone()))?;
            if let Some(v) = update.app_id {
                record.app_id = Some(v);
            }
            if let Some(v) = update.user_id {
                record.user_id = Some(v);
            }
            if let Some(v) = update.device_id {
                record.device_id = Some(v);
            }
            if let Some(v) = update.public_key {
                record.public_key = Some(v);
            }
            if let Some(v) = update.encrypted_server_share {
                record.encrypted_server_share = v;
            }
            record.updated_at = Utc::now();
            write(b, WALLET_SHARES_TABLE, &wallet_id, &record)?;
            debug!(wallet_id = %wallet_id, "wallet share updated");
            Ok(record)
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let session_id = session_id.to_string();
        self.blocking(move |b| {
            let Some(record) = read::<SessionRecord>(b, SESSIONS_TABLE, &session_id)? else {
                return Ok(None);
            };
            // Expiry is logical; the row stays until it is overwritten or deleted.
            if record.is_expired_at(Utc::now()) {
                trace!(session_id = %session_id, "session record expired");
                return Ok(None);
            }
            Ok(Some(record))
        })
        .await
    }

    async fn save_session(&self, record: SessionRecord) -> Result<()> {
        self.blocking(move |b| write(b, SESSIONS_TABLE, &record.session_id, &record))
            .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let session_id = session_id.to_string();
        self.blocking(move |b| b.delete(SESSIONS_TABLE, session_id.as_bytes()).map(|_| ()))
            .await
    }

    async fn get_nonce(&self, wallet_id: &str) -> Result<u64> {
        let wallet_id = wallet_id.to_string();
        self.blocking(move |b| Ok(read::<u64>(b, NONCES_TABLE, &wallet_id)?.unwrap_or(0)))
            .await
    }

    async fn set_nonce(&self, wallet_id: &str, value: u64) -> Result<()> {
        let wallet_id = wallet_id.to_string();
        self.blocking(move |b| write(b, NONCES_TABLE, &wallet_id, &value))
            .await
    }

    async fn get_wallet_backup(&self, wallet_id: &str) -> Result<Option<WalletBackupRecord>> {
        let wallet_id = wallet_id.to_string();
        self.blocking(move |b| read(b, WALLET_BACKUPS_TABLE, &wallet_id))
            .await
    }

    async fn upsert_wallet_backup(&self, backup: NewWalletBackup) -> Result<WalletBackupRecord> {
        if backup.threshold > backup.share_count {
            return Err(TandemError::BackupValidation(format!(
                "backup threshold {} exceeds share count {}",
                backup.threshold, backup.share_count
            )));
        }
        self.blocking(move |b| {
            let now = Utc::now();
            let created_at = read::<WalletBackupRecord>(b, WALLET_BACKUPS_TABLE, &backup.wallet_id)?
                .map(|existing| existing.created_at)
                .unwrap_or(now);
            let record = WalletBackupRecord {
                wallet_id: backup.wallet_id,
                ciphertext_kind: backup.ciphertext_kind,
                ciphertext_curve: backup.ciphertext_curve,
                ciphertext_scheme: backup.ciphertext_scheme,
                ciphertext_key_id: backup.ciphertext_key_id,
                threshold: backup.threshold,
                share_count: backup.share_count,
                label: backup.label,
                blob: backup.blob,
                encrypted_coordinator_fragment: backup.encrypted_coordinator_fragment,
                created_at,
                updated_at: now,
            };
            write(b, WALLET_BACKUPS_TABLE, &record.wallet_id, &record)?;
            debug!(wallet_id = %record.wallet_id, "wallet backup upserted");
            Ok(record)
        })
        .await
    }
}
