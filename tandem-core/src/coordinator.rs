// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DKG, signing and refresh with server-share persistence.
//!
//! Wraps [`RoundDriver`] with the storage side: after a DKG the server's
//! share is exported, sealed and saved; signing can load it back; refresh
//! re-seals the rotated share under the same wallet.

use std::sync::Arc;

use rand::RngCore;
use tracing::{debug, info, warn};

use crate::crypto::KeyEncryptor;
use crate::driver::{release_key, DriveMode, DriverConfig, PartyKeys, RoundDriver};
use crate::engine::{
    KeyHandle, ProtocolContext, RefreshOptions, SignOptions, SignatureFormat, KEY_ID_SIZE,
};
use crate::error::{Result, TandemError};
use crate::storage::{CoordinatorStorage, NewWalletShare, WalletShareRecord, WalletShareUpdate};
use crate::transport::Transport;

/// Identifies where a server share is persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletMetadata {
    pub wallet_id: String,
    pub app_id: Option<String>,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
}

impl WalletMetadata {
    pub fn new(wallet_id: impl Into<String>) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DkgRequest {
    /// Random when absent.
    pub key_id: Option<[u8; KEY_ID_SIZE]>,
    pub session_id: Option<String>,
    pub mode: DriveMode,
    /// Persist the server share under this wallet. Ignored unless the server runs locally.
    pub metadata: Option<WalletMetadata>,
}

impl DkgRequest {
    pub fn new(mode: DriveMode) -> Self {
        Self {
            key_id: None,
            session_id: None,
            mode,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DkgResult {
    pub key_id: [u8; KEY_ID_SIZE],
    /// Compressed group key.
    pub public_key: Vec<u8>,
    pub keys: PartyKeys,
    pub wallet: Option<WalletShareRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct SignRequest {
    pub keys: PartyKeys,
    pub message: Vec<u8>,
    pub format: SignatureFormat,
    pub session_id: Option<String>,
    pub extra_aad: Option<Vec<u8>>,
    /// Loads the stored server share when `keys.server` is empty, and bumps the wallet nonce.
    pub wallet_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshRequest {
    pub keys: PartyKeys,
    pub session_id: Option<String>,
    /// Loads the stored server share when `keys.server` is empty, and re-seals the result.
    pub wallet_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefreshResult {
    pub keys: PartyKeys,
    pub public_key: Vec<u8>,
    pub wallet: Option<WalletShareRecord>,
}

pub struct Coordinator {
    storage: Arc<dyn CoordinatorStorage>,
    encryptor: Arc<dyn KeyEncryptor>,
    config: DriverConfig,
}

impl Coordinator {
    pub fn new(storage: Arc<dyn CoordinatorStorage>, encryptor: Arc<dyn KeyEncryptor>) -> Self {
        Self {
            storage,
            encryptor,
            config: DriverConfig::default(),
        }
    }

    pub fn with_driver_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(&self) -> &Arc<dyn CoordinatorStorage> {
        &self.storage
    }

    pub fn encryptor(&self) -> &Arc<dyn KeyEncryptor> {
        &self.encryptor
    }

    pub fn driver_config(&self) -> &DriverConfig {
        &self.config
    }

    pub async fn run_dkg(
        &self,
        ctx: &dyn ProtocolContext,
        transport: &dyn Transport,
        request: DkgRequest,
    ) -> Result<DkgResult> {
        let key_id = request.key_id.unwrap_or_else(|| {
            let mut id = [0u8; KEY_ID_SIZE];
            rand::rngs::OsRng.fill_bytes(&mut id);
            id
        });
        let driver = RoundDriver::new(ctx, transport, &self.config);
        let keys = driver
            .dkg(key_id, request.session_id.as_deref(), request.mode)
            .await?;
        let public_key = ctx.public_key(
            keys.any()
                .ok_or_else(|| TandemError::engine("dkg produced no key"))?,
        )?;
        info!(
            key_id = %hex::encode(key_id),
            public_key = %hex::encode(&public_key),
            "dkg complete"
        );

        let wallet = match (request.metadata, keys.server) {
            (Some(metadata), Some(server)) => {
                Some(self.persist_server_share(ctx, server, metadata, &public_key).await?)
            }
            (Some(metadata), None) => {
                warn!(wallet_id = %metadata.wallet_id, "no local server share to persist");
                None
            }
            _ => None,
        };

        Ok(DkgResult {
            key_id,
            public_key,
            keys,
            wallet,
        })
    }

    async fn persist_server_share(
        &self,
        ctx: &dyn ProtocolContext,
        server: KeyHandle,
        metadata: WalletMetadata,
        public_key: &[u8],
    ) -> Result<WalletShareRecord> {
        let blob = zeroize::Zeroizing::new(ctx.export_key(server)?);
        let encrypted = self.encryptor.encrypt_share(&blob)?;
        let public_key = hex::encode(public_key);

        if self
            .storage
            .get_wallet_share(&metadata.wallet_id)
            .await?
            .is_some()
        {
            debug!(wallet_id = %metadata.wallet_id, "replacing stored server share");
            return self
                .storage
                .update_wallet_share(
                    &metadata.wallet_id,
                    WalletShareUpdate {
                        app_id: metadata.app_id,
                        user_id: metadata.user_id,
                        device_id: metadata.device_id,
                        public_key: Some(public_key),
                        encrypted_server_share: Some(encrypted),
                    },
                )
                .await;
        }
        self.storage
            .save_wallet_share(NewWalletShare {
                wallet_id: metadata.wallet_id,
                app_id: metadata.app_id,
                user_id: metadata.user_id,
                device_id: metadata.device_id,
                public_key: Some(public_key),
                encrypted_server_share: encrypted,
            })
            .await
    }

    /// Decrypts the stored server share for `wallet_id` into `ctx`.
    pub async fn load_server_key(
        &self,
        ctx: &dyn ProtocolContext,
        wallet_id: &str,
    ) -> Result<KeyHandle> {
        let record = self
            .storage
            .get_wallet_share(wallet_id)
            .await?
            .ok_or_else(|| TandemError::WalletNotFound(wallet_id.to_string()))?;
        let blob = self.encryptor.decrypt_share(&record.encrypted_server_share)?;
        let key = ctx.import_key(&blob)?;

        if let Some(expected) = &record.public_key {
            let actual = hex::encode(ctx.public_key(key)?);
            if !actual.eq_ignore_ascii_case(expected) {
                release_key(ctx, key);
                return Err(TandemError::InvalidKey(format!(
                    "stored share for {wallet_id} does not match its public key"
                )));
            }
        }
        Ok(key)
    }

    /// Server handle from the request, or one loaded from storage that the caller must release.
    async fn resolve_keys(
        &self,
        ctx: &dyn ProtocolContext,
        keys: PartyKeys,
        wallet_id: Option<&str>,
    ) -> Result<(PartyKeys, Option<KeyHandle>)> {
        match (keys.server, wallet_id) {
            (None, Some(wallet_id)) => {
                let loaded = self.load_server_key(ctx, wallet_id).await?;
                Ok((
                    PartyKeys {
                        server: Some(loaded),
                        ..keys
                    },
                    Some(loaded),
                ))
            }
            _ => Ok((keys, None)),
        }
    }

    pub async fn run_sign(
        &self,
        ctx: &dyn ProtocolContext,
        transport: &dyn Transport,
        request: SignRequest,
    ) -> Result<Vec<u8>> {
        let (keys, loaded) = self
            .resolve_keys(ctx, request.keys, request.wallet_id.as_deref())
            .await?;
        let opts = SignOptions {
            session_id: request.session_id,
            extra_aad: request.extra_aad,
        };
        let driver = RoundDriver::new(ctx, transport, &self.config);
        let result = driver
            .sign(keys, &request.message, &opts, request.format)
            .await;
        if let Some(key) = loaded {
            release_key(ctx, key);
        }
        let signature = result?;

        if let Some(wallet_id) = &request.wallet_id {
            let nonce = self.storage.get_nonce(wallet_id).await? + 1;
            self.storage.set_nonce(wallet_id, nonce).await?;
            debug!(wallet_id = %wallet_id, nonce, "signature produced");
        }
        Ok(signature)
    }

    pub async fn run_refresh(
        &self,
        ctx: &dyn ProtocolContext,
        transport: &dyn Transport,
        request: RefreshRequest,
    ) -> Result<RefreshResult> {
        let (keys, loaded) = self
            .resolve_keys(ctx, request.keys, request.wallet_id.as_deref())
            .await?;
        let result = self.refresh_inner(ctx, transport, keys, &request).await;
        if let Some(key) = loaded {
            release_key(ctx, key);
        }
        result
    }

    async fn refresh_inner(
        &self,
        ctx: &dyn ProtocolContext,
        transport: &dyn Transport,
        keys: PartyKeys,
        request: &RefreshRequest,
    ) -> Result<RefreshResult> {
        let before = ctx.public_key(
            keys.any()
                .ok_or_else(|| TandemError::engine("no local key handle supplied"))?,
        )?;
        let driver = RoundDriver::new(ctx, transport, &self.config);
        let opts = RefreshOptions {
            session_id: request.session_id.clone(),
        };
        let refreshed = driver.refresh(keys, &opts).await?;

        for key in refreshed.handles() {
            if ctx.public_key(key)? != before {
                for key in refreshed.handles() {
                    release_key(ctx, key);
                }
                return Err(TandemError::engine("refresh changed the group public key"));
            }
        }

        let wallet = match (&request.wallet_id, refreshed.server) {
            (Some(wallet_id), Some(server)) => {
                let blob = zeroize::Zeroizing::new(ctx.export_key(server)?);
                let update = WalletShareUpdate {
                    encrypted_server_share: Some(self.encryptor.encrypt_share(&blob)?),
                    ..Default::default()
                };
                Some(self.storage.update_wallet_share(wallet_id, update).await?)
            }
            _ => None,
        };
        info!(public_key = %hex::encode(&before), "refresh complete");

        Ok(RefreshResult {
            keys: refreshed,
            public_key: before,
            wallet,
        })
    }
}
