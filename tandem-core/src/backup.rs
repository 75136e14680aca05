// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `backup-share` control messages.
//!
//! A device may hand the coordinator a recovery fragment during DKG. The
//! fragment arrives on the same connection as protocol bytes, so every
//! device-channel payload is checked here first; only JSON objects whose
//! `type` is `backup-share` are consumed. Failures are answered with an error
//! ack and never end the session.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::crypto::KeyEncryptor;
use crate::encoding::{decode_binary, to_base64, BinaryEncoding};
use crate::error::{Result, TandemError};
use crate::storage::{CoordinatorStorage, NewWalletBackup, WalletBackupRecord};
use crate::transport::{ControlInterceptor, Frame, Interception};

pub const BACKUP_SHARE_TYPE: &str = "backup-share";
pub const BACKUP_ACK_TYPE: &str = "backup-share:ack";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupAck {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "keyId")]
    pub key_id: Option<String>,
    #[serde(flatten)]
    pub status: AckStatus,
}

impl BackupAck {
    fn new(key_id: Option<String>, status: AckStatus) -> Self {
        Self {
            kind: BACKUP_ACK_TYPE.to_string(),
            key_id,
            status,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok
    }
}

fn invalid(msg: impl Into<String>) -> TandemError {
    TandemError::BackupValidation(msg.into())
}

fn text<'v>(obj: &'v Map<String, Value>, field: &str) -> Option<&'v str> {
    obj.get(field).and_then(Value::as_str)
}

fn non_empty<'v>(obj: &'v Map<String, Value>, field: &str) -> Option<&'v str> {
    text(obj, field).map(str::trim).filter(|s| !s.is_empty())
}

fn count(value: Option<&Value>) -> Option<u32> {
    let value = value?;
    let n = value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0)
            .map(|f| f as u64)
    })?;
    u32::try_from(n).ok()
}

fn encoding(obj: &Map<String, Value>, field: &str) -> Result<Option<BinaryEncoding>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|_| invalid(format!("backup-share {field} unsupported"))),
    }
}

fn decode_field(value: &str, encoding: Option<BinaryEncoding>, field: &str) -> Result<Vec<u8>> {
    decode_binary(value, encoding)
        .map_err(|attempted| invalid(format!("backup-share {field} invalid {attempted}")))
}

/// Validates, seals and stores backup fragments.
pub struct BackupPipeline {
    storage: Arc<dyn CoordinatorStorage>,
    encryptor: Arc<dyn KeyEncryptor>,
}

impl BackupPipeline {
    pub fn new(storage: Arc<dyn CoordinatorStorage>, encryptor: Arc<dyn KeyEncryptor>) -> Self {
        Self { storage, encryptor }
    }

    /// Returns `None` when `payload` is not a backup-share message.
    ///
    /// `intent_key_id` is the session's key id, used when the message names no wallet.
    pub async fn handle(&self, payload: &[u8], intent_key_id: Option<&str>) -> Option<BackupAck> {
        let value: Value = serde_json::from_slice(payload).ok()?;
        let obj = value.as_object()?;
        if text(obj, "type") != Some(BACKUP_SHARE_TYPE) {
            return None;
        }

        let ack_key_id = text(obj, "keyId")
            .or_else(|| text(obj, "walletId"))
            .map(str::to_string);

        let status = match self.store(obj, intent_key_id).await {
            Ok(record) => {
                info!(wallet_id = %record.wallet_id, "backup share stored");
                AckStatus::Ok
            }
            Err(e) => {
                warn!(key_id = ?ack_key_id, error = %e, "backup share rejected");
                AckStatus::Error {
                    message: e.to_string(),
                }
            }
        };
        Some(BackupAck::new(ack_key_id, status))
    }

    async fn store(
        &self,
        obj: &Map<String, Value>,
        intent_key_id: Option<&str>,
    ) -> Result<WalletBackupRecord> {
        let backup = self.validate(obj, intent_key_id)?;
        self.storage.upsert_wallet_backup(backup).await
    }

    fn validate(
        &self,
        obj: &Map<String, Value>,
        intent_key_id: Option<&str>,
    ) -> Result<NewWalletBackup> {
        let wallet_id = non_empty(obj, "walletId")
            .or_else(|| non_empty(obj, "keyId"))
            .or_else(|| intent_key_id.map(str::trim).filter(|s| !s.is_empty()))
            .ok_or_else(|| invalid("backup-share missing wallet identifier"))?;

        let fragment_text = text(obj, "fragment")
            .or_else(|| text(obj, "share"))
            .ok_or_else(|| invalid("backup-share missing fragment payload"))?;
        let fragment = decode_field(
            fragment_text,
            encoding(obj, "fragmentEncoding")?,
            "fragment",
        )?;
        if fragment.is_empty() {
            return Err(invalid("backup-share missing fragment payload"));
        }

        let ciphertext = obj
            .get("ciphertext")
            .and_then(Value::as_object)
            .ok_or_else(|| invalid("backup-share missing ciphertext"))?;

        let metadata = (
            non_empty(ciphertext, "kind"),
            non_empty(ciphertext, "curve"),
            non_empty(ciphertext, "scheme"),
            non_empty(ciphertext, "keyId"),
            text(ciphertext, "label"),
            text(ciphertext, "blob"),
        );
        let (Some(kind), Some(curve), Some(scheme), Some(key_id), Some(label), Some(blob)) =
            metadata
        else {
            return Err(invalid("backup-share ciphertext missing metadata"));
        };

        let (Some(threshold), Some(share_count)) = (
            count(ciphertext.get("threshold")),
            count(ciphertext.get("shareCount")),
        ) else {
            return Err(invalid(
                "backup-share ciphertext missing threshold/shareCount",
            ));
        };
        if threshold == 0 || threshold > share_count {
            return Err(invalid(format!(
                "backup-share ciphertext threshold {threshold} invalid for shareCount {share_count}"
            )));
        }

        let label = decode_field(label, encoding(ciphertext, "labelEncoding")?, "label")?;
        let blob = decode_field(blob, encoding(ciphertext, "blobEncoding")?, "blob")?;

        let encrypted_coordinator_fragment = self.encryptor.encrypt_share(&fragment)?;

        Ok(NewWalletBackup {
            wallet_id: wallet_id.to_string(),
            ciphertext_kind: kind.to_string(),
            ciphertext_curve: curve.to_string(),
            ciphertext_scheme: scheme.to_string(),
            ciphertext_key_id: key_id.to_string(),
            threshold,
            share_count,
            label: to_base64(&label),
            blob: to_base64(&blob),
            encrypted_coordinator_fragment,
        })
    }
}

/// Adapts [`BackupPipeline`] to the socket transport's control hook for one session.
pub struct BackupInterceptor {
    pipeline: Arc<BackupPipeline>,
    intent_key_id: Option<String>,
    stored: Arc<Notify>,
}

impl BackupInterceptor {
    pub fn new(
        pipeline: Arc<BackupPipeline>,
        intent_key_id: Option<String>,
        stored: Arc<Notify>,
    ) -> Self {
        Self {
            pipeline,
            intent_key_id,
            stored,
        }
    }
}

#[async_trait]
impl ControlInterceptor for BackupInterceptor {
    async fn intercept(&self, payload: &[u8]) -> Interception {
        let Some(ack) = self
            .pipeline
            .handle(payload, self.intent_key_id.as_deref())
            .await
        else {
            return Interception::Forward;
        };
        if ack.is_ok() {
            self.stored.notify_one();
        }
        match serde_json::to_string(&ack) {
            Ok(text) => Interception::Handled(Some(Frame::Text(text))),
            Err(e) => {
                warn!(error = %e, "failed to encode backup ack");
                Interception::Handled(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PassthroughEncryptor;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn pipeline() -> (BackupPipeline, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::in_memory());
        let pipeline = BackupPipeline::new(storage.clone(), Arc::new(PassthroughEncryptor));
        (pipeline, storage)
    }

    fn envelope() -> Value {
        json!({
            "type": "backup-share",
            "walletId": "wallet-1",
            "ciphertext": {
                "kind": "shamir",
                "curve": "secp256k1",
                "scheme": "ecdsa",
                "keyId": "abc",
                "threshold": 2,
                "shareCount": 3,
                "label": "6c6162656c",
                "blob": "YmxvYg==",
            },
            "fragment": "0a0b0c",
        })
    }

    async fn run(pipeline: &BackupPipeline, value: &Value, intent: Option<&str>) -> BackupAck {
        pipeline
            .handle(value.to_string().as_bytes(), intent)
            .await
            .expect("backup-share should be intercepted")
    }

    #[tokio::test]
    async fn test_stores_sealed_fragment() {
        let (pipeline, storage) = pipeline();
        let ack = run(&pipeline, &envelope(), None).await;
        assert_eq!(ack.status, AckStatus::Ok);
        assert_eq!(ack.key_id.as_deref(), Some("wallet-1"));

        let record = storage.get_wallet_backup("wallet-1").await.unwrap().unwrap();
        assert_eq!(record.label, to_base64(b"label"));
        assert_eq!(record.blob, to_base64(b"blob"));
        assert_eq!(record.encrypted_coordinator_fragment, to_base64(&[10, 11, 12]));
        assert_eq!((record.threshold, record.share_count), (2, 3));
    }

    #[tokio::test]
    async fn test_non_control_payloads_pass_through() {
        let (pipeline, _) = pipeline();
        assert!(pipeline.handle(&[0x01, 0x02], None).await.is_none());
        assert!(pipeline.handle(b"{\"type\":\"hello\"}", None).await.is_none());
        assert!(pipeline.handle(b"[1,2]", None).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_fragment_is_error_ack_without_record() {
        let (pipeline, storage) = pipeline();
        let mut value = envelope();
        value["fragment"] = json!("not*hex*or*base64!");
        let ack = run(&pipeline, &value, None).await;
        assert_eq!(
            ack.status,
            AckStatus::Error {
                message: "backup-share fragment invalid base64".into()
            }
        );
        assert!(storage.get_wallet_backup("wallet-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_message_leaves_existing_record() {
        let (pipeline, storage) = pipeline();
        assert!(run(&pipeline, &envelope(), None).await.is_ok());
        let before = storage.get_wallet_backup("wallet-1").await.unwrap();

        let mut value = envelope();
        value["ciphertext"]["threshold"] = json!("two");
        assert!(!run(&pipeline, &value, None).await.is_ok());
        assert_eq!(storage.get_wallet_backup("wallet-1").await.unwrap(), before);
    }

    async fn expect_error(pipeline: &BackupPipeline, mutate: impl FnOnce(&mut Value), expected: &str) {
        let mut value = envelope();
        mutate(&mut value);
        let ack = run(pipeline, &value, None).await;
        assert_eq!(
            ack.status,
            AckStatus::Error {
                message: expected.into()
            }
        );
    }

    #[tokio::test]
    async fn test_validation_messages() {
        let (pipeline, _) = pipeline();
        expect_error(
            &pipeline,
            |v| {
                v.as_object_mut().unwrap().remove("walletId");
            },
            "backup-share missing wallet identifier",
        )
        .await;
        expect_error(
            &pipeline,
            |v| {
                v.as_object_mut().unwrap().remove("fragment");
            },
            "backup-share missing fragment payload",
        )
        .await;
        expect_error(
            &pipeline,
            |v| {
                v.as_object_mut().unwrap().remove("ciphertext");
            },
            "backup-share missing ciphertext",
        )
        .await;
        expect_error(
            &pipeline,
            |v| {
                v["ciphertext"].as_object_mut().unwrap().remove("curve");
            },
            "backup-share ciphertext missing metadata",
        )
        .await;
        expect_error(
            &pipeline,
            |v| {
                v["ciphertext"].as_object_mut().unwrap().remove("shareCount");
            },
            "backup-share ciphertext missing threshold/shareCount",
        )
        .await;
        expect_error(
            &pipeline,
            |v| v["ciphertext"]["blobEncoding"] = json!("hex"),
            "backup-share blob invalid hex",
        )
        .await;
        expect_error(
            &pipeline,
            |v| v["fragmentEncoding"] = json!("base32"),
            "backup-share fragmentEncoding unsupported",
        )
        .await;
    }

    #[tokio::test]
    async fn test_explicit_label_encoding() {
        let (pipeline, storage) = pipeline();
        let mut value = envelope();
        value["ciphertext"]["label"] = json!("abcd");
        value["ciphertext"]["labelEncoding"] = json!("base64");
        assert!(run(&pipeline, &value, None).await.is_ok());
        let record = storage.get_wallet_backup("wallet-1").await.unwrap().unwrap();
        assert_eq!(record.label, "abcd");
    }

    #[tokio::test]
    async fn test_threshold_above_share_count_rejected() {
        let (pipeline, storage) = pipeline();
        let mut value = envelope();
        value["ciphertext"]["threshold"] = json!(4);
        assert!(!run(&pipeline, &value, None).await.is_ok());
        assert!(storage.get_wallet_backup("wallet-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wallet_falls_back_to_intent_key() {
        let (pipeline, storage) = pipeline();
        let mut value = envelope();
        value.as_object_mut().unwrap().remove("walletId");
        value["share"] = value["fragment"].take();
        value.as_object_mut().unwrap().remove("fragment");

        let ack = run(&pipeline, &value, Some(" intent-key ")).await;
        assert!(ack.is_ok());
        assert_eq!(ack.key_id, None);
        assert!(storage.get_wallet_backup("intent-key").await.unwrap().is_some());
    }

    #[test]
    fn test_ack_wire_format() {
        let ok = BackupAck::new(None, AckStatus::Ok);
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"type": "backup-share:ack", "keyId": null, "status": "ok"})
        );
        let err = BackupAck::new(
            Some("k".into()),
            AckStatus::Error {
                message: "bad".into(),
            },
        );
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"type": "backup-share:ack", "keyId": "k", "status": "error", "message": "bad"})
        );
    }

    #[tokio::test]
    async fn test_interceptor_signals_stored_backup() {
        let (pipeline, _) = pipeline();
        let stored = Arc::new(Notify::new());
        let interceptor = BackupInterceptor::new(Arc::new(pipeline), None, stored.clone());

        let handled = interceptor
            .intercept(envelope().to_string().as_bytes())
            .await;
        let Interception::Handled(Some(Frame::Text(ack))) = handled else {
            panic!("expected an ack frame");
        };
        assert!(ack.contains("\"status\":\"ok\""));
        // permit left by notify_one
        stored.notified().await;

        assert!(matches!(
            interceptor.intercept(b"\x01\x02").await,
            Interception::Forward
        ));
    }
}
