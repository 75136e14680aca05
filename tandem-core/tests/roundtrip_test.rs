// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
#![forbid(unsafe_code)]

use std::sync::Arc;

use tandem_core::coordinator::{DkgRequest, SignRequest, WalletMetadata};
use tandem_core::driver::{DriveMode, DriverConfig, PartyKeys, RoundDriver};
use tandem_core::engine::{
    verify_signature, LocalEngine, ProtocolEngine, RefreshOptions, SignOptions, SignatureFormat,
};
use tandem_core::storage::{CoordinatorStorage, RedbStorage};
use tandem_core::{Coordinator, EnvelopeEncryptor, InMemoryTransport, MemoryStorage, Participant};

const KEY_ID: [u8; 32] = [0x2a; 32];

#[tokio::test]
async fn test_dual_dkg_sign_refresh() {
    let ctx = LocalEngine.context();
    let transport = InMemoryTransport::new();
    let config = DriverConfig::default();
    let driver = RoundDriver::new(ctx.as_ref(), &transport, &config);

    let keys = driver.dkg(KEY_ID, None, DriveMode::Dual).await.unwrap();
    let device_pk = ctx.public_key(keys.device.unwrap()).unwrap();
    let server_pk = ctx.public_key(keys.server.unwrap()).unwrap();
    assert_eq!(device_pk, server_pk);
    assert_eq!(device_pk.len(), 33);

    let digest = [0x11u8; 32];
    for format in [SignatureFormat::Der, SignatureFormat::Raw] {
        let sig = driver
            .sign(keys, &digest, &SignOptions::default(), format)
            .await
            .unwrap();
        assert!(!sig.is_empty());
        assert!(verify_signature(&device_pk, &digest, &sig));
    }

    let refreshed = driver
        .refresh(keys, &RefreshOptions::default())
        .await
        .unwrap();
    assert_eq!(ctx.public_key(refreshed.device.unwrap()).unwrap(), device_pk);
    assert_ne!(
        ctx.export_key(refreshed.server.unwrap()).unwrap(),
        ctx.export_key(keys.server.unwrap()).unwrap()
    );

    let sig = driver
        .sign(refreshed, &digest, &SignOptions::default(), SignatureFormat::Raw)
        .await
        .unwrap();
    assert_eq!(sig.len(), 64);
    assert!(verify_signature(&device_pk, &digest, &sig));
    assert_eq!(transport.pending(Participant::Device), 0);
    assert_eq!(transport.pending(Participant::Server), 0);
}

#[tokio::test]
async fn test_export_import_preserves_identity() {
    let ctx = LocalEngine.context();
    let transport = InMemoryTransport::new();
    let config = DriverConfig::default();
    let keys = RoundDriver::new(ctx.as_ref(), &transport, &config)
        .dkg(KEY_ID, None, DriveMode::Dual)
        .await
        .unwrap();

    let blob = ctx.export_key(keys.device.unwrap()).unwrap();
    let elsewhere = LocalEngine.context();
    let imported = elsewhere.import_key(&blob).unwrap();
    assert_eq!(
        elsewhere.public_key(imported).unwrap(),
        ctx.public_key(keys.device.unwrap()).unwrap()
    );
    assert_eq!(elsewhere.export_key(imported).unwrap(), blob);
}

#[tokio::test]
async fn test_split_parties_over_shared_transport() {
    let device_ctx = LocalEngine.context();
    let server_ctx = LocalEngine.context();
    let transport = Arc::new(InMemoryTransport::new());
    let config = DriverConfig::default();

    let device = RoundDriver::new(device_ctx.as_ref(), transport.as_ref(), &config);
    let server = RoundDriver::new(server_ctx.as_ref(), transport.as_ref(), &config);

    let (device_keys, server_keys) = tokio::join!(
        device.dkg(KEY_ID, Some("split"), DriveMode::DeviceOnly),
        server.dkg(KEY_ID, Some("split"), DriveMode::ServerOnly),
    );
    let (device_keys, server_keys) = (device_keys.unwrap(), server_keys.unwrap());
    assert!(device_keys.server.is_none());
    assert!(server_keys.device.is_none());

    let pk = device_ctx.public_key(device_keys.device.unwrap()).unwrap();
    assert_eq!(server_ctx.public_key(server_keys.server.unwrap()).unwrap(), pk);

    let digest = [0x5au8; 32];
    let opts = SignOptions::default();
    let (device_sig, server_sig) = tokio::join!(
        device.sign(device_keys, &digest, &opts, SignatureFormat::Der),
        server.sign(server_keys, &digest, &opts, SignatureFormat::Der),
    );
    assert!(verify_signature(&pk, &digest, &device_sig.unwrap()));
    assert!(verify_signature(&pk, &digest, &server_sig.unwrap()));
}

#[tokio::test]
async fn test_coordinator_persists_and_reloads_from_redb() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coordinator.db");
    let encryptor = Arc::new(EnvelopeEncryptor::new([9u8; 32]));

    let (public_key, device_blob) = {
        let storage = Arc::new(RedbStorage::open(&path).unwrap());
        let coordinator = Coordinator::new(storage, encryptor.clone());
        let ctx = LocalEngine.context();
        let result = coordinator
            .run_dkg(
                ctx.as_ref(),
                &InMemoryTransport::new(),
                DkgRequest {
                    metadata: Some(WalletMetadata::new("wallet-1")),
                    ..DkgRequest::new(DriveMode::Dual)
                },
            )
            .await
            .unwrap();
        (
            result.public_key,
            ctx.export_key(result.keys.device.unwrap()).unwrap(),
        )
    };

    let storage = Arc::new(RedbStorage::open(&path).unwrap());
    let coordinator = Coordinator::new(storage.clone(), encryptor);
    let ctx = LocalEngine.context();
    let device = ctx.import_key(&device_blob).unwrap();

    let digest = [0x33u8; 32];
    for expected_nonce in 1..=2u64 {
        let sig = coordinator
            .run_sign(
                ctx.as_ref(),
                &InMemoryTransport::new(),
                SignRequest {
                    keys: PartyKeys::device(device),
                    message: digest.to_vec(),
                    format: SignatureFormat::Raw,
                    wallet_id: Some("wallet-1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(verify_signature(&public_key, &digest, &sig));
        assert_eq!(storage.get_nonce("wallet-1").await.unwrap(), expected_nonce);
    }
}

#[tokio::test]
async fn test_sign_with_unknown_wallet_fails() {
    let coordinator = Coordinator::new(
        Arc::new(MemoryStorage::in_memory()),
        Arc::new(EnvelopeEncryptor::new([1u8; 32])),
    );
    let ctx = LocalEngine.context();
    let keys = RoundDriver::new(ctx.as_ref(), &InMemoryTransport::new(), &DriverConfig::default())
        .dkg(KEY_ID, None, DriveMode::Dual)
        .await
        .unwrap();

    let err = coordinator
        .run_sign(
            ctx.as_ref(),
            &InMemoryTransport::new(),
            SignRequest {
                keys: PartyKeys::device(keys.device.unwrap()),
                message: vec![0u8; 32],
                wallet_id: Some("missing".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, tandem_core::TandemError::WalletNotFound(_)));
    assert_eq!(
        coordinator.storage().get_nonce("missing").await.unwrap(),
        0
    );
}
