// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tandem Core - two-party MPC session orchestration
//!
//! This crate provides the coordinator-side building blocks:
//! - A handle-based adapter over a two-party ECDSA engine
//! - Transports: in-memory inboxes and a socket-backed transport with control interception
//! - A round driver for DKG, signing and refresh in dual or single-party mode
//! - A backup-share pipeline that validates and seals recovery fragments
//! - Share storage over redb or memory, with envelope encryption at rest

#![forbid(unsafe_code)]

pub mod backup;
pub mod coordinator;
pub mod crypto;
pub mod driver;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod storage;
pub mod transport;
pub mod types;

pub use backup::{BackupAck, BackupInterceptor, BackupPipeline};
pub use coordinator::{
    Coordinator, DkgRequest, DkgResult, RefreshRequest, RefreshResult, SignRequest,
    WalletMetadata,
};
pub use crypto::{EnvelopeEncryptor, KeyEncryptor, PassthroughEncryptor};
pub use driver::{DriveMode, DriverConfig, PartyKeys, RoundDriver};
pub use engine::{LocalEngine, ProtocolContext, ProtocolEngine, SignatureFormat};
pub use error::{Result, TandemError};
pub use storage::{CoordinatorStorage, MemoryStorage, RedbStorage};
pub use transport::{
    InMemoryTransport, SocketTransport, Transport, TransportMessage, INBOX_CAPACITY,
};
pub use types::{Participant, ProtocolKind};
