// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
#![forbid(unsafe_code)]

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TandemError {
    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Protocol stalled: {protocol} did not complete within {rounds} rounds")]
    ProtocolStall { protocol: &'static str, rounds: usize },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    BackupValidation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Decryption failed - authentication tag mismatch or malformed envelope")]
    DecryptionFailed,

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TandemError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Errors scoped to a single control message rather than the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BackupValidation(_) | Self::Storage(_))
    }
}

impl From<redb::DatabaseError> for TandemError {
    fn from(e: redb::DatabaseError) -> Self {
        TandemError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for TandemError {
    fn from(e: redb::TransactionError) -> Self {
        TandemError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for TandemError {
    fn from(e: redb::TableError) -> Self {
        TandemError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for TandemError {
    fn from(e: redb::StorageError) -> Self {
        TandemError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for TandemError {
    fn from(e: redb::CommitError) -> Self {
        TandemError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TandemError>;
