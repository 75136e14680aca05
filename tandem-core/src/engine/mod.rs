// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handle-based stepping interface to the cryptographic protocol engine.
//!
//! The orchestration layer never looks inside protocol messages or key
//! material; it creates sessions, feeds inbound bytes to [`ProtocolContext::step`],
//! relays whatever comes out, and finalizes once a party reports `done`.
//! Handles are opaque arena tokens owned by the context and must be freed
//! exactly once.

mod local;

use std::sync::Arc;

pub use local::{verify_signature, LocalEngine};

use crate::error::Result;
use crate::types::Participant;

pub const KEY_ID_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureFormat {
    #[default]
    Der,
    /// `r || s`, 32 bytes each.
    Raw,
}

impl std::str::FromStr for SignatureFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "der" => Ok(Self::Der),
            "raw" | "raw_rs" => Ok(Self::Raw),
            other => Err(format!("unknown signature format: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DkgOptions {
    pub role: Participant,
    pub key_id: [u8; KEY_ID_SIZE],
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SignOptions {
    pub session_id: Option<String>,
    pub extra_aad: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    pub outbound: Option<Vec<u8>>,
    pub done: bool,
}

/// Per-session engine state container.
pub trait ProtocolContext: Send + Sync {
    fn dkg_new(&self, opts: &DkgOptions) -> Result<SessionHandle>;
    fn sign_new(&self, key: KeyHandle, opts: &SignOptions) -> Result<SessionHandle>;
    fn sign_set_message(&self, session: SessionHandle, message: &[u8]) -> Result<()>;
    fn refresh_new(&self, key: KeyHandle, opts: &RefreshOptions) -> Result<SessionHandle>;

    fn step(&self, session: SessionHandle, inbound: Option<&[u8]>) -> Result<StepOutput>;

    /// Completes a DKG or refresh session.
    fn finalize_key(&self, session: SessionHandle) -> Result<KeyHandle>;
    fn finalize_signature(&self, session: SessionHandle, format: SignatureFormat)
        -> Result<Vec<u8>>;

    fn export_key(&self, key: KeyHandle) -> Result<Vec<u8>>;
    fn import_key(&self, blob: &[u8]) -> Result<KeyHandle>;
    /// Compressed SEC1 group public key.
    fn public_key(&self, key: KeyHandle) -> Result<Vec<u8>>;

    fn free_session(&self, session: SessionHandle) -> Result<()>;
    fn free_key(&self, key: KeyHandle) -> Result<()>;

    /// Releases everything the context still holds. Safe to call twice.
    fn shutdown(&self);
}

pub trait ProtocolEngine: Send + Sync {
    fn context(&self) -> Arc<dyn ProtocolContext>;
}
