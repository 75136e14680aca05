// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
#![forbid(unsafe_code)]

//! Drives engine sessions to completion over a [`Transport`].
//!
//! In dual mode both parties live in this process and are serviced
//! device first, then server, once per round. In the single-party modes only
//! one engine is local and the driver waits on its inbox between steps.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::engine::{
    DkgOptions, KeyHandle, ProtocolContext, RefreshOptions, SessionHandle, SignOptions,
    SignatureFormat, KEY_ID_SIZE,
};
use crate::error::{Result, TandemError};
use crate::transport::{Transport, TransportMessage};
use crate::types::{Participant, ProtocolKind};

pub const DUAL_ROUND_BUDGET: usize = 128;
pub const SINGLE_ROUND_BUDGET: usize = 512;
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub dual_round_budget: usize,
    pub single_round_budget: usize,
    pub poll_interval: Duration,
    /// Longest a single-party round waits for its next inbound message.
    pub receive_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            dual_round_budget: DUAL_ROUND_BUDGET,
            single_round_budget: SINGLE_ROUND_BUDGET,
            poll_interval: POLL_INTERVAL,
            receive_timeout: RECEIVE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    Dual,
    DeviceOnly,
    ServerOnly,
}

impl DriveMode {
    pub fn local_parties(&self) -> &'static [Participant] {
        match self {
            Self::Dual => &Participant::BOTH,
            Self::DeviceOnly => &[Participant::Device],
            Self::ServerOnly => &[Participant::Server],
        }
    }
}

/// Key handles for whichever parties run locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartyKeys {
    pub device: Option<KeyHandle>,
    pub server: Option<KeyHandle>,
}

impl PartyKeys {
    pub fn both(device: KeyHandle, server: KeyHandle) -> Self {
        Self {
            device: Some(device),
            server: Some(server),
        }
    }

    pub fn device(device: KeyHandle) -> Self {
        Self {
            device: Some(device),
            server: None,
        }
    }

    pub fn server(server: KeyHandle) -> Self {
        Self {
            device: None,
            server: Some(server),
        }
    }

    pub fn get(&self, participant: Participant) -> Option<KeyHandle> {
        match participant {
            Participant::Device => self.device,
            Participant::Server => self.server,
        }
    }

    fn set(&mut self, participant: Participant, key: KeyHandle) {
        match participant {
            Participant::Device => self.device = Some(key),
            Participant::Server => self.server = Some(key),
        }
    }

    pub fn mode(&self) -> Result<DriveMode> {
        match (self.device, self.server) {
            (Some(_), Some(_)) => Ok(DriveMode::Dual),
            (Some(_), None) => Ok(DriveMode::DeviceOnly),
            (None, Some(_)) => Ok(DriveMode::ServerOnly),
            (None, None) => Err(TandemError::engine("no local key handle supplied")),
        }
    }

    /// Any present handle; every local party reports the same group key.
    pub fn any(&self) -> Option<KeyHandle> {
        self.device.or(self.server)
    }

    pub fn handles(&self) -> impl Iterator<Item = KeyHandle> {
        self.device.into_iter().chain(self.server)
    }
}

/// Frees `key`, logging any failure.
pub(crate) fn release_key(ctx: &dyn ProtocolContext, key: KeyHandle) {
    if let Err(e) = ctx.free_key(key) {
        warn!(key = ?key, error = %e, "failed to free engine key");
    }
}

/// Frees its engine session when dropped, so every exit path releases it once.
struct SessionGuard<'a> {
    ctx: &'a dyn ProtocolContext,
    participant: Participant,
    handle: SessionHandle,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.free_session(self.handle) {
            warn!(participant = %self.participant, error = %e, "failed to free engine session");
        }
    }
}

pub struct RoundDriver<'a> {
    ctx: &'a dyn ProtocolContext,
    transport: &'a dyn Transport,
    config: &'a DriverConfig,
}

impl<'a> RoundDriver<'a> {
    pub fn new(
        ctx: &'a dyn ProtocolContext,
        transport: &'a dyn Transport,
        config: &'a DriverConfig,
    ) -> Self {
        Self {
            ctx,
            transport,
            config,
        }
    }

    fn open<F>(&self, mode: DriveMode, mut create: F) -> Result<Vec<SessionGuard<'a>>>
    where
        F: FnMut(Participant) -> Result<SessionHandle>,
    {
        let mut guards = Vec::with_capacity(2);
        for &participant in mode.local_parties() {
            guards.push(SessionGuard {
                ctx: self.ctx,
                participant,
                handle: create(participant)?,
            });
        }
        Ok(guards)
    }

    fn finalize_keys(&self, sessions: &[SessionGuard<'a>]) -> Result<PartyKeys> {
        let mut keys = PartyKeys::default();
        for session in sessions {
            match self.ctx.finalize_key(session.handle) {
                Ok(key) => keys.set(session.participant, key),
                Err(e) => {
                    for key in keys.handles() {
                        release_key(self.ctx, key);
                    }
                    return Err(e);
                }
            }
        }
        Ok(keys)
    }

    pub async fn dkg(
        &self,
        key_id: [u8; KEY_ID_SIZE],
        session_id: Option<&str>,
        mode: DriveMode,
    ) -> Result<PartyKeys> {
        let sessions = self.open(mode, |role| {
            self.ctx.dkg_new(&DkgOptions {
                role,
                key_id,
                session_id: session_id.map(str::to_string),
            })
        })?;
        self.run(ProtocolKind::Dkg, mode, &sessions).await?;
        self.finalize_keys(&sessions)
    }

    pub async fn sign(
        &self,
        keys: PartyKeys,
        message: &[u8],
        opts: &SignOptions,
        format: SignatureFormat,
    ) -> Result<Vec<u8>> {
        let mode = keys.mode()?;
        let sessions = self.open(mode, |participant| {
            let key = keys
                .get(participant)
                .ok_or_else(|| TandemError::engine(format!("missing {participant} key")))?;
            self.ctx.sign_new(key, opts)
        })?;
        for session in &sessions {
            self.ctx.sign_set_message(session.handle, message)?;
        }
        self.run(ProtocolKind::Sign, mode, &sessions).await?;

        let first = sessions
            .first()
            .ok_or_else(|| TandemError::engine("no signing session"))?;
        self.ctx.finalize_signature(first.handle, format)
    }

    pub async fn refresh(&self, keys: PartyKeys, opts: &RefreshOptions) -> Result<PartyKeys> {
        let mode = keys.mode()?;
        let sessions = self.open(mode, |participant| {
            let key = keys
                .get(participant)
                .ok_or_else(|| TandemError::engine(format!("missing {participant} key")))?;
            self.ctx.refresh_new(key, opts)
        })?;
        self.run(ProtocolKind::Refresh, mode, &sessions).await?;
        self.finalize_keys(&sessions)
    }

    async fn run(
        &self,
        kind: ProtocolKind,
        mode: DriveMode,
        sessions: &[SessionGuard<'a>],
    ) -> Result<()> {
        match (mode, sessions) {
            (DriveMode::Dual, _) => self.run_dual(kind, sessions).await,
            (_, [session]) => self.run_single(kind, session).await,
            _ => Err(TandemError::engine("single-party mode needs exactly one session")),
        }
    }

    async fn run_dual(&self, kind: ProtocolKind, sessions: &[SessionGuard<'a>]) -> Result<()> {
        let budget = self.config.dual_round_budget;
        let mut done = [false; 2];

        for round in 0..budget {
            for session in sessions {
                let participant = session.participant;
                if done[participant.index()] {
                    continue;
                }
                let inbound = self.transport.receive(participant).await?;
                let output = self.ctx.step(session.handle, inbound.as_deref())?;
                if let Some(payload) = output.outbound {
                    self.transport
                        .send(TransportMessage::new(participant.peer(), payload))
                        .await?;
                }
                done[participant.index()] = output.done;
            }
            if sessions.iter().all(|s| done[s.participant.index()]) {
                debug!(protocol = %kind, rounds = round + 1, "protocol complete");
                return Ok(());
            }
        }

        warn!(protocol = %kind, rounds = budget, "protocol stalled");
        Err(TandemError::ProtocolStall {
            protocol: kind.as_str(),
            rounds: budget,
        })
    }

    async fn run_single(&self, kind: ProtocolKind, session: &SessionGuard<'a>) -> Result<()> {
        let budget = self.config.single_round_budget;
        let participant = session.participant;
        let mut inbound: Option<Vec<u8>> = None;

        for round in 0..budget {
            let output = self.ctx.step(session.handle, inbound.take().as_deref())?;
            if let Some(payload) = output.outbound {
                self.transport
                    .send(TransportMessage::new(participant.peer(), payload))
                    .await?;
            }
            if output.done {
                debug!(protocol = %kind, %participant, rounds = round + 1, "protocol complete");
                return Ok(());
            }
            inbound = Some(self.wait_for_message(kind, participant, round + 1).await?);
        }

        warn!(protocol = %kind, %participant, rounds = budget, "protocol stalled");
        Err(TandemError::ProtocolStall {
            protocol: kind.as_str(),
            rounds: budget,
        })
    }

    async fn wait_for_message(
        &self,
        kind: ProtocolKind,
        participant: Participant,
        rounds: usize,
    ) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.config.receive_timeout;
        loop {
            if let Some(message) = self.transport.receive(participant).await? {
                return Ok(message);
            }
            if Instant::now() >= deadline {
                warn!(protocol = %kind, %participant, rounds, "timed out waiting for peer");
                return Err(TandemError::ProtocolStall {
                    protocol: kind.as_str(),
                    rounds,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
