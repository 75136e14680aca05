// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
#![forbid(unsafe_code)]

//! Reference two-party engine over secp256k1.
//!
//! Shares are additive: the device holds `x_d`, the server `x_s`, and the
//! group key is `(x_d + x_s)·G`. Every exchange starts with a hash
//! commitment so neither party can choose its contribution after seeing
//! the other's.

use std::collections::HashMap;
use std::sync::Arc;

use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::point::{AffineCoordinates, DecompressPoint};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::PrimeField;
use k256::{AffinePoint, FieldBytes, NonZeroScalar, ProjectivePoint, PublicKey, Scalar, U256};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::{Choice, ConstantTimeEq};
use tracing::trace;

use super::{
    DkgOptions, KeyHandle, ProtocolContext, ProtocolEngine, RefreshOptions, SessionHandle,
    SignOptions, SignatureFormat, StepOutput, KEY_ID_SIZE,
};
use crate::error::{Result, TandemError};
use crate::types::Participant;

const POINT_SIZE: usize = 33;
const SCALAR_SIZE: usize = 32;
const BLOB_VERSION: u8 = 1;
const BLOB_SIZE: usize = 2 + KEY_ID_SIZE + SCALAR_SIZE + 2 * POINT_SIZE;

const MSG_COMMIT: u8 = 0x01;
const MSG_REVEAL: u8 = 0x02;
const MSG_PARTIAL: u8 = 0x03;
const MSG_CONTRIBUTION: u8 = 0x04;

fn engine_err(msg: impl Into<String>) -> TandemError {
    TandemError::engine(msg)
}

fn role_byte(role: Participant) -> u8 {
    match role {
        Participant::Device => 0x01,
        Participant::Server => 0x02,
    }
}

fn hash32(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let digest = hash32(parts);
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(digest))
}

fn random_scalar() -> Scalar {
    *NonZeroScalar::random(&mut OsRng)
}

fn encode_point(point: &ProjectivePoint) -> Result<[u8; POINT_SIZE]> {
    let encoded = point.to_affine().to_encoded_point(true);
    <[u8; POINT_SIZE]>::try_from(encoded.as_bytes())
        .map_err(|_| engine_err("cannot encode identity point"))
}

fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    PublicKey::from_sec1_bytes(bytes)
        .map(|pk| pk.to_projective())
        .map_err(|_| engine_err("invalid curve point"))
}

fn decode_scalar(bytes: &[u8]) -> Result<Scalar> {
    if bytes.len() != SCALAR_SIZE {
        return Err(engine_err("invalid scalar length"));
    }
    Option::<Scalar>::from(Scalar::from_repr(FieldBytes::clone_from_slice(bytes)))
        .ok_or_else(|| engine_err("scalar out of range"))
}

fn challenge(r_x: &[u8], group: &[u8], message: &[u8]) -> Scalar {
    hash_to_scalar(&[b"tandem/challenge", r_x, group, message])
}

enum Message {
    Commit([u8; 32]),
    Reveal([u8; POINT_SIZE]),
    Partial([u8; SCALAR_SIZE]),
    Contribution([u8; POINT_SIZE]),
}

impl Message {
    fn encode(&self) -> Vec<u8> {
        let (tag, body): (u8, &[u8]) = match self {
            Message::Commit(c) => (MSG_COMMIT, c.as_slice()),
            Message::Reveal(p) => (MSG_REVEAL, p.as_slice()),
            Message::Partial(s) => (MSG_PARTIAL, s.as_slice()),
            Message::Contribution(p) => (MSG_CONTRIBUTION, p.as_slice()),
        };
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(tag);
        out.extend_from_slice(body);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let (tag, body) = bytes
            .split_first()
            .ok_or_else(|| engine_err("empty protocol message"))?;
        let malformed = || engine_err(format!("malformed protocol message (tag {tag:#04x})"));
        match *tag {
            MSG_COMMIT => Ok(Message::Commit(body.try_into().map_err(|_| malformed())?)),
            MSG_REVEAL => Ok(Message::Reveal(body.try_into().map_err(|_| malformed())?)),
            MSG_PARTIAL => Ok(Message::Partial(body.try_into().map_err(|_| malformed())?)),
            MSG_CONTRIBUTION => Ok(Message::Contribution(
                body.try_into().map_err(|_| malformed())?,
            )),
            _ => Err(malformed()),
        }
    }
}

#[derive(Clone)]
struct KeyShare {
    role: Participant,
    key_id: [u8; KEY_ID_SIZE],
    secret: Scalar,
    own: ProjectivePoint,
    peer: ProjectivePoint,
}

impl Drop for KeyShare {
    fn drop(&mut self) {
        self.secret = Scalar::ZERO;
    }
}

impl KeyShare {
    fn group(&self) -> ProjectivePoint {
        self.own + self.peer
    }

    fn export(&self) -> Result<Vec<u8>> {
        let mut blob = Vec::with_capacity(BLOB_SIZE);
        blob.push(BLOB_VERSION);
        blob.push(role_byte(self.role));
        blob.extend_from_slice(&self.key_id);
        blob.extend_from_slice(&self.secret.to_bytes());
        blob.extend_from_slice(&encode_point(&self.own)?);
        blob.extend_from_slice(&encode_point(&self.peer)?);
        Ok(blob)
    }

    fn import(blob: &[u8]) -> Result<Self> {
        if blob.len() != BLOB_SIZE {
            return Err(engine_err(format!(
                "key blob must be {BLOB_SIZE} bytes, got {}",
                blob.len()
            )));
        }
        if blob[0] != BLOB_VERSION {
            return Err(engine_err(format!("unsupported key blob version {}", blob[0])));
        }
        let role = match blob[1] {
            0x01 => Participant::Device,
            0x02 => Participant::Server,
            other => return Err(engine_err(format!("unknown key role {other:#04x}"))),
        };
        let (key_id_bytes, rest) = blob[2..].split_at(KEY_ID_SIZE);
        let (secret_bytes, rest) = rest.split_at(SCALAR_SIZE);
        let (own_bytes, peer_bytes) = rest.split_at(POINT_SIZE);

        let mut key_id = [0u8; KEY_ID_SIZE];
        key_id.copy_from_slice(key_id_bytes);
        let secret = decode_scalar(secret_bytes)?;
        let own = decode_point(own_bytes)?;
        let peer = decode_point(peer_bytes)?;

        if ProjectivePoint::GENERATOR * secret != own {
            return Err(engine_err("key blob secret does not match its public share"));
        }
        Ok(Self {
            role,
            key_id,
            secret,
            own,
            peer,
        })
    }
}

/// Commit-then-reveal exchange of one point per party.
struct PointExchange {
    role: Participant,
    binding: [u8; 32],
    encoded: [u8; POINT_SIZE],
    sent_commit: bool,
    sent_reveal: bool,
    peer_commit: Option<[u8; 32]>,
    peer_point: Option<ProjectivePoint>,
}

impl PointExchange {
    fn new(role: Participant, binding: [u8; 32], point: &ProjectivePoint) -> Result<Self> {
        Ok(Self {
            role,
            binding,
            encoded: encode_point(point)?,
            sent_commit: false,
            sent_reveal: false,
            peer_commit: None,
            peer_point: None,
        })
    }

    fn commitment(&self, role: Participant, encoded: &[u8]) -> [u8; 32] {
        hash32(&[b"tandem/commit", &self.binding, &[role_byte(role)], encoded])
    }

    /// Returns `false` when the message belongs to a later phase.
    fn absorb(&mut self, msg: &Message) -> Result<bool> {
        match msg {
            Message::Commit(commit) => {
                if self.peer_commit.is_some() {
                    return Err(engine_err("duplicate commitment"));
                }
                self.peer_commit = Some(*commit);
                Ok(true)
            }
            Message::Reveal(encoded) => {
                let expected = self
                    .peer_commit
                    .ok_or_else(|| engine_err("reveal received before commitment"))?;
                if self.peer_point.is_some() {
                    return Err(engine_err("duplicate reveal"));
                }
                let actual = self.commitment(self.role.peer(), encoded);
                if !bool::from(actual.as_slice().ct_eq(expected.as_slice())) {
                    return Err(engine_err("peer reveal does not match its commitment"));
                }
                self.peer_point = Some(decode_point(encoded)?);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn next_message(&mut self) -> Option<Message> {
        if !self.sent_commit {
            self.sent_commit = true;
            return Some(Message::Commit(self.commitment(self.role, &self.encoded)));
        }
        if self.peer_commit.is_some() && !self.sent_reveal {
            self.sent_reveal = true;
            return Some(Message::Reveal(self.encoded));
        }
        None
    }

    fn complete(&self) -> bool {
        self.sent_reveal && self.peer_point.is_some()
    }
}

struct DkgSession {
    role: Participant,
    key_id: [u8; KEY_ID_SIZE],
    secret: Scalar,
    point: ProjectivePoint,
    exchange: PointExchange,
}

impl DkgSession {
    fn new(opts: &DkgOptions) -> Result<Self> {
        let secret = random_scalar();
        let point = ProjectivePoint::GENERATOR * secret;
        let session_id = opts.session_id.as_deref().unwrap_or_default();
        let binding = hash32(&[b"tandem/dkg", &opts.key_id, session_id.as_bytes()]);
        Ok(Self {
            role: opts.role,
            key_id: opts.key_id,
            secret,
            point,
            exchange: PointExchange::new(opts.role, binding, &point)?,
        })
    }

    fn step(&mut self, inbound: Option<Message>) -> Result<StepOutput> {
        if let Some(msg) = inbound {
            if !self.exchange.absorb(&msg)? {
                return Err(engine_err("unexpected message during dkg"));
            }
        }
        let outbound = self.exchange.next_message().map(|m| m.encode());
        Ok(StepOutput {
            outbound,
            done: self.exchange.complete(),
        })
    }

    fn finalize(&self) -> Result<KeyShare> {
        let peer = self
            .exchange
            .peer_point
            .filter(|_| self.exchange.complete())
            .ok_or_else(|| engine_err("dkg not complete"))?;
        Ok(KeyShare {
            role: self.role,
            key_id: self.key_id,
            secret: self.secret,
            own: self.point,
            peer,
        })
    }
}

struct SignContext {
    r_x: FieldBytes,
    challenge: Scalar,
    negate_nonce: bool,
}

struct SignSession {
    key: KeyShare,
    nonce: Scalar,
    nonce_point: ProjectivePoint,
    exchange: PointExchange,
    message: Option<Vec<u8>>,
    context: Option<SignContext>,
    own_partial: Option<Scalar>,
    peer_partial: Option<Scalar>,
}

impl SignSession {
    fn new(key: KeyShare, opts: &SignOptions) -> Result<Self> {
        let nonce = random_scalar();
        let nonce_point = ProjectivePoint::GENERATOR * nonce;
        let group = encode_point(&key.group())?;
        let binding = hash32(&[
            b"tandem/sign",
            &key.key_id,
            &group,
            opts.session_id.as_deref().unwrap_or_default().as_bytes(),
            opts.extra_aad.as_deref().unwrap_or_default(),
        ]);
        let exchange = PointExchange::new(key.role, binding, &nonce_point)?;
        Ok(Self {
            key,
            nonce,
            nonce_point,
            exchange,
            message: None,
            context: None,
            own_partial: None,
            peer_partial: None,
        })
    }

    fn set_message(&mut self, message: &[u8]) -> Result<()> {
        if self.context.is_some() {
            return Err(engine_err("message already bound to signing session"));
        }
        self.message = Some(message.to_vec());
        Ok(())
    }

    fn context(&mut self) -> Result<&SignContext> {
        if self.context.is_none() {
            let peer_nonce = self
                .exchange
                .peer_point
                .ok_or_else(|| engine_err("peer nonce not yet revealed"))?;
            let message = self
                .message
                .as_deref()
                .ok_or_else(|| engine_err("message not set for signing session"))?;
            let combined = (self.nonce_point + peer_nonce).to_affine();
            let negate_nonce: bool = combined.y_is_odd().into();
            let r_x = combined.x();
            let group = encode_point(&self.key.group())?;
            self.context = Some(SignContext {
                challenge: challenge(&r_x, &group, message),
                r_x,
                negate_nonce,
            });
        }
        self.context
            .as_ref()
            .ok_or_else(|| engine_err("signing context unavailable"))
    }

    fn absorb_partial(&mut self, encoded: &[u8; SCALAR_SIZE]) -> Result<()> {
        if self.peer_partial.is_some() {
            return Err(engine_err("duplicate partial signature"));
        }
        let partial = decode_scalar(encoded)?;
        let peer_share = self.key.peer;
        let peer_nonce = self
            .exchange
            .peer_point
            .ok_or_else(|| engine_err("partial signature before nonce reveal"))?;
        let ctx = self.context()?;
        let peer_nonce = if ctx.negate_nonce {
            -peer_nonce
        } else {
            peer_nonce
        };
        if ProjectivePoint::GENERATOR * partial != peer_nonce + peer_share * ctx.challenge {
            return Err(engine_err("peer partial signature failed verification"));
        }
        self.peer_partial = Some(partial);
        Ok(())
    }

    fn step(&mut self, inbound: Option<Message>) -> Result<StepOutput> {
        if let Some(msg) = inbound {
            if !self.exchange.absorb(&msg)? {
                match msg {
                    Message::Partial(encoded) => self.absorb_partial(&encoded)?,
                    _ => return Err(engine_err("unexpected message during sign")),
                }
            }
        }

        let outbound = if let Some(msg) = self.exchange.next_message() {
            Some(msg.encode())
        } else if self.exchange.complete() && self.own_partial.is_none() {
            let secret = self.key.secret;
            let nonce = self.nonce;
            let ctx = self.context()?;
            let nonce = if ctx.negate_nonce { -nonce } else { nonce };
            let partial = nonce + ctx.challenge * secret;
            self.own_partial = Some(partial);
            let encoded: [u8; SCALAR_SIZE] = partial.to_bytes().into();
            Some(Message::Partial(encoded).encode())
        } else {
            None
        };

        Ok(StepOutput {
            outbound,
            done: self.own_partial.is_some() && self.peer_partial.is_some(),
        })
    }

    fn finalize(&self, format: SignatureFormat) -> Result<Vec<u8>> {
        let (own, peer, ctx) = match (&self.own_partial, &self.peer_partial, &self.context) {
            (Some(own), Some(peer), Some(ctx)) => (own, peer, ctx),
            _ => return Err(engine_err("signing not complete")),
        };
        let s = *own + *peer;
        match format {
            SignatureFormat::Raw => {
                let mut out = Vec::with_capacity(64);
                out.extend_from_slice(&ctx.r_x);
                out.extend_from_slice(&s.to_bytes());
                Ok(out)
            }
            SignatureFormat::Der => {
                let sig = k256::ecdsa::Signature::from_scalars(ctx.r_x, s.to_bytes())
                    .map_err(|e| engine_err(format!("cannot encode signature: {e}")))?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
        }
    }
}

struct RefreshSession {
    key: KeyShare,
    binding: [u8; 32],
    ephemeral: Scalar,
    encoded: [u8; POINT_SIZE],
    sent: bool,
    delta: Option<Scalar>,
}

impl RefreshSession {
    fn new(key: KeyShare, opts: &RefreshOptions) -> Result<Self> {
        let ephemeral = random_scalar();
        let encoded = encode_point(&(ProjectivePoint::GENERATOR * ephemeral))?;
        let group = encode_point(&key.group())?;
        let binding = hash32(&[
            b"tandem/refresh",
            &key.key_id,
            &group,
            opts.session_id.as_deref().unwrap_or_default().as_bytes(),
        ]);
        Ok(Self {
            key,
            binding,
            ephemeral,
            encoded,
            sent: false,
            delta: None,
        })
    }

    fn step(&mut self, inbound: Option<Message>) -> Result<StepOutput> {
        match inbound {
            Some(Message::Contribution(encoded)) => {
                if self.delta.is_some() {
                    return Err(engine_err("duplicate refresh contribution"));
                }
                let shared = (decode_point(&encoded)? * self.ephemeral).to_affine();
                self.delta = Some(hash_to_scalar(&[
                    b"tandem/refresh-delta",
                    &self.binding,
                    &shared.x(),
                ]));
            }
            Some(_) => return Err(engine_err("unexpected message during refresh")),
            None => {}
        }
        let outbound = if self.sent {
            None
        } else {
            self.sent = true;
            Some(Message::Contribution(self.encoded).encode())
        };
        Ok(StepOutput {
            outbound,
            done: self.sent && self.delta.is_some(),
        })
    }

    fn finalize(&self) -> Result<KeyShare> {
        let delta = self
            .delta
            .filter(|_| self.sent)
            .ok_or_else(|| engine_err("refresh not complete"))?;
        let shift = ProjectivePoint::GENERATOR * delta;
        let mut next = self.key.clone();
        match next.role {
            Participant::Device => {
                next.secret += delta;
                next.own += shift;
                next.peer -= shift;
            }
            Participant::Server => {
                next.secret -= delta;
                next.own -= shift;
                next.peer += shift;
            }
        }
        Ok(next)
    }
}

enum EngineSession {
    Dkg(DkgSession),
    Sign(Box<SignSession>),
    Refresh(RefreshSession),
}

#[derive(Default)]
struct Arena {
    next_id: u64,
    sessions: HashMap<u64, EngineSession>,
    keys: HashMap<u64, KeyShare>,
    closed: bool,
}

impl Arena {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(engine_err("protocol context has been shut down"));
        }
        Ok(())
    }

    fn alloc(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_session(&mut self, session: EngineSession) -> SessionHandle {
        let id = self.alloc();
        self.sessions.insert(id, session);
        SessionHandle(id)
    }

    fn insert_key(&mut self, key: KeyShare) -> KeyHandle {
        let id = self.alloc();
        self.keys.insert(id, key);
        KeyHandle(id)
    }

    fn key(&self, handle: KeyHandle) -> Result<&KeyShare> {
        self.ensure_open()?;
        self.keys
            .get(&handle.0)
            .ok_or_else(|| engine_err(format!("unknown key handle {}", handle.0)))
    }

    fn session(&mut self, handle: SessionHandle) -> Result<&mut EngineSession> {
        self.ensure_open()?;
        self.sessions
            .get_mut(&handle.0)
            .ok_or_else(|| engine_err(format!("unknown session handle {}", handle.0)))
    }
}

/// One arena of sessions and keys; see [`LocalEngine`].
pub struct LocalContext {
    arena: Mutex<Arena>,
}

impl LocalContext {
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
        }
    }
}

impl Default for LocalContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolContext for LocalContext {
    fn dkg_new(&self, opts: &DkgOptions) -> Result<SessionHandle> {
        let mut arena = self.arena.lock();
        arena.ensure_open()?;
        let session = DkgSession::new(opts)?;
        Ok(arena.insert_session(EngineSession::Dkg(session)))
    }

    fn sign_new(&self, key: KeyHandle, opts: &SignOptions) -> Result<SessionHandle> {
        let mut arena = self.arena.lock();
        let share = arena.key(key)?.clone();
        let session = SignSession::new(share, opts)?;
        Ok(arena.insert_session(EngineSession::Sign(Box::new(session))))
    }

    fn sign_set_message(&self, session: SessionHandle, message: &[u8]) -> Result<()> {
        match self.arena.lock().session(session)? {
            EngineSession::Sign(sign) => sign.set_message(message),
            _ => Err(engine_err("not a signing session")),
        }
    }

    fn refresh_new(&self, key: KeyHandle, opts: &RefreshOptions) -> Result<SessionHandle> {
        let mut arena = self.arena.lock();
        let share = arena.key(key)?.clone();
        let session = RefreshSession::new(share, opts)?;
        Ok(arena.insert_session(EngineSession::Refresh(session)))
    }

    fn step(&self, session: SessionHandle, inbound: Option<&[u8]>) -> Result<StepOutput> {
        let inbound = inbound.map(Message::decode).transpose()?;
        let mut arena = self.arena.lock();
        let output = match arena.session(session)? {
            EngineSession::Dkg(dkg) => dkg.step(inbound),
            EngineSession::Sign(sign) => sign.step(inbound),
            EngineSession::Refresh(refresh) => refresh.step(inbound),
        }?;
        trace!(
            handle = session.0,
            outbound = output.outbound.as_ref().map(|m| m.len()),
            done = output.done,
            "engine step"
        );
        Ok(output)
    }

    fn finalize_key(&self, session: SessionHandle) -> Result<KeyHandle> {
        let mut arena = self.arena.lock();
        let share = match arena.session(session)? {
            EngineSession::Dkg(dkg) => dkg.finalize()?,
            EngineSession::Refresh(refresh) => refresh.finalize()?,
            EngineSession::Sign(_) => {
                return Err(engine_err("signing sessions finalize to a signature"))
            }
        };
        Ok(arena.insert_key(share))
    }

    fn finalize_signature(
        &self,
        session: SessionHandle,
        format: SignatureFormat,
    ) -> Result<Vec<u8>> {
        match self.arena.lock().session(session)? {
            EngineSession::Sign(sign) => sign.finalize(format),
            _ => Err(engine_err("not a signing session")),
        }
    }

    fn export_key(&self, key: KeyHandle) -> Result<Vec<u8>> {
        self.arena.lock().key(key)?.export()
    }

    fn import_key(&self, blob: &[u8]) -> Result<KeyHandle> {
        let share = KeyShare::import(blob)?;
        let mut arena = self.arena.lock();
        arena.ensure_open()?;
        Ok(arena.insert_key(share))
    }

    fn public_key(&self, key: KeyHandle) -> Result<Vec<u8>> {
        let group = self.arena.lock().key(key)?.group();
        Ok(encode_point(&group)?.to_vec())
    }

    fn free_session(&self, session: SessionHandle) -> Result<()> {
        let mut arena = self.arena.lock();
        arena.ensure_open()?;
        arena
            .sessions
            .remove(&session.0)
            .map(|_| ())
            .ok_or_else(|| engine_err(format!("session handle {} already freed", session.0)))
    }

    fn free_key(&self, key: KeyHandle) -> Result<()> {
        let mut arena = self.arena.lock();
        arena.ensure_open()?;
        arena
            .keys
            .remove(&key.0)
            .map(|_| ())
            .ok_or_else(|| engine_err(format!("key handle {} already freed", key.0)))
    }

    fn shutdown(&self) {
        let mut arena = self.arena.lock();
        if arena.closed {
            return;
        }
        trace!(
            sessions = arena.sessions.len(),
            keys = arena.keys.len(),
            "protocol context shutdown"
        );
        arena.sessions.clear();
        arena.keys.clear();
        arena.closed = true;
    }
}

/// Engine producing [`LocalContext`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalEngine;

impl ProtocolEngine for LocalEngine {
    fn context(&self) -> Arc<dyn ProtocolContext> {
        Arc::new(LocalContext::new())
    }
}

/// Checks a signature produced by [`LocalEngine`] against a compressed group key.
///
/// Accepts both raw `r || s` and DER encodings.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let raw = if signature.len() == 64 {
        signature.to_vec()
    } else {
        match k256::ecdsa::Signature::from_der(signature) {
            Ok(sig) => sig.to_bytes().to_vec(),
            Err(_) => return false,
        }
    };
    let (r_x, s) = raw.split_at(32);
    let Ok(group) = decode_point(public_key) else {
        return false;
    };
    let Ok(s) = decode_scalar(s) else {
        return false;
    };
    let r_x = FieldBytes::clone_from_slice(r_x);
    let Some(nonce) = Option::<AffinePoint>::from(AffinePoint::decompress(&r_x, Choice::from(0)))
    else {
        return false;
    };
    let e = challenge(&r_x, public_key, message);
    ProjectivePoint::GENERATOR * s == ProjectivePoint::from(nonce) + group * e
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(ctx: &LocalContext, a: SessionHandle, b: SessionHandle) {
        let mut to_a: Vec<Vec<u8>> = Vec::new();
        let mut to_b: Vec<Vec<u8>> = Vec::new();
        let (mut done_a, mut done_b) = (false, false);
        for _ in 0..16 {
            if !done_a {
                let inbound = (!to_a.is_empty()).then(|| to_a.remove(0));
                let out = ctx.step(a, inbound.as_deref()).unwrap();
                to_b.extend(out.outbound);
                done_a = out.done;
            }
            if !done_b {
                let inbound = (!to_b.is_empty()).then(|| to_b.remove(0));
                let out = ctx.step(b, inbound.as_deref()).unwrap();
                to_a.extend(out.outbound);
                done_b = out.done;
            }
            if done_a && done_b {
                return;
            }
        }
        panic!("protocol did not complete");
    }

    fn dkg(ctx: &LocalContext) -> (KeyHandle, KeyHandle) {
        let key_id = [5u8; KEY_ID_SIZE];
        let opts = |role| DkgOptions {
            role,
            key_id,
            session_id: Some("s1".into()),
        };
        let d = ctx.dkg_new(&opts(Participant::Device)).unwrap();
        let s = ctx.dkg_new(&opts(Participant::Server)).unwrap();
        drive(ctx, d, s);
        let keys = (ctx.finalize_key(d).unwrap(), ctx.finalize_key(s).unwrap());
        ctx.free_session(d).unwrap();
        ctx.free_session(s).unwrap();
        keys
    }

    #[test]
    fn test_dkg_agrees_on_public_key() {
        let ctx = LocalContext::new();
        let (d, s) = dkg(&ctx);
        let pk = ctx.public_key(d).unwrap();
        assert_eq!(pk.len(), POINT_SIZE);
        assert_eq!(pk, ctx.public_key(s).unwrap());
    }

    #[test]
    fn test_sign_both_formats_verify() {
        let ctx = LocalContext::new();
        let (d, s) = dkg(&ctx);
        let pk = ctx.public_key(d).unwrap();
        let digest = [0x42u8; 32];

        for format in [SignatureFormat::Raw, SignatureFormat::Der] {
            let sd = ctx.sign_new(d, &SignOptions::default()).unwrap();
            let ss = ctx.sign_new(s, &SignOptions::default()).unwrap();
            ctx.sign_set_message(sd, &digest).unwrap();
            ctx.sign_set_message(ss, &digest).unwrap();
            drive(&ctx, sd, ss);
            let sig = ctx.finalize_signature(sd, format).unwrap();
            assert_eq!(sig, ctx.finalize_signature(ss, format).unwrap());
            assert!(verify_signature(&pk, &digest, &sig));
            assert!(!verify_signature(&pk, &[0u8; 32], &sig));
        }
    }

    #[test]
    fn test_sign_without_message_fails() {
        let ctx = LocalContext::new();
        let (d, s) = dkg(&ctx);
        let sd = ctx.sign_new(d, &SignOptions::default()).unwrap();
        let ss = ctx.sign_new(s, &SignOptions::default()).unwrap();
        let mut inbound = ctx.step(sd, None).unwrap().outbound;
        let mut failed = false;
        for _ in 0..8 {
            match ctx.step(ss, inbound.as_deref()) {
                Ok(out) => inbound = out.outbound,
                Err(_) => {
                    failed = true;
                    break;
                }
            }
            match ctx.step(sd, inbound.as_deref()) {
                Ok(out) => inbound = out.outbound,
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed);
    }

    #[test]
    fn test_refresh_preserves_public_key() {
        let ctx = LocalContext::new();
        let (d, s) = dkg(&ctx);
        let before_d = ctx.export_key(d).unwrap();
        let pk = ctx.public_key(d).unwrap();

        let rd = ctx.refresh_new(d, &RefreshOptions::default()).unwrap();
        let rs = ctx.refresh_new(s, &RefreshOptions::default()).unwrap();
        drive(&ctx, rd, rs);
        let nd = ctx.finalize_key(rd).unwrap();
        let ns = ctx.finalize_key(rs).unwrap();

        assert_eq!(ctx.public_key(nd).unwrap(), pk);
        assert_eq!(ctx.public_key(ns).unwrap(), pk);
        assert_ne!(ctx.export_key(nd).unwrap(), before_d);
    }

    #[test]
    fn test_export_import_identity() {
        let ctx = LocalContext::new();
        let (d, _) = dkg(&ctx);
        let blob = ctx.export_key(d).unwrap();
        assert_eq!(blob.len(), BLOB_SIZE);

        let other = LocalContext::new();
        let imported = other.import_key(&blob).unwrap();
        assert_eq!(
            other.public_key(imported).unwrap(),
            ctx.public_key(d).unwrap()
        );
    }

    #[test]
    fn test_import_rejects_tampered_blob() {
        let ctx = LocalContext::new();
        let (d, _) = dkg(&ctx);
        let mut blob = ctx.export_key(d).unwrap();
        blob[2 + KEY_ID_SIZE] ^= 0x01;
        assert!(ctx.import_key(&blob).is_err());
        assert!(ctx.import_key(&blob[..10]).is_err());
    }

    #[test]
    fn test_reveal_must_match_commitment() {
        let ctx = LocalContext::new();
        let opts = |role| DkgOptions {
            role,
            key_id: [1u8; KEY_ID_SIZE],
            session_id: None,
        };
        let d = ctx.dkg_new(&opts(Participant::Device)).unwrap();
        let s = ctx.dkg_new(&opts(Participant::Server)).unwrap();
        let commit = ctx.step(d, None).unwrap().outbound.unwrap();
        ctx.step(s, Some(&commit)).unwrap();

        let forged = Message::Reveal(
            encode_point(&(ProjectivePoint::GENERATOR * Scalar::from(7u64))).unwrap(),
        );
        assert!(ctx.step(s, Some(&forged.encode())).is_err());
    }

    #[test]
    fn test_free_exactly_once() {
        let ctx = LocalContext::new();
        let h = ctx
            .dkg_new(&DkgOptions {
                role: Participant::Device,
                key_id: [0u8; KEY_ID_SIZE],
                session_id: None,
            })
            .unwrap();
        ctx.free_session(h).unwrap();
        assert!(ctx.free_session(h).is_err());
        assert!(ctx.step(h, None).is_err());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let ctx = LocalContext::new();
        let (d, _) = dkg(&ctx);
        ctx.shutdown();
        ctx.shutdown();
        assert!(ctx.public_key(d).is_err());
    }

    #[test]
    fn test_malformed_message_rejected() {
        assert!(Message::decode(&[]).is_err());
        assert!(Message::decode(&[MSG_COMMIT, 1, 2]).is_err());
        assert!(Message::decode(&[0x7f; 33]).is_err());
    }
}
