// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::debug;

use tandem_core::engine::ProtocolContext;
use tandem_core::transport::{SocketTransport, CLOSE_NORMAL};

use crate::handshake::SessionIntent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered; no protocol has started.
    Pending,
    Active,
    Closed,
}

/// Everything the coordinator holds for one session id.
pub struct LiveSession {
    session_id: String,
    intent: RwLock<SessionIntent>,
    token: RwLock<Option<String>>,
    transport: Arc<SocketTransport>,
    ctx: Arc<dyn ProtocolContext>,
    state: Mutex<SessionState>,
    driver_lock: tokio::sync::Mutex<()>,
    backup_stored: Arc<Notify>,
    closed: Notify,
    created_at: Instant,
}

impl LiveSession {
    pub fn new(
        session_id: impl Into<String>,
        intent: SessionIntent,
        token: Option<String>,
        transport: Arc<SocketTransport>,
        ctx: Arc<dyn ProtocolContext>,
        backup_stored: Arc<Notify>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            intent: RwLock::new(intent),
            token: RwLock::new(token),
            transport,
            ctx,
            state: Mutex::new(SessionState::Pending),
            driver_lock: tokio::sync::Mutex::new(()),
            backup_stored,
            closed: Notify::new(),
            created_at: Instant::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn intent(&self) -> SessionIntent {
        self.intent.read().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// A re-sent hello may change intent and token.
    pub fn update(&self, intent: SessionIntent, token: Option<String>) {
        *self.intent.write() = intent;
        *self.token.write() = token;
    }

    pub fn transport(&self) -> &Arc<SocketTransport> {
        &self.transport
    }

    pub fn ctx(&self) -> &Arc<dyn ProtocolContext> {
        &self.ctx
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Moves `Pending` to `Active`; false once closed.
    pub(crate) fn activate(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            SessionState::Closed => false,
            _ => {
                *state = SessionState::Active;
                true
            }
        }
    }

    /// Serialises protocol runs on this session's context.
    pub(crate) async fn lock_driver(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.driver_lock.lock().await
    }

    pub(crate) fn backup_stored(&self) -> &Notify {
        &self.backup_stored
    }

    pub(crate) fn backup_stored_handle(&self) -> Arc<Notify> {
        self.backup_stored.clone()
    }

    pub(crate) fn closed(&self) -> &Notify {
        &self.closed
    }

    /// Closes sockets and tears down the engine context. Only the first call does anything.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closed;
        }
        self.transport.close(CLOSE_NORMAL, "session closed");
        self.ctx.shutdown();
        self.closed.notify_waiters();
        debug!(session_id = %self.session_id, elapsed_ms = self.elapsed().as_millis() as u64, "session closed");
        true
    }
}

/// Live sessions by id. One per server instance.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<LiveSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<LiveSession>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Returns the live session for `session_id`, creating it when absent.
    /// The flag is true when `create` ran.
    pub fn get_or_create<F>(&self, session_id: &str, create: F) -> (Arc<LiveSession>, bool)
    where
        F: FnOnce() -> LiveSession,
    {
        if let Some(existing) = self.get(session_id) {
            return (existing, false);
        }
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(session_id) {
            return (existing.clone(), false);
        }
        let session = Arc::new(create());
        sessions.insert(session_id.to_string(), session.clone());
        (session, true)
    }

    /// Removes and closes the session. False if it was not registered.
    pub fn cleanup(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id);
        match removed {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Like [`cleanup`](Self::cleanup), but only when the entry for
    /// `session_id` is `session`. A newer session under the same id is left
    /// alone; `session` itself is still closed.
    pub fn cleanup_if(&self, session_id: &str, session: &Arc<LiveSession>) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            match sessions.get(session_id) {
                Some(current) if Arc::ptr_eq(current, session) => sessions.remove(session_id),
                _ => None,
            }
        };
        let closed = session.close();
        removed.is_some() || closed
    }

    pub fn cleanup_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }
}
