// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parsing of the `hello` envelope a participant sends first.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use tandem_core::error::TandemError;
use tandem_core::types::{Participant, ProtocolKind};

pub const HELLO_TYPE: &str = "hello";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Not JSON, or not shaped like a hello.
    #[error("invalid handshake payload")]
    Payload,

    #[error("invalid handshake contents: {0}")]
    Contents(String),

    #[error("no handshake before timeout")]
    Timeout,
}

impl HandshakeError {
    /// Reason sent in the close frame.
    pub fn close_reason(&self) -> &'static str {
        match self {
            Self::Payload => "invalid handshake payload",
            Self::Contents(_) => "invalid handshake contents",
            Self::Timeout => "handshake timeout",
        }
    }

    fn contents(msg: impl Into<String>) -> Self {
        Self::Contents(msg.into())
    }
}

impl From<HandshakeError> for TandemError {
    fn from(e: HandshakeError) -> Self {
        TandemError::Handshake(e.to_string())
    }
}

/// What the session was opened for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SessionIntent {
    #[serde(rename_all = "camelCase")]
    Dkg {
        key_id: Option<String>,
        session_id_hint: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Sign {
        key_id: String,
        session_id_hint: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Refresh {
        key_id: String,
        session_id_hint: Option<String>,
    },
}

impl Default for SessionIntent {
    fn default() -> Self {
        Self::Dkg {
            key_id: None,
            session_id_hint: None,
        }
    }
}

impl SessionIntent {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Self::Dkg { .. } => ProtocolKind::Dkg,
            Self::Sign { .. } => ProtocolKind::Sign,
            Self::Refresh { .. } => ProtocolKind::Refresh,
        }
    }

    pub fn key_id(&self) -> Option<&str> {
        match self {
            Self::Dkg { key_id, .. } => key_id.as_deref(),
            Self::Sign { key_id, .. } | Self::Refresh { key_id, .. } => Some(key_id),
        }
    }

    pub fn session_id_hint(&self) -> Option<&str> {
        match self {
            Self::Dkg {
                session_id_hint, ..
            }
            | Self::Sign {
                session_id_hint, ..
            }
            | Self::Refresh {
                session_id_hint, ..
            } => session_id_hint.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHello {
    #[serde(rename = "type")]
    kind: Option<String>,
    session_id: Option<String>,
    role: Option<String>,
    token: Option<String>,
    intent: Option<String>,
    key_id: Option<String>,
    session_id_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub session_id: String,
    pub role: Participant,
    pub token: Option<String>,
    pub intent: SessionIntent,
}

impl Hello {
    pub fn parse(payload: &[u8]) -> std::result::Result<Self, HandshakeError> {
        let raw: RawHello = serde_json::from_slice(payload).map_err(|_| HandshakeError::Payload)?;

        if raw.kind.as_deref() != Some(HELLO_TYPE) {
            return Err(HandshakeError::contents("type is not hello"));
        }
        let session_id = raw
            .session_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| HandshakeError::contents("missing sessionId"))?;
        let role = raw
            .role
            .as_deref()
            .ok_or_else(|| HandshakeError::contents("missing role"))?
            .parse::<Participant>()
            .map_err(HandshakeError::Contents)?;

        let key_id = raw.key_id.filter(|k| !k.is_empty());
        let session_id_hint = raw.session_id_hint;
        let intent = match raw.intent.as_deref() {
            Some("sign") => SessionIntent::Sign {
                key_id: key_id.ok_or_else(|| HandshakeError::contents("sign intent missing keyId"))?,
                session_id_hint,
            },
            Some("refresh") => SessionIntent::Refresh {
                key_id: key_id
                    .ok_or_else(|| HandshakeError::contents("refresh intent missing keyId"))?,
                session_id_hint,
            },
            other => {
                if let Some(other) = other.filter(|i| *i != "dkg") {
                    debug!(intent = other, "unrecognised intent, treating as dkg");
                }
                SessionIntent::Dkg {
                    key_id,
                    session_id_hint,
                }
            }
        };

        Ok(Self {
            session_id,
            role,
            token: raw.token,
            intent,
        })
    }
}
