// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
#![forbid(unsafe_code)]

use thiserror::Error;

use tandem_core::error::TandemError;

use crate::handshake::HandshakeError;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Core(#[from] TandemError),

    #[error("Handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Session {0} is closed")]
    SessionClosed(String),

    #[error("Session {session_id} has intent {actual}, not {expected}")]
    WrongIntent {
        session_id: String,
        expected: &'static str,
        actual: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, ServerError>;
