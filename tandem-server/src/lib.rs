// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Websocket coordinator for two-party MPC sessions.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod handshake;
pub mod registry;
pub mod server;

pub use config::Config;
pub use error::{Result, ServerError};
pub use handshake::{Hello, SessionIntent};
pub use server::{BackupWindow, CoordinatorServer, ServerOptions, SessionHandle, SessionReady};
