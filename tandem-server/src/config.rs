// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use tandem_core::crypto::DEFAULT_MASTER_KEY_ENV;
use tandem_core::driver::DriverConfig;

use crate::error::{Result, ServerError};

const DEFAULT_PORT: u16 = 8787;
const DEFAULT_SESSION_TTL_SECS: u64 = 15 * 60;
const DEFAULT_BACKUP_GRACE_MS: u64 = 5_000;
const DEFAULT_HELLO_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptorKind {
    #[default]
    Envelope,
    /// Base64 only. Development use.
    Passthrough,
}

impl std::fmt::Display for EncryptorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Envelope => "envelope",
            Self::Passthrough => "passthrough",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(s)
    }
}

fn deserialize_nonzero<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<u64>::deserialize(deserializer)?;
    if opt == Some(0) {
        return Err(serde::de::Error::custom("value must be greater than 0"));
    }
    Ok(opt)
}

fn deserialize_nonzero_usize<'de, D>(deserializer: D) -> std::result::Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<usize>::deserialize(deserializer)?;
    if opt == Some(0) {
        return Err(serde::de::Error::custom("round budget must be greater than 0"));
    }
    Ok(opt)
}

fn deserialize_env_name<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    if let Some(name) = &opt {
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return Err(serde::de::Error::custom(format!(
                "Invalid environment variable name: '{name}'"
            )));
        }
    }
    Ok(opt)
}

/// Round driver tuning; unset fields keep the driver defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverSection {
    #[serde(default, deserialize_with = "deserialize_nonzero_usize")]
    pub dual_round_budget: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_nonzero_usize")]
    pub single_round_budget: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_nonzero")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_nonzero")]
    pub receive_timeout_secs: Option<u64>,
}

impl DriverSection {
    pub fn to_driver_config(&self) -> DriverConfig {
        let defaults = DriverConfig::default();
        DriverConfig {
            dual_round_budget: self.dual_round_budget.unwrap_or(defaults.dual_round_budget),
            single_round_budget: self
                .single_round_budget
                .unwrap_or(defaults.single_round_budget),
            poll_interval: self
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            receive_timeout: self
                .receive_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.receive_timeout),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub listen: Option<SocketAddr>,
    /// redb file. In-memory storage when absent.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
    #[serde(default)]
    pub encryptor: EncryptorKind,
    #[serde(default, deserialize_with = "deserialize_env_name")]
    pub master_key_env: Option<String>,
    #[serde(default, deserialize_with = "deserialize_nonzero")]
    pub session_ttl_secs: Option<u64>,
    #[serde(default)]
    pub backup_grace_ms: Option<u64>,
    /// How long a new socket may take to send its hello.
    #[serde(default, deserialize_with = "deserialize_nonzero")]
    pub hello_timeout_secs: Option<u64>,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub driver: DriverSection,
}

impl Config {
    /// Reads `path` when given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        const MAX_CONFIG_SIZE: u64 = 1024 * 1024;
        let metadata = std::fs::metadata(path).map_err(|e| {
            ServerError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        if metadata.len() > MAX_CONFIG_SIZE {
            return Err(ServerError::Config("Config file too large".into()));
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn listen(&self) -> SocketAddr {
        self.listen
            .unwrap_or(SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)))
    }

    pub fn master_key_env(&self) -> &str {
        self.master_key_env
            .as_deref()
            .unwrap_or(DEFAULT_MASTER_KEY_ENV)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs.unwrap_or(DEFAULT_SESSION_TTL_SECS))
    }

    pub fn backup_grace(&self) -> Duration {
        Duration::from_millis(self.backup_grace_ms.unwrap_or(DEFAULT_BACKUP_GRACE_MS))
    }

    pub fn hello_timeout(&self) -> Duration {
        Duration::from_secs(self.hello_timeout_secs.unwrap_or(DEFAULT_HELLO_TIMEOUT_SECS))
    }
}
