// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use tandem_core::coordinator::WalletMetadata;
use tandem_core::crypto::{EnvelopeEncryptor, KeyEncryptor, PassthroughEncryptor};
use tandem_core::engine::LocalEngine;
use tandem_core::storage::{CoordinatorStorage, MemoryStorage, RedbStorage};
use tandem_server::config::{Config, EncryptorKind, LogLevel};
use tandem_server::{
    BackupWindow, CoordinatorServer, Result, ServerOptions, SessionIntent, SessionReady,
};

#[derive(Parser, Debug)]
#[command(name = "tandem-server", version, about = "Two-party MPC coordinator")]
struct Args {
    /// TOML config file.
    #[arg(long, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `listen` from the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

fn init_logging(level: LogLevel) {
    let use_json = std::env::var("TANDEM_LOG_JSON").is_ok();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    if use_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };
    init_logging(config.log_level);

    if let Err(e) = run(args, config).await {
        error!(error = %e, "coordinator failed");
        std::process::exit(1);
    }
}

fn open_storage(config: &Config) -> Result<Arc<dyn CoordinatorStorage>> {
    match &config.storage_path {
        Some(path) => {
            info!(path = %path.display(), "opening redb storage");
            Ok(Arc::new(RedbStorage::open(path)?))
        }
        None => {
            warn!("no storage_path configured; records are kept in memory");
            Ok(Arc::new(MemoryStorage::in_memory()))
        }
    }
}

fn build_encryptor(config: &Config) -> Result<Arc<dyn KeyEncryptor>> {
    match config.encryptor {
        EncryptorKind::Envelope => Ok(Arc::new(EnvelopeEncryptor::from_env(
            config.master_key_env(),
        )?)),
        EncryptorKind::Passthrough => {
            warn!("passthrough encryptor stores shares unencrypted");
            Ok(Arc::new(PassthroughEncryptor))
        }
    }
}

async fn run(args: Args, config: Config) -> Result<()> {
    let options = ServerOptions {
        listen: args.listen.unwrap_or_else(|| config.listen()),
        session_ttl: config.session_ttl(),
        hello_timeout: config.hello_timeout(),
        driver: config.driver.to_driver_config(),
    };
    let storage = open_storage(&config)?;
    let encryptor = build_encryptor(&config)?;
    let grace = config.backup_grace();

    let (server, mut events) =
        CoordinatorServer::bind(options, storage, encryptor, Arc::new(LocalEngine)).await?;

    loop {
        tokio::select! {
            ready = events.recv() => match ready {
                Some(ready) => {
                    tokio::spawn(serve_session(ready, grace));
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
        }
    }
    server.shutdown();
    Ok(())
}

async fn serve_session(ready: SessionReady, grace: Duration) {
    let SessionReady {
        session_id,
        intent,
        handle,
        ..
    } = ready;

    match &intent {
        SessionIntent::Dkg { key_id, .. } => {
            let wallet_id = key_id.clone().unwrap_or_else(|| session_id.clone());
            match handle.run_dkg(Some(WalletMetadata::new(wallet_id))).await {
                Ok(result) => {
                    info!(
                        %session_id,
                        public_key = %hex::encode(&result.public_key),
                        "dkg finished, waiting for backup share"
                    );
                    match handle.await_backup(grace).await {
                        BackupWindow::Received => info!(%session_id, "backup share stored"),
                        BackupWindow::Closed => info!(%session_id, "device left before backup"),
                        BackupWindow::Elapsed => {
                            warn!(%session_id, grace_ms = grace.as_millis() as u64, "no backup share")
                        }
                    }
                }
                Err(e) => warn!(%session_id, error = %e, "dkg failed"),
            }
        }
        SessionIntent::Refresh { key_id, .. } => match handle.run_refresh().await {
            Ok(_) => info!(%session_id, wallet_id = %key_id, "refresh finished"),
            Err(e) => warn!(%session_id, error = %e, "refresh failed"),
        },
        SessionIntent::Sign { key_id, .. } => {
            warn!(
                %session_id,
                wallet_id = %key_id,
                "sign sessions need an application-supplied digest; closing"
            );
        }
    }
    handle.close();
}
