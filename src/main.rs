//! AxoRelay server binary.
//!
//! Temporary file relay: clients create uploads, attach files to them and
//! share download links that honor one-shot, streaming, password and
//! YubiKey policies. The main entry point builds the backends and the Axum
//! router, configures optional TLS, and starts the listener.

mod app;
mod archive;
mod auth;
mod config;
mod context;
mod data;
mod download;
mod error;
mod http;
mod ingest;
mod logging;
mod metadata;
mod models;
mod sniff;
mod tls;
mod upload;
mod version;
mod yubikey;

#[cfg(test)]
mod testing;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use crate::config::{Args, DEFAULT_STREAM_BUFFER_SIZE, RelayConfig, load_user_seed};
use crate::context::AppState;
use crate::data::{DataBackends, FileBackend, StorageMode, StreamBackend};
use crate::metadata::{MemoryMetadata, MetadataBackend};
use crate::yubikey::{OtpVerifier, YubicoClient};

shadow!(build);

/// Starts the AxoRelay server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(args.debug);

    let config = Arc::new(RelayConfig::from_args(&args).map_err(std::io::Error::other)?);

    let files = FileBackend::new(&args.data_dir);
    files.ensure_root().await?;
    info!("data directory: {:?}", files.root_path());
    let mut data = DataBackends::new().with(StorageMode::Normal, Arc::new(files));
    if config.stream_mode {
        data = data.with(
            StorageMode::Stream,
            Arc::new(StreamBackend::new(DEFAULT_STREAM_BUFFER_SIZE)),
        );
    }

    let metadata = Arc::new(MemoryMetadata::new());
    if let Some(users_file) = args.users_file.as_deref() {
        seed_users(metadata.as_ref(), Path::new(users_file)).await?;
    }

    let otp = match (config.protected_by_yubikey, config.yubikey_client_id.as_deref()) {
        (true, Some(client_id)) => Some(Arc::new(YubicoClient::new(
            config.yubikey_api_url.clone(),
            client_id,
        )) as Arc<dyn OtpVerifier>),
        _ => None,
    };

    let state = AppState {
        config,
        metadata,
        data,
        otp,
    };
    let app = app::build_router(state, args.cors_origins.as_deref());

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let tls_config = tls::build_rustls_config(&args, host).await?;
    let handle = Handle::new();
    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    tokio::spawn(shutdown_signal(handle.clone()));
    match tls_config {
        Some(tls_config) => {
            info!("🔒 Starting HTTPS server at {}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(service)
                .await
        }
        None => {
            info!("🚀 Starting HTTP server at {}", addr);
            axum_server::bind(addr).handle(handle).serve(service).await
        }
    }
}

/// 从 JSON 文件导入用户与令牌。
async fn seed_users(metadata: &dyn MetadataBackend, path: &Path) -> Result<(), std::io::Error> {
    let seed = load_user_seed(path)
        .await
        .map_err(std::io::Error::other)?;
    for user in &seed.users {
        metadata
            .create_user(user)
            .await
            .map_err(std::io::Error::other)?;
    }
    for token in &seed.tokens {
        metadata
            .create_token(token)
            .await
            .map_err(std::io::Error::other)?;
    }
    info!(
        users = seed.users.len(),
        tokens = seed.tokens.len(),
        "loaded users from {:?}",
        path
    );
    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
