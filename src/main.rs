//! stash-drive server binary.
//!
//! A personal file store: uploads are persisted to a local directory, gated by
//! an aggregate storage ceiling, and exposed through list, download, delete and
//! usage endpoints. The main entry point builds the Axum router and starts the
//! HTTP listener.

mod atomic;
mod background;
mod config;
mod error;
mod files;
mod http;
mod logging;
mod quota;
mod routes;
mod storage;
mod upload;
mod version;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use crate::background::spawn_background_tasks;
use crate::config::{Args, SHUTDOWN_GRACE_SECS, format_gib};
use crate::quota::StorageAccountant;
use crate::storage::Storage;
use crate::upload::UploadConfig;

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(
        PathBuf::from(&args.storage_dir),
        PathBuf::from(&args.temp_dir),
    ));
    storage.ensure_root().await?;
    let accountant = Arc::new(StorageAccountant::new(storage.clone(), args.max_storage));
    let upload_config = Arc::new(UploadConfig {
        max_file_size: args.max_file_size,
        temp_ttl: Duration::from_secs(args.temp_ttl_secs),
    });

    spawn_background_tasks(storage.clone(), upload_config.clone());
    let app = routes::build_router(
        storage.clone(),
        accountant,
        upload_config,
        args.cors_origins.as_deref(),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!(
        storage_dir = %storage.root_path().display(),
        max_storage = %format_gib(args.max_storage),
        max_file_size = args.max_file_size,
        "storage ready"
    );
    info!("Starting HTTP server at {}", addr);

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::spawn(shutdown_signal(handle));
    server.await
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
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
