//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MIB: u64 = 1024 * 1024;
pub const DEFAULT_MAX_STORAGE: u64 = 28 * GIB;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * MIB;
pub const DEFAULT_TEMP_TTL_SECS: u64 = 24 * 60 * 60;
pub const TEMP_CLEAN_INTERVAL_SECS: u64 = 900;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// MIME types accepted by `POST /upload`.
pub const ALLOWED_MIME_TYPES: [&str; 6] = [
    "image/jpeg",
    "image/png",
    "application/pdf",
    "text/plain",
    "video/mp4",
    "audio/mpeg",
];

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "stash-drive", version = VERSION_INFO, about = "Personal file storage server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "DRIVE_STORAGE_DIR",
        default_value = ".drive/storage",
        help = "Storage directory for uploaded files"
    )]
    pub storage_dir: String,
    #[arg(
        short = 't',
        long,
        env = "DRIVE_TEMP_DIR",
        default_value = ".drive/temp",
        help = "Staging directory for uploads in progress"
    )]
    pub temp_dir: String,
    #[arg(
        short = 'b',
        long = "bind",
        env = "DRIVE_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "DRIVE_PORT",
        default_value_t = 3000,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "DRIVE_MAX_STORAGE",
        default_value_t = DEFAULT_MAX_STORAGE,
        help = "Total storage ceiling in bytes"
    )]
    pub max_storage: u64,
    #[arg(
        long,
        env = "DRIVE_MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Max size of a single uploaded file in bytes"
    )]
    pub max_file_size: u64,
    #[arg(
        long,
        env = "DRIVE_CORS_ORIGINS",
        default_value = "*",
        help = "Comma separated CORS origins (* for any)"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "DRIVE_TEMP_TTL_SECS",
        default_value_t = DEFAULT_TEMP_TTL_SECS,
        help = "Staged upload cleanup threshold in seconds (0 to disable)"
    )]
    pub temp_ttl_secs: u64,
}

/// Formats a byte count as whole GiB when exact, otherwise with two decimals.
pub fn format_gib(bytes: u64) -> String {
    if bytes % GIB == 0 {
        format!("{}GB", bytes / GIB)
    } else {
        format!("{:.2}GB", bytes as f64 / GIB as f64)
    }
}
