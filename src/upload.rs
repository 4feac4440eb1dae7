//! 表单上传处理器与暂存目录清理。

use axum::extract::{Extension, Multipart};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{info, warn};

use crate::error::{ApiError, scan_failure};
use crate::quota::StorageAccountant;
use crate::storage::{Storage, StorageError};

#[derive(Debug)]
pub struct UploadConfig {
    pub max_file_size: u64,
    pub temp_ttl: Duration,
}

/// 接收 multipart 表单中的 `file` 字段并写入存储目录。
///
/// 读取内容前先检查用量是否已达上限，暂存完成后再按实际大小检查一次，
/// 单个上传不会让用量越过上限；并发上传之间不做串行化。
pub async fn upload_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(accountant): Extension<Arc<StorageAccountant>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    mut multipart: Multipart,
) -> Result<&'static str, ApiError> {
    accountant
        .ensure_capacity(None)
        .await
        .inspect_err(|err| log_rejected("", err))
        .map_err(scan_failure)?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("Invalid multipart data: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let Some(original_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let declared_mime = field.content_type().map(str::to_string);

        let stored = storage
            .put(
                &original_name,
                declared_mime.as_deref(),
                field,
                upload.max_file_size,
                &accountant,
            )
            .await
            .inspect_err(|err| log_rejected(&original_name, err))
            .map_err(|err| match err {
                StorageError::Io(err) => ApiError::Internal(format!("Error saving file: {err}")),
                other => other.into(),
            })?;
        info!(
            name = stored.name,
            size = stored.size,
            mime = stored.mime_type,
            "upload stored"
        );
        return Ok("File uploaded successfully");
    }

    Err(ApiError::BadRequest("No file uploaded.".into()))
}

fn log_rejected(original_name: &str, err: &StorageError) {
    match err {
        StorageError::Io(err) => warn!(original_name, error = %err, "upload write failed"),
        other => warn!(original_name, reason = ?other, "upload rejected"),
    }
}

/// 清理暂存目录中超过 TTL 的残留文件（进程中途退出时遗留）。
pub async fn cleanup_upload_temp(
    storage: &Storage,
    upload: &UploadConfig,
) -> Result<(), std::io::Error> {
    if upload.temp_ttl.is_zero() {
        return Ok(());
    }

    let temp_root = storage.staging_path();
    if fs::metadata(temp_root).await.is_err() {
        return Ok(());
    }

    let now = SystemTime::now();
    let mut dir = fs::read_dir(temp_root).await?;
    while let Some(entry) = dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let modified = match metadata.modified() {
            Ok(value) => value,
            Err(_) => continue,
        };
        let age = match now.duration_since(modified) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if age >= upload.temp_ttl {
            let path = entry.path();
            if let Err(err) = fs::remove_file(&path).await {
                warn!(path = ?path, error = %err, "failed to remove stale staged upload");
            } else {
                info!(path = ?path, "removed stale staged upload");
            }
        }
    }

    Ok(())
}
