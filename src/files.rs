//! 文件列表、下载、删除与用量查询处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::{fmt_http_date, parse_http_date};
use std::io::{ErrorKind, SeekFrom};
use std::time::{SystemTime, UNIX_EPOCH};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::error::{ApiError, scan_failure};
use crate::quota::{StorageAccountant, StorageUsage};
use crate::storage::{FileEntry, Storage, StorageError};

/// 列出存储目录中的文件。
pub async fn list_files(
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<Vec<FileEntry>>, ApiError> {
    let entries = storage.list_files().await.map_err(scan_failure)?;
    info!(count = entries.len(), "list files");
    Ok(JsonResponse(entries))
}

/// 返回当前用量与上限（字节）。
pub async fn storage_usage(
    Extension(accountant): Extension<Arc<StorageAccountant>>,
) -> Result<JsonResponse<StorageUsage>, ApiError> {
    let usage = accountant.compute_usage().await.map_err(scan_failure)?;
    debug!(used = usage.used, max = usage.max, "storage usage");
    Ok(JsonResponse(usage))
}

/// 以附件形式下载文件，支持单段 Range 请求。
pub async fn download_file(
    Path(filename): Path<String>,
    request_headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let opened = storage.open_file(&filename).await?;
    let name = opened.name;
    let file_size = opened.metadata.len();
    let modified = opened.metadata.modified().ok();
    let mime = mime_guess::from_path(&name).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&name))
            .map_err(|_| ApiError::Internal("failed to build response headers".into()))?,
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(value) = modified.map(fmt_http_date) {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&value)
                .map_err(|_| ApiError::Internal("failed to build response headers".into()))?,
        );
    }

    let if_range_matches = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => match parse_http_date(value) {
            Ok(date) => modified
                .map(|ts| unix_secs(ts) <= unix_secs(date))
                .unwrap_or(false),
            Err(_) => false,
        },
        None => true,
    };

    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let file = opened.file;
    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(name, start, end, length, "download range request accepted");
        let mut file = file;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let stream = ReaderStream::new(file.take(length));
        response_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, file_size))
                .map_err(|_| ApiError::Internal("failed to build response headers".into()))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
    info!(name, size = file_size, "download file");
    let stream = ReaderStream::new(file);
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// 删除文件。
pub async fn delete_file(
    Path(filename): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<&'static str, ApiError> {
    match storage.delete_file(&filename).await {
        Ok(name) => {
            info!(name, "delete file");
            Ok("File deleted successfully")
        }
        Err(StorageError::Io(err)) if err.kind() != ErrorKind::NotFound => {
            warn!(filename, error = %err, "delete failed");
            Err(ApiError::Internal("Error deleting file".into()))
        }
        Err(err) => Err(err.into()),
    }
}

/// HTTP 日期只精确到秒，比较 If-Range 前先截断文件时间。
fn unix_secs(ts: SystemTime) -> u64 {
    ts.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// `Content-Disposition: attachment`，非 ASCII 名称附带 RFC 5987 `filename*`。
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_control() || !c.is_ascii() => '_',
            c => c,
        })
        .collect();

    if fallback == filename {
        return format!("attachment; filename=\"{filename}\"");
    }
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(filename)
    )
}

/// 解析 Range 头，返回可读取的范围。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }

    let mut parts = range.splitn(2, '-');
    let start_part = parts.next().unwrap_or_default();
    let end_part = parts.next().unwrap_or_default();

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        if suffix == 0 {
            return Ok(None);
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        let end: u64 = if end_part.is_empty() {
            file_size - 1
        } else {
            end_part
                .parse::<u64>()
                .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?
                .min(file_size - 1)
        };
        (start, end)
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }

    Ok(Some((start, end)))
}
