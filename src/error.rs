//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::io::ErrorKind;
use tracing::warn;

use crate::config::format_gib;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Forbidden(String),
    PayloadTooLarge(String),
    UnsupportedMediaType(String),
    RangeNotSatisfiable(u64),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg).into_response(),
            ApiError::UnsupportedMediaType(msg) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, msg).into_response()
            }
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    headers,
                    "range not satisfiable",
                )
                    .into_response()
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidName => ApiError::BadRequest("Invalid file name".into()),
            StorageError::UnsupportedMediaType(mime) => {
                ApiError::UnsupportedMediaType(format!("Unsupported file type: {mime}"))
            }
            StorageError::PayloadTooLarge(limit) => ApiError::PayloadTooLarge(format!(
                "File too large (max {}MB)",
                limit / crate::config::MIB
            )),
            StorageError::CapacityExceeded { max } => {
                ApiError::Forbidden(format!("Storage limit reached ({})", format_gib(max)))
            }
            StorageError::Incomplete(msg) => ApiError::BadRequest(format!("Upload interrupted: {msg}")),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound("File not found".into()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}

/// 扫描存储目录失败一律视为服务端错误，目录本身消失时也不返回 404。
pub fn scan_failure(error: StorageError) -> ApiError {
    match error {
        StorageError::Io(err) => {
            warn!(error = %err, "storage scan failed");
            ApiError::Internal("Failed to read storage".into())
        }
        other => other.into(),
    }
}
