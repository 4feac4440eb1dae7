//! 路由装配：端点、中间件与共享状态。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::http::{add_security_headers, build_cors_layer, extract_forwarded_ip};
use crate::quota::StorageAccountant;
use crate::storage::Storage;
use crate::upload::UploadConfig;
use crate::{files, upload, version};

/// 组装路由。只有 `POST /upload` 受存储上限约束，存储已满时读取与删除仍可用。
pub fn build_router(
    storage: Arc<Storage>,
    accountant: Arc<StorageAccountant>,
    upload_config: Arc<UploadConfig>,
    cors_origins: Option<&str>,
) -> Router {
    let mut app = Router::new()
        .route(
            "/upload",
            // 单文件大小在流式写入时检查。
            post(upload::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/files", get(files::list_files))
        .route("/download/{filename}", get(files::download_file))
        .route("/delete/{filename}", delete(files::delete_file))
        .route("/storage-usage", get(files::storage_usage))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = extract_forwarded_ip(request.headers()).map(|ip| ip.to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip().to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(accountant))
        .layer(Extension(upload_config));

    if let Some(cors_layer) = build_cors_layer(cors_origins) {
        app = app.layer(cors_layer);
    }

    app
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, StatusCode, header};
    use axum::response::Response;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    const BOUNDARY: &str = "drive-test-boundary";

    fn make_app(max_storage: u64, max_file_size: u64) -> (TempDir, Router) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("storage");
        let staging = temp.path().join("staging");
        std::fs::create_dir_all(&root).expect("create storage root");
        std::fs::create_dir_all(&staging).expect("create staging");
        let storage = Arc::new(Storage::new(root, staging));
        let accountant = Arc::new(StorageAccountant::new(storage.clone(), max_storage));
        let upload_config = Arc::new(UploadConfig {
            max_file_size,
            temp_ttl: Duration::from_secs(60),
        });
        let app = build_router(storage, accountant, upload_config, Some("*"));
        (temp, app)
    }

    fn multipart_request(field: &str, filename: &str, content_type: &str, data: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("build request")
    }

    fn empty_request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("build request")
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.expect("infallible")
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes()
            .to_vec()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).expect("json body")
    }

    async fn usage(app: &Router) -> Value {
        body_json(send(app, empty_request(Method::GET, "/storage-usage")).await).await
    }

    async fn listed(app: &Router) -> Vec<Value> {
        let response = send(app, empty_request(Method::GET, "/files")).await;
        assert_eq!(response.status(), StatusCode::OK);
        match body_json(response).await {
            Value::Array(items) => items,
            other => panic!("expected array, got {other}"),
        }
    }

    #[tokio::test]
    async fn upload_is_listed_with_its_size() {
        let (_temp, app) = make_app(1024, 1024);
        let response = send(&app, multipart_request("file", "hello.txt", "text/plain", b"hello")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"File uploaded successfully");

        let files = listed(&app).await;
        assert_eq!(files.len(), 1);
        let name = files[0]["name"].as_str().expect("name");
        assert!(name.ends_with("-hello.txt"));
        assert_eq!(files[0]["size"], 5);
    }

    #[tokio::test]
    async fn ceiling_rejects_third_upload() {
        let (_temp, app) = make_app(10, 1024);
        for name in ["a.txt", "b.txt"] {
            let response = send(&app, multipart_request("file", name, "text/plain", b"12345")).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(usage(&app).await["used"], 10);

        let response = send(&app, multipart_request("file", "c.txt", "text/plain", b"x")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let usage = usage(&app).await;
        assert_eq!(usage["used"], 10);
        assert_eq!(usage["max"], 10);
    }

    #[tokio::test]
    async fn upload_that_would_overflow_is_rejected() {
        let (_temp, app) = make_app(10, 1024);
        let response = send(&app, multipart_request("file", "a.txt", "text/plain", b"123456")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app, multipart_request("file", "b.txt", "text/plain", b"123456")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(listed(&app).await.len(), 1);
    }

    #[tokio::test]
    async fn reads_and_deletes_work_when_full() {
        let (_temp, app) = make_app(5, 1024);
        let response = send(&app, multipart_request("file", "a.txt", "text/plain", b"12345")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let files = listed(&app).await;
        let name = files[0]["name"].as_str().expect("name").to_string();
        let response = send(&app, empty_request(Method::DELETE, &format!("/delete/{name}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(usage(&app).await["used"], 0);
    }

    #[tokio::test]
    async fn disallowed_type_is_rejected() {
        let (_temp, app) = make_app(1024, 1024);
        let response = send(
            &app,
            multipart_request("file", "archive.zip", "application/zip", b"PK"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(listed(&app).await.is_empty());
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let (_temp, app) = make_app(1024, 4);
        let response = send(&app, multipart_request("file", "big.txt", "text/plain", b"12345")).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(listed(&app).await.is_empty());
    }

    #[tokio::test]
    async fn missing_file_field_is_bad_request() {
        let (_temp, app) = make_app(1024, 1024);
        let response = send(&app, multipart_request("other", "a.txt", "text/plain", b"abc")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_bytes(response).await, b"No file uploaded.");
    }

    #[tokio::test]
    async fn download_delete_download() {
        let (_temp, app) = make_app(1024, 1024);
        let response = send(&app, multipart_request("file", "scan.pdf", "application/pdf", b"%PDF-1.7")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let name = listed(&app).await[0]["name"]
            .as_str()
            .expect("name")
            .to_string();

        let response = send(&app, empty_request(Method::GET, &format!("/download/{name}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .expect("content disposition")
            .to_string();
        assert!(disposition.starts_with("attachment"));
        assert!(disposition.contains(&name));
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).expect("content type"),
            "application/pdf"
        );
        assert_eq!(body_bytes(response).await, b"%PDF-1.7");

        let response = send(&app, empty_request(Method::DELETE, &format!("/delete/{name}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"File deleted successfully");

        let response = send(&app, empty_request(Method::GET, &format!("/download/{name}"))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ranged_download_returns_partial_content() {
        let (_temp, app) = make_app(1024, 1024);
        let response = send(&app, multipart_request("file", "r.txt", "text/plain", b"0123456789")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let name = listed(&app).await[0]["name"]
            .as_str()
            .expect("name")
            .to_string();

        let request = Request::builder()
            .uri(format!("/download/{name}"))
            .header(header::RANGE, "bytes=2-4")
            .body(Body::empty())
            .expect("build request");
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(body_bytes(response).await, b"234");
    }

    #[tokio::test]
    async fn if_range_with_served_last_modified_keeps_range() {
        let (_temp, app) = make_app(1024, 1024);
        let response = send(&app, multipart_request("file", "r.txt", "text/plain", b"0123456789")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let name = listed(&app).await[0]["name"]
            .as_str()
            .expect("name")
            .to_string();

        let response = send(&app, empty_request(Method::GET, &format!("/download/{name}"))).await;
        let last_modified = response
            .headers()
            .get(header::LAST_MODIFIED)
            .expect("last-modified")
            .clone();

        let request = Request::builder()
            .uri(format!("/download/{name}"))
            .header(header::RANGE, "bytes=2-4")
            .header(header::IF_RANGE, last_modified)
            .body(Body::empty())
            .expect("build request");
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(body_bytes(response).await, b"234");

        let request = Request::builder()
            .uri(format!("/download/{name}"))
            .header(header::RANGE, "bytes=2-4")
            .header(header::IF_RANGE, "Thu, 01 Jan 1970 00:00:00 GMT")
            .body(Body::empty())
            .expect("build request");
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"0123456789");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delete_failure_is_server_error() {
        use std::os::unix::fs::PermissionsExt;

        let (temp, app) = make_app(1024, 1024);
        let response = send(&app, multipart_request("file", "keep.txt", "text/plain", b"abc")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let name = listed(&app).await[0]["name"]
            .as_str()
            .expect("name")
            .to_string();

        let root = temp.path().join("storage");
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o555)).expect("chmod");
        // 特权用户不受目录权限限制，此时构造不出删除失败。
        let writable = std::fs::write(root.join(".write-check"), b"").is_ok();
        if writable {
            let _ = std::fs::remove_file(root.join(".write-check"));
        } else {
            let response = send(&app, empty_request(Method::DELETE, &format!("/delete/{name}"))).await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body_bytes(response).await, b"Error deleting file");
        }
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        if !writable {
            assert_eq!(listed(&app).await.len(), 1);
        }
    }

    #[tokio::test]
    async fn version_reports_build_fields() {
        let (_temp, app) = make_app(1024, 1024);
        let response = send(&app, empty_request(Method::GET, "/api/version")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let info = body_json(response).await;
        let mut keys: Vec<&str> = info
            .as_object()
            .expect("object")
            .keys()
            .map(String::as_str)
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, ["buildEnv", "buildTime", "version"]);
        assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn traversal_download_stays_in_storage() {
        let (temp, app) = make_app(1024, 1024);
        std::fs::write(temp.path().join("passwd"), b"root:x:0:0").expect("write outside");

        let response = send(
            &app,
            empty_request(Method::GET, "/download/..%2F..%2Fetc%2Fpasswd"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&app, empty_request(Method::GET, "/download/..%2Fpasswd")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_unknown_is_not_found() {
        let (_temp, app) = make_app(1024, 1024);
        let response = send(&app, empty_request(Method::DELETE, "/delete/never-uploaded.txt")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_bytes(response).await, b"File not found");
    }

    #[tokio::test]
    async fn usage_matches_listing_after_mutations() {
        let (_temp, app) = make_app(1024, 1024);
        for (name, data) in [("a.txt", &b"abc"[..]), ("b.png", &b"1234567"[..]), ("c.mp4", &b"xy"[..])] {
            let mime = mime_guess::from_path(name).first_or_octet_stream();
            let response = send(&app, multipart_request("file", name, mime.essence_str(), data)).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        let files = listed(&app).await;
        let victim = files
            .iter()
            .find(|file| file["name"].as_str().is_some_and(|name| name.ends_with("-b.png")))
            .and_then(|file| file["name"].as_str())
            .expect("b.png listed")
            .to_string();
        let response = send(&app, empty_request(Method::DELETE, &format!("/delete/{victim}"))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let listed_sum: u64 = listed(&app)
            .await
            .iter()
            .filter_map(|file| file["size"].as_u64())
            .sum();
        assert_eq!(listed_sum, 5);
        assert_eq!(usage(&app).await["used"], 5);
    }

    #[tokio::test]
    async fn responses_carry_security_headers() {
        let (_temp, app) = make_app(1024, 1024);
        let response = send(&app, empty_request(Method::GET, "/files")).await;
        assert_eq!(
            response.headers().get(header::X_CONTENT_TYPE_OPTIONS).expect("nosniff"),
            "nosniff"
        );
        assert_eq!(
            response.headers().get(header::X_FRAME_OPTIONS).expect("frame options"),
            "DENY"
        );
    }
}
