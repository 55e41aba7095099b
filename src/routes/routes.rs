//! Defines routes for chunked uploads, sharing and storage management.
//!
//! ## Structure
//! - **Chunked upload** (`/chunk/upload`)
//!   - `POST   /init` — start, resume or deduplicate an upload
//!   - `POST   /chunk/{upload_id}/{chunk_index}` — store one chunk
//!   - `GET    /status/{upload_id}` — progress and missing chunks
//!   - `POST   /verify/{upload_id}/{chunk_index}` — compare a chunk hash
//!   - `POST   /complete/{upload_id}` — merge and publish
//!   - `DELETE /cancel/{upload_id}` — abandon an upload
//!
//! - **Sharing** (`/share`)
//!   - `POST /file` — single-request upload
//!   - `GET  /select?code=` — file info and download URL
//!   - `GET  /download?code=` — file contents
//!
//! - **Storage** (`/storage`)
//!   - `GET  /storage` — active and available backends
//!   - `PUT  /storage/current` — switch backend
//!   - `POST /storage/test/{type}` — connection test

use crate::{
    handlers::{
        chunk_handlers::{
            cancel_upload, complete_upload, init_upload, upload_chunk, upload_status,
            verify_chunk,
        },
        health_handlers::{healthz, readyz},
        share_handlers::{download_file, select_file, share_file},
        storage_handlers::{storage_overview, switch_storage, test_storage},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
};

/// Room for multipart framing around a chunk.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the application router.
///
/// Chunk bodies are capped at `max_chunk_size` (plus multipart framing);
/// whole-file shares are size-checked while streaming instead.
pub fn routes(max_chunk_size: usize) -> Router<AppState> {
    let chunk_upload = Router::new()
        .route("/init", post(init_upload))
        .route(
            "/chunk/{upload_id}/{chunk_index}",
            post(upload_chunk).layer(DefaultBodyLimit::max(max_chunk_size + MULTIPART_OVERHEAD)),
        )
        .route("/status/{upload_id}", get(upload_status))
        .route("/verify/{upload_id}/{chunk_index}", post(verify_chunk))
        .route("/complete/{upload_id}", post(complete_upload))
        .route("/cancel/{upload_id}", delete(cancel_upload));

    let share = Router::new()
        .route("/file", post(share_file).layer(DefaultBodyLimit::disable()))
        .route("/select", get(select_file))
        .route("/download", get(download_file));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/chunk/upload", chunk_upload)
        .nest("/share", share)
        .route("/storage", get(storage_overview))
        .route("/storage/current", put(switch_storage))
        .route("/storage/test/{type}", post(test_storage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig,
        db,
        services::chunk_service::sha256_hex,
        storage::{StorageKind, local::LocalStrategy, service::ConcreteStorageService},
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode, header},
        response::Response,
    };
    use bytes::Bytes;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        _dir: tempfile::TempDir,
    }

    async fn app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::resolve(Default::default(), |_| None).unwrap();
        let storage = Arc::new(ConcreteStorageService::with_strategies(
            StorageKind::Local,
            vec![Arc::new(LocalStrategy::new(dir.path()))],
        ));
        let state = AppState::new(config, Arc::new(db::memory_pool().await), storage);
        TestApp {
            router: routes(1024).with_state(state),
            _dir: dir,
        }
    }

    impl TestApp {
        async fn send(&self, request: Request<Body>) -> (StatusCode, Bytes) {
            let response: Response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            (status, to_bytes(response.into_body(), usize::MAX).await.unwrap())
        }

        async fn json(&self, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap();
            let (status, bytes) = self.send(request).await;
            (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
        }

        async fn raw(&self, uri: &str, body: &'static [u8]) -> (StatusCode, Value) {
            let request = Request::post(uri).body(Body::from(body)).unwrap();
            let (status, bytes) = self.send(request).await;
            (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
        }
    }

    #[tokio::test]
    async fn chunked_upload_over_http() {
        let app = app().await;
        let content = b"hello chunked world";
        let (status, init) = app
            .json(
                Method::POST,
                "/chunk/upload/init",
                json!({
                    "fileName": "greeting.txt",
                    "fileSize": content.len(),
                    "chunkSize": 8,
                    "fileHash": sha256_hex(content),
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(init["existed"], false);
        assert_eq!(init["totalChunks"], 3);
        let upload_id = init["uploadID"].as_str().unwrap().to_string();

        for (index, part) in [&content[0..8], &content[8..16], &content[16..]].iter().enumerate() {
            let request = Request::post(format!("/chunk/upload/chunk/{}/{}", upload_id, index))
                .body(Body::from(part.to_vec()))
                .unwrap();
            let (status, body) = app.send(request).await;
            assert_eq!(status, StatusCode::OK);
            let body: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(body["chunkHash"], sha256_hex(part));
        }

        let (status, verify) = app
            .json(
                Method::POST,
                &format!("/chunk/upload/verify/{}/0", upload_id),
                json!({ "chunk_hash": sha256_hex(&content[0..8]) }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(verify["verified"], true);

        let (status, done) = app
            .json(
                Method::POST,
                &format!("/chunk/upload/complete/{}", upload_id),
                json!({ "expire_value": 2, "expire_style": "count" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(done["fileName"], "greeting.txt");
        assert_eq!(done["fileSize"], content.len());
        let code = done["code"].as_str().unwrap().to_string();
        assert_eq!(done["shareURL"], format!("/share/select?code={}", code));

        let (status, selected) = app
            .json(Method::GET, &format!("/share/select?code={}", code), Value::Null)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(selected["remainingCount"], 1);
        assert_eq!(selected["downloadURL"], format!("/share/download?code={}", code));

        let request = Request::get(format!("/share/download?code={}", code))
            .body(Body::empty())
            .unwrap();
        let (status, body) = app.send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], content);
    }

    #[tokio::test]
    async fn accepts_multipart_chunks() {
        let app = app().await;
        let (_, init) = app
            .json(
                Method::POST,
                "/chunk/upload/init",
                json!({
                    "file_name": "a.bin",
                    "file_size": 4,
                    "chunk_size": 4,
                    "file_hash": sha256_hex(b"abcd"),
                }),
            )
            .await;
        let upload_id = init["uploadID"].as_str().unwrap();

        let boundary = "XBOUNDARYX";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\n\
             Content-Type: application/octet-stream\r\n\r\nabcd\r\n--{b}--\r\n",
            b = boundary
        );
        let request = Request::post(format!("/chunk/upload/chunk/{}/0", upload_id))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();
        let (status, body) = app.send(request).await;
        assert_eq!(status, StatusCode::OK, "{:?}", body);

        let (_, status) = app
            .json(Method::GET, &format!("/chunk/upload/status/{}", upload_id), Value::Null)
            .await;
        assert_eq!(status["status"], "completed");
        assert_eq!(status["uploadedChunks"], json!([0]));
    }

    #[tokio::test]
    async fn errors_carry_json_status() {
        let app = app().await;

        let (status, body) = app.raw("/chunk/upload/chunk/nope/0", b"data").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], 404);
        assert!(body["error"].as_str().unwrap().contains("nope"));

        let (status, body) = app
            .json(
                Method::POST,
                "/chunk/upload/init",
                json!({ "fileName": "x", "fileSize": 10, "chunkSize": 4, "fileHash": "zz" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);

        let (status, _) = app
            .json(
                Method::POST,
                "/chunk/upload/init",
                json!({
                    "fileName": "x",
                    "fileSize": 100 * 1024 * 1024,
                    "chunkSize": 4,
                    "fileHash": sha256_hex(b"x"),
                }),
            )
            .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        let (_, init) = app
            .json(
                Method::POST,
                "/chunk/upload/init",
                json!({ "fileName": "x", "fileSize": 8, "chunkSize": 4, "fileHash": sha256_hex(b"12345678") }),
            )
            .await;
        let upload_id = init["uploadID"].as_str().unwrap();
        let (status, body) = app
            .json(Method::POST, &format!("/chunk/upload/complete/{}", upload_id), json!({}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], 409);

        let (status, body) = app
            .json(Method::DELETE, &format!("/chunk/upload/cancel/{}", upload_id), Value::Null)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, _) = app
            .json(Method::GET, "/share/select?code=missing", Value::Null)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn identified_callers_get_the_larger_limit() {
        let app = app().await;
        let request = Request::post("/chunk/upload/init")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-user-id", "42")
            .body(Body::from(
                json!({
                    "fileName": "big.iso",
                    "fileSize": 20 * 1024 * 1024,
                    "chunkSize": 1024 * 1024,
                    "fileHash": sha256_hex(b"big"),
                })
                .to_string(),
            ))
            .unwrap();
        let (status, _) = app.send(request).await;
        assert_eq!(status, StatusCode::OK);

        let request = Request::post("/chunk/upload/init")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-user-id", "not-a-number")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _) = app.send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn shares_a_whole_file() {
        let app = app().await;
        let boundary = "SHAREBOUNDARY";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"expireStyle\"\r\n\r\nforever\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"notes.md\"\r\n\
             Content-Type: text/markdown\r\n\r\n# notes\r\n--{b}--\r\n",
            b = boundary
        );
        let request = Request::post("/share/file")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();
        let (status, body) = app.send(request).await;
        assert_eq!(status, StatusCode::OK, "{:?}", body);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["fileName"], "notes.md");
        assert_eq!(body["fileSize"], 7);
        assert_eq!(body["existed"], false);
        assert!(body["expiredAt"].is_null());
    }

    #[tokio::test]
    async fn manages_storage_backends() {
        let app = app().await;
        let (status, overview) = app.json(Method::GET, "/storage", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(overview, json!({ "current": "local", "available": ["local"] }));

        let (status, _) = app
            .json(Method::PUT, "/storage/current", json!({ "type": "s3" }))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = app
            .json(Method::PUT, "/storage/current", json!({ "type": "ftp" }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, info) = app.json(Method::POST, "/storage/test/local", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["type"], "local");
        assert_eq!(info["connected"], true);

        let (status, ready) = app.json(Method::GET, "/readyz", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ready["checks"]["sqlite"]["ok"], true);
        assert_eq!(ready["checks"]["local"]["ok"], true);
    }
}
