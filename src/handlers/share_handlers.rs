//! Whole-file sharing and retrieval by code.

use super::{
    chunk_handlers::{default_expire_style, default_expire_value},
    extract::CallerId,
};
use crate::{
    errors::AppError,
    services::share_service::ShareUpload,
    state::AppState,
    storage::ByteStream,
};
use axum::{
    Json,
    extract::{Multipart, Query, State},
    response::Response,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, channel::mpsc};
use serde::{Deserialize, Serialize};
use std::io;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareResponse {
    pub code: String,
    #[serde(rename = "shareURL")]
    pub share_url: String,
    pub file_name: String,
    pub file_size: i64,
    pub expired_at: Option<DateTime<Utc>>,
    pub existed: bool,
}

#[derive(Debug, Deserialize)]
pub struct CodeQuery {
    pub code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectResponse {
    pub code: String,
    pub file_name: String,
    pub file_size: i64,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    pub direct_access: bool,
    pub expired_at: Option<DateTime<Utc>>,
    /// Downloads left; `-1` when unlimited.
    pub remaining_count: i64,
    pub used_count: i64,
}

/// `POST /share/file`
///
/// Multipart form with a `file` part. Optional `expireValue` and `expireStyle`
/// parts must come before the file; the file is streamed straight to storage.
pub async fn share_file(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    mut multipart: Multipart,
) -> Result<Json<ShareResponse>, AppError> {
    let mut expire_value = default_expire_value();
    let mut expire_style = default_expire_style();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::new(e.status(), e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "expireValue" | "expire_value" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::new(e.status(), e.body_text()))?;
                expire_value = text
                    .trim()
                    .parse()
                    .map_err(|_| AppError::bad_request(format!("invalid expireValue `{}`", text)))?;
            }
            "expireStyle" | "expire_style" => {
                expire_style = field
                    .text()
                    .await
                    .map_err(|e| AppError::new(e.status(), e.body_text()))?;
            }
            "file" => {
                let upload = ShareUpload {
                    file_name: field.file_name().unwrap_or_default().to_string(),
                    expire_value,
                    expire_style,
                    size_limit: state.size_limit(user_id),
                    user_id,
                };

                // feed the part through a channel so the service can own a 'static stream
                let (mut tx, rx) = mpsc::channel::<io::Result<Bytes>>(4);
                let source: ByteStream = Box::pin(rx);
                let pump = async move {
                    loop {
                        let next = match field.chunk().await {
                            Ok(Some(bytes)) => Ok(bytes),
                            Ok(None) => break,
                            Err(err) => Err(io::Error::other(err.body_text())),
                        };
                        let failed = next.is_err();
                        if tx.send(next).await.is_err() || failed {
                            break;
                        }
                    }
                };
                let ((), shared) = tokio::join!(pump, state.shares.upload_file(upload, source));
                let shared = shared?;

                let fc = shared.file_code;
                return Ok(Json(ShareResponse {
                    share_url: state.share_url(&fc.code),
                    file_name: fc.display_name(),
                    file_size: fc.size,
                    expired_at: fc.expired_at,
                    existed: shared.existed,
                    code: fc.code,
                }));
            }
            _ => {}
        }
    }

    Err(AppError::bad_request("multipart field `file` is required"))
}

/// `GET /share/select?code=`
pub async fn select_file(
    State(state): State<AppState>,
    Query(query): Query<CodeQuery>,
) -> Result<Json<SelectResponse>, AppError> {
    let selected = state.shares.select(&query.code).await?;
    let fc = selected.file_code;
    Ok(Json(SelectResponse {
        file_name: fc.display_name(),
        file_size: fc.size,
        download_url: selected.download.download_url,
        direct_access: selected.download.direct_access,
        expired_at: fc.expired_at,
        remaining_count: fc.expired_count,
        used_count: fc.used_count,
        code: fc.code,
    }))
}

/// `GET /share/download?code=`
pub async fn download_file(
    State(state): State<AppState>,
    Query(query): Query<CodeQuery>,
) -> Result<Response, AppError> {
    Ok(state.shares.download(&query.code).await?)
}
