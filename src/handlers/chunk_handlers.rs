//! Chunked upload endpoints under `/chunk/upload`.
//!
//! Request bodies use camelCase field names; the snake_case spellings older
//! clients send are accepted as aliases.

use super::extract::{CallerId, JsonBody};
use crate::{
    errors::AppError,
    services::chunk_service::{InitRequest, InitResponse, UploadStatus},
    state::AppState,
};
use axum::{
    Json,
    extract::{FromRequest, Multipart, Path, Request, State},
    http::{HeaderMap, header::CONTENT_TYPE},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitBody {
    #[serde(alias = "file_name")]
    pub file_name: String,
    #[serde(alias = "file_size")]
    pub file_size: i64,
    #[serde(alias = "chunk_size")]
    pub chunk_size: i64,
    #[serde(alias = "file_hash")]
    pub file_hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyBody {
    #[serde(alias = "expected_hash", alias = "chunk_hash", alias = "chunkHash")]
    pub expected_hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteBody {
    #[serde(default = "default_expire_value", alias = "expire_value")]
    pub expire_value: i64,
    #[serde(default = "default_expire_style", alias = "expire_style")]
    pub expire_style: String,
}

pub(crate) fn default_expire_value() -> i64 {
    1
}

pub(crate) fn default_expire_style() -> String {
    "day".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub chunk_hash: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub verified: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub code: String,
    #[serde(rename = "shareURL")]
    pub share_url: String,
    pub file_name: String,
    pub file_size: i64,
    pub expired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub success: bool,
}

/// `POST /chunk/upload/init`
pub async fn init_upload(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    JsonBody(body): JsonBody<InitBody>,
) -> Result<Json<InitResponse>, AppError> {
    let response = state
        .chunks
        .init(InitRequest {
            file_name: body.file_name,
            file_size: body.file_size,
            chunk_size: body.chunk_size,
            file_hash: body.file_hash,
            size_limit: state.size_limit(user_id),
            user_id,
        })
        .await?;
    Ok(Json(response))
}

/// `POST /chunk/upload/chunk/{upload_id}/{chunk_index}`
///
/// The body is the raw chunk, or a multipart form carrying it in `chunk`.
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path((upload_id, chunk_index)): Path<(String, i64)>,
    request: Request,
) -> Result<Json<ChunkResponse>, AppError> {
    let data = if is_multipart(request.headers()) {
        chunk_from_multipart(request, &state).await?
    } else {
        Bytes::from_request(request, &state)
            .await
            .map_err(|e| AppError::new(e.status(), e.body_text()))?
    };

    let chunk_hash = state
        .chunks
        .upload_chunk(&upload_id, chunk_index, data)
        .await?;
    Ok(Json(ChunkResponse { chunk_hash }))
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"))
}

async fn chunk_from_multipart(request: Request, state: &AppState) -> Result<Bytes, AppError> {
    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| AppError::new(e.status(), e.body_text()))?;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::new(e.status(), e.body_text()))?
    {
        if field.name() == Some("chunk") {
            return field
                .bytes()
                .await
                .map_err(|e| AppError::new(e.status(), e.body_text()));
        }
    }
    Err(AppError::bad_request("multipart field `chunk` is required"))
}

/// `GET /chunk/upload/status/{upload_id}`
pub async fn upload_status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<UploadStatus>, AppError> {
    Ok(Json(state.chunks.status(&upload_id).await?))
}

/// `POST /chunk/upload/verify/{upload_id}/{chunk_index}`
pub async fn verify_chunk(
    State(state): State<AppState>,
    Path((upload_id, chunk_index)): Path<(String, i64)>,
    JsonBody(body): JsonBody<VerifyBody>,
) -> Result<Json<VerifyResponse>, AppError> {
    let verified = state
        .chunks
        .verify_chunk(&upload_id, chunk_index, &body.expected_hash)
        .await?;
    Ok(Json(VerifyResponse { verified }))
}

/// `POST /chunk/upload/complete/{upload_id}`
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    CallerId(user_id): CallerId,
    JsonBody(body): JsonBody<CompleteBody>,
) -> Result<Json<CompleteResponse>, AppError> {
    let file_code = state
        .chunks
        .complete(&upload_id, body.expire_value, &body.expire_style, user_id)
        .await?;
    Ok(Json(CompleteResponse {
        share_url: state.share_url(&file_code.code),
        file_name: file_code.display_name(),
        file_size: file_code.size,
        expired_at: file_code.expired_at,
        code: file_code.code,
    }))
}

/// `DELETE /chunk/upload/cancel/{upload_id}`
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    state.chunks.cancel(&upload_id).await?;
    Ok(Json(CancelResponse { success: true }))
}
