//! Backend inspection and switching.

use super::extract::JsonBody;
use crate::{
    errors::AppError,
    state::AppState,
    storage::{StorageKind, service::StorageInfo},
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct StorageOverview {
    pub current: StorageKind,
    pub available: Vec<StorageKind>,
}

#[derive(Debug, Deserialize)]
pub struct SwitchBody {
    #[serde(rename = "type", alias = "storage_type")]
    pub kind: String,
}

/// `GET /storage`
pub async fn storage_overview(State(state): State<AppState>) -> Json<StorageOverview> {
    Json(StorageOverview {
        current: state.storage.current_kind(),
        available: state.storage.available_kinds(),
    })
}

/// `PUT /storage/current`
pub async fn switch_storage(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<SwitchBody>,
) -> Result<Json<StorageOverview>, AppError> {
    let kind: StorageKind = body.kind.parse()?;
    state.storage.switch(kind)?;
    Ok(storage_overview(State(state)).await)
}

/// `POST /storage/test/{type}`
pub async fn test_storage(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<StorageInfo>, AppError> {
    let kind: StorageKind = kind.parse()?;
    Ok(Json(state.storage.test_connection_with_result(kind).await))
}
