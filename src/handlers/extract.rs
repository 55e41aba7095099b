//! Request extractors shared by the handlers.

use crate::errors::AppError;
use axum::{
    Json,
    extract::{FromRequest, FromRequestParts, Request},
    http::request::Parts,
};
use serde::de::DeserializeOwned;

/// Header the upstream auth layer sets for identified callers.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Caller identity from [`USER_ID_HEADER`]; `None` for anonymous requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerId(pub Option<i64>);

impl<S: Send + Sync> FromRequestParts<S> for CallerId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(USER_ID_HEADER) else {
            return Ok(CallerId(None));
        };
        value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|id| CallerId(Some(id)))
            .ok_or_else(|| AppError::bad_request(format!("invalid {} header", USER_ID_HEADER)))
    }
}

/// `Json<T>` whose rejections use the JSON error body.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => Err(AppError::bad_request(rejection.body_text())),
        }
    }
}
