//! Persistent records of the upload pipeline.
//!
//! Each struct maps to one SQLite table via `sqlx::FromRow` and serializes
//! as JSON via `serde`.

pub mod chunk;
pub mod file_code;
pub mod upload_session;
