//! Error taxonomy for the ingestion core.
//!
//! Neither kind is fatal: a `DecodeError` drops one message, a `StoreError`
//! fails one operation. Callers log and carry on.

use thiserror::Error;

/// An inbound telemetry message that could not be turned into an event.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload must be a json object, got {0}")]
    NotAnObject(&'static str),

    #[error("field '{field}' has an unsupported value: {value}")]
    Field { field: &'static str, value: String },

    #[error("unparseable timestamp '{0}' (expected YYYY-MM-DD HH:MM:SS)")]
    Timestamp(String),
}

/// A persistence failure surfaced to the caller of a store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row for device '{device_id}': {detail}")]
    Corrupt { device_id: String, detail: String },
}

pub type StoreResult<T> = Result<T, StoreError>;
