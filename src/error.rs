//! Storage error type shared by the record store, metric catalog and training sink.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{context} failed: {status} - {body}")]
    Status {
        context: String,
        status: u16,
        body: String,
    },

    #[error("Unexpected row shape: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
