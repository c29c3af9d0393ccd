use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("record not found")]
    NotFound,

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Encoding(err.to_string())
    }
}

impl From<eyre::Report> for StoreError {
    fn from(err: eyre::Report) -> Self {
        StoreError::Encoding(err.to_string())
    }
}
