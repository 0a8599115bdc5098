use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Invalid content identifier: {0}")]
    Validation(String),

    #[error("No reconstruction known for content identifier: {0}")]
    ReconstructionMiss(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Discriminator for a [`StoreError`], cheap to copy into batch reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Encoding,
    BackendUnavailable,
    Validation,
    ReconstructionMiss,
    Config,
    Io,
    Cancelled,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Encoding(_) => ErrorKind::Encoding,
            StoreError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::ReconstructionMiss(_) => ErrorKind::ReconstructionMiss,
            StoreError::Config(_) => ErrorKind::Config,
            StoreError::Io(_) => ErrorKind::Io,
            StoreError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Encoding(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
