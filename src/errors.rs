use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("PARSE_FAILURE: {0}")]
    Codec(#[from] CodecError),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("KIND_MISMATCH: record '{id}' is {actual}, collection holds {expected}")]
    KindMismatch {
        id: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("WATCH_FAILURE: {0}")]
    Watch(String),
    #[error("PATH_OUTSIDE_ROOT: {}", .0.display())]
    OutsideRoot(PathBuf),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<notify::Error> for StoreError {
    fn from(value: notify::Error) -> Self {
        Self::Watch(value.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
