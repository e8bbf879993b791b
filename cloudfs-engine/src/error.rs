use cloudfs_core::RemoteError;
use thiserror::Error;

use crate::cache::CacheError;
use crate::meta::MetaError;
use crate::persist::IndexError;
use crate::transfer::TransferError;

/// Closed set of failure categories every engine error folds into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    NameExists,
    Conflict,
    Transient,
    Permanent,
    CacheExhausted,
    Cancelled,
    NotEmpty,
    NotADirectory,
    IsADirectory,
    InvalidName,
    Io,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} has unresolved local and remote changes")]
    Conflict(String),
    #[error("timed out waiting for {0}")]
    TimedOut(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Meta(err) => err.kind(),
            EngineError::Cache(err) => err.kind(),
            EngineError::Transfer(err) => err.kind(),
            EngineError::Remote(err) => remote_kind(err),
            EngineError::Index(_) | EngineError::Io(_) => ErrorKind::Io,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::TimedOut(_) => ErrorKind::Transient,
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

pub(crate) fn remote_kind(err: &RemoteError) -> ErrorKind {
    use cloudfs_core::ApiErrorClass;
    match err.classification() {
        ApiErrorClass::Transient | ApiErrorClass::RateLimit => ErrorKind::Transient,
        ApiErrorClass::NotFound => ErrorKind::NotFound,
        ApiErrorClass::Auth | ApiErrorClass::Permanent => ErrorKind::Permanent,
    }
}
