use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments")]
    InvalidBase,
    #[error("invalid timestamp: {0}")]
    Time(#[from] time::error::Parse),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    NotFound,
    Permanent,
}

impl RemoteError {
    pub fn api(status: StatusCode, body: impl Into<String>) -> Self {
        RemoteError::Api {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn classification(&self) -> ApiErrorClass {
        match self {
            RemoteError::Api { status, .. } => classify_api_status(*status),
            RemoteError::Request(err) if err.is_timeout() || err.is_connect() => {
                ApiErrorClass::Transient
            }
            RemoteError::Request(err) if err.is_body() || err.is_request() => {
                ApiErrorClass::Transient
            }
            RemoteError::Request(err) => err
                .status()
                .map(classify_api_status)
                .unwrap_or(ApiErrorClass::Transient),
            RemoteError::Url(_) | RemoteError::InvalidBase | RemoteError::Time(_) => {
                ApiErrorClass::Permanent
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.classification() == ApiErrorClass::NotFound
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RemoteError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub(crate) fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        ApiErrorClass::NotFound
    } else if status == StatusCode::INSUFFICIENT_STORAGE {
        ApiErrorClass::Permanent
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// One child returned by a remote listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Unix seconds.
    pub mtime: i64,
    /// Lowercase hex md5 of the content, files only.
    pub checksum: Option<String>,
}

/// Where a finished upload lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UploadTarget {
    Replace { id: String },
    Create { parent_id: String, name: String },
}

/// Operations the engine needs from the remote file store.
///
/// Uploads are session based so a partially uploaded file can be resumed
/// chunk by chunk; `put` is the single-shot form.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_children(&self, dir_id: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    async fn get_range(&self, id: &str, offset: u64, length: u64) -> Result<Bytes, RemoteError>;

    async fn begin_upload(&self, target: &UploadTarget, size: u64) -> Result<String, RemoteError>;

    async fn upload_chunk(
        &self,
        session: &str,
        offset: u64,
        data: Bytes,
    ) -> Result<(), RemoteError>;

    async fn finish_upload(&self, session: &str) -> Result<RemoteEntry, RemoteError>;

    async fn create_dir(&self, parent_id: &str, name: &str) -> Result<RemoteEntry, RemoteError>;

    async fn delete(&self, id: &str) -> Result<(), RemoteError>;

    async fn rename(
        &self,
        id: &str,
        new_name: &str,
        new_parent: Option<&str>,
    ) -> Result<RemoteEntry, RemoteError>;

    async fn put(&self, target: &UploadTarget, data: Bytes) -> Result<RemoteEntry, RemoteError> {
        let session = self.begin_upload(target, data.len() as u64).await?;
        if !data.is_empty() {
            self.upload_chunk(&session, 0, data).await?;
        }
        self.finish_upload(&session).await
    }
}
