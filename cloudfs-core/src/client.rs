use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{RANGE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use url::Url;

use crate::store::{EntryKind, RemoteEntry, RemoteError, RemoteStore, UploadTarget};

const LIST_PAGE_SIZE: u32 = 200;

/// `RemoteStore` over the JSON REST surface of the file service.
#[derive(Clone)]
pub struct HttpRemote {
    http: Client,
    base_url: Url,
    token: String,
}

impl HttpRemote {
    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, RemoteError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub fn with_http(http: Client, base_url: &str, token: impl Into<String>) -> Result<Self, RemoteError> {
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn list_children_page(
        &self,
        dir_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<ResourceList, RemoteError> {
        let mut url = self.endpoint(&["v1", "nodes", dir_id, "children"])?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string());
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidBase)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Api {
            status,
            body,
            retry_after,
        })
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn list_children(&self, dir_id: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let mut offset = 0u32;
        let mut items = Vec::new();
        loop {
            let page = self
                .list_children_page(dir_id, LIST_PAGE_SIZE, offset)
                .await?;
            offset = offset.saturating_add(page.items.len() as u32);
            let exhausted = page.items.is_empty();
            for item in page.items {
                items.push(item.into_entry()?);
            }
            if exhausted || offset >= page.total {
                break;
            }
        }
        Ok(items)
    }

    async fn get_range(&self, id: &str, offset: u64, length: u64) -> Result<Bytes, RemoteError> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let url = self.endpoint(&["v1", "nodes", id, "content"])?;
        let last = offset.saturating_add(length) - 1;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .header(RANGE, format!("bytes={offset}-{last}"))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let partial = response.status() == StatusCode::PARTIAL_CONTENT;
        let body = response.bytes().await?;
        if partial {
            return Ok(body);
        }
        // Server ignored the range header; slice the full body ourselves.
        let start = (offset as usize).min(body.len());
        let end = (offset.saturating_add(length) as usize).min(body.len());
        Ok(body.slice(start..end))
    }

    async fn begin_upload(&self, target: &UploadTarget, size: u64) -> Result<String, RemoteError> {
        let url = self.endpoint(&["v1", "uploads"])?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&UploadRequest { target, size })
            .send()
            .await?;
        let session: UploadSession = Self::handle_response(response).await?;
        Ok(session.session_id)
    }

    async fn upload_chunk(
        &self,
        session: &str,
        offset: u64,
        data: Bytes,
    ) -> Result<(), RemoteError> {
        let mut url = self.endpoint(&["v1", "uploads", session])?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string());
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .body(data)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn finish_upload(&self, session: &str) -> Result<RemoteEntry, RemoteError> {
        let url = self.endpoint(&["v1", "uploads", session, "commit"])?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let resource: Resource = Self::handle_response(response).await?;
        resource.into_entry()
    }

    async fn create_dir(&self, parent_id: &str, name: &str) -> Result<RemoteEntry, RemoteError> {
        let url = self.endpoint(&["v1", "nodes", parent_id, "children"])?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&CreateDirRequest {
                name,
                kind: EntryKind::Dir,
            })
            .send()
            .await?;
        let resource: Resource = Self::handle_response(response).await?;
        resource.into_entry()
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        let url = self.endpoint(&["v1", "nodes", id])?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn rename(
        &self,
        id: &str,
        new_name: &str,
        new_parent: Option<&str>,
    ) -> Result<RemoteEntry, RemoteError> {
        let url = self.endpoint(&["v1", "nodes", id])?;
        let response = self
            .http
            .patch(url)
            .header("Authorization", self.auth_header_value())
            .json(&RenameRequest {
                name: new_name,
                parent_id: new_parent,
            })
            .send()
            .await?;
        let resource: Resource = Self::handle_response(response).await?;
        resource.into_entry()
    }
}

fn parse_retry_after(value: &str) -> Option<u64> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value.trim()).ok()?;
    Some(
        at.duration_since(std::time::SystemTime::now())
            .map(|d| d.as_secs())
            .unwrap_or(0),
    )
}

fn parse_modified(value: Option<&str>) -> Result<i64, time::error::Parse> {
    let Some(value) = value else {
        return Ok(0);
    };
    Ok(OffsetDateTime::parse(value, &Rfc3339)?.unix_timestamp())
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Resource {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: EntryKind,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
}

impl Resource {
    fn into_entry(self) -> Result<RemoteEntry, RemoteError> {
        Ok(RemoteEntry {
            mtime: parse_modified(self.modified.as_deref())?,
            id: self.id,
            name: self.name,
            kind: self.resource_type,
            size: self.size.unwrap_or(0),
            checksum: self.md5.map(|sum| sum.to_ascii_lowercase()),
        })
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ResourceList {
    pub items: Vec<Resource>,
    pub limit: u32,
    pub offset: u32,
    pub total: u32,
}

#[derive(Debug, Deserialize)]
struct UploadSession {
    session_id: String,
}

#[derive(Serialize)]
struct UploadRequest<'a> {
    target: &'a UploadTarget,
    size: u64,
}

#[derive(Serialize)]
struct CreateDirRequest<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: EntryKind,
}

#[derive(Serialize)]
struct RenameRequest<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
}
