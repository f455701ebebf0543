//! Thin HTTP transport for the remote object store (SPEC_FULL.md S2 item 9).
//!
//! Reduced from the teacher's `ApiClient`: same `send_authed`/`map_status`
//! shape and bearer-token convention, cut down to the blob operations
//! `RemoteSide` needs plus the `disk_usage` probe the error handler uses to
//! distinguish quota/revocation/offline (spec.md S4.5).

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::errors::SyncError;

/// Capability the error handler needs to classify a failure (spec.md
/// S4.5): probe the remote for disk usage, revocation, and permission
/// status. Abstracted the same way `side::Side` is so tests can substitute
/// a controllable fake instead of a real `ApiClient`.
#[async_trait]
pub trait RemoteProbe: Send + Sync {
    async fn disk_usage(&self) -> Result<DiskUsage>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobInfo {
    pub path: String,
    pub etag: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskUsage {
    pub used_bytes: u64,
    pub quota_bytes: Option<u64>,
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("build http client")?;
        Ok(ApiClient {
            http,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/blobs/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    async fn send_authed(&self, builder: reqwest::RequestBuilder) -> Result<Response> {
        let resp = builder
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|_| SyncError::Offline)?;
        Ok(resp)
    }

    fn map_status(status: StatusCode) -> Option<SyncError> {
        match status.as_u16() {
            400 => Some(SyncError::Revoked),
            403 => Some(SyncError::WrongPermissions),
            413 => Some(SyncError::QuotaExceeded),
            _ => None,
        }
    }

    async fn map_error(resp: Response) -> anyhow::Error {
        let status = resp.status();
        if let Some(classified) = Self::map_status(status) {
            return classified.into();
        }
        let body = resp.text().await.unwrap_or_default();
        anyhow::anyhow!("remote request failed: {status} {body}")
    }

    pub async fn upload_blob(&self, path: &str, bytes: Vec<u8>) -> Result<BlobInfo> {
        let resp = self
            .send_authed(self.http.put(self.url(path)).body(bytes))
            .await?;
        if !resp.status().is_success() {
            return Err(Self::map_error(resp).await);
        }
        resp.json().await.context("decode upload response")
    }

    pub async fn download_blob(&self, path: &str) -> Result<Vec<u8>> {
        let resp = self.send_authed(self.http.get(self.url(path))).await?;
        if !resp.status().is_success() {
            return Err(Self::map_error(resp).await);
        }
        resp.bytes().await.map(|b| b.to_vec()).context("read blob body")
    }

    pub async fn delete_blob(&self, path: &str) -> Result<()> {
        let resp = self.send_authed(self.http.delete(self.url(path))).await?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(Self::map_error(resp).await);
        }
        Ok(())
    }

    pub async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobInfo>> {
        let resp = self
            .send_authed(
                self.http
                    .get(format!("{}/blobs", self.base_url.trim_end_matches('/')))
                    .query(&[("prefix", prefix)]),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(Self::map_error(resp).await);
        }
        resp.json().await.context("decode list response")
    }
}

#[async_trait]
impl RemoteProbe for ApiClient {
    /// Probed by the error handler to distinguish offline/revoked/quota
    /// (spec.md S4.5).
    async fn disk_usage(&self) -> Result<DiskUsage> {
        let resp = self
            .send_authed(self.http.get(format!("{}/disk-usage", self.base_url.trim_end_matches('/'))))
            .await?;
        if !resp.status().is_success() {
            return Err(Self::map_error(resp).await);
        }
        resp.json().await.context("decode disk usage response")
    }
}
