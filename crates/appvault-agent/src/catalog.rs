//! Distribution server client.
//!
//! `GET {server}/api/apps/{key}/manifest` describes the current release;
//! the manifest's `download_url` is then streamed chunk by chunk. 404 means
//! the server does not know the application, everything that prevents an
//! answer (connect errors, timeouts, 5xx) means the server is unreachable.

use appvault_core::error::{Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

const FILE_READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteManifest {
    pub version: String,
    pub download_url: String,
    pub sha256: String,
    #[serde(default)]
    pub content_length: u64,
}

impl RemoteManifest {
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(SyncError::InvalidManifest("empty version".into()));
        }
        if self.download_url.trim().is_empty() {
            return Err(SyncError::InvalidManifest("empty download_url".into()));
        }
        if self.sha256.len() != 64 || !self.sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SyncError::InvalidManifest(format!(
                "sha256 is not a 64 character hex digest: {:?}",
                self.sha256
            )));
        }
        Ok(())
    }
}

/// One entry of the server's `/apps` listing. Accepts both the
/// `name`/`executable_prefix` spelling and `key`/`entry_point`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AppListing {
    #[serde(alias = "name")]
    pub key: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(alias = "executable_prefix")]
    pub entry_point: String,
    #[serde(default)]
    pub icon: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AppListingBody {
    apps: Vec<AppListing>,
}

#[async_trait]
pub trait ChunkStream: Send {
    /// Next piece of the artifact, `None` once the stream is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    async fn fetch_manifest(&self, app_key: &str) -> Result<RemoteManifest>;
    async fn fetch_artifact(&self, manifest: &RemoteManifest) -> Result<Box<dyn ChunkStream>>;
    async fn list_apps(&self) -> Result<Vec<AppListing>>;
}

#[derive(Clone)]
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpCatalog {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("appvault-agent/0.1")
            .connect_timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn resolve(&self, reference: &str) -> String {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            reference.to_string()
        } else {
            format!("{}/{}", self.base_url, reference.trim_start_matches('/'))
        }
    }
}

fn transport_error(e: reqwest::Error) -> SyncError {
    SyncError::Unreachable(e.to_string())
}

#[async_trait]
impl RemoteCatalog for HttpCatalog {
    async fn fetch_manifest(&self, app_key: &str) -> Result<RemoteManifest> {
        let url = format!("{}/api/apps/{}/manifest", self.base_url, app_key);
        debug!(%url, "fetching manifest");
        let res = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;
        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(app_key.to_string()));
        }
        if status.is_server_error() {
            return Err(SyncError::Unreachable(format!("manifest status {status}")));
        }
        if !status.is_success() {
            return Err(SyncError::InvalidManifest(format!("manifest status {status}")));
        }
        let body = res.bytes().await.map_err(transport_error)?;
        let manifest: RemoteManifest = serde_json::from_slice(&body)
            .map_err(|e| SyncError::InvalidManifest(format!("decode: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    async fn fetch_artifact(&self, manifest: &RemoteManifest) -> Result<Box<dyn ChunkStream>> {
        if let Some(path) = manifest.download_url.strip_prefix("file://") {
            return Ok(Box::new(FileChunks::open(PathBuf::from(path)).await?));
        }
        let url = self.resolve(&manifest.download_url);
        debug!(%url, "downloading artifact");
        // Bounds the wait for headers only; each chunk read has its own timeout.
        let res = match tokio::time::timeout(self.timeout, self.client.get(&url).send()).await {
            Ok(res) => res.map_err(transport_error)?,
            Err(_) => return Err(SyncError::Unreachable("download request timed out".into())),
        };
        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(manifest.download_url.clone()));
        }
        if status.is_server_error() {
            return Err(SyncError::Unreachable(format!("download status {status}")));
        }
        if !status.is_success() {
            return Err(SyncError::InvalidManifest(format!("download status {status}")));
        }
        Ok(Box::new(HttpChunks {
            response: res,
            timeout: self.timeout,
        }))
    }

    async fn list_apps(&self) -> Result<Vec<AppListing>> {
        let url = format!("{}/apps", self.base_url);
        let res = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;
        let status = res.status();
        if status.is_server_error() {
            return Err(SyncError::Unreachable(format!("listing status {status}")));
        }
        if !status.is_success() {
            return Err(SyncError::InvalidManifest(format!("listing status {status}")));
        }
        let body = res.bytes().await.map_err(transport_error)?;
        let listing: AppListingBody = serde_json::from_slice(&body)
            .map_err(|e| SyncError::InvalidManifest(format!("decode listing: {e}")))?;
        Ok(listing.apps)
    }
}

struct HttpChunks {
    response: reqwest::Response,
    timeout: Duration,
}

#[async_trait]
impl ChunkStream for HttpChunks {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match tokio::time::timeout(self.timeout, self.response.chunk()).await {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(e)) => Err(transport_error(e)),
            Err(_) => Err(SyncError::Unreachable("artifact read timed out".into())),
        }
    }
}

/// Local file source, used for `file://` download references and imports.
pub struct FileChunks {
    file: tokio::fs::File,
    buf: Vec<u8>,
}

impl FileChunks {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            file,
            buf: vec![0u8; FILE_READ_CHUNK],
        })
    }
}

#[async_trait]
impl ChunkStream for FileChunks {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let n = self.file.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
    }
}
