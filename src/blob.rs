//! Blob storage for mirrored page images.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::error::BlobError;
use crate::http_client::EnhancedHttpClient;

pub const DEFAULT_SIGNED_URL_TTL: Duration = Duration::from_secs(3600);

/// Where an uploaded object comes from.
#[derive(Debug, Clone)]
pub enum BlobSource {
    /// Fetched over HTTP before storing.
    Url(String),
    Bytes(Vec<u8>),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store an object at `path`, replacing any existing one. Returns the path.
    async fn upload(&self, source: BlobSource, path: &str) -> Result<String, BlobError>;

    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String, BlobError>;

    fn public_url(&self, path: &str) -> String;

    async fn delete(&self, path: &str) -> Result<bool, BlobError>;

    /// Remove every object below `prefix`, returning how many were removed.
    async fn delete_folder(&self, prefix: &str) -> Result<usize, BlobError>;

    async fn exists(&self, path: &str) -> Result<bool, BlobError>;
}

/// Folder holding the mirrored pages of one chapter.
pub fn chapter_folder(work_id: &str, chapter_id: &str) -> String {
    format!("manga-{}/chapter-{}", work_id, chapter_id)
}

pub fn page_path(work_id: &str, chapter_id: &str, page_number: u32, extension: &str) -> String {
    format!("{}/page-{:03}.{}", chapter_folder(work_id, chapter_id), page_number, extension)
}

/// Image extension taken from the URL path, `jpg` when unknown.
pub fn image_extension(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or("");
    let ext = path.rsplit('/').next().and_then(|name| name.rsplit_once('.')).map(|(_, ext)| ext.to_lowercase());
    match ext.as_deref() {
        Some("png") => "png",
        Some("webp") => "webp",
        Some("gif") => "gif",
        Some("avif") => "avif",
        _ => "jpg",
    }
}

/// Blob store over a local directory.
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
    http: EnhancedHttpClient,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str, http: EnhancedHttpClient) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// Map a relative object path under the root, refusing escapes.
    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(path.trim_matches('/'));
        if path.trim().is_empty()
            || relative.components().any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(BlobError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, source: BlobSource, path: &str) -> Result<String, BlobError> {
        let target = self.resolve(path)?;
        let bytes = match source {
            BlobSource::Bytes(bytes) => bytes,
            BlobSource::Url(url) => self.http.get_bytes(&url).await?.0,
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, bytes).await?;
        log::debug!("Stored blob {}", path);
        Ok(path.to_string())
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String, BlobError> {
        if !self.exists(path).await? {
            return Err(BlobError::NotFound(path.to_string()));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("{}?expires={}", self.public_url(path), expires))
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}", self.public_base_url, path.trim_start_matches('/'))
    }

    async fn delete(&self, path: &str) -> Result<bool, BlobError> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_folder(&self, prefix: &str) -> Result<usize, BlobError> {
        let folder = self.resolve(prefix)?;
        if !fs::try_exists(&folder).await? {
            return Ok(0);
        }
        let mut removed = 0;
        let mut pending = vec![folder.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    pending.push(entry.path());
                } else {
                    removed += 1;
                }
            }
        }
        fs::remove_dir_all(&folder).await?;
        Ok(removed)
    }

    async fn exists(&self, path: &str) -> Result<bool, BlobError> {
        let target = self.resolve(path)?;
        Ok(fs::metadata(&target).await.map(|m| m.is_file()).unwrap_or(false))
    }
}
