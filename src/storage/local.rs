//! Local filesystem archive.
//!
//! Pages are written atomically (temp file, then rename). The metadata log
//! is rewritten under a lock so concurrent fetches never lose records.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{NormalizedRequest, RawPage};
use crate::storage::{ArchiveRecord, RawArchive};
use crate::utils::url::safe_filename;

const METADATA_FILE: &str = "search_metadata.json";

/// Local filesystem archive backend.
pub struct LocalArchive {
    root_dir: PathBuf,
    metadata_lock: Mutex<()>,
}

impl LocalArchive {
    /// Create an archive rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            metadata_lock: Mutex::new(()),
        }
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Write JSON data.
    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_bytes(key, &bytes).await
    }

    /// Read JSON data, returning None if the file doesn't exist.
    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match tokio::fs::read(self.path(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }
}

#[async_trait]
impl RawArchive for LocalArchive {
    async fn store(
        &self,
        request: &NormalizedRequest,
        page: &RawPage,
        total_tweets: usize,
    ) -> Result<ArchiveRecord> {
        let now = Utc::now();
        let html_file = format!(
            "{}_{}.html",
            safe_filename(&page.url),
            now.format("%Y%m%d_%H%M%S%3f")
        );
        self.write_bytes(&html_file, page.html.as_bytes()).await?;

        let record = ArchiveRecord {
            timestamp: now,
            query: request.target.clone(),
            url: page.url.clone(),
            html_file,
            parameters: serde_json::to_value(request)?,
            pages_loaded: page.pages,
            total_tweets,
            requested_tweets: request.max_results,
        };

        let _guard = self.metadata_lock.lock().await;
        let mut records: Vec<ArchiveRecord> =
            self.read_json(METADATA_FILE).await?.unwrap_or_default();
        records.push(record.clone());
        self.write_json(METADATA_FILE, &records).await?;

        log::debug!("Archived {} as {}", page.url, record.html_file);
        Ok(record)
    }

    async fn records(&self) -> Result<Vec<ArchiveRecord>> {
        let _guard = self.metadata_lock.lock().await;
        Ok(self.read_json(METADATA_FILE).await?.unwrap_or_default())
    }
}
