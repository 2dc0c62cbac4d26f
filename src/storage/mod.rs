//! Archive of raw upstream pages.
//!
//! Every successful fetch can be kept on disk next to a running log of
//! what was requested, so parser changes can be checked against real
//! pages later.
//!
//! ## Directory Structure
//!
//! ```text
//! cache/
//! ├── search_metadata.json                          # One record per fetch
//! └── https___nitter_net_search_f_tweets_q_python_20240320_101500.html
//! ```

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{NormalizedRequest, RawPage};

// Re-export for convenience
pub use local::LocalArchive;

/// One entry of `search_metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveRecord {
    pub timestamp: DateTime<Utc>,
    /// Search query or username
    pub query: String,
    pub url: String,
    /// Path of the stored page, relative to the archive root
    pub html_file: String,
    /// Normalized request parameters
    pub parameters: serde_json::Value,
    pub pages_loaded: usize,
    pub total_tweets: usize,
    pub requested_tweets: usize,
}

/// Storage backend for raw pages.
#[async_trait]
pub trait RawArchive: Send + Sync {
    /// Store `page` and record what produced it.
    async fn store(
        &self,
        request: &NormalizedRequest,
        page: &RawPage,
        total_tweets: usize,
    ) -> Result<ArchiveRecord>;

    /// All records written so far, oldest first.
    async fn records(&self) -> Result<Vec<ArchiveRecord>>;
}
