//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::RequestKind;

/// Upper bound on retries so a misconfigured file cannot hammer the upstream.
const MAX_RETRY_CEILING: u32 = 10;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Cache, rate limiting and retry settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Upstream site and HTTP behavior
    #[serde(default)]
    pub scraper: ScraperConfig,

    /// Raw page archive
    #[serde(default)]
    pub archive: ArchiveConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    ///
    /// Any error here is a startup failure, never a per-request one.
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;

        if self.scraper.user_agent.trim().is_empty() {
            return Err(AppError::validation("scraper.user_agent is empty"));
        }
        if self.scraper.timeout_secs == 0 {
            return Err(AppError::validation("scraper.timeout_secs must be > 0"));
        }
        if self.scraper.max_pages == 0 {
            return Err(AppError::validation("scraper.max_pages must be > 0"));
        }
        url::Url::parse(&self.scraper.base_url)
            .map_err(|e| AppError::validation(format!("scraper.base_url: {e}")))?;
        url::Url::parse(&self.scraper.image_domain)
            .map_err(|e| AppError::validation(format!("scraper.image_domain: {e}")))?;

        if self.archive.enabled && self.archive.dir.as_os_str().is_empty() {
            return Err(AppError::validation("archive.dir is empty"));
        }
        Ok(())
    }
}

/// Settings consumed by the fetch/cache/rate-limit core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Fetch attempts admitted per rate window
    #[serde(default = "defaults::max_requests_in_window")]
    pub max_requests_in_window: u32,

    /// Rate window length in milliseconds
    #[serde(default = "defaults::window_duration_ms")]
    pub window_duration_ms: u64,

    /// Longest a fetch may wait for rate limiter admission
    #[serde(default = "defaults::rate_limit_timeout_ms")]
    pub rate_limit_timeout_ms: u64,

    /// Fetches allowed to run against the upstream at once
    #[serde(default = "defaults::max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// Total payload bytes the cache may hold
    #[serde(default = "defaults::cache_capacity_bytes")]
    pub cache_capacity_bytes: usize,

    /// Freshness of search results
    #[serde(default = "defaults::search_ttl_secs")]
    pub search_ttl_secs: u64,

    /// Freshness of profile pages
    #[serde(default = "defaults::profile_ttl_secs")]
    pub profile_ttl_secs: u64,

    /// Interval of the eager expiry sweep (0 disables it)
    #[serde(default = "defaults::sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Extra attempts after the first failed fetch
    #[serde(default = "defaults::max_fetch_retries")]
    pub max_fetch_retries: u32,

    /// Timeout of one fetch attempt in milliseconds
    #[serde(default = "defaults::fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// First retry delay; doubles on each further attempt
    #[serde(default = "defaults::retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Cap on the retry delay
    #[serde(default = "defaults::retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl PipelineConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_duration_ms)
    }

    pub fn rate_limit_timeout(&self) -> Duration {
        Duration::from_millis(self.rate_limit_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    /// Cache lifetime for a result of the given kind.
    ///
    /// Searches go stale faster than profiles.
    pub fn ttl_for(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::Search => Duration::from_secs(self.search_ttl_secs),
            RequestKind::UserProfile => Duration::from_secs(self.profile_ttl_secs),
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_requests_in_window == 0 {
            return Err(AppError::validation(
                "pipeline.max_requests_in_window must be > 0",
            ));
        }
        if self.window_duration_ms == 0 {
            return Err(AppError::validation(
                "pipeline.window_duration_ms must be > 0",
            ));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(AppError::validation(
                "pipeline.max_concurrent_fetches must be > 0",
            ));
        }
        if self.cache_capacity_bytes == 0 {
            return Err(AppError::validation(
                "pipeline.cache_capacity_bytes must be > 0",
            ));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(AppError::validation("pipeline.fetch_timeout_ms must be > 0"));
        }
        if self.max_fetch_retries > MAX_RETRY_CEILING {
            return Err(AppError::validation(format!(
                "pipeline.max_fetch_retries must be <= {MAX_RETRY_CEILING}"
            )));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(AppError::validation(
                "pipeline.retry_max_delay_ms must be >= retry_base_delay_ms",
            ));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_requests_in_window: defaults::max_requests_in_window(),
            window_duration_ms: defaults::window_duration_ms(),
            rate_limit_timeout_ms: defaults::rate_limit_timeout_ms(),
            max_concurrent_fetches: defaults::max_concurrent_fetches(),
            cache_capacity_bytes: defaults::cache_capacity_bytes(),
            search_ttl_secs: defaults::search_ttl_secs(),
            profile_ttl_secs: defaults::profile_ttl_secs(),
            sweep_interval_secs: defaults::sweep_interval_secs(),
            max_fetch_retries: defaults::max_fetch_retries(),
            fetch_timeout_ms: defaults::fetch_timeout_ms(),
            retry_base_delay_ms: defaults::retry_base_delay_ms(),
            retry_max_delay_ms: defaults::retry_max_delay_ms(),
        }
    }
}

/// Upstream site and HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Nitter instance to read from
    #[serde(default = "defaults::base_url")]
    pub base_url: String,

    /// Host that serves original tweet images
    #[serde(default = "defaults::image_domain")]
    pub image_domain: String,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Per-page request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Delay between "Load more" pages in milliseconds
    #[serde(default = "defaults::page_delay")]
    pub page_delay_ms: u64,

    /// Hard stop on pagination
    #[serde(default = "defaults::max_pages")]
    pub max_pages: usize,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::base_url(),
            image_domain: defaults::image_domain(),
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            page_delay_ms: defaults::page_delay(),
            max_pages: defaults::max_pages(),
        }
    }
}

/// Raw page archive settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "defaults::archive_dir")]
    pub dir: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: defaults::archive_dir(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    // Pipeline defaults
    pub fn max_requests_in_window() -> u32 {
        10
    }
    pub fn window_duration_ms() -> u64 {
        60_000
    }
    pub fn rate_limit_timeout_ms() -> u64 {
        120_000
    }
    pub fn max_concurrent_fetches() -> usize {
        4
    }
    pub fn cache_capacity_bytes() -> usize {
        32 * 1024 * 1024
    }
    pub fn search_ttl_secs() -> u64 {
        60
    }
    pub fn profile_ttl_secs() -> u64 {
        300
    }
    pub fn sweep_interval_secs() -> u64 {
        30
    }
    pub fn max_fetch_retries() -> u32 {
        2
    }
    pub fn fetch_timeout_ms() -> u64 {
        90_000
    }
    pub fn retry_base_delay_ms() -> u64 {
        500
    }
    pub fn retry_max_delay_ms() -> u64 {
        10_000
    }

    // Scraper defaults
    pub fn base_url() -> String {
        "https://nitter.net".into()
    }
    pub fn image_domain() -> String {
        "https://pbs.twimg.com".into()
    }
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; tweetpipe/0.1)".into()
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn page_delay() -> u64 {
        1_000
    }
    pub fn max_pages() -> usize {
        20
    }

    pub fn archive_dir() -> PathBuf {
        PathBuf::from("cache")
    }
}
