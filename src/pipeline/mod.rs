//! Pipeline entry point.
//!
//! [`Pipeline`] owns the cache, the rate limiter and the fetch coordinator
//! and is the only thing callers need:
//!
//! - `resolve`: cached, collapsed, rate-limited fetch of one request
//! - `refresh`: drop the cached result and fetch again
//! - `resolve_many`: several requests with bounded concurrency

pub mod cache;
pub mod coordinator;
pub mod rate_limit;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;

use crate::error::{AppError, FetchError, FetchErrorKind, Result};
use crate::models::{Config, FetchResult, Request};
use crate::services::{NitterFetcher, Normalizer, RawFetcher};
use crate::storage::{LocalArchive, RawArchive};

pub use cache::{CacheEntry, CacheStats, CacheStore};
pub use coordinator::FetchCoordinator;
pub use rate_limit::{Permit, RateLimiter};

/// Per-request outcome returned to callers.
pub type Resolved = std::result::Result<FetchResult, FetchError>;

/// Fetch-cache-ratelimit pipeline.
pub struct Pipeline {
    coordinator: FetchCoordinator,
    cache: Arc<CacheStore>,
    limiter: Arc<RateLimiter>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build a pipeline around `fetcher`.
    ///
    /// Must be called from inside a tokio runtime; the cache sweeper is
    /// spawned here.
    pub fn new(config: &Config, fetcher: Arc<dyn RawFetcher>) -> Result<Self> {
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(AppError::config("pipeline must be created inside a tokio runtime"));
        }

        let settings = config.pipeline.clone();
        let cache = Arc::new(CacheStore::new(settings.cache_capacity_bytes)?);
        let limiter = Arc::new(RateLimiter::from_config(&settings)?);
        let normalizer = Normalizer::new(&config.scraper)?;

        let archive: Option<Arc<dyn RawArchive>> = if config.archive.enabled {
            log::info!("Archiving raw pages to {:?}", config.archive.dir);
            Some(Arc::new(LocalArchive::new(&config.archive.dir)))
        } else {
            None
        };

        let sweeper = settings
            .sweep_interval()
            .map(|interval| cache.spawn_sweeper(interval));

        let coordinator = FetchCoordinator::new(
            Arc::clone(&cache),
            Arc::clone(&limiter),
            fetcher,
            normalizer,
            settings,
            archive,
        );

        Ok(Self {
            coordinator,
            cache,
            limiter,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Build a pipeline that reads from the configured Nitter instance.
    pub fn from_config(config: &Config) -> Result<Self> {
        let fetcher = NitterFetcher::new(config.scraper.clone())?;
        Self::new(config, Arc::new(fetcher))
    }

    /// Resolve one request.
    pub async fn resolve(&self, request: &Request) -> Resolved {
        self.coordinator.resolve(request).await
    }

    /// Discard the cached result for `request` and resolve it again.
    ///
    /// A fetch already in flight for the same request is joined, not
    /// duplicated.
    pub async fn refresh(&self, request: &Request) -> Resolved {
        if self.coordinator.invalidate(request)? {
            log::debug!("Invalidated cached result before refresh");
        }
        self.coordinator.resolve(request).await
    }

    /// Resolve, but stop waiting after `wait`.
    ///
    /// The fetch itself keeps running and still fills the cache.
    pub async fn resolve_with_timeout(&self, request: &Request, wait: Duration) -> Resolved {
        match tokio::time::timeout(wait, self.coordinator.resolve(request)).await {
            Ok(resolved) => resolved,
            Err(_) => Err(FetchError::new(
                FetchErrorKind::UpstreamUnavailable,
                format!("no result within {wait:?}"),
            )),
        }
    }

    /// Resolve several requests, at most `concurrency` at a time.
    ///
    /// Outcomes are returned in the order of `requests`.
    pub async fn resolve_many(&self, requests: &[Request], concurrency: usize) -> Vec<Resolved> {
        let mut outcomes: Vec<(usize, Resolved)> = stream::iter(requests.iter().enumerate())
            .map(|(index, request)| async move { (index, self.resolve(request).await) })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, resolved)| resolved).collect()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Fetch admissions left in the current rate window.
    pub fn remaining_budget(&self) -> u32 {
        self.limiter.remaining()
    }

    /// Fetches currently running upstream.
    pub fn inflight(&self) -> usize {
        self.coordinator.inflight()
    }

    /// Stop the sweeper and refuse new fetch attempts.
    ///
    /// Cached results stay readable.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }
        self.limiter.close();
        log::info!("Pipeline shut down");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(sweeper) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }
    }
}
