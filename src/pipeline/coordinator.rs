// src/pipeline/coordinator.rs

//! Fetch coordination: cache lookup, in-flight collapsing, retries.
//!
//! At most one upstream fetch runs per fingerprint. The first caller to
//! miss the cache registers the fetch and spawns it; later callers for the
//! same fingerprint subscribe to its outcome. The fetch task owns the work,
//! so callers that stop waiting never cancel it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use crate::error::{AppError, FetchError, FetchErrorKind, Result};
use crate::models::{FetchResult, Fingerprint, NormalizedRequest, PipelineConfig, RawPage, Request};
use crate::pipeline::cache::CacheStore;
use crate::pipeline::rate_limit::RateLimiter;
use crate::services::{FilterSet, Normalizer, RawFetcher};
use crate::storage::RawArchive;

/// Shared outcome of one in-flight fetch.
type Outcome = std::result::Result<Arc<FetchResult>, FetchError>;

type Inflight = HashMap<Fingerprint, watch::Receiver<Option<Outcome>>>;

enum Joined {
    Cached(Arc<FetchResult>),
    Waiting(watch::Receiver<Option<Outcome>>),
}

struct Shared {
    cache: Arc<CacheStore>,
    limiter: Arc<RateLimiter>,
    fetcher: Arc<dyn RawFetcher>,
    normalizer: Normalizer,
    archive: Option<Arc<dyn RawArchive>>,
    config: PipelineConfig,
    inflight: Mutex<Inflight>,
}

/// Removes the in-flight record when the fetch task finishes or unwinds.
struct InflightGuard {
    shared: Arc<Shared>,
    fingerprint: Fingerprint,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.shared.lock_inflight().remove(&self.fingerprint);
    }
}

/// Resolves requests through the cache, the limiter and the fetcher.
#[derive(Clone)]
pub struct FetchCoordinator {
    shared: Arc<Shared>,
}

impl FetchCoordinator {
    pub fn new(
        cache: Arc<CacheStore>,
        limiter: Arc<RateLimiter>,
        fetcher: Arc<dyn RawFetcher>,
        normalizer: Normalizer,
        config: PipelineConfig,
        archive: Option<Arc<dyn RawArchive>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache,
                limiter,
                fetcher,
                normalizer,
                archive,
                config,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of fetches currently running.
    pub fn inflight(&self) -> usize {
        self.shared.lock_inflight().len()
    }

    /// Resolve `request` to a result, from cache when possible.
    pub async fn resolve(&self, request: &Request) -> std::result::Result<FetchResult, FetchError> {
        let normalized = request.normalize()?;
        let fingerprint = normalized.fingerprint();

        if let Some(entry) = self.shared.cache.get(&fingerprint) {
            log::debug!("Cache hit for {} ({})", normalized.target, fingerprint.short());
            return Ok(entry.payload.from_cache());
        }

        let mut rx = match self.join_or_start(normalized, fingerprint) {
            Joined::Cached(payload) => return Ok(payload.from_cache()),
            Joined::Waiting(rx) => rx,
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };

        match outcome {
            Some(Ok(payload)) => Ok(FetchResult::clone(&payload)),
            Some(Err(e)) => Err(e),
            None => Err(FetchError::new(
                FetchErrorKind::UpstreamUnavailable,
                "fetch task ended without a result",
            )),
        }
    }

    /// Drop any cached result for `request`.
    pub fn invalidate(&self, request: &Request) -> std::result::Result<bool, FetchError> {
        let fingerprint = request.normalize()?.fingerprint();
        Ok(self.shared.cache.invalidate(&fingerprint))
    }

    fn join_or_start(&self, request: NormalizedRequest, fingerprint: Fingerprint) -> Joined {
        let mut inflight = self.shared.lock_inflight();

        if let Some(rx) = inflight.get(&fingerprint) {
            log::debug!("Joining in-flight fetch {}", fingerprint.short());
            return Joined::Waiting(rx.clone());
        }

        // A fetch may have finished between the first lookup and the lock.
        if let Some(entry) = self.shared.cache.peek(&fingerprint) {
            return Joined::Cached(entry.payload);
        }

        let (tx, rx) = watch::channel(None);
        inflight.insert(fingerprint.clone(), rx.clone());
        drop(inflight);

        let guard = InflightGuard {
            shared: Arc::clone(&self.shared),
            fingerprint,
        };
        tokio::spawn(async move {
            let outcome = guard.shared.fetch_with_retries(&request, &guard.fingerprint).await;
            drop(guard);
            let _ = tx.send(Some(outcome));
        });

        Joined::Waiting(rx)
    }
}

impl Shared {
    fn lock_inflight(&self) -> MutexGuard<'_, Inflight> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch_with_retries(&self, request: &NormalizedRequest, fingerprint: &Fingerprint) -> Outcome {
        let attempts = self.config.max_fetch_retries + 1;
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.retry_delay(attempt - 1);
                log::debug!(
                    "Retrying {} in {:?} (attempt {}/{})",
                    fingerprint.short(),
                    delay,
                    attempt + 1,
                    attempts
                );
                sleep(delay).await;
            }

            match self.attempt(request).await {
                Ok(raw) => return self.complete(request, fingerprint, raw).await,
                Err(e) if e.fetch_kind() == Some(FetchErrorKind::RateLimitTimeout) => {
                    log::warn!("Rate limit wait exceeded for {}", request.target);
                    return Err(e.into_fetch_error());
                }
                Err(e) if e.is_transient() => {
                    log::warn!("Fetch attempt {} for {} failed: {}", attempt + 1, request.target, e);
                    last_error = Some(e);
                }
                Err(e) => {
                    log::warn!("Fetch for {} failed permanently: {}", request.target, e);
                    return Err(e.into_fetch_error());
                }
            }
        }

        let message = last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string());
        Err(FetchError::new(
            FetchErrorKind::UpstreamUnavailable,
            format!("{} failed after {} attempt(s): {}", request.target, attempts, message),
        ))
    }

    /// One limited, time-boxed call to the fetch primitive.
    async fn attempt(&self, request: &NormalizedRequest) -> Result<RawPage> {
        let permit = self.limiter.acquire().await?;
        let fetched = timeout(self.config.fetch_timeout(), self.fetcher.fetch_raw(request)).await;
        self.limiter.release(permit);

        fetched.unwrap_or_else(|_| {
            Err(AppError::upstream(
                request.target.clone(),
                format!("no response within {:?}", self.config.fetch_timeout()),
            ))
        })
    }

    async fn complete(&self, request: &NormalizedRequest, fingerprint: &Fingerprint, raw: RawPage) -> Outcome {
        let filters = FilterSet::from_request(request);
        let result = Arc::new(self.normalizer.normalize(&raw, &filters)?);

        // Archiving is best-effort.
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.store(request, &raw, result.len()).await {
                log::warn!("Failed to archive page {}: {}", raw.url, e);
            }
        }

        let ttl = self.config.ttl_for(request.kind);
        if !self.cache.put(fingerprint.clone(), Arc::clone(&result), ttl) {
            log::warn!(
                "Result for {} ({} bytes) exceeds cache capacity, not cached",
                request.target,
                result.size_bytes()
            );
        }

        log::info!(
            "Fetched {} record(s) for {} ({})",
            result.len(),
            request.target,
            fingerprint.short()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Config, RequestKind};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;

    struct PanickingFetcher;

    #[async_trait]
    impl RawFetcher for PanickingFetcher {
        async fn fetch_raw(&self, _request: &NormalizedRequest) -> Result<RawPage> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            panic!("fetcher bug");
        }
    }

    struct EmptyFetcher;

    #[async_trait]
    impl RawFetcher for EmptyFetcher {
        async fn fetch_raw(&self, request: &NormalizedRequest) -> Result<RawPage> {
            Ok(RawPage {
                kind: RequestKind::Search,
                url: format!("https://nitter.net/search?q={}", request.target),
                html: r#"<div class="timeline"></div>"#.into(),
                pages: 1,
                fetched_at: Utc::now(),
            })
        }
    }

    fn coordinator(fetcher: Arc<dyn RawFetcher>) -> FetchCoordinator {
        let config = Config::default();
        FetchCoordinator::new(
            Arc::new(CacheStore::new(1024 * 1024).unwrap()),
            Arc::new(RateLimiter::from_config(&config.pipeline).unwrap()),
            fetcher,
            Normalizer::new(&config.scraper).unwrap(),
            config.pipeline,
            None,
        )
    }

    #[tokio::test]
    async fn test_panicking_fetch_releases_waiters() {
        let coordinator = coordinator(Arc::new(PanickingFetcher));
        let request = Request::search("boom");

        let (a, b) = tokio::join!(coordinator.resolve(&request), coordinator.resolve(&request));
        assert_eq!(a.unwrap_err().kind, FetchErrorKind::UpstreamUnavailable);
        assert_eq!(b.unwrap_err().kind, FetchErrorKind::UpstreamUnavailable);
        assert_eq!(coordinator.inflight(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_drops_cached_result() {
        let coordinator = coordinator(Arc::new(EmptyFetcher));
        let request = Request::search("gone");

        assert!(!coordinator.invalidate(&request).unwrap());
        coordinator.resolve(&request).await.unwrap();
        assert!(coordinator.invalidate(&request).unwrap());
        assert!(!coordinator.invalidate(&request).unwrap());
    }
}
