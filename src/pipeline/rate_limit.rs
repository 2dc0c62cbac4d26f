// src/pipeline/rate_limit.rs

//! Sliding-window rate limiter for upstream fetch attempts.
//!
//! Every fetch attempt, retries included, must hold a [`Permit`]. A permit
//! is granted once a concurrency slot is free and the last `window` holds
//! fewer than `limit` admissions. Callers over budget sleep until the
//! oldest admission leaves the window; there is no fairness between them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, sleep, timeout};

use crate::error::{AppError, FetchError, FetchErrorKind, Result};
use crate::models::PipelineConfig;

/// Admission to start one upstream fetch attempt.
///
/// Holding it occupies a concurrency slot; dropping it frees the slot.
#[derive(Debug)]
pub struct Permit {
    admitted_at: Instant,
    _slot: OwnedSemaphorePermit,
}

impl Permit {
    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }
}

/// Process-wide fetch budget.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    max_wait: Duration,
    admissions: Mutex<VecDeque<Instant>>,
    slots: Arc<Semaphore>,
}

impl RateLimiter {
    /// Create a limiter admitting `limit` fetches per `window`, with at most
    /// `max_concurrent` held permits and giving up after `max_wait`.
    pub fn new(limit: u32, window: Duration, max_wait: Duration, max_concurrent: usize) -> Result<Self> {
        if limit == 0 || window.is_zero() {
            return Err(AppError::config("rate limit needs a non-zero budget and window"));
        }
        if max_concurrent == 0 {
            return Err(AppError::config("rate limiter needs at least one concurrent slot"));
        }
        Ok(Self {
            limit,
            window,
            max_wait,
            admissions: Mutex::new(VecDeque::with_capacity(limit as usize)),
            slots: Arc::new(Semaphore::new(max_concurrent)),
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(
            config.max_requests_in_window,
            config.window(),
            config.rate_limit_timeout(),
            config.max_concurrent_fetches,
        )
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.admissions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop admissions that left the window.
    fn prune(admissions: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = admissions.front() {
            if now.saturating_duration_since(*front) >= window {
                admissions.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record an admission now, or report how long until one is possible.
    fn try_admit(&self) -> std::result::Result<Instant, Duration> {
        let now = Instant::now();
        let mut admissions = self.lock();
        Self::prune(&mut admissions, now, self.window);

        if admissions.len() < self.limit as usize {
            admissions.push_back(now);
            return Ok(now);
        }

        let wait = admissions
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        Err(wait)
    }

    /// Wait for a concurrency slot and window capacity.
    ///
    /// Fails with [`FetchErrorKind::RateLimitTimeout`] after `max_wait`.
    pub async fn acquire(&self) -> Result<Permit> {
        match timeout(self.max_wait, self.admit()).await {
            Ok(permit) => permit,
            Err(_) => Err(FetchError::new(
                FetchErrorKind::RateLimitTimeout,
                format!("no fetch capacity within {:?}", self.max_wait),
            )
            .into()),
        }
    }

    async fn admit(&self) -> Result<Permit> {
        let slot = Arc::clone(&self.slots).acquire_owned().await.map_err(|_| {
            FetchError::new(FetchErrorKind::UpstreamUnavailable, "rate limiter is shut down")
        })?;

        loop {
            match self.try_admit() {
                Ok(admitted_at) => {
                    return Ok(Permit {
                        admitted_at,
                        _slot: slot,
                    });
                }
                Err(wait) => {
                    log::debug!("Rate budget exhausted, waiting {wait:?}");
                    sleep(wait).await;
                }
            }
        }
    }

    /// Hand a permit back early. Dropping it has the same effect.
    pub fn release(&self, permit: Permit) {
        drop(permit);
    }

    /// Admissions still available in the current window.
    pub fn remaining(&self) -> u32 {
        let mut admissions = self.lock();
        Self::prune(&mut admissions, Instant::now(), self.window);
        self.limit.saturating_sub(admissions.len() as u32)
    }

    /// Fail all current and future `acquire` calls.
    pub fn close(&self) {
        self.slots.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, window_ms: u64, max_wait_ms: u64, concurrent: usize) -> Arc<RateLimiter> {
        Arc::new(
            RateLimiter::new(
                limit,
                Duration::from_millis(window_ms),
                Duration::from_millis(max_wait_ms),
                concurrent,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_rejects_empty_budget() {
        assert!(RateLimiter::new(0, Duration::from_secs(1), Duration::from_secs(1), 1).is_err());
        assert!(RateLimiter::new(1, Duration::ZERO, Duration::from_secs(1), 1).is_err());
        assert!(RateLimiter::new(1, Duration::from_secs(1), Duration::from_secs(1), 0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_then_wait_for_window() {
        let limiter = limiter(2, 1_000, 10_000, 8);
        let start = Instant::now();

        let a = limiter.acquire().await.unwrap();
        let b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.remaining(), 0);
        let c = limiter.acquire().await.unwrap();

        assert_eq!(a.admitted_at(), start);
        assert_eq!(b.admitted_at(), start);
        assert_eq!(c.admitted_at() - start, Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_admissions_never_exceed_limit() {
        let limiter = limiter(3, 1_000, 60_000, 16);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let permit = limiter.acquire().await.unwrap();
                let at = permit.admitted_at();
                limiter.release(permit);
                at
            }));
        }

        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap());
        }
        times.sort();

        for (i, t) in times.iter().enumerate() {
            let in_window = times[i..]
                .iter()
                .take_while(|u| u.saturating_duration_since(*t) < Duration::from_millis(1_000))
                .count();
            assert!(in_window <= 3, "{in_window} admissions inside one window");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_budget_stays_exhausted() {
        let limiter = limiter(1, 10_000, 2_000, 4);
        let _first = limiter.acquire().await.unwrap();

        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err.fetch_kind(), Some(FetchErrorKind::RateLimitTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_slot_is_released() {
        let limiter = limiter(100, 1_000, 5_000, 1);
        let held = limiter.acquire().await.unwrap();

        let blocked = timeout(Duration::from_millis(100), limiter.acquire()).await;
        assert!(blocked.is_err());

        limiter.release(held);
        assert!(limiter.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let limiter = limiter(5, 1_000, 5_000, 1);
        limiter.close();
        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err.fetch_kind(), Some(FetchErrorKind::UpstreamUnavailable));
    }
}
