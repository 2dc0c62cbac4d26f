// src/services/fetcher.rs

//! Upstream fetch primitive.
//!
//! [`RawFetcher`] is the single seam between the pipeline and whatever
//! actually talks to the upstream. [`NitterFetcher`] implements it over
//! plain HTTP and follows "Load more" cursors until enough items are
//! collected.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scraper::Html;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{NormalizedRequest, RawPage, RequestKind, ScraperConfig};
use crate::services::normalizer::parse_selector;
use crate::utils::http::{create_async_client, fetch_text};
use crate::utils::resolve_url;
use crate::utils::url::request_url;

/// Fetches the raw page(s) for a request.
///
/// Implementations may be slow and may fail; they must be safe to retry.
/// Transient failures are reported through [`AppError::is_transient`].
#[async_trait]
pub trait RawFetcher: Send + Sync {
    async fn fetch_raw(&self, request: &NormalizedRequest) -> Result<RawPage>;
}

/// One parsed upstream page.
#[derive(Debug, Default)]
struct TimelinePage {
    /// Outer HTML of each tweet item
    items: Vec<String>,
    /// Profile card, banner and photo rail (first profile page only)
    header: String,
    next_url: Option<String>,
}

/// HTTP fetcher for a Nitter instance.
pub struct NitterFetcher {
    config: ScraperConfig,
    client: reqwest::Client,
}

impl NitterFetcher {
    pub fn new(config: ScraperConfig) -> Result<Self> {
        let client = create_async_client(&config)?;
        Ok(Self { config, client })
    }

    /// Split one page into items, profile header and the next cursor link.
    ///
    /// Pages without a timeline are upstream errors: "not found" panels are
    /// permanent, anything else (challenge pages, rate-limit notices) is
    /// retried.
    fn parse_page(html: &str, page_url: &str, keep_header: bool) -> Result<TimelinePage> {
        let document = Html::parse_document(html);
        let timeline = parse_selector(".timeline")?;
        let item = parse_selector(".timeline-item")?;
        let show_more = parse_selector(".show-more a")?;
        let error_panel = parse_selector(".error-panel")?;
        let header = parse_selector(".profile-banner, .profile-card, .photo-rail-card")?;

        if document.select(&timeline).next().is_none() {
            if let Some(panel) = document.select(&error_panel).next() {
                let message = panel.text().collect::<String>().trim().to_string();
                let lower = message.to_lowercase();
                if lower.contains("not found") || lower.contains("doesn't exist") {
                    return Err(AppError::upstream_permanent(page_url, message));
                }
                return Err(AppError::upstream(page_url, message));
            }
            return Err(AppError::upstream(page_url, "page has no timeline"));
        }

        let items = document
            .select(&item)
            .filter(|el| !el.value().classes().any(|c| c == "show-more"))
            .map(|el| el.html())
            .collect();

        let header = if keep_header {
            document.select(&header).map(|el| el.html()).collect()
        } else {
            String::new()
        };

        let base = Url::parse(page_url)?;
        let next_url = document
            .select(&show_more)
            .find(|a| {
                let href = a.value().attr("href").unwrap_or("");
                let text: String = a.text().collect();
                href.contains("cursor=") && !text.contains("Load newest")
            })
            .and_then(|a| a.value().attr("href"))
            .map(|href| resolve_url(&base, href));

        Ok(TimelinePage {
            items,
            header,
            next_url,
        })
    }
}

#[async_trait]
impl RawFetcher for NitterFetcher {
    async fn fetch_raw(&self, request: &NormalizedRequest) -> Result<RawPage> {
        let first_url = request_url(&self.config.base_url, request)?;
        let delay = Duration::from_millis(self.config.page_delay_ms);

        let mut page_url = first_url.clone();
        let mut items: Vec<String> = Vec::new();
        let mut header = String::new();
        let mut pages = 0;

        loop {
            let html = fetch_text(&self.client, &page_url).await?;
            pages += 1;

            let keep_header = pages == 1 && request.kind == RequestKind::UserProfile;
            let page = Self::parse_page(&html, &page_url, keep_header)?;
            if keep_header {
                header = page.header;
            }

            let before = items.len();
            items.extend(page.items);
            log::debug!(
                "Page {} of {} gave {} items ({} total)",
                pages,
                first_url,
                items.len() - before,
                items.len()
            );

            if items.len() >= request.max_results
                || items.len() == before
                || pages >= self.config.max_pages
            {
                break;
            }
            let Some(next) = page.next_url else {
                break;
            };
            page_url = next;

            if delay.as_millis() > 0 {
                tokio::time::sleep(delay).await;
            }
        }

        log::info!(
            "Fetched {} items in {} page(s) from {}",
            items.len(),
            pages,
            first_url
        );

        Ok(RawPage {
            kind: request.kind,
            url: first_url,
            html: format!(
                "<html><body>{}<div class=\"timeline\">{}</div></body></html>",
                header,
                items.concat()
            ),
            pages,
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://nitter.net/search?f=tweets&q=python";

    #[test]
    fn test_parse_page_collects_items_and_cursor() {
        let html = r#"<html><body><div class="timeline">
            <div class="show-more"><a href="?f=tweets&q=python">Load newest</a></div>
            <div class="timeline-item"><div class="tweet-content">one</div></div>
            <div class="timeline-item"><div class="tweet-content">two</div></div>
            <div class="timeline-item show-more"><a href="?f=tweets&q=python&cursor=XYZ">Load more</a></div>
        </div></body></html>"#;

        let page = NitterFetcher::parse_page(html, URL, false).unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.items[0].contains("one"));
        assert_eq!(
            page.next_url.as_deref(),
            Some("https://nitter.net/search?f=tweets&q=python&cursor=XYZ")
        );
        assert!(page.header.is_empty());
    }

    #[test]
    fn test_parse_page_without_cursor() {
        let html = r#"<div class="timeline"><div class="timeline-none">No items found</div></div>"#;
        let page = NitterFetcher::parse_page(html, URL, false).unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_url.is_none());
    }

    #[test]
    fn test_not_found_panel_is_permanent() {
        let html = r#"<div class="error-panel"><span>User "ghost" not found</span></div>"#;
        let err = NitterFetcher::parse_page(html, URL, false).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_challenge_page_is_transient() {
        let html = r#"<html><body><h1>Verifying your browser</h1></body></html>"#;
        let err = NitterFetcher::parse_page(html, URL, false).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_profile_header_is_kept() {
        let html = r#"<div class="profile-card"><a class="profile-card-fullname">jack</a></div>
            <div class="timeline"></div>"#;
        let page = NitterFetcher::parse_page(html, "https://nitter.net/jack/search", true).unwrap();
        assert!(page.header.contains("profile-card-fullname"));
    }
}
