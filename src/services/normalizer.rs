// src/services/normalizer.rs

//! Turns raw upstream markup into [`FetchResult`] records.
//!
//! Normalization is pure: the same page and filters always give the same
//! records. Filters are checked in a fixed order (include filters, exclude
//! filters, date range); surviving tweets keep upstream order and are
//! truncated to the requested cap without re-sorting.

use chrono::{NaiveDate, NaiveDateTime};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::{AppError, FetchError, Result};
use crate::models::{
    FetchResult, FilterType, NormalizedRequest, Profile, RawPage, RequestKind, ScraperConfig,
    Tweet,
};
use crate::utils::url::{canonical_tweet_link, to_original_image};

/// Filters applied to extracted tweets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    pub include: Vec<FilterType>,
    pub exclude: Vec<FilterType>,
    /// Inclusive
    pub since: Option<NaiveDate>,
    /// Exclusive, like the upstream's own `until`
    pub until: Option<NaiveDate>,
    pub max_results: usize,
}

impl FilterSet {
    pub fn from_request(request: &NormalizedRequest) -> Self {
        Self {
            include: request.include.clone(),
            exclude: request.exclude.clone(),
            since: request.since,
            until: request.until,
            max_results: request.max_results,
        }
    }

    /// Whether `tweet` passes every active predicate.
    pub fn accepts(&self, tweet: &Tweet) -> bool {
        self.include
            .iter()
            .all(|f| matches_filter(*f, tweet) != Some(false))
            && self
                .exclude
                .iter()
                .all(|f| matches_filter(*f, tweet) != Some(true))
            && self.in_date_range(tweet)
    }

    fn in_date_range(&self, tweet: &Tweet) -> bool {
        // Tweets without a readable timestamp were already range-filtered upstream.
        let Some(date) = tweet.timestamp.map(|t| t.date()) else {
            return true;
        };
        self.since.is_none_or(|since| date >= since) && self.until.is_none_or(|until| date < until)
    }
}

/// Evaluate one filter against a tweet.
///
/// `None` means the markup does not carry enough to judge; the upstream's
/// own filtering is trusted for those.
pub fn matches_filter(filter: FilterType, tweet: &Tweet) -> Option<bool> {
    match filter {
        FilterType::Media => Some(tweet.has_media()),
        FilterType::Images => Some(!tweet.images.is_empty()),
        FilterType::Videos | FilterType::NativeVideo => Some(tweet.has_video),
        FilterType::Verified => Some(tweet.verified),
        FilterType::Replies => Some(tweet.is_reply),
        FilterType::NativeRetweets => Some(tweet.is_retweet),
        FilterType::Quote => Some(tweet.is_quote),
        FilterType::Links => Some(tweet.has_links),
        FilterType::News | FilterType::Safe | FilterType::ProVideo => None,
    }
}

/// CSS selectors used for extraction.
struct Selectors {
    timeline: Selector,
    item: Selector,
    username: Selector,
    fullname: Selector,
    verified: Selector,
    content: Selector,
    content_link: Selector,
    date_link: Selector,
    heart: Selector,
    retweet_icon: Selector,
    comment_icon: Selector,
    image: Selector,
    video: Selector,
    retweet_header: Selector,
    replying_to: Selector,
    quote: Selector,
    avatar: Selector,
    tweet_link: Selector,
    profile_fullname: Selector,
    profile_username: Selector,
    profile_bio: Selector,
    profile_location: Selector,
    profile_joindate: Selector,
    stat_posts: Selector,
    stat_following: Selector,
    stat_followers: Selector,
    stat_likes: Selector,
    profile_avatar: Selector,
    profile_banner: Selector,
    photo_rail: Selector,
}

impl Selectors {
    fn new() -> Result<Self> {
        Ok(Self {
            timeline: parse_selector(".timeline")?,
            item: parse_selector(".timeline-item")?,
            username: parse_selector(".username")?,
            fullname: parse_selector(".fullname")?,
            verified: parse_selector(".verified-icon")?,
            content: parse_selector(".tweet-content")?,
            content_link: parse_selector(".tweet-content a")?,
            date_link: parse_selector(".tweet-date a")?,
            heart: parse_selector(".tweet-stat .icon-heart")?,
            retweet_icon: parse_selector(".tweet-stat .icon-retweet")?,
            comment_icon: parse_selector(".tweet-stat .icon-comment")?,
            image: parse_selector(".attachment.image img")?,
            video: parse_selector(".attachment.video-container, .gallery-video")?,
            retweet_header: parse_selector(".retweet-header div")?,
            replying_to: parse_selector(".replying-to a")?,
            quote: parse_selector(".quote")?,
            avatar: parse_selector(".tweet-avatar img")?,
            tweet_link: parse_selector(".tweet-link")?,
            profile_fullname: parse_selector(".profile-card-fullname")?,
            profile_username: parse_selector(".profile-card-username")?,
            profile_bio: parse_selector(".profile-bio p")?,
            profile_location: parse_selector(".profile-location span:nth-of-type(2)")?,
            profile_joindate: parse_selector(".profile-joindate span")?,
            stat_posts: parse_selector(".posts .profile-stat-num")?,
            stat_following: parse_selector(".following .profile-stat-num")?,
            stat_followers: parse_selector(".followers .profile-stat-num")?,
            stat_likes: parse_selector(".likes .profile-stat-num")?,
            profile_avatar: parse_selector(".profile-card-avatar img")?,
            profile_banner: parse_selector(".profile-banner img")?,
            photo_rail: parse_selector(".photo-rail-grid a img")?,
        })
    }
}

pub(crate) fn parse_selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| AppError::selector(s, format!("{e:?}")))
}

/// Converts raw pages into records.
#[derive(Debug, Clone)]
pub struct Normalizer {
    base_url: Url,
    image_domain: String,
}

impl Normalizer {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        Ok(Self {
            base_url: Url::parse(&config.base_url)?,
            image_domain: config.image_domain.clone(),
        })
    }

    /// Parse `raw` and apply `filters`.
    ///
    /// A page missing the structure its kind requires is
    /// `MalformedUpstreamOutput`; a well-formed empty timeline is an empty
    /// result.
    pub fn normalize(&self, raw: &RawPage, filters: &FilterSet) -> std::result::Result<FetchResult, FetchError> {
        let selectors = Selectors::new().map_err(AppError::into_fetch_error)?;
        let document = Html::parse_document(&raw.html);

        if document.select(&selectors.timeline).next().is_none() {
            return Err(FetchError::malformed(format!(
                "no timeline in page from {}",
                raw.url
            )));
        }

        let (profile, media) = match raw.kind {
            RequestKind::Search => (None, Vec::new()),
            RequestKind::UserProfile => {
                let profile = self.extract_profile(&document, &selectors).ok_or_else(|| {
                    FetchError::malformed(format!("no profile card in page from {}", raw.url))
                })?;
                let media = document
                    .select(&selectors.photo_rail)
                    .filter_map(|img| img.value().attr("src"))
                    .map(|src| self.image(src))
                    .collect();
                (Some(profile), media)
            }
        };

        let records = document
            .select(&selectors.item)
            .filter(|item| !item.value().classes().any(|c| c == "show-more"))
            .filter_map(|item| self.extract_tweet(&item, &selectors))
            .filter(|tweet| filters.accepts(tweet))
            .take(filters.max_results)
            .collect();

        Ok(FetchResult {
            records,
            profile,
            media,
            fetched_at: raw.fetched_at,
            source_fresh: true,
        })
    }

    fn image(&self, src: &str) -> String {
        to_original_image(&self.base_url, &self.image_domain, src)
    }

    fn extract_tweet(&self, item: &ElementRef, s: &Selectors) -> Option<Tweet> {
        let username = text_of(item, &s.username)?;
        let fullname_el = item.select(&s.fullname).next()?;
        let full_name = clean_text(&fullname_el.text().collect::<String>());

        let date_el = item.select(&s.date_link).next();
        let timestamp = date_el
            .and_then(|a| a.value().attr("title"))
            .and_then(parse_tweet_timestamp);

        let retweeted_by = text_of(item, &s.retweet_header);
        let replying_to = text_of(item, &s.replying_to);

        let tweet_link = item
            .select(&s.tweet_link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| canonical_tweet_link(&username, href))
            .unwrap_or_default();

        let has_links = item
            .select(&s.content_link)
            .filter_map(|a| a.value().attr("href"))
            .any(|href| href.starts_with("http://") || href.starts_with("https://"));

        Some(Tweet {
            full_name,
            content: text_of(item, &s.content).unwrap_or_default(),
            date: date_el
                .map(|a| clean_text(&a.text().collect::<String>()))
                .unwrap_or_default(),
            timestamp,
            likes: stat_next_to(item, &s.heart),
            retweets: stat_next_to(item, &s.retweet_icon),
            comments: stat_next_to(item, &s.comment_icon),
            images: item
                .select(&s.image)
                .filter_map(|img| img.value().attr("src"))
                .map(|src| self.image(src))
                .collect(),
            has_video: item.select(&s.video).next().is_some(),
            verified: fullname_el.select(&s.verified).next().is_some(),
            is_retweet: retweeted_by.is_some(),
            retweeted_by,
            is_reply: replying_to.is_some(),
            replying_to,
            is_quote: item.select(&s.quote).next().is_some(),
            has_links,
            profile_image: item
                .select(&s.avatar)
                .next()
                .and_then(|img| img.value().attr("src"))
                .map(|src| self.image(src))
                .unwrap_or_default(),
            tweet_link,
            username,
        })
    }

    fn extract_profile(&self, document: &Html, s: &Selectors) -> Option<Profile> {
        let root = document.root_element();
        let fullname_el = root.select(&s.profile_fullname).next()?;
        let username = text_of(&root, &s.profile_username)?;

        Some(Profile {
            full_name: clean_text(&fullname_el.text().collect::<String>()),
            username: username.trim_start_matches('@').to_string(),
            bio: text_of(&root, &s.profile_bio).unwrap_or_default(),
            location: text_of(&root, &s.profile_location).unwrap_or_default(),
            join_date: text_of(&root, &s.profile_joindate)
                .map(|d| d.replace("Joined", "").trim().to_string())
                .unwrap_or_default(),
            verified: fullname_el.select(&s.verified).next().is_some(),
            tweets: text_of(&root, &s.stat_posts).map_or(0, |t| parse_stat(&t)),
            following: text_of(&root, &s.stat_following).map_or(0, |t| parse_stat(&t)),
            followers: text_of(&root, &s.stat_followers).map_or(0, |t| parse_stat(&t)),
            likes: text_of(&root, &s.stat_likes).map_or(0, |t| parse_stat(&t)),
            profile_image: root
                .select(&s.profile_avatar)
                .next()
                .and_then(|img| img.value().attr("src"))
                .map(|src| self.image(src))
                .unwrap_or_default(),
            banner_image: root
                .select(&s.profile_banner)
                .next()
                .and_then(|img| img.value().attr("src"))
                .map(|src| self.image(src))
                .unwrap_or_default(),
        })
    }
}

fn clean_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-normalized text of the first match, if non-empty.
fn text_of(scope: &ElementRef, selector: &Selector) -> Option<String> {
    let el = scope.select(selector).next()?;
    let text = clean_text(&el.text().collect::<String>());
    (!text.is_empty()).then_some(text)
}

/// Counter printed next to a stat icon, e.g. `<div><span class="icon-heart"></span> 1,204</div>`.
fn stat_next_to(scope: &ElementRef, icon: &Selector) -> u64 {
    scope
        .select(icon)
        .next()
        .and_then(|el| el.parent())
        .and_then(ElementRef::wrap)
        .map(|parent| parse_stat(&parent.text().collect::<String>()))
        .unwrap_or(0)
}

/// "1,204" → 1204; anything unreadable counts as zero.
pub fn parse_stat(raw: &str) -> u64 {
    raw.trim().replace(',', "").parse().unwrap_or(0)
}

/// Parse the date tooltip, e.g. "Mar 20, 2024 · 3:04 PM UTC".
pub fn parse_tweet_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let cleaned = clean_text(&raw.replace('·', " "));
    NaiveDateTime::parse_from_str(&cleaned, "%b %d, %Y %I:%M %p UTC").ok()
}
