//! Normalized records returned to callers.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::RequestKind;

/// Fixed per-record overhead counted by the cache for numbers, flags and bookkeeping.
const RECORD_OVERHEAD_BYTES: usize = 64;

/// A tweet as shown in a timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Tweet {
    /// Handle including the leading `@`
    pub username: String,

    pub full_name: String,

    pub content: String,

    /// Relative or short date as displayed (e.g. "2h", "Mar 20")
    pub date: String,

    /// Absolute time parsed from the date tooltip, when present
    pub timestamp: Option<NaiveDateTime>,

    pub likes: u64,
    pub retweets: u64,
    pub comments: u64,

    /// Full-size image URLs on the original image host
    pub images: Vec<String>,

    pub has_video: bool,

    /// Author carries a verification badge
    pub verified: bool,

    pub is_retweet: bool,
    pub retweeted_by: Option<String>,

    pub is_reply: bool,
    pub replying_to: Option<String>,

    pub is_quote: bool,

    /// Body links to something other than a hashtag or mention
    pub has_links: bool,

    pub profile_image: String,

    /// Canonical `https://x.com/{user}/status/{id}` link
    pub tweet_link: String,
}

impl Tweet {
    pub fn has_media(&self) -> bool {
        !self.images.is_empty() || self.has_video
    }

    fn approx_size(&self) -> usize {
        RECORD_OVERHEAD_BYTES
            + self.username.len()
            + self.full_name.len()
            + self.content.len()
            + self.date.len()
            + self.images.iter().map(String::len).sum::<usize>()
            + self.retweeted_by.as_ref().map_or(0, String::len)
            + self.replying_to.as_ref().map_or(0, String::len)
            + self.profile_image.len()
            + self.tweet_link.len()
    }
}

/// Profile card of a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Profile {
    pub full_name: String,
    /// Handle without the leading `@`
    pub username: String,
    pub bio: String,
    pub location: String,
    pub join_date: String,
    pub verified: bool,
    pub tweets: u64,
    pub following: u64,
    pub followers: u64,
    pub likes: u64,
    pub profile_image: String,
    pub banner_image: String,
}

impl Profile {
    fn approx_size(&self) -> usize {
        RECORD_OVERHEAD_BYTES
            + self.full_name.len()
            + self.username.len()
            + self.bio.len()
            + self.location.len()
            + self.join_date.len()
            + self.profile_image.len()
            + self.banner_image.len()
    }
}

/// Raw output of one upstream fetch, before normalization.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub kind: RequestKind,
    /// First URL requested
    pub url: String,
    /// Page markup; multiple "Load more" pages are already merged
    pub html: String,
    /// Number of upstream pages that went into `html`
    pub pages: usize,
    pub fetched_at: DateTime<Utc>,
}

/// Outcome of a successful `resolve`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchResult {
    /// Tweets in upstream order
    pub records: Vec<Tweet>,

    /// Present for profile requests
    pub profile: Option<Profile>,

    /// Photo rail of a profile
    #[serde(default)]
    pub media: Vec<String>,

    pub fetched_at: DateTime<Utc>,

    /// `true` when produced by a fetch for this call, `false` when served from cache
    pub source_fresh: bool,
}

impl FetchResult {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bytes charged against the cache capacity.
    pub fn size_bytes(&self) -> usize {
        RECORD_OVERHEAD_BYTES
            + self.records.iter().map(Tweet::approx_size).sum::<usize>()
            + self.profile.as_ref().map_or(0, Profile::approx_size)
            + self.media.iter().map(String::len).sum::<usize>()
    }

    /// Copy handed out for a cache hit.
    pub fn from_cache(&self) -> Self {
        Self {
            source_fresh: false,
            ..self.clone()
        }
    }
}
