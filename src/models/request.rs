//! Logical content requests and their normalized, fingerprinted form.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::FetchError;

/// Default number of tweets collected for a request.
pub const DEFAULT_MAX_RESULTS: usize = 50;

/// Largest cap a caller may ask for.
pub const MAX_RESULTS_LIMIT: usize = 1000;

/// What kind of page a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Search,
    UserProfile,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Search => "search",
            RequestKind::UserProfile => "user_profile",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Search filters understood by the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    NativeRetweets,
    Media,
    Videos,
    News,
    Verified,
    NativeVideo,
    Replies,
    Links,
    Images,
    Safe,
    Quote,
    ProVideo,
}

impl FilterType {
    pub const ALL: [FilterType; 12] = [
        FilterType::NativeRetweets,
        FilterType::Media,
        FilterType::Videos,
        FilterType::News,
        FilterType::Verified,
        FilterType::NativeVideo,
        FilterType::Replies,
        FilterType::Links,
        FilterType::Images,
        FilterType::Safe,
        FilterType::Quote,
        FilterType::ProVideo,
    ];

    /// Name used on the wire, both in query parameters and upstream URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterType::NativeRetweets => "nativeretweets",
            FilterType::Media => "media",
            FilterType::Videos => "videos",
            FilterType::News => "news",
            FilterType::Verified => "verified",
            FilterType::NativeVideo => "native_video",
            FilterType::Replies => "replies",
            FilterType::Links => "links",
            FilterType::Images => "images",
            FilterType::Safe => "safe",
            FilterType::Quote => "quote",
            FilterType::ProVideo => "pro_video",
        }
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterType {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        FilterType::ALL
            .into_iter()
            .find(|f| f.as_str() == name)
            .ok_or_else(|| FetchError::invalid(format!("unknown filter '{}'", s.trim())))
    }
}

/// A content request as handed over by the API layer.
///
/// Parameters stay as raw strings until [`Request::normalize`] checks them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    kind: RequestKind,
    params: BTreeMap<String, String>,
    language: Option<String>,
}

impl Request {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
            language: None,
        }
    }

    /// Search request for `query`.
    pub fn search(query: impl Into<String>) -> Self {
        Self::new(RequestKind::Search).with_param("q", query)
    }

    /// Profile request for `username` (a leading `@` is accepted).
    pub fn profile(username: impl Into<String>) -> Self {
        Self::new(RequestKind::UserProfile).with_param("username", username)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Validate parameters and bring them into canonical form.
    pub fn normalize(&self) -> Result<NormalizedRequest, FetchError> {
        let mut target = None;
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        let mut since = None;
        let mut until = None;
        let mut max_results = None;
        let mut near = None;

        for (key, value) in &self.params {
            match (key.as_str(), self.kind) {
                ("q" | "query", RequestKind::Search) => {
                    set_once(&mut target, key, normalize_query(value)?)?;
                }
                ("username", RequestKind::UserProfile) => {
                    target = Some(normalize_username(value)?);
                }
                ("include_filters", _) => include = parse_filters(value)?,
                ("exclude_filters", _) => exclude = parse_filters(value)?,
                ("since", _) => since = parse_date(key, value)?,
                ("until", _) => until = parse_date(key, value)?,
                ("max_tweets" | "max_results", _) => {
                    set_once(&mut max_results, key, parse_cap(value)?)?;
                }
                ("near", _) => {
                    let place = collapse_whitespace(value).to_lowercase();
                    near = (!place.is_empty()).then_some(place);
                }
                _ => {
                    return Err(FetchError::invalid(format!(
                        "parameter '{key}' is not valid for a {} request",
                        self.kind
                    )));
                }
            }
        }

        let target = target.ok_or_else(|| match self.kind {
            RequestKind::Search => FetchError::invalid("missing search query 'q'"),
            RequestKind::UserProfile => FetchError::invalid("missing 'username'"),
        })?;

        if let Some(both) = include.iter().find(|f| exclude.contains(f)) {
            return Err(FetchError::invalid(format!(
                "filter '{both}' is both included and excluded"
            )));
        }

        if let (Some(s), Some(u)) = (since, until) {
            // `until` is exclusive, so equal dates select nothing.
            if s >= u {
                return Err(FetchError::invalid(format!(
                    "date range is empty: since {s} is not before until {u}"
                )));
            }
        }

        let language = self
            .language
            .as_deref()
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty());

        if let Some(lang) = &language {
            if !lang.chars().all(|c| c.is_ascii_alphabetic() || c == '-') {
                return Err(FetchError::invalid(format!("invalid language '{lang}'")));
            }
        }

        Ok(NormalizedRequest {
            kind: self.kind,
            target,
            include,
            exclude,
            since,
            until,
            max_results: max_results.unwrap_or(DEFAULT_MAX_RESULTS),
            near,
            language,
        })
    }
}

/// A validated request in canonical form.
///
/// Two requests that mean the same thing normalize to equal values and
/// therefore share a [`Fingerprint`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct NormalizedRequest {
    pub kind: RequestKind,
    /// Lower-cased search query or bare username
    pub target: String,
    /// Sorted, de-duplicated
    pub include: Vec<FilterType>,
    /// Sorted, de-duplicated
    pub exclude: Vec<FilterType>,
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub max_results: usize,
    pub near: Option<String>,
    pub language: Option<String>,
}

impl NormalizedRequest {
    /// Stable text form; the fingerprint is its digest.
    pub fn canonical(&self) -> String {
        fn join(filters: &[FilterType]) -> String {
            filters
                .iter()
                .map(FilterType::as_str)
                .collect::<Vec<_>>()
                .join(",")
        }
        fn date(d: Option<NaiveDate>) -> String {
            d.map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default()
        }

        format!(
            "{}|{}|include={}|exclude={}|since={}|until={}|max={}|near={}|lang={}",
            self.kind,
            self.target,
            join(&self.include),
            join(&self.exclude),
            date(self.since),
            date(self.until),
            self.max_results,
            self.near.as_deref().unwrap_or(""),
            self.language.as_deref().unwrap_or(""),
        )
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let digest = Sha256::digest(self.canonical().as_bytes());
        Fingerprint(hex::encode(digest))
    }
}

/// Deterministic identity of a normalized request.
///
/// Used as the cache key and the in-flight dedup key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Fingerprint(value.to_string())
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_query(raw: &str) -> Result<String, FetchError> {
    let query = collapse_whitespace(raw).to_lowercase();
    if query.is_empty() {
        return Err(FetchError::invalid("search query is empty"));
    }
    Ok(query)
}

fn normalize_username(raw: &str) -> Result<String, FetchError> {
    let name = raw.trim().trim_start_matches('@').to_lowercase();
    if name.is_empty() {
        return Err(FetchError::invalid("username is empty"));
    }
    if name.len() > 15 || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(FetchError::invalid(format!("invalid username '{}'", raw.trim())));
    }
    Ok(name)
}

/// Store an aliased parameter, rejecting a second value under another alias.
fn set_once<T>(slot: &mut Option<T>, key: &str, value: T) -> Result<(), FetchError> {
    if slot.is_some() {
        return Err(FetchError::invalid(format!(
            "parameter '{key}' duplicates a value given under another name"
        )));
    }
    *slot = Some(value);
    Ok(())
}

fn parse_filters(raw: &str) -> Result<Vec<FilterType>, FetchError> {
    let mut filters = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(FilterType::from_str)
        .collect::<Result<Vec<_>, _>>()?;
    filters.sort();
    filters.dedup();
    Ok(filters)
}

fn parse_date(key: &str, raw: &str) -> Result<Option<NaiveDate>, FetchError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| FetchError::invalid(format!("'{key}' must be YYYY-MM-DD, got '{raw}'")))
}

fn parse_cap(raw: &str) -> Result<usize, FetchError> {
    let cap: usize = raw
        .trim()
        .parse()
        .map_err(|_| FetchError::invalid(format!("max_tweets must be a number, got '{raw}'")))?;
    if !(1..=MAX_RESULTS_LIMIT).contains(&cap) {
        return Err(FetchError::invalid(format!(
            "max_tweets must be between 1 and {MAX_RESULTS_LIMIT}"
        )));
    }
    Ok(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchErrorKind;

    #[test]
    fn test_equivalent_requests_share_fingerprint() {
        let a = Request::search("  Python   Programming ")
            .with_param("include_filters", "verified,images")
            .with_param("since", "2024-01-01");
        let b = Request::search("python programming")
            .with_param("include_filters", "Images, verified,images")
            .with_param("since", " 2024-01-01 ");

        let fa = a.normalize().unwrap().fingerprint();
        let fb = b.normalize().unwrap().fingerprint();
        assert_eq!(fa, fb);
    }

    #[test]
    fn test_different_caps_differ() {
        let a = Request::search("python").normalize().unwrap();
        let b = Request::search("python")
            .with_param("max_tweets", "10")
            .normalize()
            .unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.max_results, DEFAULT_MAX_RESULTS);
    }

    #[test]
    fn test_query_alias_and_default_cap_match() {
        let a = Request::search("rust").with_param("max_tweets", "50");
        let b = Request::new(RequestKind::Search).with_param("query", "RUST");
        assert_eq!(
            a.normalize().unwrap().fingerprint(),
            b.normalize().unwrap().fingerprint()
        );
    }

    #[test]
    fn test_kinds_never_collide() {
        let search = Request::search("jack").normalize().unwrap();
        let profile = Request::profile("jack").normalize().unwrap();
        assert_ne!(search.fingerprint(), profile.fingerprint());
    }

    #[test]
    fn test_username_is_cleaned() {
        let req = Request::profile("@Jack").normalize().unwrap();
        assert_eq!(req.target, "jack");
        assert_eq!(
            req.fingerprint(),
            Request::profile("jack").normalize().unwrap().fingerprint()
        );
    }

    #[test]
    fn test_unknown_filter_rejected() {
        let err = Request::search("python")
            .with_param("include_filters", "verified,gifs")
            .normalize()
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::RequestInvalid);
        assert!(err.message.contains("gifs"));
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let err = Request::search("python")
            .with_param("sort", "latest")
            .normalize()
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::RequestInvalid);
    }

    #[test]
    fn test_wrong_target_key_for_kind() {
        assert!(Request::profile("jack").with_param("q", "x").normalize().is_err());
        assert!(Request::new(RequestKind::Search).normalize().is_err());
    }

    #[test]
    fn test_aliases_given_twice_rejected() {
        let err = Request::search("rust")
            .with_param("query", "python")
            .normalize()
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::RequestInvalid);

        let err = Request::search("rust")
            .with_param("max_tweets", "10")
            .with_param("max_results", "20")
            .normalize()
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::RequestInvalid);

        let single = Request::search("rust")
            .with_param("max_results", "20")
            .normalize()
            .unwrap();
        assert_eq!(single.max_results, 20);
    }

    #[test]
    fn test_same_day_range_rejected() {
        let err = Request::search("rust")
            .with_param("since", "2024-03-01")
            .with_param("until", "2024-03-01")
            .normalize()
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::RequestInvalid);

        assert!(Request::search("rust")
            .with_param("since", "2024-03-01")
            .with_param("until", "2024-03-02")
            .normalize()
            .is_ok());
    }

    #[test]
    fn test_inverted_date_range_rejected() {
        let err = Request::search("python")
            .with_param("since", "2024-03-20")
            .with_param("until", "2024-01-01")
            .normalize()
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::RequestInvalid);
    }

    #[test]
    fn test_bad_date_and_cap_rejected() {
        assert!(
            Request::search("python")
                .with_param("since", "01/02/2024")
                .normalize()
                .is_err()
        );
        assert!(
            Request::search("python")
                .with_param("max_tweets", "0")
                .normalize()
                .is_err()
        );
        assert!(
            Request::search("python")
                .with_param("max_tweets", "1001")
                .normalize()
                .is_err()
        );
    }

    #[test]
    fn test_filter_in_both_lists_rejected() {
        assert!(
            Request::search("python")
                .with_param("include_filters", "replies")
                .with_param("exclude_filters", "replies")
                .normalize()
                .is_err()
        );
    }

    #[test]
    fn test_invalid_username_rejected() {
        assert!(Request::profile("@").normalize().is_err());
        assert!(Request::profile("not a name").normalize().is_err());
    }

    #[test]
    fn test_language_is_part_of_identity() {
        let en = Request::search("python").with_language("EN").normalize().unwrap();
        let de = Request::search("python").with_language("de").normalize().unwrap();
        assert_eq!(en.language.as_deref(), Some("en"));
        assert_ne!(en.fingerprint(), de.fingerprint());
    }

    #[test]
    fn test_filter_round_trip_names() {
        for filter in FilterType::ALL {
            assert_eq!(filter.as_str().parse::<FilterType>().unwrap(), filter);
        }
    }
}
