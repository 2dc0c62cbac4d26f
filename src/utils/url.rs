// src/utils/url.rs

//! URL building and rewriting for the upstream site.

use std::sync::OnceLock;

use percent_encoding::percent_decode_str;
use regex::Regex;
use url::Url;

use crate::error::Result;
use crate::models::{NormalizedRequest, RequestKind};

/// Resolve a potentially relative URL against a base URL.
pub fn resolve_url(base: &Url, href: &str) -> String {
    match base.join(href) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}

/// First page URL for a request.
///
/// Searches go to `/search?f=tweets&q=...`; profiles to `/{username}/search`.
/// Filters become `f-<name>=on` / `e-<name>=on` pairs.
pub fn request_url(base_url: &str, request: &NormalizedRequest) -> Result<String> {
    let base = Url::parse(base_url)?;
    let mut url = match request.kind {
        RequestKind::Search => base.join("/search")?,
        RequestKind::UserProfile => base.join(&format!("/{}/search", request.target))?,
    };

    let has_options = !request.include.is_empty()
        || !request.exclude.is_empty()
        || request.since.is_some()
        || request.until.is_some()
        || request.near.is_some()
        || request.language.is_some();

    if request.kind == RequestKind::UserProfile && !has_options {
        return Ok(url.to_string());
    }

    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("f", "tweets");

        let mut query = match request.kind {
            RequestKind::Search => request.target.clone(),
            RequestKind::UserProfile => String::new(),
        };
        if let Some(lang) = &request.language {
            if !query.is_empty() {
                query.push(' ');
            }
            query.push_str(&format!("lang:{lang}"));
        }
        pairs.append_pair("q", &query);

        for filter in &request.include {
            pairs.append_pair(&format!("f-{filter}"), "on");
        }
        for filter in &request.exclude {
            pairs.append_pair(&format!("e-{filter}"), "on");
        }
        if let Some(since) = request.since {
            pairs.append_pair("since", &since.format("%Y-%m-%d").to_string());
        }
        if let Some(until) = request.until {
            pairs.append_pair("until", &until.format("%Y-%m-%d").to_string());
        }
        if let Some(near) = &request.near {
            pairs.append_pair("near", near);
        }
    }

    Ok(url.to_string())
}

/// Rewrite a proxied `/pic/...` image to its original host.
///
/// Anything that is not a proxied picture is returned resolved but untouched.
pub fn to_original_image(base: &Url, image_domain: &str, src: &str) -> String {
    let absolute = resolve_url(base, src);
    let Some(path) = absolute
        .strip_prefix(base.origin().ascii_serialization().as_str())
        .and_then(|rest| rest.strip_prefix("/pic/"))
    else {
        return absolute;
    };

    let decoded = percent_decode_str(path).decode_utf8_lossy();
    format!("{}/{}", image_domain.trim_end_matches('/'), decoded)
}

/// Canonical `https://x.com/{user}/status/{id}` link for a tweet permalink.
pub fn canonical_tweet_link(username: &str, href: &str) -> Option<String> {
    static STATUS_ID: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = STATUS_ID
        .get_or_init(|| Regex::new(r"/status/(\d+)").ok())
        .as_ref()?;

    let id = pattern.captures(href)?.get(1)?.as_str();
    let user = username.trim().trim_start_matches('@');
    Some(format!("https://x.com/{user}/status/{id}"))
}

/// File-system safe rendition of a URL.
pub fn safe_filename(url: &str) -> String {
    url.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Request;

    const BASE: &str = "https://nitter.net";

    #[test]
    fn test_plain_search_url() {
        let req = Request::search("python").normalize().unwrap();
        assert_eq!(
            request_url(BASE, &req).unwrap(),
            "https://nitter.net/search?f=tweets&q=python"
        );
    }

    #[test]
    fn test_search_url_with_options() {
        let req = Request::search("yapay zeka")
            .with_param("include_filters", "verified,images")
            .with_param("exclude_filters", "replies")
            .with_param("since", "2024-01-01")
            .with_param("until", "2024-03-20")
            .normalize()
            .unwrap();
        let url = request_url(BASE, &req).unwrap();
        assert_eq!(
            url,
            "https://nitter.net/search?f=tweets&q=yapay+zeka&f-verified=on&f-images=on\
             &e-replies=on&since=2024-01-01&until=2024-03-20"
        );
    }

    #[test]
    fn test_search_url_carries_language() {
        let req = Request::search("rust").with_language("de").normalize().unwrap();
        assert_eq!(
            request_url(BASE, &req).unwrap(),
            "https://nitter.net/search?f=tweets&q=rust+lang%3Ade"
        );
    }

    #[test]
    fn test_profile_url() {
        let req = Request::profile("@Jack").normalize().unwrap();
        assert_eq!(
            request_url(BASE, &req).unwrap(),
            "https://nitter.net/jack/search"
        );
    }

    #[test]
    fn test_next_page_resolves_cursor() {
        let page = Url::parse("https://nitter.net/search?f=tweets&q=python").unwrap();
        assert_eq!(
            resolve_url(&page, "?f=tweets&q=python&cursor=abc"),
            "https://nitter.net/search?f=tweets&q=python&cursor=abc"
        );
    }

    #[test]
    fn test_image_rewrite() {
        let base = Url::parse(BASE).unwrap();
        assert_eq!(
            to_original_image(&base, "https://pbs.twimg.com", "/pic/media%2FGabc.jpg%3Fname%3Dsmall"),
            "https://pbs.twimg.com/media/Gabc.jpg?name=small"
        );
        assert_eq!(
            to_original_image(&base, "https://pbs.twimg.com", "https://cdn.example.com/a.png"),
            "https://cdn.example.com/a.png"
        );
    }

    #[test]
    fn test_canonical_tweet_link() {
        assert_eq!(
            canonical_tweet_link("@rustlang", "/rustlang/status/1234567890#m"),
            Some("https://x.com/rustlang/status/1234567890".to_string())
        );
        assert_eq!(canonical_tweet_link("@rustlang", "/rustlang"), None);
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("https://a.b/c?d=1"), "https___a_b_c_d_1");
    }
}
