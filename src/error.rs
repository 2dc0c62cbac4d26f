// src/error.rs

//! Unified error handling for the pipeline.

use std::fmt;

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Per-request failure categories surfaced to callers of `resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    /// Waited too long for rate limiter admission. Safe to retry later.
    RateLimitTimeout,
    /// The upstream kept failing until the retry budget ran out.
    UpstreamUnavailable,
    /// The upstream answered, but not with a page we know how to read.
    MalformedUpstreamOutput,
    /// Parameters were rejected before any fetch was attempted.
    RequestInvalid,
    /// The upstream reported that the user or page does not exist.
    TargetNotFound,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::RateLimitTimeout => "rate_limit_timeout",
            FetchErrorKind::UpstreamUnavailable => "upstream_unavailable",
            FetchErrorKind::MalformedUpstreamOutput => "malformed_upstream_output",
            FetchErrorKind::RequestInvalid => "request_invalid",
            FetchErrorKind::TargetNotFound => "target_not_found",
        }
    }

    /// Whether the caller may reasonably try the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchErrorKind::RateLimitTimeout | FetchErrorKind::UpstreamUnavailable
        )
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed per-request failure.
///
/// Cloneable so a single outcome can be handed to every waiter of an
/// in-flight fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl fmt::Display) -> Self {
        Self {
            kind,
            message: message.to_string(),
        }
    }

    pub fn invalid(message: impl fmt::Display) -> Self {
        Self::new(FetchErrorKind::RequestInvalid, message)
    }

    pub fn malformed(message: impl fmt::Display) -> Self {
        Self::new(FetchErrorKind::MalformedUpstreamOutput, message)
    }
}

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Per-request pipeline failure
    #[error("Fetch failed ({0})")]
    Fetch(#[from] FetchError),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// CSS selector parsing failed
    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// The upstream answered with something other than a usable page
    #[error("Upstream error for {context}: {message}")]
    Upstream {
        context: String,
        message: String,
        transient: bool,
    },
}

impl AppError {
    /// Create a selector parsing error.
    pub fn selector(selector: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a retryable upstream error with context.
    pub fn upstream(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Upstream {
            context: context.into(),
            message: message.to_string(),
            transient: true,
        }
    }

    /// Create an upstream error that retrying will not fix.
    pub fn upstream_permanent(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Upstream {
            context: context.into(),
            message: message.to_string(),
            transient: false,
        }
    }

    /// Whether a fetch attempt that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Http(e) => !e.status().is_some_and(|s| s.is_client_error() && s.as_u16() != 429),
            AppError::Io(_) => true,
            AppError::Upstream { transient, .. } => *transient,
            AppError::Fetch(e) => e.kind.is_retryable(),
            _ => false,
        }
    }

    /// Collapse any error into the per-request failure shape.
    pub fn into_fetch_error(self) -> FetchError {
        match self {
            AppError::Fetch(e) => e,
            AppError::Upstream {
                transient: false,
                context,
                message,
            } => FetchError::new(
                FetchErrorKind::TargetNotFound,
                format!("{context}: {message}"),
            ),
            AppError::Selector { .. } | AppError::Json(_) => {
                FetchError::malformed(self.to_string())
            }
            AppError::Validation(message) => FetchError::invalid(message),
            other => FetchError::new(FetchErrorKind::UpstreamUnavailable, other),
        }
    }

    /// The per-request kind, when this error is a per-request failure.
    pub fn fetch_kind(&self) -> Option<FetchErrorKind> {
        match self {
            AppError::Fetch(e) => Some(e.kind),
            _ => None,
        }
    }
}
