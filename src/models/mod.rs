// src/models/mod.rs

//! Domain models for the pipeline.
//!
//! This module contains all data structures used throughout the crate,
//! organized by their primary purpose.

mod config;
mod request;
mod tweet;

// Re-export all public types
pub use config::{ArchiveConfig, Config, PipelineConfig, ScraperConfig};
pub use request::{
    DEFAULT_MAX_RESULTS, FilterType, Fingerprint, MAX_RESULTS_LIMIT, NormalizedRequest, Request,
    RequestKind,
};
pub use tweet::{FetchResult, Profile, RawPage, Tweet};
