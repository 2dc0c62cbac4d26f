// src/lib.rs

//! tweetpipe: cached, rate-limited tweet search and profile fetching.
//!
//! Requests go through [`Pipeline::resolve`], which serves fresh results
//! from an in-memory cache, collapses concurrent identical requests into one
//! upstream fetch and keeps upstream traffic inside a sliding-window budget.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;

pub use error::{AppError, FetchError, FetchErrorKind};
pub use models::{Config, FetchResult, FilterType, Request, RequestKind};
pub use pipeline::{Pipeline, Resolved};
