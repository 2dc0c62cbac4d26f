//! Service layer for the pipeline.
//!
//! This module contains:
//! - The upstream fetch primitive (`RawFetcher`, `NitterFetcher`)
//! - Page normalization and filtering (`Normalizer`, `FilterSet`)

mod fetcher;
pub mod normalizer;

pub use fetcher::{NitterFetcher, RawFetcher};
pub use normalizer::{FilterSet, Normalizer};
