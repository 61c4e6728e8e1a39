//! cdxfetch: a client for CDX web-archive indices
//!
//! This crate presents one or more heterogeneous CDX index services (the
//! Internet Archive's wayback-style server, and pywb-style servers such as
//! the Common Crawl index, which is sharded into one index per crawl) as a
//! single ordered, paginated stream of capture records. It can also fetch
//! the archived content a capture points at and re-emit it as WARC records.

pub mod catalog;
pub mod fetch;
pub mod iter;
pub mod query;
pub mod record;
pub mod timeutil;
pub mod transport;
pub mod warc;

use thiserror::Error;

/// Main error type for cdxfetch operations
///
/// Every failure class callers need to distinguish is a separate variant:
/// usage errors are never retried, fetch failures carry the endpoint and
/// attempt count, fatal network errors mean retrying cannot help, and
/// materialization errors are localized to a single capture.
#[derive(Debug, Error)]
pub enum CdxError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("fetch failed for {url} after {attempts} attempts: {message}")]
    FetchFailure {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("name resolution failed for {url}, check the hostname")]
    FatalNetwork { url: String },

    #[error("request cancelled for {url}")]
    Cancelled { url: String },

    #[error("HTTP status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("cannot decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("materialization failed for {url} {timestamp}: {message}")]
    Materialization {
        url: String,
        timestamp: String,
        message: String,
    },

    #[error("invalid timestamp {0:?}, cdx timestamps are digit strings like 20170101000000")]
    Timestamp(String),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CdxError {
    /// True when the error concerns exactly one capture and the caller may
    /// continue with the rest of the stream.
    pub fn is_per_record(&self) -> bool {
        matches!(self, CdxError::Materialization { .. })
    }
}

/// Result type alias for cdxfetch operations
pub type Result<T> = std::result::Result<T, CdxError>;

// Re-export commonly used types
pub use catalog::{IndexCatalog, IndexEndpoint, Source};
pub use iter::CdxFetcher;
pub use query::{CrawlOrder, FilterClause, FilterModifier, MatchType, QuerySpec};
pub use record::CaptureRecord;
pub use transport::{CancelToken, Transport};
