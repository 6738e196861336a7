//! Pushl: notification fan-out for feed-based IndieWeb sites
//!
//! Given feed or entry URLs, this crate discovers content changes and sends
//! the corresponding outbound notifications: WebSub hub pings for updated
//! feeds, Webmention pings from entries to the pages they link to, and
//! optional Wayback Machine archival requests. A small on-disk HTTP cache
//! makes repeated runs idempotent and lets the tool notice updates and
//! deletions between invocations.

pub mod cache;
pub mod config;
pub mod engine;
pub mod entries;
pub mod feeds;
pub mod fetch;
pub mod notify;
pub mod registry;
pub mod url;

use thiserror::Error;

/// Main error type for Pushl operations
///
/// Task bodies report these to the registry; a failed task bumps the run's
/// failure count but never cancels its peers.
#[derive(Debug, Error)]
pub enum PushlError {
    #[error("Could not fetch {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("{endpoint} rejected ping: HTTP {status}")]
    PingRejected { endpoint: String, status: u16 },

    #[error("Ping to {endpoint} failed: {reason}")]
    PingFailed { endpoint: String, reason: String },

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing host in URL")]
    MissingHost,
}

/// Result type alias for Pushl operations
pub type Result<T> = std::result::Result<T, PushlError>;

// Re-export commonly used types
pub use config::ProcessingConfig;
pub use engine::Engine;
pub use registry::{TaskKind, TaskRegistry};
pub use url::{extract_host, normalize_url};
