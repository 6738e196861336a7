//! Runtime configuration
//!
//! All configuration comes from the command line and is immutable once the
//! engine starts.

use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default cap on simultaneous outbound requests
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Default cap on simultaneous requests against one host
pub const DEFAULT_MAX_PER_HOST: usize = 4;

/// Default per-request timeout, in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// The user agent sent when none is configured
pub fn default_user_agent() -> String {
    format!("Pushl/{}", env!("CARGO_PKG_VERSION"))
}

/// Processing options, fixed for the lifetime of a run
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Cache directory; None disables all persistence
    pub cache_dir: Option<PathBuf>,

    /// Recurse into feeds autodiscovered on entry pages
    pub recurse: bool,

    /// Follow RFC 5005 archive links for backfill
    pub archive: bool,

    /// Request Wayback Machine archival for every mention target
    pub wayback: bool,

    /// Save-page-now URL prefix the target is appended to; points at the
    /// real Wayback Machine by default, overridable for testing
    pub wayback_endpoint: String,

    /// Normalized URL prefixes for which webmention processing is
    /// suppressed; only hub pings happen for feeds matching these
    pub websub_only: Vec<String>,

    /// User-agent header for every outbound request
    pub user_agent: String,

    /// Connect and total timeout per request
    pub timeout: Duration,

    /// Cap on simultaneous outbound requests
    pub max_connections: usize,

    /// Cap on simultaneous requests per host; 0 means unlimited
    pub max_per_host: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            recurse: false,
            archive: false,
            wayback: false,
            wayback_endpoint: crate::notify::WAYBACK_SAVE_PREFIX.to_string(),
            websub_only: Vec::new(),
            user_agent: default_user_agent(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_per_host: DEFAULT_MAX_PER_HOST,
        }
    }
}

impl ProcessingConfig {
    /// True when the URL falls under a websub-only prefix
    pub fn is_websub_only(&self, url: &Url) -> bool {
        self.websub_only
            .iter()
            .any(|prefix| url.as_str().starts_with(prefix.as_str()))
    }
}
