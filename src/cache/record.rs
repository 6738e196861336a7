use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// On-disk record format version; bumped when the shape changes
///
/// Records carrying any other value are treated as cache misses and
/// overwritten on the next successful fetch.
pub const SCHEMA_VERSION: u32 = 1;

/// Cached outcome of the last completed fetch of a URL
///
/// The record keeps just enough of the response to issue a conditional GET
/// next time (`etag`, `last_modified`), to synthesize a result from a 304
/// (`status`, `final_url`, `content_type`, `body`, `link_headers`), and to
/// detect removed links between runs (`links`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Format version tag; see [`SCHEMA_VERSION`]
    pub schema: u32,

    /// HTTP status of the last terminal response after redirect chasing
    pub status: u16,

    /// Final URL after redirects and canonical rewriting
    pub final_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Decoded response body; absent when the terminal status carried none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    /// `Link:` response header values from the terminal response
    ///
    /// Kept so webmention endpoint discovery works on a 304 without the
    /// server having to repeat its headers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link_headers: Vec<String>,

    /// When this record was last written or refreshed
    pub fetched_at: DateTime<Utc>,

    /// Outbound URLs observed on the previous successful parse
    ///
    /// For feeds this is the item-URL set; for entries the filtered target
    /// set. The union of this and the freshly parsed set drives pings so
    /// that deletions still get mentioned.
    #[serde(default)]
    pub links: BTreeSet<String>,
}

impl CacheRecord {
    /// Creates a fresh record stamped with the current time
    pub fn new(status: u16, final_url: String) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            status,
            final_url,
            etag: None,
            last_modified: None,
            content_type: None,
            body: None,
            link_headers: Vec::new(),
            fetched_at: Utc::now(),
            links: BTreeSet::new(),
        }
    }

    /// Returns true when the record was written by this version of the format
    pub fn is_current_schema(&self) -> bool {
        self.schema == SCHEMA_VERSION
    }
}
