//! URL handling for Pushl
//!
//! This module provides the URL normalization used for cache keys, task
//! dedup keys and outgoing requests, plus host extraction helpers.

mod normalize;

use url::Url;

pub use normalize::normalize_url;

/// Extracts the host from a URL, lowercased
///
/// Returns None for URLs without a host, which cannot happen for the
/// http(s) URLs this crate works with after normalization.
pub fn extract_host(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Returns true when two URLs share an origin host (host and port)
///
/// Used to restrict webmention targets to external links: a page linking
/// to itself or to a sibling page on the same site is not mentioned. The
/// port participates so that distinct services on one name stay distinct.
pub fn same_host(a: &Url, b: &Url) -> bool {
    match (extract_host(a), extract_host(b)) {
        (Some(ha), Some(hb)) => ha == hb && a.port_or_known_default() == b.port_or_known_default(),
        _ => false,
    }
}
