//! Entry page parsing
//!
//! Extracts from an entry's HTML everything the fan-out needs: the mention
//! source (canonical URL when declared), the outgoing links to mention,
//! autodiscovered feeds for recursion, and entry-level WebSub hubs.

use crate::url::same_host;
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeSet;
use url::Url;

/// Link relations that never produce webmentions
///
/// Tokens are compared case-insensitively; additionally any rel token
/// containing "nav" (nav, navigation, site-nav, ...) is excluded.
const REL_BLACKLIST: &[&str] = &["author", "self", "nofollow", "nonotify"];

/// Content types that mark a `rel="alternate"` link as a feed
const FEED_TYPES: &[&str] = &[
    "text/xml",
    "application/rdf+xml",
    "application/rss+xml",
    "application/atom+xml",
    "application/xml",
];

/// What a single parse of an entry page yields
#[derive(Debug)]
pub struct EntrySnapshot {
    /// The URL to advertise as the webmention source: the document's
    /// canonical URL when declared, otherwise the fetched URL
    pub source: Url,

    /// Outgoing link targets, filtered and resolved absolute; fragments
    /// are kept so fragment-targeted mentions stay addressable
    pub targets: BTreeSet<String>,

    /// Feed URLs autodiscovered from `rel="alternate"` links
    pub feeds: Vec<Url>,

    /// WebSub hubs advertised by the entry itself
    pub hubs: Vec<Url>,
}

/// Parses an entry page fetched from `base`
///
/// Never fails: a page without any recognizable entry container is treated
/// as one big container.
pub fn parse_entry(base: &Url, body: &str) -> EntrySnapshot {
    let document = Html::parse_document(body);

    let source = document_canonical(&document, base).unwrap_or_else(|| base.clone());

    let mut targets = BTreeSet::new();
    if let Ok(anchor_selector) = Selector::parse("a[href]") {
        for container in entry_containers(&document) {
            for anchor in container.select(&anchor_selector) {
                if rel_excluded(anchor.value().attr("rel")) {
                    continue;
                }
                let Some(href) = anchor.value().attr("href") else {
                    continue;
                };
                if let Some(resolved) = resolve_target(href, &source) {
                    targets.insert(resolved);
                }
            }
        }
    }

    let mut feeds = Vec::new();
    if let Ok(alternate_selector) = Selector::parse("link[rel~=\"alternate\"][href]") {
        for link in document.select(&alternate_selector) {
            let is_feed_type = link
                .value()
                .attr("type")
                .map(|t| FEED_TYPES.contains(&t.trim()))
                .unwrap_or(false);
            if !is_feed_type {
                continue;
            }
            if let Some(href) = link.value().attr("href") {
                if let Ok(resolved) = source.join(href) {
                    feeds.push(resolved);
                }
            }
        }
    }

    let mut hubs = Vec::new();
    if let Ok(hub_selector) = Selector::parse("link[rel~=\"hub\"][href]") {
        for link in document.select(&hub_selector) {
            if let Some(href) = link.value().attr("href") {
                if let Ok(resolved) = source.join(href) {
                    hubs.push(resolved);
                }
            }
        }
    }

    EntrySnapshot {
        source,
        targets,
        feeds,
        hubs,
    }
}

/// The document-root canonical link, if declared
fn document_canonical(document: &Html, base: &Url) -> Option<Url> {
    let selector = Selector::parse("link[rel~=\"canonical\"][href]").ok()?;
    let href = document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("href"))?;
    base.join(href).ok()
}

/// Finds the elements holding the entry's own content
///
/// Priority: `.h-entry` microformat containers, then `<article>`, then
/// `.entry`, then the whole document.
fn entry_containers(document: &Html) -> Vec<ElementRef<'_>> {
    for selector_str in [".h-entry", "article", ".entry"] {
        if let Ok(selector) = Selector::parse(selector_str) {
            let containers: Vec<_> = document.select(&selector).collect();
            if !containers.is_empty() {
                return containers;
            }
        }
    }
    vec![document.root_element()]
}

/// Checks a rel attribute against the non-mention blacklist
fn rel_excluded(rel: Option<&str>) -> bool {
    let Some(rel) = rel else {
        return false;
    };
    rel.split_ascii_whitespace().any(|token| {
        let token = token.to_ascii_lowercase();
        REL_BLACKLIST.contains(&token.as_str()) || token.contains("nav")
    })
}

/// Resolves an href into an absolute mention target
///
/// Returns None for links that can never be mentioned: unresolvable hrefs,
/// non-http(s) schemes, same-page anchors, and links back to the source's
/// own host (mentions go to external pages).
fn resolve_target(href: &str, source: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    if href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }

    let resolved = source.join(href).ok()?;
    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }
    if same_host(&resolved, source) {
        return None;
    }

    Some(resolved.to_string())
}
