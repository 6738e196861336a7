//! Feed parsing
//!
//! Turns a fetched feed body into a [`FeedSnapshot`]: hub URLs, the feed's
//! self URL, item URLs, and RFC 5005 archive links. Anything feed-rs
//! accepts (RSS, Atom, RDF, JSON Feed) parses directly; HTML documents
//! carrying `h-entry` microformats are treated as feeds too, with each
//! `h-entry` that declares a `u-url` becoming an item.

use scraper::{Html, Selector};
use std::collections::BTreeSet;
use thiserror::Error;
use url::Url;

/// Relations marking RFC 5005 archive/pagination neighbors
const ARCHIVE_RELS: &[&str] = &["prev-archive", "next-archive", "prev-page", "next-page"];

/// Feed parse failure; callers log it and move on without derived work
#[derive(Debug, Error)]
pub enum FeedParseError {
    #[error("not a recognizable feed: {0}")]
    Unrecognized(String),
}

/// What a single parse of a feed document yields
#[derive(Debug)]
pub struct FeedSnapshot {
    /// WebSub hubs advertised by the feed
    pub hubs: Vec<Url>,

    /// The feed's own URL as declared by `rel="self"`, if any
    pub self_url: Option<Url>,

    /// Item URLs, resolved absolute
    pub items: BTreeSet<String>,

    /// RFC 5005 archive/pagination page URLs
    pub archives: Vec<Url>,

    /// True when this document is an archive view rather than the
    /// current one; archive views never get hub pings
    pub is_archive: bool,
}

/// Parses a feed body fetched from `base`
pub fn parse_feed(base: &Url, body: &str) -> Result<FeedSnapshot, FeedParseError> {
    match feed_rs::parser::parse(body.as_bytes()) {
        Ok(feed) => Ok(from_parsed_feed(base, feed)),
        Err(feed_err) => parse_html_feed(base, body).map_err(|_| {
            FeedParseError::Unrecognized(format!("{feed_err}; no h-entry items either"))
        }),
    }
}

fn from_parsed_feed(base: &Url, feed: feed_rs::model::Feed) -> FeedSnapshot {
    let mut hubs = Vec::new();
    let mut self_url = None;
    let mut current_url = None;
    let mut archives = Vec::new();

    for link in &feed.links {
        let Ok(href) = base.join(&link.href) else {
            continue;
        };
        match link.rel.as_deref() {
            Some("hub") => hubs.push(href),
            Some("self") => self_url = Some(href),
            Some("current") => current_url = Some(href),
            Some(rel) if ARCHIVE_RELS.contains(&rel) => archives.push(href),
            _ => {}
        }
    }

    let mut items = BTreeSet::new();
    for entry in &feed.entries {
        let link = entry
            .links
            .iter()
            .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
            .or_else(|| entry.links.first());
        if let Some(link) = link {
            if let Ok(resolved) = base.join(&link.href) {
                items.insert(resolved.to_string());
            }
        }
    }

    // An archive view declares a rel=current pointing somewhere other than
    // itself (RFC 5005 §2; the fh: markers are not exposed by the parser,
    // so the link heuristic has to carry it).
    let is_archive = match (&current_url, &self_url) {
        (Some(current), Some(this)) => current != this,
        (Some(_), None) => true,
        _ => false,
    };

    FeedSnapshot {
        hubs,
        self_url,
        items,
        archives,
        is_archive,
    }
}

/// Minimal microformats2 reading of an HTML feed
///
/// Each `.h-entry` with a `.u-url[href]` descendant contributes an item;
/// `<link rel="hub">` and archive rels are honored like their XML
/// counterparts. A document with no `h-entry` is not a feed.
fn parse_html_feed(base: &Url, body: &str) -> Result<FeedSnapshot, FeedParseError> {
    let document = Html::parse_document(body);

    let entry_selector = Selector::parse(".h-entry")
        .map_err(|e| FeedParseError::Unrecognized(e.to_string()))?;
    let url_selector = Selector::parse(".u-url[href]")
        .map_err(|e| FeedParseError::Unrecognized(e.to_string()))?;

    let mut items = BTreeSet::new();
    let mut saw_entry = false;
    for entry in document.select(&entry_selector) {
        saw_entry = true;
        if let Some(url_el) = entry.select(&url_selector).next() {
            if let Some(href) = url_el.value().attr("href") {
                if let Ok(resolved) = base.join(href) {
                    items.insert(resolved.to_string());
                }
            }
        }
    }

    if !saw_entry {
        return Err(FeedParseError::Unrecognized(
            "HTML document without h-entry items".to_string(),
        ));
    }

    let mut hubs = Vec::new();
    if let Ok(hub_selector) = Selector::parse("link[rel~=\"hub\"][href]") {
        for el in document.select(&hub_selector) {
            if let Some(href) = el.value().attr("href") {
                if let Ok(resolved) = base.join(href) {
                    hubs.push(resolved);
                }
            }
        }
    }

    let mut archives = Vec::new();
    for rel in ARCHIVE_RELS {
        if let Ok(selector) = Selector::parse(&format!("link[rel~=\"{rel}\"][href]")) {
            for el in document.select(&selector) {
                if let Some(href) = el.value().attr("href") {
                    if let Ok(resolved) = base.join(href) {
                        archives.push(resolved);
                    }
                }
            }
        }
    }

    Ok(FeedSnapshot {
        hubs,
        self_url: None,
        items,
        archives,
        is_archive: false,
    })
}
