//! Fan-out orchestration
//!
//! The [`Engine`] owns the shared pieces of a run (config, cache, fetcher,
//! task registry) and hosts the task bodies: feed processing, entry
//! processing, and the three ping kinds. Tasks submit follow-on work
//! through the registry and never await their children; quiescence is
//! detected at the top level by the registry's counters.

use crate::cache::CacheStore;
use crate::config::ProcessingConfig;
use crate::entries::parse_entry;
use crate::feeds::parse_feed;
use crate::fetch::link_header::{find_rel, parse_link_headers};
use crate::fetch::{build_http_client, FetchResult, Fetcher, HostLimiter};
use crate::notify;
use crate::registry::{TaskKind, TaskRegistry};
use crate::url::{extract_host, normalize_url};
use crate::{PushlError, Result};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use url::Url;

/// Shared state and task bodies for one run
pub struct Engine {
    config: ProcessingConfig,
    cache: Arc<CacheStore>,
    fetcher: Fetcher,
    registry: Arc<TaskRegistry>,

    /// Hosts that appeared as feed or entry seeds; `-r` recursion only
    /// follows autodiscovered feeds on these hosts
    feed_hosts: StdMutex<HashSet<String>>,
}

impl Engine {
    /// Builds an engine from the given configuration
    pub fn new(config: ProcessingConfig) -> Result<Arc<Self>> {
        let client = build_http_client(&config.user_agent, config.timeout)?;
        let limits = Arc::new(HostLimiter::new(
            config.max_connections,
            config.max_per_host,
        ));
        let cache = Arc::new(CacheStore::new(config.cache_dir.clone()));
        let fetcher = Fetcher::new(client, Arc::clone(&cache), limits);

        Ok(Arc::new(Self {
            config,
            cache,
            fetcher,
            registry: TaskRegistry::new(),
            feed_hosts: StdMutex::new(HashSet::new()),
        }))
    }

    /// The task registry driving this run
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Submits the initial tasks for the seed URLs
    pub fn seed(self: &Arc<Self>, feeds: &[Url], websub_only: &[Url], entries: &[Url]) {
        for url in feeds {
            self.submit_feed(url.clone(), false);
        }
        for url in websub_only {
            self.submit_feed(url.clone(), true);
        }
        for url in entries {
            self.note_feed_host(url);
            self.submit_entry(url.clone());
        }
    }

    fn note_feed_host(&self, url: &Url) {
        if let Some(host) = extract_host(url) {
            self.feed_hosts
                .lock()
                .expect("feed host set poisoned")
                .insert(host);
        }
    }

    fn is_feed_host(&self, url: &Url) -> bool {
        extract_host(url)
            .map(|host| {
                self.feed_hosts
                    .lock()
                    .expect("feed host set poisoned")
                    .contains(&host)
            })
            .unwrap_or(false)
    }

    /// Queues a feed for processing
    pub fn submit_feed(self: &Arc<Self>, url: Url, suppress_mentions: bool) {
        self.note_feed_host(&url);
        let engine = Arc::clone(self);
        let key = url.to_string();
        self.registry.submit(
            TaskKind::Feed,
            key,
            Box::pin(async move { engine.process_feed(url, suppress_mentions).await }),
        );
    }

    /// Queues an entry page for processing
    pub fn submit_entry(self: &Arc<Self>, url: Url) {
        let engine = Arc::clone(self);
        let key = url.to_string();
        self.registry.submit(
            TaskKind::Entry,
            key,
            Box::pin(async move { engine.process_entry(url).await }),
        );
    }

    fn submit_entry_str(self: &Arc<Self>, item: &str) {
        match normalize_url(item) {
            Ok(url) => self.submit_entry(url),
            Err(err) => tracing::debug!("Skipping invalid entry URL {}: {}", item, err),
        }
    }

    fn submit_websub(self: &Arc<Self>, topic: Url, hub: Url) {
        let engine = Arc::clone(self);
        let key = format!("{topic} -> {hub}");
        self.registry.submit(
            TaskKind::WebSubPing,
            key,
            Box::pin(async move { engine.send_websub(topic, hub).await }),
        );
    }

    fn submit_webmention(self: &Arc<Self>, source: Url, target: String) {
        let engine = Arc::clone(self);
        let key = format!("{source} -> {target}");
        self.registry.submit(
            TaskKind::WebmentionPing,
            key,
            Box::pin(async move { engine.send_webmention(source, target).await }),
        );
    }

    fn submit_wayback(self: &Arc<Self>, target: String) {
        let engine = Arc::clone(self);
        let key = target.clone();
        self.registry.submit(
            TaskKind::WaybackSave,
            key,
            Box::pin(async move { engine.save_wayback(target).await }),
        );
    }

    /// Feed task body
    ///
    /// Hubs are pinged on any non-304 response and never on a 304; entry
    /// tasks are submitted either way (entries change independently of the
    /// feed document), for the union of the current and previously-seen
    /// item sets so removed items still get their update check.
    async fn process_feed(self: Arc<Self>, url: Url, suppress_mentions: bool) -> Result<()> {
        let suppress_mentions = suppress_mentions || self.config.is_websub_only(&url);
        let result = self.fetcher.fetch(&url).await;

        if !result.is_success() {
            return Err(fetch_error(&url, &result));
        }

        if result.served_from_cache {
            tracing::debug!("{}: feed unchanged", url);
            if !suppress_mentions {
                for item in &result.previous_links {
                    self.submit_entry_str(item);
                }
            }
            return Ok(());
        }

        tracing::info!("Feed {} has been updated", url);

        if !result.is_parseable() {
            tracing::warn!(
                "{}: not a feed content type ({})",
                url,
                result.content_type.as_deref().unwrap_or("unknown")
            );
            return Ok(());
        }
        let Some(body) = result.body.as_deref() else {
            tracing::warn!("{}: feed response had no body", url);
            return Ok(());
        };

        let snapshot = match parse_feed(&result.final_url, body) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!("{}: {}", url, err);
                return Ok(());
            }
        };

        self.cache.set_links(&url, snapshot.items.clone()).await;

        if !snapshot.is_archive {
            let topic = snapshot
                .self_url
                .clone()
                .unwrap_or_else(|| result.final_url.clone());
            for hub in &snapshot.hubs {
                self.submit_websub(topic.clone(), hub.clone());
            }
        }

        if !suppress_mentions {
            let items: BTreeSet<String> = snapshot
                .items
                .union(&result.previous_links)
                .cloned()
                .collect();
            for item in &items {
                self.submit_entry_str(item);
            }
        }

        if self.config.archive {
            for archive in snapshot.archives {
                self.submit_feed(archive, suppress_mentions);
            }
        }

        Ok(())
    }

    /// Entry task body
    async fn process_entry(self: Arc<Self>, url: Url) -> Result<()> {
        let result = self.fetcher.fetch(&url).await;

        if result.is_gone() {
            // The entry was deleted: everything it used to link to gets a
            // deletion notice, and the stored link set empties out.
            tracing::info!("{}: entry is gone, notifying previous targets", url);
            let source = result.canonical_url.clone();
            for target in &result.previous_links {
                self.submit_webmention(source.clone(), target.clone());
            }
            self.cache.set_links(&url, BTreeSet::new()).await;
            return Ok(());
        }

        if !result.is_success() {
            return Err(fetch_error(&url, &result));
        }

        if result.served_from_cache {
            tracing::debug!("{}: entry unchanged", url);
            return Ok(());
        }

        if !result.is_parseable() {
            tracing::debug!(
                "{}: not a parseable content type ({})",
                url,
                result.content_type.as_deref().unwrap_or("unknown")
            );
            return Ok(());
        }
        let Some(body) = result.body.as_deref() else {
            return Ok(());
        };

        tracing::info!("Processing entry: {}", url);
        let snapshot = parse_entry(&result.canonical_url, body);

        let current = snapshot.targets.clone();
        let all_targets: BTreeSet<String> =
            current.union(&result.previous_links).cloned().collect();
        self.cache.set_links(&url, current).await;

        for target in &all_targets {
            self.submit_webmention(snapshot.source.clone(), target.clone());
            if self.config.wayback {
                self.submit_wayback(target.clone());
            }
        }

        // Entry-level hubs, from the markup and from the Link header.
        let mut hubs = snapshot.hubs.clone();
        let header_links = parse_link_headers(&result.link_headers);
        if let Some(hub) = find_rel(&header_links, "hub") {
            if let Ok(resolved) = result.final_url.join(&hub.target) {
                hubs.push(resolved);
            }
        }
        for hub in hubs {
            self.submit_websub(snapshot.source.clone(), hub);
        }

        if self.config.recurse {
            for feed in snapshot.feeds {
                if self.is_feed_host(&feed) {
                    self.submit_feed(feed, false);
                } else {
                    tracing::info!("Ignoring non-local feed {}", feed);
                }
            }
        }

        Ok(())
    }

    /// Webmention task body: discover the target's endpoint, then POST
    async fn send_webmention(self: Arc<Self>, source: Url, target: String) -> Result<()> {
        let request_url = match normalize_url(&target) {
            Ok(url) => url,
            Err(err) => {
                tracing::debug!("Skipping unmentionable target {}: {}", target, err);
                return Ok(());
            }
        };

        let result = self.fetcher.fetch(&request_url).await;

        if let Some(error) = &result.error {
            return Err(PushlError::FetchFailed {
                url: target.clone(),
                reason: error.clone(),
            });
        }

        if !result.is_success() {
            if let Some(status) = result.status {
                if (400..500).contains(&status) {
                    tracing::warn!(
                        "{}: link to {} generated client error {}",
                        source,
                        target,
                        status
                    );
                }
            }
            return Ok(());
        }

        let Some(endpoint) = notify::discover_endpoint(&result) else {
            tracing::debug!("{}: no webmention endpoint", target);
            return Ok(());
        };

        notify::send_webmention(
            self.fetcher.client(),
            self.fetcher.limits(),
            &endpoint,
            source.as_str(),
            &target,
        )
        .await
    }

    /// WebSub task body
    async fn send_websub(self: Arc<Self>, topic: Url, hub: Url) -> Result<()> {
        notify::send_websub(
            self.fetcher.client(),
            self.fetcher.limits(),
            &hub,
            topic.as_str(),
        )
        .await
    }

    /// Wayback task body
    async fn save_wayback(self: Arc<Self>, target: String) -> Result<()> {
        notify::save_wayback(
            self.fetcher.client(),
            self.fetcher.limits(),
            &self.config.wayback_endpoint,
            &target,
        )
        .await
    }
}

fn fetch_error(url: &Url, result: &FetchResult) -> PushlError {
    let reason = match (&result.error, result.status) {
        (Some(error), _) => error.clone(),
        (None, Some(status)) => format!("HTTP {status}"),
        (None, None) => "no response".to_string(),
    };
    PushlError::FetchFailed {
        url: url.to_string(),
        reason,
    }
}
