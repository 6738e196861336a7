//! Caching HTTP fetcher
//!
//! This module wraps the HTTP client with everything the processors need:
//! - conditional GETs (`If-None-Match` / `If-Modified-Since`) against the
//!   on-disk cache, with 304 responses synthesized from the stored body
//! - manual redirect following with loop detection, up to [`MAX_REDIRECTS`]
//! - canonical-URL tracking from `Link: <...>; rel="canonical"` headers
//! - per-run memoization so any URL is fetched at most once per process run,
//!   no matter how many tasks ask for it
//! - global and per-host concurrency caps
//! - retry-once policy for transient failures
//!
//! Failures surface as a failed [`FetchResult`], never as a panic or a
//! hung task.

mod limits;
pub mod link_header;

pub use limits::{HostLimiter, RequestPermit};

use crate::cache::{CacheRecord, CacheStore};
use crate::url::extract_host;
use link_header::{find_rel, parse_link_headers};
use reqwest::header::{
    CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LINK, LOCATION,
};
use reqwest::{redirect::Policy, Client, StatusCode};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

/// Maximum number of redirect hops to follow
pub const MAX_REDIRECTS: u32 = 10;

/// Retry policy for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Base delay between retries (exponential backoff)
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Calculates the delay for a given retry attempt
    ///
    /// Uses exponential backoff: delay = base_delay * 2^attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt)
    }

    /// Checks whether an outcome is worth retrying
    ///
    /// 5xx responses, timeouts and connection errors retry; 4xx responses
    /// are permanent.
    pub fn is_retryable(status: Option<StatusCode>, is_timeout: bool, is_connect: bool) -> bool {
        if is_timeout || is_connect {
            return true;
        }

        if let Some(status) = status {
            if status.is_server_error() {
                return true;
            }
            if status.is_client_error() {
                return false;
            }
        }

        false
    }
}

/// Result of a fetch operation
///
/// Always produced, even for failures; `error` carries the description when
/// the request never reached a terminal HTTP response. `previous_links` is
/// the link set stored by the last successful run, present regardless of
/// how this fetch went so deletion detection works on errors too.
#[derive(Debug)]
pub struct FetchResult {
    /// The normalized URL this fetch was keyed on
    pub url: Url,

    /// Final URL after following the redirect chain
    pub final_url: Url,

    /// The URL to advertise as a mention source: the last canonical URL
    /// seen along the chain, falling back to `final_url`
    pub canonical_url: Url,

    /// Terminal HTTP status; None when no response was received
    pub status: Option<u16>,

    /// Content-Type header of the terminal response
    pub content_type: Option<String>,

    /// Decoded body; reused from the cache on a 304
    pub body: Option<String>,

    /// `Link:` header values from the terminal response (or the cached
    /// copy's, on a 304 that did not repeat them)
    pub link_headers: Vec<String>,

    /// True when the body was served from the cache via a 304
    pub served_from_cache: bool,

    /// Link set stored by the previous successful fetch of this URL
    pub previous_links: BTreeSet<String>,

    /// Description of a network-level failure, if any
    pub error: Option<String>,
}

impl FetchResult {
    fn failed(url: Url, previous: Option<&CacheRecord>, message: String) -> Self {
        Self {
            final_url: url.clone(),
            canonical_url: url.clone(),
            url,
            status: None,
            content_type: None,
            body: None,
            link_headers: Vec::new(),
            served_from_cache: false,
            previous_links: previous.map(|p| p.links.clone()).unwrap_or_default(),
            error: Some(message),
        }
    }

    /// True for a usable response: 2xx or a cache hit
    pub fn is_success(&self) -> bool {
        self.served_from_cache
            || matches!(self.status, Some(status) if (200..300).contains(&status))
    }

    /// True when the resource reports itself deleted (HTTP 410)
    pub fn is_gone(&self) -> bool {
        self.status == Some(410)
    }

    /// True when callers should attempt to parse the body
    ///
    /// Non-HTML/XML/JSON content types short-circuit; a missing
    /// Content-Type gets the benefit of the doubt.
    pub fn is_parseable(&self) -> bool {
        match &self.content_type {
            None => true,
            Some(ctype) => {
                let ctype = ctype.to_ascii_lowercase();
                ctype.contains("html") || ctype.contains("xml") || ctype.contains("json")
            }
        }
    }
}

struct RawResponse {
    status: StatusCode,
    final_url: Url,
    canonical: Option<Url>,
    etag: Option<String>,
    last_modified: Option<String>,
    content_type: Option<String>,
    link_headers: Vec<String>,
    body: Option<String>,
}

struct FetchFailure {
    message: String,
    retryable: bool,
}

impl FetchFailure {
    fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "request timeout".to_string()
        } else if err.is_connect() {
            format!("connection error: {err}")
        } else {
            format!("network error: {err}")
        };
        Self {
            message,
            retryable: RetryPolicy::is_retryable(err.status(), err.is_timeout(), err.is_connect()),
        }
    }
}

/// Builds the HTTP client shared by fetches and pings
///
/// Redirects are followed manually so canonical links and loops along the
/// chain can be observed.
pub fn build_http_client(user_agent: &str, timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(timeout)
        .redirect(Policy::none())
        .gzip(true)
        .brotli(true)
        .build()
}

/// HTTP fetcher with conditional-GET caching and per-run dedup
pub struct Fetcher {
    client: Client,
    cache: Arc<CacheStore>,
    limits: Arc<HostLimiter>,
    retry: RetryPolicy,

    /// Per-URL slots serializing concurrent fetches of the same URL; the
    /// first caller does the work, everyone else awaits the shared result.
    /// Slots are kept for the whole run, so a URL is fetched once, period.
    inflight: StdMutex<HashMap<String, Arc<Mutex<Option<Arc<FetchResult>>>>>>,
}

impl Fetcher {
    /// Creates a fetcher over the given client, cache and limits
    pub fn new(client: Client, cache: Arc<CacheStore>, limits: Arc<HostLimiter>) -> Self {
        Self {
            client,
            cache,
            limits,
            retry: RetryPolicy::default(),
            inflight: StdMutex::new(HashMap::new()),
        }
    }

    /// The underlying HTTP client, for POSTs that bypass the cache
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The shared request limiter
    pub fn limits(&self) -> &Arc<HostLimiter> {
        &self.limits
    }

    /// Fetches a normalized URL, memoized per run
    ///
    /// Concurrent calls for the same URL coalesce into one network fetch;
    /// later calls get the same shared result without touching the network.
    pub async fn fetch(&self, url: &Url) -> Arc<FetchResult> {
        let slot = {
            let mut map = self.inflight.lock().expect("fetch dedup map poisoned");
            Arc::clone(
                map.entry(url.as_str().to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(None))),
            )
        };

        let mut guard = slot.lock().await;
        if let Some(result) = guard.as_ref() {
            tracing::trace!("{}: reusing in-run fetch result", url);
            return Arc::clone(result);
        }

        let result = Arc::new(self.fetch_uncached(url).await);
        *guard = Some(Arc::clone(&result));
        result
    }

    async fn fetch_uncached(&self, url: &Url) -> FetchResult {
        let previous = self.cache.get(url).await;

        let mut attempt = 0;
        let outcome = loop {
            let outcome = self.fetch_once(url, previous.as_ref()).await;
            let retryable = match &outcome {
                Ok(raw) => RetryPolicy::is_retryable(Some(raw.status), false, false),
                Err(failure) => failure.retryable,
            };
            if !retryable || attempt >= self.retry.max_retries {
                break outcome;
            }
            let delay = self.retry.delay_for_attempt(attempt);
            tracing::debug!("Retrying {} after {:?}", url, delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        };

        match outcome {
            Err(failure) => {
                tracing::warn!("Could not fetch {}: {}", url, failure.message);
                FetchResult::failed(url.clone(), previous.as_ref(), failure.message)
            }
            Ok(raw) if raw.status == StatusCode::NOT_MODIFIED => {
                self.synthesize_from_cache(url, previous, raw).await
            }
            Ok(raw) if raw.status.is_success() => self.store_fresh(url, previous, raw).await,
            Ok(raw) => {
                // Terminal HTTP error: keep the cached body, but remember we
                // tried so an immediate rerun doesn't hammer the origin.
                self.cache.touch(url).await;
                let canonical = raw.canonical.unwrap_or_else(|| raw.final_url.clone());
                FetchResult {
                    url: url.clone(),
                    final_url: raw.final_url,
                    canonical_url: canonical,
                    status: Some(raw.status.as_u16()),
                    content_type: raw.content_type,
                    body: None,
                    link_headers: raw.link_headers,
                    served_from_cache: false,
                    previous_links: previous.map(|p| p.links).unwrap_or_default(),
                    error: None,
                }
            }
        }
    }

    async fn synthesize_from_cache(
        &self,
        url: &Url,
        previous: Option<CacheRecord>,
        raw: RawResponse,
    ) -> FetchResult {
        let Some(prev) = previous else {
            // A 304 with nothing cached means our validators were stale
            // guesses; there is nothing to reuse.
            return FetchResult::failed(
                url.clone(),
                None,
                "got 304 but no cached copy exists".to_string(),
            );
        };

        self.cache.touch(url).await;

        let final_url = Url::parse(&prev.final_url).unwrap_or_else(|_| url.clone());
        let canonical = raw.canonical.unwrap_or_else(|| final_url.clone());
        let link_headers = if raw.link_headers.is_empty() {
            prev.link_headers.clone()
        } else {
            raw.link_headers
        };

        FetchResult {
            url: url.clone(),
            final_url,
            canonical_url: canonical,
            status: Some(prev.status),
            content_type: prev.content_type.clone(),
            body: prev.body.clone(),
            link_headers,
            served_from_cache: true,
            previous_links: prev.links,
            error: None,
        }
    }

    async fn store_fresh(
        &self,
        url: &Url,
        previous: Option<CacheRecord>,
        raw: RawResponse,
    ) -> FetchResult {
        let previous_links = previous.map(|p| p.links).unwrap_or_default();
        let canonical = raw.canonical.unwrap_or_else(|| raw.final_url.clone());

        let mut record = CacheRecord::new(raw.status.as_u16(), raw.final_url.to_string());
        record.etag = raw.etag;
        record.last_modified = raw.last_modified;
        record.content_type = raw.content_type.clone();
        record.body = raw.body.clone();
        record.link_headers = raw.link_headers.clone();
        // Carried forward until the caller derives a fresh set.
        record.links = previous_links.clone();
        self.cache.put(url, &record).await;

        FetchResult {
            url: url.clone(),
            final_url: raw.final_url,
            canonical_url: canonical,
            status: Some(raw.status.as_u16()),
            content_type: raw.content_type,
            body: raw.body,
            link_headers: raw.link_headers,
            served_from_cache: false,
            previous_links,
            error: None,
        }
    }

    /// One attempt: chase redirects to a terminal response
    async fn fetch_once(
        &self,
        url: &Url,
        previous: Option<&CacheRecord>,
    ) -> Result<RawResponse, FetchFailure> {
        let conditional = previous.filter(|p| p.body.is_some());
        let mut current = url.clone();
        let mut canonical: Option<Url> = None;
        let mut visited: HashSet<String> = HashSet::new();

        for _ in 0..=MAX_REDIRECTS {
            if !visited.insert(current.to_string()) {
                return Err(FetchFailure::permanent(format!(
                    "redirect loop detected at {current}"
                )));
            }

            let Some(host) = extract_host(&current) else {
                return Err(FetchFailure::permanent(format!("no host in {current}")));
            };

            let mut request = self.client.get(current.clone());
            if let Some(prev) = conditional {
                if let Some(etag) = &prev.etag {
                    request = request.header(IF_NONE_MATCH, etag);
                }
                if let Some(last_modified) = &prev.last_modified {
                    request = request.header(IF_MODIFIED_SINCE, last_modified);
                }
            }

            let _permit = self.limits.acquire(&host).await;
            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => return Err(FetchFailure::from_reqwest(&err)),
            };

            let status = response.status();
            let link_headers: Vec<String> = response
                .headers()
                .get_all(LINK)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .map(String::from)
                .collect();

            // A canonical declared anywhere along the chain rewrites the
            // URL we will advertise, not the URL we request.
            let parsed_links = parse_link_headers(&link_headers);
            if let Some(link) = find_rel(&parsed_links, "canonical") {
                if let Ok(resolved) = current.join(&link.target) {
                    canonical = Some(resolved);
                }
            }

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok());
                let Some(location) = location else {
                    return Err(FetchFailure::permanent(
                        "redirect response without Location header",
                    ));
                };
                let mut next = current.join(location).map_err(|err| {
                    FetchFailure::permanent(format!("invalid redirect URL {location}: {err}"))
                })?;
                next.set_fragment(None);
                tracing::debug!("Following redirect from {} to {}", current, next);
                current = next;
                continue;
            }

            let etag = header_string(&response, ETAG);
            let last_modified = header_string(&response, LAST_MODIFIED);
            let content_type = header_string(&response, CONTENT_TYPE);

            let body = if status == StatusCode::NOT_MODIFIED || !status.is_success() {
                None
            } else {
                match response.text().await {
                    Ok(text) => Some(text),
                    Err(err) => return Err(FetchFailure::from_reqwest(&err)),
                }
            };

            return Ok(RawResponse {
                status,
                final_url: current,
                canonical,
                etag,
                last_modified,
                content_type,
                link_headers,
                body,
            });
        }

        Err(FetchFailure::permanent(format!(
            "too many redirects (max {MAX_REDIRECTS})"
        )))
    }
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}
