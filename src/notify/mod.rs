//! Outbound notifications: Webmention, WebSub, Wayback
//!
//! Endpoint discovery follows the Webmention discovery order: `Link:`
//! response header first, then the first `<link rel="webmention">`, then
//! the first `<a rel="webmention">`. An empty href is a valid endpoint
//! meaning the target URL itself.
//!
//! POSTs share one retry shape: 2xx is success, 4xx is a permanent
//! rejection, 5xx and network errors retry once with backoff. Wayback
//! saves never retry.

use crate::fetch::link_header::{find_rel, parse_link_headers};
use crate::fetch::{FetchResult, HostLimiter, RetryPolicy};
use crate::url::extract_host;
use crate::{PushlError, Result};
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use url::Url;

/// Wayback Machine save-page-now prefix; the target URL is appended as-is
pub const WAYBACK_SAVE_PREFIX: &str = "https://web.archive.org/save/";

/// Finds the webmention endpoint advertised by a fetched target
///
/// Works identically for live responses and 304-synthesized ones, since
/// the fetch result carries the stored `Link:` headers and body.
pub fn discover_endpoint(target: &FetchResult) -> Option<Url> {
    let links = parse_link_headers(&target.link_headers);
    if let Some(link) = find_rel(&links, "webmention") {
        return resolve_endpoint(&link.target, &target.final_url);
    }

    // Don't go digging for a link tag in a non-markup document.
    let markup = target
        .content_type
        .as_deref()
        .map(|ctype| {
            let ctype = ctype.to_ascii_lowercase();
            ctype.contains("html") || ctype.contains("xml")
        })
        .unwrap_or(false);
    if !markup {
        return None;
    }

    let body = target.body.as_deref()?;
    let document = Html::parse_document(body);
    for selector_str in ["link[rel~=\"webmention\"][href]", "a[rel~=\"webmention\"][href]"] {
        if let Ok(selector) = Selector::parse(selector_str) {
            if let Some(element) = document.select(&selector).next() {
                let href = element.value().attr("href").unwrap_or("");
                return resolve_endpoint(href, &target.final_url);
            }
        }
    }

    None
}

fn resolve_endpoint(href: &str, base: &Url) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() {
        return Some(base.clone());
    }
    base.join(href).ok()
}

/// POSTs `source`/`target` form fields to a webmention endpoint
pub async fn send_webmention(
    client: &Client,
    limits: &HostLimiter,
    endpoint: &Url,
    source: &str,
    target: &str,
) -> Result<()> {
    tracing::debug!("Webmention: notifying {} of {} -> {}", endpoint, source, target);
    post_form(client, limits, endpoint, &[("source", source), ("target", target)]).await?;
    tracing::info!("{}: webmention sent to {} for {}", source, endpoint, target);
    Ok(())
}

/// POSTs a `hub.mode=publish` notification to a WebSub hub
pub async fn send_websub(
    client: &Client,
    limits: &HostLimiter,
    hub: &Url,
    topic: &str,
) -> Result<()> {
    tracing::debug!("WebSub: notifying {} of {}", hub, topic);
    post_form(
        client,
        limits,
        hub,
        &[("hub.mode", "publish"), ("hub.url", topic)],
    )
    .await?;
    tracing::info!("{}: WebSub notification sent to {}", topic, hub);
    Ok(())
}

/// Asks the Wayback Machine to archive a target; 2xx and 3xx both count
/// as accepted, and there is no retry
pub async fn save_wayback(
    client: &Client,
    limits: &HostLimiter,
    save_prefix: &str,
    target: &str,
) -> Result<()> {
    let save_url =
        Url::parse(&format!("{save_prefix}{target}")).map_err(PushlError::UrlParse)?;
    let Some(host) = extract_host(&save_url) else {
        return Err(PushlError::FetchFailed {
            url: save_url.to_string(),
            reason: "no host".to_string(),
        });
    };

    let _permit = limits.acquire(&host).await;
    let response = client
        .get(save_url.clone())
        .send()
        .await
        .map_err(|err| PushlError::PingFailed {
            endpoint: save_url.to_string(),
            reason: err.to_string(),
        })?;

    let status = response.status();
    if status.is_success() || status.is_redirection() {
        tracing::info!("Wayback archival requested for {}", target);
        Ok(())
    } else {
        Err(PushlError::PingFailed {
            endpoint: save_url.to_string(),
            reason: format!("HTTP {status}"),
        })
    }
}

async fn post_form(
    client: &Client,
    limits: &HostLimiter,
    endpoint: &Url,
    form: &[(&str, &str)],
) -> Result<()> {
    let retry = RetryPolicy::default();
    let mut attempt = 0;

    loop {
        match post_form_once(client, limits, endpoint, form).await {
            Ok(status) if status.is_success() => return Ok(()),
            Ok(status) if status.is_client_error() => {
                return Err(PushlError::PingRejected {
                    endpoint: endpoint.to_string(),
                    status: status.as_u16(),
                });
            }
            Ok(status) if status.is_server_error() && attempt < retry.max_retries => {
                tracing::debug!("{} returned {}, retrying", endpoint, status);
            }
            Ok(status) => {
                return Err(PushlError::PingFailed {
                    endpoint: endpoint.to_string(),
                    reason: format!("HTTP {status}"),
                });
            }
            Err(err) if attempt < retry.max_retries => {
                tracing::debug!("POST to {} failed ({}), retrying", endpoint, err);
            }
            Err(err) => {
                return Err(PushlError::PingFailed {
                    endpoint: endpoint.to_string(),
                    reason: err.to_string(),
                });
            }
        }

        tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
        attempt += 1;
    }
}

async fn post_form_once(
    client: &Client,
    limits: &HostLimiter,
    endpoint: &Url,
    form: &[(&str, &str)],
) -> std::result::Result<StatusCode, reqwest::Error> {
    let host = extract_host(endpoint).unwrap_or_default();
    let _permit = limits.acquire(&host).await;
    let response = client.post(endpoint.clone()).form(form).send().await?;
    Ok(response.status())
}
