//! End-to-end fan-out tests
//!
//! These drive the engine against wiremock servers through the full task
//! graph: feed fetch, entry fetch, endpoint discovery, and the outbound
//! POSTs, including rerun behavior against a populated cache.

use pushl::cache::CacheStore;
use pushl::config::ProcessingConfig;
use pushl::{normalize_url, Engine};
use std::sync::Arc;
use url::Url;
use wiremock::matchers::{body_string, body_string_contains, header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Percent-encodes a URL the way a form body carries it
fn form_encode(url: &str) -> String {
    url.replace(':', "%3A").replace('/', "%2F")
}

fn html_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/html")
}

fn atom_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "application/atom+xml")
}

fn atom_feed(feed_url: &str, hub_url: Option<&str>, item_urls: &[&str]) -> String {
    let hub_link = hub_url
        .map(|hub| format!(r#"<link rel="hub" href="{hub}"/>"#))
        .unwrap_or_default();
    let entries: String = item_urls
        .iter()
        .enumerate()
        .map(|(i, item)| {
            format!(
                r#"<entry>
                     <id>urn:test:{i}</id>
                     <title>Post {i}</title>
                     <updated>2025-01-01T00:00:00Z</updated>
                     <link rel="alternate" href="{item}"/>
                   </entry>"#
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Test feed</title>
  <id>urn:test:feed</id>
  <updated>2025-01-01T00:00:00Z</updated>
  <link rel="self" href="{feed_url}"/>
  {hub_link}
  {entries}
</feed>"#
    )
}

async fn run(config: ProcessingConfig, feeds: &[String], entries: &[String]) -> Arc<Engine> {
    let feeds: Vec<Url> = feeds.iter().map(|u| normalize_url(u).unwrap()).collect();
    let entries: Vec<Url> = entries.iter().map(|u| normalize_url(u).unwrap()).collect();

    let engine = Engine::new(config).expect("engine builds");
    engine.seed(&feeds, &[], &entries);
    engine.registry().await_quiescent().await;
    engine
}

async fn run_websub_only(config: ProcessingConfig, websub_only: &[String]) -> Arc<Engine> {
    let websub_only: Vec<Url> = websub_only.iter().map(|u| normalize_url(u).unwrap()).collect();

    let engine = Engine::new(config).expect("engine builds");
    engine.seed(&[], &websub_only, &[]);
    engine.registry().await_quiescent().await;
    engine
}

/// Scenario: a feed with a hub and one entry linking to an external page
/// with a webmention endpoint produces exactly one WebSub POST and one
/// Webmention POST with the right bodies.
#[tokio::test]
async fn test_feed_fanout_pings_hub_and_mentions_target() {
    let site = MockServer::start().await;
    let hub = MockServer::start().await;
    let target = MockServer::start().await;

    let feed_url = format!("{}/feed.xml", site.uri());
    let post_url = format!("{}/post1", site.uri());
    let target_url = format!("{}/page", target.uri());

    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(atom_response(atom_feed(
            &feed_url,
            Some(&format!("{}/", hub.uri())),
            &[&post_url],
        )))
        .mount(&site)
        .await;

    Mock::given(method("GET"))
        .and(path("/post1"))
        .respond_with(html_response(format!(
            r#"<html><body><div class="h-entry">
               <a href="{target_url}">an external page</a>
               </div></body></html>"#
        )))
        .mount(&site)
        .await;

    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(html_response(
            r#"<html><head><link rel="webmention" href="/wm"></head>
               <body>target</body></html>"#
                .to_string(),
        ))
        .mount(&target)
        .await;

    Mock::given(method("POST"))
        .and(path("/wm"))
        .and(body_string(format!(
            "source={}&target={}",
            form_encode(&post_url),
            form_encode(&target_url)
        )))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&target)
        .await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_string(format!(
            "hub.mode=publish&hub.url={}",
            form_encode(&feed_url)
        )))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&hub)
        .await;

    let engine = run(ProcessingConfig::default(), &[feed_url], &[]).await;
    assert_eq!(engine.registry().failures(), 0);
}

/// Scenario: rerunning against unchanged content with a populated cache
/// produces zero POSTs, and every fetch is conditional.
#[tokio::test]
async fn test_rerun_with_cache_is_quiet() {
    let site = MockServer::start().await;
    let hub = MockServer::start().await;
    let target = MockServer::start().await;
    let cache_dir = tempfile::tempdir().unwrap();

    let feed_url = format!("{}/feed.xml", site.uri());
    let post_url = format!("{}/post1", site.uri());
    let target_url = format!("{}/page", target.uri());

    // First run: everything fresh, with validators.
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            atom_response(atom_feed(
                &feed_url,
                Some(&format!("{}/", hub.uri())),
                &[&post_url],
            ))
            .insert_header("etag", "\"feed-v1\""),
        )
        .mount(&site)
        .await;
    Mock::given(method("GET"))
        .and(path("/post1"))
        .respond_with(
            html_response(format!(
                r#"<div class="h-entry"><a href="{target_url}">link</a></div>"#
            ))
            .insert_header("etag", "\"post-v1\""),
        )
        .mount(&site)
        .await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(
            html_response(
                r#"<link rel="webmention" href="/wm"><body>target</body>"#.to_string(),
            )
            .insert_header("etag", "\"page-v1\""),
        )
        .mount(&target)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&target)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&hub)
        .await;

    let config = ProcessingConfig {
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..Default::default()
    };
    let engine = run(config.clone(), &[feed_url.clone()], &[]).await;
    assert_eq!(engine.registry().failures(), 0);

    // Second run: conditional requests get 304s, nothing is posted.
    site.reset().await;
    hub.reset().await;
    target.reset().await;

    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .and(header("if-none-match", "\"feed-v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&site)
        .await;
    Mock::given(method("GET"))
        .and(path("/post1"))
        .and(header("if-none-match", "\"post-v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&site)
        .await;
    // Any non-conditional GET or any POST anywhere is a failure.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&site)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&target)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .expect(0)
        .mount(&target)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&hub)
        .await;

    let engine = run(config, &[feed_url], &[]).await;
    assert_eq!(engine.registry().failures(), 0);
}

/// Scenario: an entry drops one link and gains another between runs. The
/// removed target still gets a mention (deletion notice), the new target
/// gets endpoint discovery, and the stored link set ends up as the new one.
#[tokio::test]
async fn test_link_diff_mentions_removed_and_added_targets() {
    let site = MockServer::start().await;
    let target_b = MockServer::start().await;
    let target_c = MockServer::start().await;
    let cache_dir = tempfile::tempdir().unwrap();

    let feed_url = format!("{}/feed.xml", site.uri());
    let post_url = format!("{}/post1", site.uri());
    let b_url = format!("{}/page", target_b.uri());
    let c_url = format!("{}/page", target_c.uri());

    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            atom_response(atom_feed(&feed_url, None, &[&post_url]))
                .insert_header("etag", "\"feed-v1\""),
        )
        .mount(&site)
        .await;
    Mock::given(method("GET"))
        .and(path("/post1"))
        .respond_with(
            html_response(format!(
                r#"<div class="h-entry"><a href="{b_url}">b</a></div>"#
            ))
            .insert_header("etag", "\"post-v1\""),
        )
        .mount(&site)
        .await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(
            html_response(
                r#"<link rel="webmention" href="/wm"><body>b</body>"#.to_string(),
            )
            .insert_header("etag", "\"b-v1\""),
        )
        .mount(&target_b)
        .await;
    Mock::given(method("POST"))
        .and(path("/wm"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&target_b)
        .await;

    let config = ProcessingConfig {
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..Default::default()
    };
    let engine = run(config.clone(), &[feed_url.clone()], &[]).await;
    assert_eq!(engine.registry().failures(), 0);
    site.verify().await;
    target_b.verify().await;

    // Second run: the entry now links c instead of b.
    site.reset().await;
    target_b.reset().await;

    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .and(header("if-none-match", "\"feed-v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&site)
        .await;
    Mock::given(method("GET"))
        .and(path("/post1"))
        .respond_with(
            html_response(format!(
                r#"<div class="h-entry"><a href="{c_url}">c</a></div>"#
            ))
            .insert_header("etag", "\"post-v2\""),
        )
        .mount(&site)
        .await;
    // Deletion notice for the dropped target; its page serves a 304 and the
    // endpoint comes out of the cache.
    Mock::given(method("GET"))
        .and(path("/page"))
        .and(header("if-none-match", "\"b-v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&target_b)
        .await;
    Mock::given(method("POST"))
        .and(path("/wm"))
        .and(body_string_contains(format!("target={}", form_encode(&b_url))))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&target_b)
        .await;
    // The new target has no endpoint: it gets fetched, nothing gets posted.
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(html_response("<body>no endpoint here</body>".to_string()))
        .expect(1)
        .mount(&target_c)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .expect(0)
        .mount(&target_c)
        .await;

    let engine = run(config.clone(), &[feed_url], &[]).await;
    assert_eq!(engine.registry().failures(), 0);

    // The stored link set is now exactly the new one.
    let store = CacheStore::new(config.cache_dir.clone());
    let record = store
        .get(&normalize_url(&post_url).unwrap())
        .await
        .expect("entry record exists");
    assert!(record.links.contains(&c_url));
    assert!(!record.links.contains(&b_url));
    assert_eq!(record.links.len(), 1);
}

/// Scenario: an entry declaring a canonical URL advertises the canonical
/// as the webmention source.
#[tokio::test]
async fn test_canonical_url_becomes_mention_source() {
    let site = MockServer::start().await;
    let target = MockServer::start().await;

    let post_url = format!("{}/post", site.uri());
    let target_url = format!("{}/page", target.uri());

    Mock::given(method("GET"))
        .and(path("/post"))
        .respond_with(html_response(format!(
            r#"<html><head><link rel="canonical" href="https://canonical.example/post"></head>
               <body><div class="h-entry"><a href="{target_url}">link</a></div></body></html>"#
        )))
        .mount(&site)
        .await;

    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(html_response(
            r#"<link rel="webmention" href="/wm">"#.to_string(),
        ))
        .mount(&target)
        .await;

    Mock::given(method("POST"))
        .and(path("/wm"))
        .and(body_string(format!(
            "source={}&target={}",
            form_encode("https://canonical.example/post"),
            form_encode(&target_url)
        )))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&target)
        .await;

    let engine = run(ProcessingConfig::default(), &[], &[post_url]).await;
    assert_eq!(engine.registry().failures(), 0);
}

/// Scenario: with recursion enabled, a feed autodiscovered on an entry of
/// an already-seen host is processed and its hub pinged too.
#[tokio::test]
async fn test_recurse_processes_autodiscovered_feed() {
    let site = MockServer::start().await;
    let hub = MockServer::start().await;

    let feed_url = format!("{}/feed.xml", site.uri());
    let post_url = format!("{}/post1", site.uri());
    let cat_feed_url = format!("{}/cat/feed.xml", site.uri());

    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(atom_response(atom_feed(&feed_url, None, &[&post_url])))
        .mount(&site)
        .await;

    Mock::given(method("GET"))
        .and(path("/post1"))
        .respond_with(html_response(format!(
            r#"<html><head>
               <link rel="alternate" type="application/atom+xml" href="{cat_feed_url}">
               </head><body><div class="h-entry">no links</div></body></html>"#
        )))
        .mount(&site)
        .await;

    Mock::given(method("GET"))
        .and(path("/cat/feed.xml"))
        .respond_with(atom_response(atom_feed(
            &cat_feed_url,
            Some(&format!("{}/", hub.uri())),
            &[],
        )))
        .expect(1)
        .mount(&site)
        .await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_string_contains(format!(
            "hub.url={}",
            form_encode(&cat_feed_url)
        )))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&hub)
        .await;

    let config = ProcessingConfig {
        recurse: true,
        ..Default::default()
    };
    let engine = run(config, &[feed_url], &[]).await;
    assert_eq!(engine.registry().failures(), 0);
}

/// Scenario: wayback mode requests archival of every linked target.
#[tokio::test]
async fn test_wayback_saves_every_target() {
    let site = MockServer::start().await;
    let target = MockServer::start().await;
    let wayback = MockServer::start().await;

    let post_url = format!("{}/post", site.uri());
    let one_url = format!("{}/one", target.uri());
    let two_url = format!("{}/two", target.uri());

    Mock::given(method("GET"))
        .and(path("/post"))
        .respond_with(html_response(format!(
            r#"<div class="h-entry">
               <a href="{one_url}">one</a>
               <a href="{two_url}">two</a>
               </div>"#
        )))
        .mount(&site)
        .await;

    // Neither target advertises an endpoint; discovery happens, no POSTs.
    Mock::given(method("GET"))
        .and(path("/one"))
        .respond_with(html_response("<body>one</body>".to_string()))
        .expect(1)
        .mount(&target)
        .await;
    Mock::given(method("GET"))
        .and(path("/two"))
        .respond_with(html_response("<body>two</body>".to_string()))
        .expect(1)
        .mount(&target)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .expect(0)
        .mount(&target)
        .await;

    Mock::given(method("GET"))
        .and(path_regex("^/save/.*"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&wayback)
        .await;

    let config = ProcessingConfig {
        wayback: true,
        wayback_endpoint: format!("{}/save/", wayback.uri()),
        ..Default::default()
    };
    let engine = run(config, &[], &[post_url]).await;
    assert_eq!(engine.registry().failures(), 0);
}

/// A websub-only seed pings its hub but never produces webmentions for its
/// entries.
#[tokio::test]
async fn test_websub_only_suppresses_mentions() {
    let site = MockServer::start().await;
    let hub = MockServer::start().await;

    let feed_url = format!("{}/feed.xml", site.uri());
    let post_url = format!("{}/post1", site.uri());

    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(atom_response(atom_feed(
            &feed_url,
            Some(&format!("{}/", hub.uri())),
            &[&post_url],
        )))
        .mount(&site)
        .await;

    // Entries of a websub-only feed are not even fetched.
    Mock::given(method("GET"))
        .and(path("/post1"))
        .respond_with(html_response("<body>post</body>".to_string()))
        .expect(0)
        .mount(&site)
        .await;

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&hub)
        .await;

    let config = ProcessingConfig {
        websub_only: vec![normalize_url(&feed_url).unwrap().to_string()],
        ..Default::default()
    };
    let engine = run_websub_only(config, &[feed_url]).await;
    assert_eq!(engine.registry().failures(), 0);
}

/// A target linked from several entries is fetched exactly once per run.
#[tokio::test]
async fn test_shared_target_fetched_once() {
    let site = MockServer::start().await;
    let target = MockServer::start().await;

    let feed_url = format!("{}/feed.xml", site.uri());
    let post1_url = format!("{}/post1", site.uri());
    let post2_url = format!("{}/post2", site.uri());
    let target_url = format!("{}/page", target.uri());

    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(atom_response(atom_feed(
            &feed_url,
            None,
            &[&post1_url, &post2_url],
        )))
        .mount(&site)
        .await;
    for post_path in ["/post1", "/post2"] {
        Mock::given(method("GET"))
            .and(path(post_path))
            .respond_with(html_response(format!(
                r#"<div class="h-entry"><a href="{target_url}">shared</a></div>"#
            )))
            .mount(&site)
            .await;
    }

    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(html_response(
            r#"<link rel="webmention" href="/wm">"#.to_string(),
        ))
        .expect(1)
        .mount(&target)
        .await;

    // Two distinct (source, target) pairs, so two mentions.
    Mock::given(method("POST"))
        .and(path("/wm"))
        .respond_with(ResponseTemplate::new(202))
        .expect(2)
        .mount(&target)
        .await;

    let engine = run(ProcessingConfig::default(), &[feed_url], &[]).await;
    assert_eq!(engine.registry().failures(), 0);
}

/// A 410 from a previously-cached entry sends deletion notices for the
/// links it used to contain.
#[tokio::test]
async fn test_gone_entry_notifies_previous_targets() {
    let site = MockServer::start().await;
    let target = MockServer::start().await;
    let cache_dir = tempfile::tempdir().unwrap();

    let post_url = format!("{}/post", site.uri());
    let target_url = format!("{}/page", target.uri());

    Mock::given(method("GET"))
        .and(path("/post"))
        .respond_with(
            html_response(format!(
                r#"<div class="h-entry"><a href="{target_url}">link</a></div>"#
            ))
            .insert_header("etag", "\"post-v1\""),
        )
        .mount(&site)
        .await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(html_response(
            r#"<link rel="webmention" href="/wm">"#.to_string(),
        ))
        .mount(&target)
        .await;
    Mock::given(method("POST"))
        .and(path("/wm"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&target)
        .await;

    let config = ProcessingConfig {
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..Default::default()
    };
    let engine = run(config.clone(), &[], &[post_url.clone()]).await;
    assert_eq!(engine.registry().failures(), 0);
    site.verify().await;
    target.verify().await;

    // The entry is deleted; its old target hears about it.
    site.reset().await;
    target.reset().await;

    Mock::given(method("GET"))
        .and(path("/post"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&site)
        .await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(html_response(
            r#"<link rel="webmention" href="/wm">"#.to_string(),
        ))
        .mount(&target)
        .await;
    Mock::given(method("POST"))
        .and(path("/wm"))
        .and(body_string_contains(format!(
            "target={}",
            form_encode(&target_url)
        )))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&target)
        .await;

    let engine = run(config.clone(), &[], &[post_url.clone()]).await;
    assert_eq!(engine.registry().failures(), 0);

    let store = CacheStore::new(config.cache_dir.clone());
    let record = store
        .get(&normalize_url(&post_url).unwrap())
        .await
        .expect("entry record exists");
    assert!(record.links.is_empty());
}
