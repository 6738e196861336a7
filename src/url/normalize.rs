use crate::UrlError;
use url::Url;

/// Normalizes a URL for use as a request target and cache/dedup key
///
/// # Normalization Steps
///
/// 1. Parse the URL; reject if malformed
/// 2. Require an http or https scheme and a host
/// 3. Lowercase scheme and host, strip default ports, canonicalize
///    percent-encoding (all handled by the `url` parser)
/// 4. Remove the fragment
///
/// Query parameter order is preserved: reordering a query string can change
/// what a server returns, so two orderings are two different resources.
/// Fragments are dropped here because they never go on the wire; callers
/// that care about fragment-targeted mentions keep the original string.
///
/// Normalization is idempotent: feeding the output back in yields the same
/// URL.
///
/// # Examples
///
/// ```
/// use pushl::normalize_url;
///
/// let url = normalize_url("HTTPS://Example.COM:443/page#section").unwrap();
/// assert_eq!(url.as_str(), "https://example.com/page");
/// ```
pub fn normalize_url(url_str: &str) -> Result<Url, UrlError> {
    let mut url = Url::parse(url_str.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(format!(
            "Only HTTP and HTTPS schemes are supported, got: {}",
            url.scheme()
        )));
    }

    if url.host_str().is_none() {
        return Err(UrlError::MissingHost);
    }

    url.set_fragment(None);

    Ok(url)
}
