//! HTTP `Link:` response header parsing
//!
//! Enough of RFC 8288 for this crate's needs: split a header value into
//! entries, pull out the target and the `rel` parameter, and look entries
//! up by rel token. Parameters other than `rel` are kept but unused.

/// One `<target>; param=value; ...` entry from a `Link:` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHeader {
    /// The URI reference between the angle brackets; may be empty
    pub target: String,

    /// Parameters, lowercased names, quotes stripped from values
    pub params: Vec<(String, String)>,
}

impl LinkHeader {
    /// The `rel` parameter value, if present
    pub fn rel(&self) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| name == "rel")
            .map(|(_, value)| value.as_str())
    }

    /// True when `rel` contains the given token (case-insensitive)
    ///
    /// `rel` is a whitespace-separated token list, so `rel="webmention
    /// http://webmention.org/"` matches `webmention`.
    pub fn has_rel(&self, token: &str) -> bool {
        self.rel()
            .map(|rel| {
                rel.split_ascii_whitespace()
                    .any(|t| t.eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }
}

/// Parses a set of `Link:` header values into entries
///
/// Malformed entries are skipped rather than failing the whole header.
pub fn parse_link_headers(values: &[String]) -> Vec<LinkHeader> {
    values
        .iter()
        .flat_map(|value| split_entries(value))
        .filter_map(|entry| parse_entry(&entry))
        .collect()
}

/// Finds the first entry whose rel contains the given token
pub fn find_rel<'a>(links: &'a [LinkHeader], token: &str) -> Option<&'a LinkHeader> {
    links.iter().find(|link| link.has_rel(token))
}

/// Splits a header value on top-level commas
///
/// Commas inside `<...>` targets or quoted parameter values do not split.
fn split_entries(value: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_angle = false;
    let mut in_quote = false;

    for ch in value.chars() {
        match ch {
            '<' if !in_quote => {
                in_angle = true;
                current.push(ch);
            }
            '>' if !in_quote => {
                in_angle = false;
                current.push(ch);
            }
            '"' if !in_angle => {
                in_quote = !in_quote;
                current.push(ch);
            }
            ',' if !in_angle && !in_quote => {
                entries.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        entries.push(current);
    }
    entries
}

fn parse_entry(entry: &str) -> Option<LinkHeader> {
    let entry = entry.trim();
    let rest = entry.strip_prefix('<')?;
    let (target, rest) = rest.split_once('>')?;

    let mut params = Vec::new();
    for part in rest.split(';').skip_while(|p| p.trim().is_empty()) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, value) = match part.split_once('=') {
            Some((name, value)) => (name, value),
            None => (part, ""),
        };
        let value = value.trim().trim_matches('"');
        params.push((name.trim().to_ascii_lowercase(), value.to_string()));
    }

    Some(LinkHeader {
        target: target.trim().to_string(),
        params,
    })
}
