//! Default unique-key derivation
//!
//! Two URLs that differ only in scheme/host casing, default port,
//! fragment or a trailing slash address the same resource for
//! deduplication purposes.

/// Compute the default unique key for a URL
///
/// Normalization: lowercase scheme and host, elide default ports, drop
/// the fragment, strip one trailing slash from non-root paths. A URL that
/// fails to parse is used verbatim (trimmed) so it still deduplicates
/// against an identical seed.
#[must_use]
pub fn compute_unique_key(raw_url: &str) -> String {
    let trimmed = raw_url.trim();
    let Ok(parsed) = url::Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    let scheme = parsed.scheme().to_ascii_lowercase();
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();

    let port = match (parsed.port(), scheme.as_str()) {
        (Some(80), "http") | (Some(443), "https") | (None, _) => String::new(),
        (Some(p), _) => format!(":{p}"),
    };

    let path = match parsed.path() {
        "/" | "" => String::new(),
        p => p.trim_end_matches('/').to_string(),
    };

    let query = parsed
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();

    format!("{scheme}://{host}{port}{path}{query}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_and_default_port_folded() {
        assert_eq!(
            compute_unique_key("HTTP://Example.com:80/path"),
            "http://example.com/path"
        );
    }

    #[test]
    fn test_fragment_dropped_query_kept() {
        assert_eq!(
            compute_unique_key("https://example.com/a?b=1#section"),
            "https://example.com/a?b=1"
        );
    }

    #[test]
    fn test_trailing_slash_insensitive() {
        assert_eq!(
            compute_unique_key("https://example.com/a/"),
            compute_unique_key("https://example.com/a")
        );
    }

    #[test]
    fn test_root_path_elided() {
        assert_eq!(compute_unique_key("https://example.com/"), "https://example.com");
    }

    #[test]
    fn test_non_default_port_kept() {
        assert_eq!(
            compute_unique_key("https://example.com:8443/x"),
            "https://example.com:8443/x"
        );
    }

    #[test]
    fn test_unparseable_url_used_verbatim() {
        assert_eq!(compute_unique_key("  not a url  "), "not a url");
    }
}
