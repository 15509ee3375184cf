//! Miscellaneous URL helpers.
use url::Url;

/// Append `name=value` to a URL string without escaping `value`.
///
/// Uses `&` when the URL already carries a query and `?` otherwise.
#[must_use]
pub fn append_raw_query(url: &str, name: &str, value: &str) -> String {
    let separator = if url.contains('?') {
        if url.ends_with('?') || url.ends_with('&') {
            ""
        } else {
            "&"
        }
    } else {
        "?"
    };
    format!("{}{}{}={}", url, separator, name, value)
}

/// Resolve a `Location` header value against the URI that produced it.
///
/// Absolute locations are returned as-is; relative ones are joined onto
/// `base`. Returns `None` unless the result is an `http`/`https` URL, so a
/// `host:port/path` value (which parses with the host as its scheme) is
/// rejected rather than followed.
#[must_use]
pub fn resolve_location(base: &str, location: &str) -> Option<String> {
    let location = location.trim();
    if location.is_empty() {
        return None;
    }
    Url::parse(location)
        .or_else(|_| Url::parse(base).and_then(|b| b.join(location)))
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(|u| u.to_string())
}
