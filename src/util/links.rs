use std::net::Ipv4Addr;
use thiserror::Error;
use url::Url;

/// Errors produced while turning feed-supplied strings into absolute URLs.
#[derive(Error, Debug)]
pub enum UrlError {
    /// The string could not be parsed, even relative to a base.
    #[error("Invalid URL: {0}")]
    Invalid(#[from] url::ParseError),
    /// The base URL has no host to rebase onto.
    #[error("URL has no host: {0}")]
    NoHost(String),
}

/// Returns `scheme://host[:port]` for a URL.
///
/// ```
/// use feedrelay::util::root_url;
///
/// assert_eq!(root_url("https://example.com/a/b?c=1").unwrap(), "https://example.com");
/// assert_eq!(root_url("http://example.com:8080/feed").unwrap(), "http://example.com:8080");
/// ```
pub fn root_url(url: &str) -> Result<String, UrlError> {
    let parsed = Url::parse(url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| UrlError::NoHost(url.to_string()))?;
    Ok(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

/// Rebases a possibly-relative link onto the root of `source`.
///
/// Empty links stay empty; `http(s)://` links are returned untouched.
pub fn absolutize(link: &str, source: &str) -> Result<String, UrlError> {
    let link = link.trim();
    if link.is_empty() || has_http_scheme(link) {
        return Ok(link.to_string());
    }
    let root = Url::parse(&root_url(source)?)?;
    Ok(root.join(link)?.to_string())
}

/// Resolves a media reference found inside entry HTML.
///
/// Relative references are joined onto `base` (the entry link when known,
/// otherwise the feed URL). Protocol-relative `//cdn/...` references inherit
/// the base scheme.
pub fn resolve_media(reference: &str, base: &str) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() || reference.starts_with("data:") {
        return None;
    }
    if has_http_scheme(reference) {
        return Some(reference.to_string());
    }
    Url::parse(base)
        .and_then(|b| b.join(reference))
        .ok()
        .map(String::from)
}

/// Ensures a user-supplied feed URL carries an http(s) scheme.
///
/// ```
/// use feedrelay::util::normalize_feed_url;
///
/// assert_eq!(normalize_feed_url("example.com/rss"), "https://example.com/rss");
/// assert_eq!(normalize_feed_url("http://example.com/rss"), "http://example.com/rss");
/// ```
pub fn normalize_feed_url(url: &str) -> String {
    let url = url.trim();
    if has_http_scheme(url) {
        return url.to_string();
    }
    if url.starts_with('/') {
        format!("https:/{}", url)
    } else {
        format!("https://{}", url)
    }
}

/// Accepts `http(s)://...` URLs and bare IPv4 addresses (hub endpoints).
pub fn is_url_or_ip(text: &str) -> bool {
    (has_http_scheme(text) && text.len() > text.find("://").map_or(0, |i| i + 3))
        || text.parse::<Ipv4Addr>().is_ok()
}

fn has_http_scheme(s: &str) -> bool {
    let lower = s.get(..8).unwrap_or(s).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolutize_relative_path() {
        let link = absolutize("/posts/1", "https://blog.example.com/feed.xml").unwrap();
        assert_eq!(link, "https://blog.example.com/posts/1");
    }

    #[test]
    fn test_absolutize_relative_without_slash() {
        let link = absolutize("posts/1", "https://blog.example.com/deep/feed.xml").unwrap();
        assert_eq!(link, "https://blog.example.com/posts/1");
    }

    #[test]
    fn test_absolutize_keeps_absolute_and_empty() {
        assert_eq!(
            absolutize("https://other.example/x", "https://a.example/").unwrap(),
            "https://other.example/x"
        );
        assert_eq!(absolutize("", "https://a.example/").unwrap(), "");
    }

    #[test]
    fn test_absolutize_bad_source() {
        assert!(absolutize("/x", "not a url").is_err());
    }

    #[test]
    fn test_resolve_media() {
        let base = "https://site.example/2024/post.html";
        assert_eq!(
            resolve_media("img/a.png", base).as_deref(),
            Some("https://site.example/2024/img/a.png")
        );
        assert_eq!(
            resolve_media("//cdn.example/b.jpg", base).as_deref(),
            Some("https://cdn.example/b.jpg")
        );
        assert_eq!(resolve_media("data:image/png;base64,AAA", base), None);
        assert_eq!(resolve_media("", base), None);
    }

    #[test]
    fn test_normalize_feed_url_leading_slash() {
        assert_eq!(normalize_feed_url("/example.com/rss"), "https://example.com/rss");
    }

    #[test]
    fn test_is_url_or_ip() {
        assert!(is_url_or_ip("https://rsshub.app"));
        assert!(is_url_or_ip("192.168.1.10"));
        assert!(!is_url_or_ip("https://"));
        assert!(!is_url_or_ip("rsshub.app"));
        assert!(!is_url_or_ip("999.1.1.1"));
    }
}
