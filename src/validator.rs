//! Builds conditional revalidation requests and merges a `304 Not
//! Modified` response back into a cached [`Resource`].

use std::time::SystemTime;

use http::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use http::{HeaderMap, HeaderValue};

use crate::resource::Resource;

/// Headers that must never survive a copy from one hop to the next.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Adds `If-None-Match` (from a cached `ETag`) and/or `If-Modified-Since`
/// (from a cached `Last-Modified`) to `headers`, which should already be a
/// clone of the outbound request's headers.
pub fn add_validators(headers: &mut HeaderMap, cached: &Resource) {
    if let Some(etag) = cached.header().get(ETAG) {
        headers.insert(IF_NONE_MATCH, etag.clone());
    } else if let Some(last_modified) = cached.header().get(LAST_MODIFIED) {
        headers.insert(IF_MODIFIED_SINCE, last_modified.clone());
    }
}

/// Merges a `304 Not Modified` response into the cached `Resource`,
/// producing the `Resource` to serve: `(cached_headers ∪ new_headers) \
/// hop-by-hop`, keeping the cached status and body, with `response_time`
/// reset to `now`.
pub fn merge_not_modified(cached: &Resource, revalidation_headers: &HeaderMap, now: SystemTime) -> Resource {
    let mut merged = cached.header().clone();
    for (name, value) in revalidation_headers {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        merged.insert(name.clone(), value.clone());
    }
    for hop in HOP_BY_HOP_HEADERS {
        merged.remove(*hop);
    }

    Resource::new(
        cached.status(),
        merged,
        cached.body().clone(),
        now,
        now,
    )
}

/// Strips hop-by-hop headers from a header map being relayed across a hop.
pub fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    headers
}

/// Adds a `Warning` header (RFC 7234 §5.5), e.g. `111 - "Revalidation
/// Failed"` when falling back to a stale cached response after a failed
/// refresh attempt.
pub fn with_warning(mut headers: HeaderMap, code: u16, text: &str) -> HeaderMap {
    if let Ok(value) = HeaderValue::from_str(&format!("{code} - \"{text}\"")) {
        headers.insert(http::header::WARNING, value);
    }
    headers
}

pub fn with_via(mut headers: HeaderMap) -> HeaderMap {
    let existing = headers
        .get(http::header::VIA)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let via = match existing {
        Some(existing) if !existing.is_empty() => format!("{existing}, {}", crate::resource::VIA_PSEUDONYM),
        _ => crate::resource::VIA_PSEUDONYM.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&via) {
        headers.insert(http::header::VIA, value);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Body;
    use http::StatusCode;

    #[test]
    fn prefers_etag_over_last_modified() {
        let mut header = HeaderMap::new();
        header.insert(ETAG, HeaderValue::from_static("\"v1\""));
        header.insert(LAST_MODIFIED, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        let now = SystemTime::now();
        let cached = Resource::new(StatusCode::OK, header, Body::Empty, now, now);

        let mut outgoing = HeaderMap::new();
        add_validators(&mut outgoing, &cached);
        assert_eq!(outgoing.get(IF_NONE_MATCH).unwrap(), "\"v1\"");
        assert!(!outgoing.contains_key(IF_MODIFIED_SINCE));
    }

    #[test]
    fn merge_not_modified_keeps_body_and_drops_hop_by_hop() {
        let mut cached_headers = HeaderMap::new();
        cached_headers.insert(ETAG, HeaderValue::from_static("\"v1\""));
        let now = SystemTime::now();
        let cached = Resource::new(StatusCode::OK, cached_headers, Body::Bytes(bytes::Bytes::from_static(b"hello")), now, now);

        let mut revalidation = HeaderMap::new();
        revalidation.insert(ETAG, HeaderValue::from_static("\"v1\""));
        revalidation.insert(http::header::CONNECTION, HeaderValue::from_static("close"));

        let merged = merge_not_modified(&cached, &revalidation, now);
        assert_eq!(merged.status(), StatusCode::OK);
        assert!(!merged.header().contains_key(http::header::CONNECTION));
        match merged.body() {
            Body::Bytes(b) => assert_eq!(&b[..], b"hello"),
            _ => panic!("expected bytes body"),
        }
    }
}
