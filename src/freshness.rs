//! Decides whether a cached [`Resource`] can be served as-is, must be
//! revalidated, or can't be used at all, for a given request.

use std::time::{Duration, SystemTime};

use crate::cache_control::CacheControl;
use crate::resource::Resource;

/// The outcome of evaluating a cached [`Resource`] against a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Serve the cached response without contacting the origin.
    Fresh,
    /// The response may not be matching at all, or requires refresh
    /// first; either way send a (possibly conditional) request upstream.
    Stale,
    /// Send a conditional request; a 304 keeps the cached body.
    MustRevalidate,
    /// The response must not be reused at all (`no-store`, or `private`
    /// under a shared cache).
    Uncacheable,
}

/// `request_cache_control` carries any `Cache-Control` directives sent by
/// the *current* request (e.g. `no-cache`, `max-age=0`), which can force
/// revalidation independent of the cached response's own freshness.
pub fn evaluate(
    resource: &Resource,
    request_cache_control: &CacheControl,
    shared: bool,
    now: SystemTime,
) -> Decision {
    let response_cc = resource_cache_control(resource);

    if response_cc.contains_key("no-store") || (shared && response_cc.contains_key("private")) {
        return Decision::Uncacheable;
    }

    if resource.is_stale() || response_cc.contains_key("no-cache") {
        return Decision::MustRevalidate;
    }

    if request_cache_control.contains_key("no-cache") {
        return Decision::MustRevalidate;
    }
    if matches!(request_cache_control.duration("max-age"), Some(Ok(d)) if d.is_zero()) {
        return Decision::MustRevalidate;
    }

    let age_secs = match resource.age(now) {
        Ok(age) => age.as_secs() as i64,
        Err(_) => return Decision::MustRevalidate,
    };

    // The lifetime is `MaxAge(shared)`, falling back to the heuristic only
    // when `MaxAge` is exactly zero (no directive and no `Expires` at all) —
    // a *negative* `MaxAge` (an `Expires` already in the past) means
    // immediate staleness, not "fall back to heuristic".
    let lifetime = match resource.max_age(shared, now) {
        Ok(0) => resource.heuristic_freshness(now).as_secs() as i64,
        Ok(n) => n,
        Err(_) => return Decision::MustRevalidate,
    };

    if age_secs < lifetime {
        return Decision::Fresh;
    }

    if resource.must_validate(shared) {
        return Decision::MustRevalidate;
    }

    Decision::Stale
}

/// Status codes this cache will store a response under, independent of
/// any `Cache-Control` directive: everything else is passed through but
/// never persisted.
const CACHEABLE_STATUSES: &[u16] = &[200, 203, 300, 301, 404, 410];

/// Whether a freshly fetched `Resource` may be written to the store at
/// all. Distinct from [`evaluate`], which only judges an *already stored*
/// entry's continued usability.
pub fn is_storable(method: &http::Method, resource: &Resource, shared: bool) -> bool {
    if !matches!(*method, http::Method::GET | http::Method::HEAD) {
        return false;
    }
    if !CACHEABLE_STATUSES.contains(&resource.status().as_u16()) {
        return false;
    }
    let cc = resource_cache_control(resource);
    if cc.contains_key("no-store") {
        return false;
    }
    if shared && cc.contains_key("private") {
        return false;
    }
    true
}

/// Whether a stale or unreachable-for-refresh cached `Resource` may still
/// be served, per its own `stale-if-error` grace period: permitted only
/// while `age < lifetime + stale_if_error`. Absent the directive, an
/// upstream failure is never papered over with a stale response.
pub fn may_serve_stale_on_error(resource: &Resource, shared: bool, now: SystemTime) -> bool {
    let Some(grace) = resource.stale_if_error() else {
        return false;
    };
    let Ok(age) = resource.age(now) else {
        return false;
    };
    let lifetime = match resource.max_age(shared, now) {
        Ok(n) if n > 0 => Duration::from_secs(n as u64),
        Ok(_) => resource.heuristic_freshness(now),
        Err(_) => return false,
    };
    age < lifetime + grace
}

fn resource_cache_control(resource: &Resource) -> CacheControl {
    CacheControl::parse_all(
        resource
            .header()
            .get_all(http::header::CACHE_CONTROL)
            .iter()
            .filter_map(|v| v.to_str().ok()),
    )
    .unwrap_or_default()
}
