//! The top-level cache state machine: look up a cached [`Resource`],
//! decide what [`freshness::evaluate`] says to do about it, and either
//! serve it, revalidate it, or fetch a fresh copy from upstream — folding
//! concurrent misses for the same fingerprint into a single upstream
//! fetch.

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::broadcast;

use crate::cache_control::CacheControl;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::fingerprint::{self, Fingerprint};
use crate::freshness::{self, Decision};
use crate::mirror::{Distro, MirrorSet};
use crate::resource::{Body, Resource};
use crate::store::Store;
use crate::upstream::UpstreamClient;
use crate::validator;

/// Whether this cache instance is acting as a shared (multi-client) cache
/// or a private one. A reverse proxy serving many `apt`/`yum` clients is
/// always shared.
const SHARED_CACHE: bool = true;

/// A resource plus the provenance the caller needs to log or report, e.g.
/// whether it came straight from the cache or required a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Hit,
    Revalidated,
    Miss,
    /// A refresh attempt failed (upstream error or 5xx) and a cached
    /// entry's `stale-if-error` grace period permitted serving it anyway.
    StaleOnError,
}

/// Coordinates cache lookups, revalidation, and single-flight origin
/// fetches for one fingerprint space.
/// What a single-flight leader hands its followers: the fetched resource,
/// or the error that fetching/storing it produced, stringified since
/// [`Error`] doesn't implement `Clone`.
type FetchOutcome = Arc<std::result::Result<Resource, String>>;

pub struct CacheHandler<S, U> {
    store: Arc<S>,
    upstream: Arc<U>,
    mirrors: Arc<MirrorSet>,
    clock: Arc<dyn Clock>,
    in_flight: DashMap<Fingerprint, broadcast::Sender<FetchOutcome>>,
}

impl<S, U> CacheHandler<S, U>
where
    S: Store + 'static,
    U: UpstreamClient + 'static,
{
    pub fn new(store: Arc<S>, upstream: Arc<U>, mirrors: Arc<MirrorSet>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            upstream,
            mirrors,
            clock,
            in_flight: DashMap::new(),
        }
    }

    /// Serves one request: method, request path (used both for mirror
    /// rewriting and as the cache key), and the request's own
    /// `Cache-Control` header value, if any.
    #[tracing::instrument(skip(self, request_headers), fields(path))]
    pub async fn handle(
        &self,
        method: Method,
        path: &str,
        request_headers: &HeaderMap,
    ) -> Result<(Outcome, Resource)> {
        let Some(distro) = Distro::from_path(path) else {
            return Err(Error::InvariantViolation(format!("no known distro for path {path}")));
        };
        let upstream_url = self
            .mirrors
            .rewrite(distro, path)
            .ok_or_else(|| Error::InvariantViolation(format!("could not rewrite path {path}")))?;

        let uri: http::Uri = path.parse().map_err(|e: http::uri::InvalidUri| {
            Error::parse("request path", e.to_string())
        })?;
        let base_key = Fingerprint::new(&method, &uri, request_headers, &[]);
        let (key, cached) = self.lookup(base_key, &method, &uri, request_headers).await?;

        let request_cc = request_cache_control(request_headers);
        let now = self.clock.now();

        if let Some(cached) = cached {
            match freshness::evaluate(&cached, &request_cc, SHARED_CACHE, now) {
                Decision::Fresh => {
                    tracing::debug!(%key, "cache hit");
                    return Ok((Outcome::Hit, cached));
                }
                Decision::Uncacheable | Decision::Stale => {
                    match self
                        .fetch_single_flight(base_key, &method, &uri, &upstream_url, request_headers, &HeaderMap::new())
                        .await
                    {
                        Ok(fresh) if fresh.status().is_server_error() => {
                            if freshness::may_serve_stale_on_error(&cached, SHARED_CACHE, now) {
                                return Ok((Outcome::StaleOnError, serve_stale_on_error(cached)));
                            }
                            return Ok((Outcome::Miss, fresh));
                        }
                        Ok(fresh) => return Ok((Outcome::Miss, fresh)),
                        Err(err) => {
                            if freshness::may_serve_stale_on_error(&cached, SHARED_CACHE, now) {
                                return Ok((Outcome::StaleOnError, serve_stale_on_error(cached)));
                            }
                            return Err(err);
                        }
                    }
                }
                Decision::MustRevalidate => {
                    let mut conditional = HeaderMap::new();
                    validator::add_validators(&mut conditional, &cached);
                    match self
                        .fetch_single_flight(base_key, &method, &uri, &upstream_url, request_headers, &conditional)
                        .await
                    {
                        Ok(revalidated) if revalidated.status() == StatusCode::NOT_MODIFIED => {
                            let merged = validator::merge_not_modified(&cached, revalidated.header(), now);
                            self.store.put(key, &merged).await?;
                            return Ok((Outcome::Revalidated, merged));
                        }
                        Ok(revalidated) if revalidated.status().is_server_error() => {
                            if freshness::may_serve_stale_on_error(&cached, SHARED_CACHE, now) {
                                return Ok((Outcome::StaleOnError, serve_stale_on_error(cached)));
                            }
                            return Ok((Outcome::Miss, revalidated));
                        }
                        Ok(revalidated) => return Ok((Outcome::Miss, revalidated)),
                        Err(err) => {
                            if freshness::may_serve_stale_on_error(&cached, SHARED_CACHE, now) {
                                return Ok((Outcome::StaleOnError, serve_stale_on_error(cached)));
                            }
                            return Err(err);
                        }
                    }
                }
            }
        }

        tracing::debug!(%base_key, "cache miss");
        let fresh = self
            .fetch_single_flight(base_key, &method, &uri, &upstream_url, request_headers, &HeaderMap::new())
            .await?;
        Ok((Outcome::Miss, fresh))
    }

    /// Resolves a request down to the key its cached entry (if any) actually
    /// lives under. `base_key` ignores `Vary` entirely; if what's stored
    /// there is a pointer naming a `Vary` header, this does a second lookup
    /// at the variant key derived from the current request's values for
    /// those headers. Returns that resolved key either way, so a miss still
    /// tells the caller where a freshly fetched variant belongs.
    async fn lookup(
        &self,
        base_key: Fingerprint,
        method: &Method,
        uri: &http::Uri,
        request_headers: &HeaderMap,
    ) -> Result<(Fingerprint, Option<Resource>)> {
        let Some(pointer) = self.store.get(base_key).await? else {
            return Ok((base_key, None));
        };
        let Some(vary) = pointer.header().get(http::header::VARY).and_then(|v| v.to_str().ok()) else {
            return Ok((base_key, Some(pointer)));
        };
        let names = fingerprint::vary_names(vary);
        let variant_key = Fingerprint::new(method, uri, request_headers, &names);
        let variant = self.store.get(variant_key).await?;
        Ok((variant_key, variant))
    }

    /// Fetches from upstream, folding concurrent requests for the same
    /// fingerprint into a single fetch: the first caller becomes the
    /// leader and does the real work; everyone else waits on a broadcast
    /// and gets a clone of the same outcome. The leader's result is handed
    /// back (and broadcast to followers) as soon as the upstream response's
    /// headers arrive — the body, if any, is a live, still-filling
    /// [`Body::Live`] that each subscriber streams independently. Storing
    /// the finished body happens separately, in the background, once it's
    /// fully downloaded.
    async fn fetch_single_flight(
        &self,
        base_key: Fingerprint,
        method: &Method,
        uri: &http::Uri,
        url: &url::Url,
        request_headers: &HeaderMap,
        conditional_headers: &HeaderMap,
    ) -> Result<Resource> {
        let mut leader_tx = None;
        let mut receiver = match self.in_flight.entry(base_key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().subscribe(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, rx) = broadcast::channel(1);
                entry.insert(tx.clone());
                leader_tx = Some(tx);
                rx
            }
        };

        if let Some(tx) = leader_tx {
            let result = self.upstream.fetch(method, url, conditional_headers).await;
            if let Ok(resource) = &result {
                self.spawn_persist(base_key, method.clone(), uri.clone(), request_headers.clone(), resource.clone());
            }
            self.in_flight.remove(&base_key);
            let broadcastable: FetchOutcome = Arc::new(result.as_ref().map(Resource::clone).map_err(ToString::to_string));
            let _ = tx.send(broadcastable);
            return result;
        }

        match receiver.recv().await {
            Ok(outcome) => match outcome.as_ref() {
                Ok(resource) => Ok(resource.clone()),
                Err(message) => Err(Error::InvariantViolation(message.clone())),
            },
            Err(_) => Err(Error::InvariantViolation(format!(
                "single-flight leader for {base_key} vanished without a result"
            ))),
        }
    }

    /// Spawns a background task that waits for `resource`'s body (if it's
    /// still downloading) to finish, then persists it — at the variant key
    /// derived from its own `Vary` header plus a pointer at `base_key`, or
    /// directly at `base_key` if it doesn't vary. Runs independent of the
    /// caller returning the resource to its client, so a slow disk write
    /// never holds up the response.
    fn spawn_persist(
        &self,
        base_key: Fingerprint,
        method: Method,
        uri: http::Uri,
        request_headers: HeaderMap,
        resource: Resource,
    ) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(err) = persist_fetched(store, base_key, &method, &uri, &request_headers, resource).await {
                tracing::warn!(%base_key, %err, "failed to persist fetched resource");
            }
        });
    }
}

/// Awaits a freshly fetched resource's body to completion (a no-op for
/// bodies that were never streaming), checks whether it's storable at all,
/// and writes it to the store — splitting it into a variant entry plus a
/// `Vary`-carrying pointer at `base_key` if its response varies.
async fn persist_fetched<S: Store>(
    store: Arc<S>,
    base_key: Fingerprint,
    method: &Method,
    uri: &http::Uri,
    request_headers: &HeaderMap,
    resource: Resource,
) -> Result<()> {
    if resource.status() == StatusCode::NOT_MODIFIED {
        return Ok(());
    }
    if let Body::Live(live) = resource.body() {
        if let Err(message) = live.completion().await {
            return Err(Error::InvariantViolation(message));
        }
    }
    if !freshness::is_storable(method, &resource, SHARED_CACHE) {
        return Ok(());
    }

    match resource.header().get(http::header::VARY).and_then(|v| v.to_str().ok()) {
        Some(vary) if !vary.is_empty() => {
            let names = fingerprint::vary_names(vary);
            let variant_key = Fingerprint::new(method, uri, request_headers, &names);
            store.put(variant_key, &resource).await?;
            store.put(base_key, &vary_pointer(&resource, vary)).await?;
        }
        _ => {
            store.put(base_key, &resource).await?;
        }
    }
    Ok(())
}

/// A minimal resource carrying only the `Vary` header, stored at a
/// request's `Vary`-agnostic base key so lookups know which headers to
/// re-derive a variant key from.
fn vary_pointer(resource: &Resource, vary: &str) -> Resource {
    let mut header = HeaderMap::new();
    if let Ok(value) = http::HeaderValue::from_str(vary) {
        header.insert(http::header::VARY, value);
    }
    Resource::new(resource.status(), header, Body::Empty, resource.request_time(), resource.response_time())
}

/// Marks a cached `Resource` as served past its freshness lifetime because
/// a refresh attempt failed and `stale-if-error` permitted the fallback.
fn serve_stale_on_error(cached: Resource) -> Resource {
    let header = validator::with_warning(cached.header().clone(), 111, "Revalidation Failed");
    cached.with_header(header)
}

fn request_cache_control(headers: &HeaderMap) -> CacheControl {
    CacheControl::parse_all(
        headers
            .get_all(http::header::CACHE_CONTROL)
            .iter()
            .filter_map(|v| v.to_str().ok()),
    )
    .unwrap_or_default()
}
