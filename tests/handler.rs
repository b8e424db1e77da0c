use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use repocache::clock::FixedClock;
use repocache::{Body, CacheHandler, Fingerprint, MirrorSet, Outcome, Resource, Store, UpstreamClient};
use url::Url;

struct MemStore(Mutex<std::collections::HashMap<Fingerprint, Resource>>);

impl MemStore {
    fn new() -> Self {
        Self(Mutex::new(std::collections::HashMap::new()))
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get(&self, key: Fingerprint) -> repocache::Result<Option<Resource>> {
        Ok(self.0.lock().unwrap().get(&key).cloned())
    }
    async fn put(&self, key: Fingerprint, resource: &Resource) -> repocache::Result<()> {
        self.0.lock().unwrap().insert(key, resource.clone());
        Ok(())
    }
    async fn delete(&self, key: Fingerprint) -> repocache::Result<()> {
        self.0.lock().unwrap().remove(&key);
        Ok(())
    }
}

/// An upstream stub that always answers `304 Not Modified` once primed,
/// so revalidation tests don't need a real network.
struct AlwaysNotModified {
    calls: AtomicUsize,
}

#[async_trait]
impl UpstreamClient for AlwaysNotModified {
    async fn fetch(&self, _method: &Method, _url: &Url, _headers: &HeaderMap) -> repocache::Result<Resource> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = SystemTime::now();
        let mut header = HeaderMap::new();
        header.insert(http::header::ETAG, HeaderValue::from_static("\"v1\""));
        Ok(Resource::new(StatusCode::NOT_MODIFIED, header, Body::Empty, now, now))
    }
}

fn mirrors() -> Arc<MirrorSet> {
    Arc::new(MirrorSet::new(
        Url::parse("http://deb.debian.org/debian/").unwrap(),
        Url::parse("http://archive.ubuntu.com/ubuntu/").unwrap(),
        Url::parse("http://mirror.centos.org/centos/").unwrap(),
    ))
}

#[tokio::test]
async fn must_revalidate_entry_serves_the_merged_cached_body_on_304() {
    let store = Arc::new(MemStore::new());
    let now = SystemTime::now();

    let mut header = HeaderMap::new();
    header.insert(http::header::ETAG, HeaderValue::from_static("\"v1\""));
    header.insert(http::header::CACHE_CONTROL, HeaderValue::from_static("s-maxage=0, must-revalidate"));
    let cached = Resource::new(
        StatusCode::OK,
        header,
        Body::Bytes(bytes::Bytes::from_static(b"package contents")),
        now,
        now,
    );
    let key = Fingerprint::new(
        &Method::GET,
        &"/debian/pool/main/foo.deb".parse().unwrap(),
        &HeaderMap::new(),
        &[],
    );
    store.put(key, &cached).await.unwrap();

    let upstream = Arc::new(AlwaysNotModified { calls: AtomicUsize::new(0) });
    let clock = Arc::new(FixedClock(now)) as Arc<dyn repocache::clock::Clock>;
    let handler = CacheHandler::new(store, upstream.clone(), mirrors(), clock);

    let (outcome, resource) = handler
        .handle(Method::GET, "/debian/pool/main/foo.deb", &HeaderMap::new())
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Revalidated);
    assert_eq!(resource.status(), StatusCode::OK);
    match resource.body() {
        Body::Bytes(bytes) => assert_eq!(&bytes[..], b"package contents"),
        other => panic!("expected the original cached bytes, got {other:?}"),
    }
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
}

struct AlwaysServerError;

#[async_trait]
impl UpstreamClient for AlwaysServerError {
    async fn fetch(&self, _method: &Method, _url: &Url, _headers: &HeaderMap) -> repocache::Result<Resource> {
        let now = SystemTime::now();
        Ok(Resource::new(StatusCode::BAD_GATEWAY, HeaderMap::new(), Body::Empty, now, now))
    }
}

#[tokio::test]
async fn stale_if_error_falls_back_to_the_cached_body_on_a_5xx_refresh() {
    let store = Arc::new(MemStore::new());
    let now = SystemTime::now();

    let mut header = HeaderMap::new();
    header.insert(
        http::header::DATE,
        HeaderValue::from_str(&httpdate::fmt_http_date(now - std::time::Duration::from_secs(120))).unwrap(),
    );
    header.insert(
        http::header::CACHE_CONTROL,
        HeaderValue::from_static("max-age=60, stale-if-error=3600"),
    );
    let cached = Resource::new(
        StatusCode::OK,
        header,
        Body::Bytes(bytes::Bytes::from_static(b"package contents")),
        now,
        now,
    );
    let key = Fingerprint::new(
        &Method::GET,
        &"/debian/pool/main/foo.deb".parse().unwrap(),
        &HeaderMap::new(),
        &[],
    );
    store.put(key, &cached).await.unwrap();

    let upstream = Arc::new(AlwaysServerError);
    let clock = Arc::new(FixedClock(now)) as Arc<dyn repocache::clock::Clock>;
    let handler = CacheHandler::new(store, upstream, mirrors(), clock);

    let (outcome, resource) = handler
        .handle(Method::GET, "/debian/pool/main/foo.deb", &HeaderMap::new())
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::StaleOnError);
    assert_eq!(resource.status(), StatusCode::OK);
    assert_eq!(resource.header().get(http::header::WARNING).unwrap(), "111 - \"Revalidation Failed\"");
    match resource.body() {
        Body::Bytes(bytes) => assert_eq!(&bytes[..], b"package contents"),
        other => panic!("expected the original cached bytes, got {other:?}"),
    }
}

#[tokio::test]
async fn a_request_for_an_unconfigured_distro_path_fails_fast() {
    let store = Arc::new(MemStore::new());
    let upstream = Arc::new(AlwaysNotModified { calls: AtomicUsize::new(0) });
    let clock = Arc::new(FixedClock(SystemTime::now())) as Arc<dyn repocache::clock::Clock>;
    let handler = CacheHandler::new(store, upstream, mirrors(), clock);

    let result = handler.handle(Method::GET, "/fedora/pkg.rpm", &HeaderMap::new()).await;
    assert!(result.is_err());
}
