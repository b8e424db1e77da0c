use http::{HeaderMap, HeaderValue, Method, StatusCode};
use repocache::{Body, FsStore, Fingerprint, Resource, Store};
use std::time::SystemTime;

#[tokio::test]
async fn put_then_get_round_trips_across_a_fresh_store_handle() {
    let dir = tempfile::tempdir().unwrap();

    let key = Fingerprint::new(
        &Method::GET,
        &"/debian/pool/main/foo.deb".parse().unwrap(),
        &HeaderMap::new(),
        &[],
    );

    {
        let store = FsStore::open(dir.path()).unwrap();
        let mut header = HeaderMap::new();
        header.insert(http::header::ETAG, HeaderValue::from_static("\"abc123\""));
        let now = SystemTime::now();
        let resource = Resource::new(
            StatusCode::OK,
            header,
            Body::Bytes(bytes::Bytes::from_static(b"package contents")),
            now,
            now,
        );
        store.put(key, &resource).await.unwrap();
    }

    // Re-open the store fresh, as a subsequent process restart would.
    let reopened = FsStore::open(dir.path()).unwrap();
    let fetched = reopened.get(key).await.unwrap().expect("entry persisted");
    assert_eq!(fetched.header().get(http::header::ETAG).unwrap(), "\"abc123\"");
}
