//! [`Resource`]: one cached or in-flight HTTP response, plus the freshness
//! math (`Age`, `MaxAge`, heuristic freshness, validators) defined directly
//! on it. Every method that needs "now" takes it as an explicit parameter
//! rather than reading the wall clock itself — see [`crate::clock`].

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use http::header::{AGE, DATE, ETAG, EXPIRES, LAST_MODIFIED};
use http::{HeaderMap, StatusCode};

use crate::cache_control::CacheControl;
use crate::error::Error;

/// The pseudonym this cache appends to outgoing `Via` headers.
pub const VIA_PSEUDONYM: &str = "1.1 httpcache";

/// A seekable, cloneable handle to a response body. Cloning is cheap:
/// `Bytes` is refcounted, `File` holds a shared handle to the same on-disk
/// (or temp-file) bytes, and `Live` holds a shared handle to a body still
/// arriving from upstream. Every variant is reopened fresh for every read
/// so that every reader starts at offset 0 independent of any other
/// reader's position — this is what makes a `Resource` replayable for both
/// revalidation and concurrent fan-out.
#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    Bytes(Bytes),
    File(Arc<PathBuf>),
    /// A body still being written by an in-flight upstream fetch; see
    /// [`LiveBody`].
    Live(LiveBody),
}

impl Body {
    pub fn len_hint(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::File(_) | Body::Live(_) => None,
        }
    }

    /// Opens a fresh, seek-to-zero stream over the body's bytes. For
    /// `Live`, this follows the body as it's written and only ends once
    /// the upstream fetch completes or fails.
    pub async fn stream(&self) -> std::io::Result<BoxStream<'static, std::io::Result<Bytes>>> {
        match self {
            Body::Empty => Ok(futures::stream::empty().boxed()),
            Body::Bytes(b) => {
                let b = b.clone();
                Ok(futures::stream::once(async move { Ok(b) }).boxed())
            }
            Body::File(path) => {
                let file = tokio::fs::File::open(path.as_path()).await?;
                Ok(tokio_util::io::ReaderStream::new(file).boxed())
            }
            Body::Live(live) => Ok(live.stream()),
        }
    }
}

/// A body still arriving from an in-flight upstream fetch. Every chunk is
/// written to a private spool file as it arrives; a subscriber — whether
/// it starts reading before the first byte or joins mid-download — opens
/// that same file from offset zero and blocks for more until the fetch
/// finishes or fails, so every subscriber replays an identical byte
/// sequence regardless of when it attached.
///
/// The producer side (the upstream client) drives [`LiveBody::bump_written`],
/// [`LiveBody::finish`], and [`LiveBody::fail`]; [`LiveBody::reader_count`]
/// lets it tell whether anyone is still waiting on the fetch it's driving.
#[derive(Debug, Clone)]
pub struct LiveBody {
    inner: Arc<LiveBodyInner>,
}

#[derive(Debug)]
struct LiveBodyInner {
    path: PathBuf,
    written: AtomicU64,
    ready: tokio::sync::Notify,
    outcome: OnceLock<std::result::Result<(), String>>,
    readers: AtomicUsize,
    ever_had_reader: std::sync::atomic::AtomicBool,
}

impl LiveBody {
    /// `path` must name a file that already exists (empty) and is
    /// writable by whoever drives `bump_written`.
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(LiveBodyInner {
                path,
                written: AtomicU64::new(0),
                ready: tokio::sync::Notify::new(),
                outcome: OnceLock::new(),
                readers: AtomicUsize::new(0),
                ever_had_reader: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// The spool file backing this body.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Bytes written so far, visible to every subscriber.
    pub fn bytes_written(&self) -> u64 {
        self.inner.written.load(Ordering::Acquire)
    }

    /// Records that `n` more bytes were appended to the spool file and
    /// wakes any subscriber waiting for them.
    pub fn bump_written(&self, n: u64) {
        self.inner.written.fetch_add(n, Ordering::AcqRel);
        self.inner.ready.notify_waiters();
    }

    /// Marks the body complete: every subscriber caught up to the last
    /// byte stops cleanly instead of waiting for more.
    pub fn finish(&self) {
        let _ = self.inner.outcome.set(Ok(()));
        self.inner.ready.notify_waiters();
    }

    /// Marks the body failed: every subscriber still waiting for bytes
    /// surfaces `message` as an I/O error instead of hanging forever.
    pub fn fail(&self, message: String) {
        let _ = self.inner.outcome.set(Err(message));
        self.inner.ready.notify_waiters();
    }

    /// How many live subscribers are currently reading this body. The
    /// producer uses this (together with [`LiveBody::had_reader`]) to
    /// decide whether an in-progress fetch still has anyone waiting on it.
    pub fn reader_count(&self) -> usize {
        self.inner.readers.load(Ordering::SeqCst)
    }

    /// Whether at least one subscriber has ever attached. Guards against
    /// aborting a fetch before its first reader has had a chance to show
    /// up.
    pub fn had_reader(&self) -> bool {
        self.inner.ever_had_reader.load(Ordering::SeqCst)
    }

    /// Waits until the body finishes or fails, without counting as a
    /// reader (doesn't affect `reader_count`/cancellation) — used by the
    /// store-persistence path, which needs the final bytes but isn't a
    /// client the producer should wait on.
    pub async fn completion(&self) -> std::result::Result<(), String> {
        loop {
            let notified = self.inner.ready.notified();
            if let Some(outcome) = self.inner.outcome.get() {
                return outcome.clone();
            }
            notified.await;
        }
    }

    /// Opens a fresh, seek-to-zero, tailing stream over the body.
    pub fn stream(&self) -> BoxStream<'static, std::io::Result<Bytes>> {
        self.inner.readers.fetch_add(1, Ordering::SeqCst);
        self.inner.ever_had_reader.store(true, Ordering::SeqCst);

        let state = LiveReadState {
            body: self.clone(),
            file: None,
            pos: 0,
        };
        let inner = futures::stream::unfold(state, |mut state| async move {
            loop {
                if state.file.is_none() {
                    match tokio::fs::File::open(&state.body.inner.path).await {
                        Ok(file) => state.file = Some(file),
                        Err(err) => return Some((Err(err), state)),
                    }
                }

                let notified = state.body.inner.ready.notified();
                let available = state.body.bytes_written();
                if state.pos < available {
                    use tokio::io::AsyncReadExt;
                    let to_read = ((available - state.pos).min(64 * 1024)) as usize;
                    let mut buf = vec![0u8; to_read];
                    return match state.file.as_mut().unwrap().read_exact(&mut buf).await {
                        Ok(()) => {
                            state.pos += to_read as u64;
                            Some((Ok(Bytes::from(buf)), state))
                        }
                        Err(err) => Some((Err(err), state)),
                    };
                }

                match state.body.inner.outcome.get() {
                    Some(Ok(())) => return None,
                    Some(Err(message)) => {
                        return Some((Err(std::io::Error::other(message.clone())), state));
                    }
                    None => notified.await,
                }
            }
        });
        LiveBodyStream { inner, body: self.clone() }.boxed()
    }
}

struct LiveReadState {
    body: LiveBody,
    file: Option<tokio::fs::File>,
    pos: u64,
}

/// Wraps the tailing [`unfold`][futures::stream::unfold] stream so that
/// dropping it (a client disconnecting mid-download) decrements
/// `reader_count`, letting the producer notice nobody is listening
/// anymore.
struct LiveBodyStream<S> {
    inner: S,
    body: LiveBody,
}

impl<S> Drop for LiveBodyStream<S> {
    fn drop(&mut self) {
        self.body.inner.readers.fetch_sub(1, Ordering::SeqCst);
        self.body.inner.ready.notify_waiters();
    }
}

impl<S: Stream<Item = std::io::Result<Bytes>> + Unpin> Stream for LiveBodyStream<S> {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// One cached or in-flight HTTP response.
#[derive(Debug)]
pub struct Resource {
    status: StatusCode,
    header: HeaderMap,
    body: Body,
    request_time: SystemTime,
    response_time: SystemTime,
    stale: bool,
    cc: OnceLock<CacheControl>,
}

impl Clone for Resource {
    fn clone(&self) -> Self {
        let cc = OnceLock::new();
        if let Some(parsed) = self.cc.get() {
            let _ = cc.set(parsed.clone());
        }
        Self {
            status: self.status,
            header: self.header.clone(),
            body: self.body.clone(),
            request_time: self.request_time,
            response_time: self.response_time,
            stale: self.stale,
            cc,
        }
    }
}

impl Resource {
    /// `response_time` must be `>= request_time`.
    pub fn new(
        status: StatusCode,
        header: HeaderMap,
        body: Body,
        request_time: SystemTime,
        response_time: SystemTime,
    ) -> Self {
        debug_assert!(response_time >= request_time, "response_time < request_time");
        Self {
            status,
            header,
            body,
            request_time,
            response_time,
            stale: false,
            cc: OnceLock::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn header(&self) -> &HeaderMap {
        &self.header
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn request_time(&self) -> SystemTime {
        self.request_time
    }

    pub fn response_time(&self) -> SystemTime {
        self.response_time
    }

    /// `true` iff `200 <= status < 400`.
    pub fn is_non_error_status(&self) -> bool {
        let code = self.status.as_u16();
        (200..400).contains(&code)
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Copy-on-write: returns an updated `Resource` with the stale bit
    /// forced on, leaving `self` (and any other holder's view of it)
    /// untouched.
    #[must_use]
    pub fn mark_stale(mut self) -> Self {
        self.stale = true;
        self
    }

    /// Replaces the header map, invalidating the memoized `cc` (copy-on-write).
    #[must_use]
    pub fn with_header(mut self, header: HeaderMap) -> Self {
        self.header = header;
        self.cc = OnceLock::new();
        self
    }

    fn cache_control(&self) -> &CacheControl {
        self.cc.get_or_init(|| {
            let lines: Vec<&str> = self
                .header
                .get_all(http::header::CACHE_CONTROL)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            CacheControl::parse_all(lines).unwrap_or_else(|err| {
                tracing::debug!(%err, "malformed Cache-Control header, treating as absent");
                CacheControl::default()
            })
        })
    }

    fn header_str(&self, name: http::HeaderName) -> Option<&str> {
        self.header.get(name)?.to_str().ok()
    }

    /// Zero (`UNIX_EPOCH`) if `Last-Modified` is absent or unparseable.
    pub fn last_modified(&self) -> SystemTime {
        self.header_str(LAST_MODIFIED)
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    /// Zero (`UNIX_EPOCH`), `Ok`, if `Expires` is absent.
    pub fn expires(&self) -> Result<SystemTime, Error> {
        match self.header_str(EXPIRES) {
            None => Ok(SystemTime::UNIX_EPOCH),
            Some(v) => httpdate::parse_http_date(v)
                .map_err(|e| Error::parse("Expires", e.to_string())),
        }
    }

    /// `true` iff `Date` parses and is strictly after `t`. An unparseable
    /// or missing `Date` is treated as not-after (conflating "missing"
    /// with "malformed" per the open question in the design notes); we at
    /// least log malformed dates distinctly from absent ones.
    pub fn date_after(&self, t: SystemTime) -> bool {
        match self.header_str(DATE) {
            None => false,
            Some(v) => match httpdate::parse_http_date(v) {
                Ok(date) => date > t,
                Err(_) => {
                    tracing::debug!(date = v, "malformed Date header");
                    false
                }
            },
        }
    }

    fn raw_date(&self) -> Option<SystemTime> {
        self.header_str(DATE).and_then(|v| httpdate::parse_http_date(v).ok())
    }

    /// `Age = (now - origin_time) + declared_age`, where `origin_time` is
    /// `Proxy-Date` if present, else `Date`. Errors if neither is present
    /// and parseable.
    pub fn age(&self, now: SystemTime) -> Result<Duration, Error> {
        let declared = self
            .header_str(AGE)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_default();

        let proxy_date = self
            .header
            .get("proxy-date")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok());

        let origin = proxy_date.or_else(|| self.raw_date());
        let Some(origin) = origin else {
            return Err(Error::parse("Age", "neither Proxy-Date nor Date is present"));
        };

        let resident = now.duration_since(origin).unwrap_or_default();
        Ok(resident + declared)
    }

    /// The applicable freshness lifetime in whole seconds, which may be
    /// *negative* when `Expires` names a time in the past — the caller
    /// (the freshness evaluator) must treat any `lifetime <= 0` as
    /// immediate staleness rather than saturating to zero here.
    pub fn max_age(&self, shared: bool, now: SystemTime) -> Result<i64, Error> {
        let cc = self.cache_control();

        if shared {
            if let Some(d) = cc.duration("s-maxage") {
                let d = d?;
                if d > Duration::ZERO {
                    return Ok(d.as_secs() as i64);
                }
            }
        }

        if let Some(d) = cc.duration("max-age") {
            let d = d?;
            if d > Duration::ZERO {
                return Ok(d.as_secs() as i64);
            }
        }

        if self.header.contains_key(EXPIRES) {
            let expires = self.expires()?;
            let secs = signed_duration_secs(expires, now);
            return Ok(secs);
        }

        Ok(0)
    }

    /// Conservative on parse failure: a broken `Cache-Control` counts as
    /// must-revalidate.
    pub fn must_validate(&self, shared: bool) -> bool {
        let cc = self.cache_control();
        if shared && cc.contains_key("s-maxage") {
            return true;
        }
        if cc.contains_key("must-revalidate") {
            return true;
        }
        if shared && cc.contains_key("proxy-revalidate") {
            return true;
        }
        false
    }

    pub fn has_validators(&self) -> bool {
        self.header.contains_key(LAST_MODIFIED) || self.header.contains_key(ETAG)
    }

    pub fn has_explicit_expiration(&self) -> bool {
        let cc = self.cache_control();
        if matches!(cc.duration("max-age"), Some(Ok(d)) if d > Duration::ZERO) {
            return true;
        }
        if matches!(cc.duration("s-maxage"), Some(Ok(d)) if d > Duration::ZERO) {
            return true;
        }
        matches!(self.expires(), Ok(t) if t != SystemTime::UNIX_EPOCH)
    }

    /// `(now - last_modified) / 10`, or zero if there's an explicit
    /// expiration or no `Last-Modified` to heuristically measure from.
    pub fn heuristic_freshness(&self, now: SystemTime) -> Duration {
        if self.has_explicit_expiration() || !self.header.contains_key(LAST_MODIFIED) {
            return Duration::ZERO;
        }
        let last_modified = self.last_modified();
        now.duration_since(last_modified)
            .unwrap_or_default()
            .checked_div(10)
            .unwrap_or_default()
    }

    /// Copy-on-write: deletes every header named in the `private="..."`
    /// directive's field list.
    #[must_use]
    pub fn remove_private_headers(self) -> Self {
        let cc = self.cache_control();
        let Some(private) = cc.get("private") else {
            return self;
        };
        let mut header = self.header.clone();
        for name in private {
            if let Ok(name) = http::HeaderName::from_bytes(name.as_bytes()) {
                header.remove(name);
            }
        }
        self.with_header(header)
    }

    pub fn via(&self) -> &'static str {
        VIA_PSEUDONYM
    }

    /// The `stale-if-error` directive's grace period, if present and
    /// parseable. A cache may serve this response past its normal
    /// freshness lifetime, up to `lifetime + stale_if_error`, when an
    /// attempt to refresh it fails.
    pub fn stale_if_error(&self) -> Option<Duration> {
        match self.cache_control().duration("stale-if-error") {
            Some(Ok(d)) => Some(d),
            _ => None,
        }
    }
}

/// `expires - now` in whole seconds, allowing a negative result.
fn signed_duration_secs(expires: SystemTime, now: SystemTime) -> i64 {
    match expires.duration_since(now) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CACHE_CONTROL, HeaderValue};
    use std::time::Duration;

    fn resource_with_headers(pairs: &[(http::HeaderName, &str)]) -> Resource {
        let mut header = HeaderMap::new();
        for (name, value) in pairs {
            header.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        let now = SystemTime::now();
        Resource::new(StatusCode::OK, header, Body::Empty, now, now)
    }

    #[test]
    fn is_non_error_status_matches_range() {
        let r = resource_with_headers(&[]);
        assert!(r.is_non_error_status());
    }

    #[test]
    fn s3_max_age_shared_prefers_s_maxage() {
        let r = resource_with_headers(&[(CACHE_CONTROL, "s-maxage=60, max-age=10")]);
        let now = SystemTime::now();
        assert_eq!(r.max_age(true, now).unwrap(), 60);
        assert_eq!(r.max_age(false, now).unwrap(), 10);
    }

    #[test]
    fn s4_age_computation() {
        let now = SystemTime::now();
        let date = now - Duration::from_secs(30);
        let r = resource_with_headers(&[
            (http::header::DATE, &httpdate::fmt_http_date(date)),
            (AGE, "5"),
        ]);
        let age = r.age(now).unwrap();
        assert_eq!(age.as_secs(), 35);
    }

    #[test]
    fn s5_heuristic_freshness() {
        let now = SystemTime::now();
        let last_modified = now - Duration::from_secs(1000);
        let r = resource_with_headers(&[(LAST_MODIFIED, &httpdate::fmt_http_date(last_modified))]);
        let freshness = r.heuristic_freshness(now);
        assert_eq!(freshness.as_secs(), 100);
    }

    #[test]
    fn s6_must_revalidate_via_s_maxage_shared() {
        let r = resource_with_headers(&[(CACHE_CONTROL, "s-maxage=0")]);
        assert!(r.must_validate(true));
    }

    #[test]
    fn heuristic_freshness_zero_with_explicit_expiration() {
        let now = SystemTime::now();
        let last_modified = now - Duration::from_secs(1000);
        let r = resource_with_headers(&[
            (LAST_MODIFIED, &httpdate::fmt_http_date(last_modified)),
            (CACHE_CONTROL, "max-age=5"),
        ]);
        assert_eq!(r.heuristic_freshness(now), Duration::ZERO);
    }

    #[test]
    fn stale_if_error_parses_its_grace_period() {
        let r = resource_with_headers(&[(CACHE_CONTROL, "max-age=60, stale-if-error=86400")]);
        assert_eq!(r.stale_if_error(), Some(Duration::from_secs(86400)));
    }

    #[test]
    fn stale_if_error_absent_by_default() {
        let r = resource_with_headers(&[(CACHE_CONTROL, "max-age=60")]);
        assert_eq!(r.stale_if_error(), None);
    }

    #[test]
    fn negative_max_age_from_past_expires() {
        let now = SystemTime::now();
        let expires = now - Duration::from_secs(10);
        let r = resource_with_headers(&[(EXPIRES, &httpdate::fmt_http_date(expires))]);
        assert!(r.max_age(true, now).unwrap() < 0);
    }

    #[tokio::test]
    async fn live_body_streams_bytes_as_they_arrive_and_a_late_subscriber_still_gets_everything() {
        use tokio::io::AsyncWriteExt;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        let live = LiveBody::new(tmp.path().to_path_buf());

        let early = live.stream();
        let mut file = tokio::fs::File::create(live.path()).await.unwrap();
        file.write_all(b"hello ").await.unwrap();
        live.bump_written(6);

        let late = live.stream();

        file.write_all(b"world").await.unwrap();
        live.bump_written(5);
        live.finish();

        let early_bytes: Vec<u8> = early.map(|chunk| chunk.unwrap().to_vec()).collect::<Vec<_>>().await.concat();
        let late_bytes: Vec<u8> = late.map(|chunk| chunk.unwrap().to_vec()).collect::<Vec<_>>().await.concat();

        assert_eq!(early_bytes, b"hello world");
        assert_eq!(late_bytes, b"hello world");
    }

    #[test]
    fn live_body_reader_count_tracks_attach_and_drop() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let live = LiveBody::new(tmp.path().to_path_buf());
        assert_eq!(live.reader_count(), 0);
        assert!(!live.had_reader());

        let stream = live.stream();
        assert_eq!(live.reader_count(), 1);
        assert!(live.had_reader());

        drop(stream);
        assert_eq!(live.reader_count(), 0);
        assert!(live.had_reader());
    }
}
