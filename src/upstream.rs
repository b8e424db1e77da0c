//! The origin-fetching half of the proxy: turns a request path plus any
//! validators into a streamed [`Resource`] fetched from the real mirror.
//!
//! [`UpstreamClient::fetch`] returns as soon as the response's status and
//! headers arrive; for a body-bearing response, the body itself keeps
//! arriving in the background and is tee'd to a spool file through a
//! [`LiveBody`], so the cache handler can start relaying bytes to its own
//! caller (and to the store) without waiting for the whole download.

use std::time::{Duration, SystemTime};

use futures::StreamExt;
use http::{HeaderMap, Method, StatusCode};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::error::{Error, Result};
use crate::resource::{Body, LiveBody, Resource};

/// Fetches a single resource from an upstream origin. Implementations own
/// connection pooling, timeouts, and TLS; the cache handler only needs the
/// resulting [`Resource`].
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn fetch(
        &self,
        method: &Method,
        url: &Url,
        conditional_headers: &HeaderMap,
    ) -> Result<Resource>;
}

/// A [`UpstreamClient`] backed by a pooled [`reqwest::Client`]. Response
/// bodies are spooled to a temp file as they stream in rather than held in
/// memory, since package files can run into the hundreds of megabytes.
pub struct ReqwestUpstreamClient {
    client: reqwest::Client,
    spool_dir: std::path::PathBuf,
}

impl ReqwestUpstreamClient {
    /// `read_timeout` doubles as the overall per-request deadline: reqwest's
    /// `Client::timeout` bounds connect + send + the full response body,
    /// not just an inter-chunk read, so no separate deadline timer is
    /// layered on top.
    pub fn new(
        connect_timeout: Duration,
        read_timeout: Duration,
        spool_dir: impl Into<std::path::PathBuf>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .map_err(Error::Upstream)?;
        let spool_dir = spool_dir.into();
        fs_err::create_dir_all(&spool_dir).map_err(Error::Store)?;
        Ok(Self { client, spool_dir })
    }

    /// Hands back a [`Body::Live`] immediately and spawns a task that
    /// streams the response body into its spool file in the background,
    /// so the caller (and every single-flight follower) can start relaying
    /// bytes as soon as they arrive instead of waiting for the download to
    /// finish.
    fn spawn_live_tee(&self, response: reqwest::Response) -> Result<Body> {
        let tmp = tempfile::NamedTempFile::new_in(&self.spool_dir).map_err(Error::Store)?;
        let path = tmp.path().to_path_buf();
        // Keep the temp file alive under its own path rather than having
        // it deleted when `tmp` drops; the tee task below owns it now.
        let _ = tmp.keep();

        let live = LiveBody::new(path);
        let tee_target = live.clone();
        tokio::spawn(async move { tee_response_body(response, tee_target).await });
        Ok(Body::Live(live))
    }
}

/// Streams `response`'s body into `live`'s spool file, chunk by chunk,
/// bailing out early if every subscriber has gone away. Marks `live`
/// finished on a clean end-of-stream, or failed on any I/O or upstream
/// error (including a cancellation when nobody's left waiting).
async fn tee_response_body(response: reqwest::Response, live: LiveBody) {
    let mut file = match tokio::fs::File::create(live.path()).await {
        Ok(file) => file,
        Err(err) => {
            live.fail(err.to_string());
            return;
        }
    };

    let mut stream = response.bytes_stream();
    loop {
        if live.had_reader() && live.reader_count() == 0 {
            live.fail("upstream fetch aborted: no attached readers remained".to_string());
            return;
        }

        match stream.next().await {
            Some(Ok(chunk)) => {
                if let Err(err) = file.write_all(&chunk).await {
                    live.fail(err.to_string());
                    return;
                }
                live.bump_written(chunk.len() as u64);
            }
            Some(Err(err)) => {
                live.fail(err.to_string());
                return;
            }
            None => {
                if let Err(err) = file.flush().await {
                    live.fail(err.to_string());
                    return;
                }
                live.finish();
                return;
            }
        }
    }
}

#[async_trait::async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    async fn fetch(
        &self,
        method: &Method,
        url: &Url,
        conditional_headers: &HeaderMap,
    ) -> Result<Resource> {
        let request_time = SystemTime::now();

        let mut builder = self.client.request(method.clone(), url.clone());
        for (name, value) in conditional_headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                Error::UpstreamTimeout(err.timeout().unwrap_or_default())
            } else {
                Error::Upstream(err)
            }
        })?;

        let response_time = SystemTime::now();
        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| Error::parse("upstream status code", e.to_string()))?;
        let header = response.headers().clone();

        let body = if status == StatusCode::NOT_MODIFIED || method == Method::HEAD {
            Body::Empty
        } else {
            self.spawn_live_tee(response)?
        };

        Ok(Resource::new(status, header, body, request_time, response_time))
    }
}
