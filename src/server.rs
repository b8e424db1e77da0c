//! The HTTP/1.1 listener: accepts connections, dispatches `GET`/`HEAD`
//! through a [`CacheHandler`], and passes every other method straight
//! through uncached (nothing useful to cache about an upload or a probe).

use std::convert::Infallible;
use std::sync::Arc;

use futures::StreamExt;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::error::Result;
use crate::handler::{CacheHandler, Outcome};
use crate::resource::Resource;
use crate::store::Store;
use crate::upstream::UpstreamClient;
use crate::validator;

type ResponseBody = http_body_util::combinators::BoxBody<Bytes, std::io::Error>;

/// Runs the proxy's HTTP listener until the process is killed. Each
/// accepted connection gets its own `tokio::spawn`'d task; the cache
/// handler itself is shared (and internally synchronized) across all of
/// them.
pub async fn serve<S, U>(listen: std::net::SocketAddr, handler: Arc<CacheHandler<S, U>>) -> Result<()>
where
    S: Store + 'static,
    U: UpstreamClient + 'static,
{
    let listener = TcpListener::bind(listen)
        .await
        .map_err(crate::error::Error::Store)?;
    tracing::info!(%listen, "listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(%err, "failed to accept connection");
                continue;
            }
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(dispatch(handler, req).await) }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(%peer, %err, "connection closed with error");
            }
        });
    }
}

async fn dispatch<S, U>(
    handler: Arc<CacheHandler<S, U>>,
    request: Request<Incoming>,
) -> Response<ResponseBody>
where
    S: Store + 'static,
    U: UpstreamClient + 'static,
{
    let method = request.method().clone();
    if !matches!(method, Method::GET | Method::HEAD) {
        return empty_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let path = request.uri().path().to_owned();
    match handler.handle(method, &path, request.headers()).await {
        Ok((outcome, resource)) => resource_response(outcome, resource).await,
        Err(err) => {
            tracing::warn!(%err, path, "request failed");
            empty_response(err.status())
        }
    }
}

async fn resource_response(outcome: Outcome, resource: Resource) -> Response<ResponseBody> {
    let mut headers = validator::strip_hop_by_hop(resource.header().clone());
    headers = validator::with_via(headers);
    if let Ok(age) = resource.age(std::time::SystemTime::now()) {
        if let Ok(value) = http::HeaderValue::from_str(&age.as_secs().to_string()) {
            headers.insert(http::header::AGE, value);
        }
    }
    if let Some(len) = resource.body().len_hint() {
        if let Ok(value) = http::HeaderValue::from_str(&len.to_string()) {
            headers.insert(http::header::CONTENT_LENGTH, value);
        }
    }

    let mut builder = Response::builder().status(resource.status());
    *builder.headers_mut().expect("builder has no error yet") = headers;
    builder = builder.header("x-repocache-outcome", outcome_label(outcome));

    let body = match resource.body().stream().await {
        Ok(stream) => {
            let frames = stream.map(|chunk| chunk.map(Frame::data));
            StreamBody::new(frames).boxed()
        }
        Err(err) => {
            tracing::warn!(%err, "failed to open cached body for streaming");
            return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    builder.body(body).unwrap_or_else(|_| empty_response(StatusCode::INTERNAL_SERVER_ERROR))
}

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Hit => "hit",
        Outcome::Revalidated => "revalidated",
        Outcome::Miss => "miss",
        Outcome::StaleOnError => "stale-on-error",
    }
}

fn empty_response(status: StatusCode) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .body(
            Full::new(Bytes::new())
                .map_err(|never: Infallible| match never {})
                .boxed(),
        )
        .expect("building an empty response never fails")
}
