#![warn(missing_docs)]
//! A caching HTTP reverse proxy for OS package repositories — it sits in
//! front of the real Debian, Ubuntu, and CentOS mirrors, and answers
//! repeated `apt`/`yum`/`dnf` requests from its own disk cache whenever
//! [RFC 7234](http://httpwg.org/specs/rfc7234.html) says it's allowed to,
//! revalidating with the origin when it isn't.
//!
//! The freshness math lives on [`resource::Resource`] and is orchestrated
//! by [`freshness::evaluate`]; [`handler::CacheHandler`] wires that
//! together with a [`store::Store`] and an [`upstream::UpstreamClient`]
//! into a single request lifecycle, folding concurrent misses for the
//! same [`fingerprint::Fingerprint`] into one upstream fetch.

pub mod cache_control;
pub mod clock;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod freshness;
pub mod handler;
pub mod mirror;
pub mod resource;
pub mod server;
pub mod store;
pub mod upstream;
pub mod validator;

pub use cache_control::CacheControl;
pub use config::Config;
pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use handler::{CacheHandler, Outcome};
pub use mirror::{Distro, MirrorSet};
pub use resource::{Body, Resource};
pub use store::{FsStore, Store};
pub use upstream::{ReqwestUpstreamClient, UpstreamClient};
