use thiserror::Error;

/// Errors surfaced by the cache engine and its collaborators.
///
/// Every variant maps to an HTTP status via [`Error::status`] so the
/// listener can turn a failed request into a short, user-visible response
/// instead of propagating a panic.
#[derive(Debug, Error)]
pub enum Error {
    /// A `Cache-Control` directive or an HTTP date failed to parse.
    ///
    /// Callers treat the affected directive as absent; `MustValidate`
    /// treats a parse error as `true` (conservative).
    #[error("failed to parse {what}: {message}")]
    Parse { what: &'static str, message: String },

    /// The on-disk store failed to read or write an entry.
    ///
    /// Non-fatal on read (falls through to a cache miss); on write, the
    /// commit is aborted but the client response is still served.
    #[error("cache store error: {0}")]
    Store(#[source] std::io::Error),

    /// The upstream mirror could not be reached, or responded with an
    /// error status during a fetch or revalidation.
    #[error("upstream request failed: {0}")]
    Upstream(#[source] reqwest::Error),

    /// The upstream request exceeded its configured deadline.
    #[error("upstream request timed out after {0:?}")]
    UpstreamTimeout(std::time::Duration),

    /// A value that should be impossible given the crate's own invariants
    /// (e.g. a negative `Age`, an out-of-range status code reaching a
    /// place that assumed it had already been validated).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl Error {
    pub fn parse(what: &'static str, message: impl Into<String>) -> Self {
        Self::Parse {
            what,
            message: message.into(),
        }
    }

    /// The HTTP status that should be returned to the client for this
    /// error. A cache engine error is always reported as a status code
    /// with a short body; the process never panics on a request-scoped
    /// error.
    pub fn status(&self) -> http::StatusCode {
        match self {
            Error::Parse { .. } => http::StatusCode::BAD_GATEWAY,
            Error::Store(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
            Error::Upstream(_) | Error::UpstreamTimeout(_) => http::StatusCode::BAD_GATEWAY,
            Error::InvariantViolation(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
