//! An opaque key identifying a request for cache lookup: method + canonical
//! URL + the values of any headers nominated by a previously cached
//! response's `Vary`.

use std::hash::{Hash, Hasher};

use http::{HeaderMap, Method, Uri};

/// A stable, opaque identifier for a request. Two requests with an equal
/// fingerprint may share a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Builds a fingerprint from the method, URI, and the subset of
    /// request headers named by `vary_on` (case-insensitive, already
    /// lower-cased).
    pub fn new(method: &Method, uri: &Uri, headers: &HeaderMap, vary_on: &[String]) -> Self {
        let mut hasher = rustc_fnv1a_hasher();
        method.as_str().hash(&mut hasher);
        uri.to_string().hash(&mut hasher);
        for name in vary_on {
            name.hash(&mut hasher);
            if let Ok(header_name) = http::HeaderName::from_bytes(name.as_bytes()) {
                for value in headers.get_all(header_name) {
                    value.as_bytes().hash(&mut hasher);
                }
            }
        }
        Self(hasher.finish())
    }

    pub fn as_hex(self) -> String {
        format!("{:016x}", self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

/// Splits a `Vary` header value into the lower-cased header names it
/// names, e.g. `"Accept-Encoding, Cookie"` -> `["accept-encoding", "cookie"]`.
pub fn vary_names(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// A small non-cryptographic hasher (FNV-1a). Fingerprints are cache keys,
/// not security boundaries, so a fast, dependency-free hash is enough.
fn rustc_fnv1a_hasher() -> impl Hasher {
    struct Fnv1a(u64);
    impl Hasher for Fnv1a {
        fn finish(&self) -> u64 {
            self.0
        }
        fn write(&mut self, bytes: &[u8]) {
            const PRIME: u64 = 0x100000001b3;
            for &b in bytes {
                self.0 ^= u64::from(b);
                self.0 = self.0.wrapping_mul(PRIME);
            }
        }
    }
    Fnv1a(0xcbf29ce484222325)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_requests_fingerprint_equal() {
        let uri: Uri = "/debian/pool/foo.deb".parse().unwrap();
        let a = Fingerprint::new(&Method::GET, &uri, &HeaderMap::new(), &[]);
        let b = Fingerprint::new(&Method::GET, &uri, &HeaderMap::new(), &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_methods_fingerprint_differently() {
        let uri: Uri = "/debian/pool/foo.deb".parse().unwrap();
        let get = Fingerprint::new(&Method::GET, &uri, &HeaderMap::new(), &[]);
        let head = Fingerprint::new(&Method::HEAD, &uri, &HeaderMap::new(), &[]);
        assert_ne!(get, head);
    }

    #[test]
    fn vary_header_participates_in_fingerprint() {
        let uri: Uri = "/debian/pool/foo.deb".parse().unwrap();
        let mut with_gzip = HeaderMap::new();
        with_gzip.insert(http::header::ACCEPT_ENCODING, "gzip".parse().unwrap());
        let mut with_br = HeaderMap::new();
        with_br.insert(http::header::ACCEPT_ENCODING, "br".parse().unwrap());

        let vary = vec!["accept-encoding".to_string()];
        let a = Fingerprint::new(&Method::GET, &uri, &with_gzip, &vary);
        let b = Fingerprint::new(&Method::GET, &uri, &with_br, &vary);
        assert_ne!(a, b);
    }

    #[test]
    fn vary_names_splits_and_normalizes() {
        assert_eq!(
            vary_names("Accept-Encoding,  Cookie"),
            vec!["accept-encoding".to_string(), "cookie".to_string()]
        );
        assert_eq!(vary_names("*"), vec!["*".to_string()]);
        assert_eq!(vary_names(""), Vec::<String>::new());
    }
}
