//! Runtime configuration: where to listen, where the cache lives on disk,
//! which upstream mirrors to use, and how long to wait on them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

fn default_debian_mirror() -> Url {
    Url::parse("http://deb.debian.org/debian/").expect("valid built-in default")
}

fn default_ubuntu_mirror() -> Url {
    Url::parse("http://archive.ubuntu.com/ubuntu/").expect("valid built-in default")
}

fn default_centos_mirror() -> Url {
    Url::parse("http://mirror.centos.org/centos/").expect("valid built-in default")
}

/// Everything the proxy needs to start serving.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP listener binds to.
    pub listen: SocketAddr,
    /// Root of the on-disk cache store.
    pub cache_dir: PathBuf,
    /// Base URL for Debian requests.
    pub debian_mirror: Url,
    /// Base URL for Ubuntu requests.
    pub ubuntu_mirror: Url,
    /// Default base URL for CentOS requests, used until overridden at runtime.
    pub centos_mirror: Url,
    /// Timeout for establishing a connection to an upstream mirror.
    pub connect_timeout: Duration,
    /// Timeout for reading a full response from an upstream mirror.
    pub read_timeout: Duration,
}

impl Config {
    /// The default configuration.
    ///
    /// | field | value |
    /// | :---: | :--- |
    /// | [`listen`][Self::listen] | `127.0.0.1:3142` |
    /// | [`cache_dir`][Self::cache_dir] | `./cache` |
    /// | [`connect_timeout`][Self::connect_timeout] | 10s |
    /// | [`read_timeout`][Self::read_timeout] | 5 minutes |
    pub fn default() -> Self {
        Self {
            listen: "127.0.0.1:3142".parse().expect("valid built-in default"),
            cache_dir: PathBuf::from("./cache"),
            debian_mirror: default_debian_mirror(),
            ubuntu_mirror: default_ubuntu_mirror(),
            centos_mirror: default_centos_mirror(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn listen(self, listen: SocketAddr) -> Self {
        Self { listen, ..self }
    }

    #[must_use]
    pub fn cache_dir(self, cache_dir: impl Into<PathBuf>) -> Self {
        Self { cache_dir: cache_dir.into(), ..self }
    }

    #[must_use]
    pub fn debian_mirror(self, debian_mirror: Url) -> Self {
        Self { debian_mirror, ..self }
    }

    #[must_use]
    pub fn ubuntu_mirror(self, ubuntu_mirror: Url) -> Self {
        Self { ubuntu_mirror, ..self }
    }

    #[must_use]
    pub fn centos_mirror(self, centos_mirror: Url) -> Self {
        Self { centos_mirror, ..self }
    }

    #[must_use]
    pub fn connect_timeout(self, connect_timeout: Duration) -> Self {
        Self { connect_timeout, ..self }
    }

    #[must_use]
    pub fn read_timeout(self, read_timeout: Duration) -> Self {
        Self { read_timeout, ..self }
    }

    /// Where spooled (in-progress, not-yet-committed) response bodies live,
    /// kept alongside but distinct from the committed cache store.
    pub fn spool_dir(&self) -> PathBuf {
        self.cache_dir.join(".spool")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default()
    }
}
