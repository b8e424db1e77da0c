use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use url::Url;

use repocache::clock::system_clock;
use repocache::{CacheHandler, Config, FsStore, MirrorSet, ReqwestUpstreamClient};

mod logging;

/// A caching HTTP reverse proxy for Debian, Ubuntu, and CentOS package
/// repositories.
#[derive(Parser)]
#[command(author, version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "REPOCACHE_LISTEN", default_value = "127.0.0.1:3142")]
    listen: SocketAddr,

    /// Directory the cache store lives in.
    #[arg(long, env = "REPOCACHE_CACHE_DIR", default_value = "./cache")]
    cache_dir: PathBuf,

    /// Base URL for Debian requests.
    #[arg(long, env = "REPOCACHE_DEBIAN_MIRROR")]
    debian_mirror: Option<Url>,

    /// Base URL for Ubuntu requests.
    #[arg(long, env = "REPOCACHE_UBUNTU_MIRROR")]
    ubuntu_mirror: Option<Url>,

    /// Default base URL for CentOS requests. Accepts a shorthand alias
    /// like `cn:tsinghua`; [`MirrorSet`] also exposes this as a runtime-
    /// mutable override for embedders that want to repoint it without a
    /// restart.
    #[arg(long, env = "REPOCACHE_CENTOS_MIRROR")]
    centos_mirror: Option<Url>,

    /// Seconds to wait when connecting to an upstream mirror.
    #[arg(long, env = "REPOCACHE_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    connect_timeout_secs: u64,

    /// Seconds to wait for a full response from an upstream mirror.
    #[arg(long, env = "REPOCACHE_READ_TIMEOUT_SECS", default_value_t = 300)]
    read_timeout_secs: u64,

    /// Use verbose (debug-level) logging.
    #[arg(global = true, long, short)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        let mut config = Config::default()
            .listen(self.listen)
            .cache_dir(self.cache_dir)
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .read_timeout(Duration::from_secs(self.read_timeout_secs));
        if let Some(mirror) = self.debian_mirror {
            config = config.debian_mirror(mirror);
        }
        if let Some(mirror) = self.ubuntu_mirror {
            config = config.ubuntu_mirror(mirror);
        }
        if let Some(mirror) = self.centos_mirror {
            config = config.centos_mirror(mirror);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::setup_logging(cli.verbose)?;
    let config = cli.into_config();

    let store = Arc::new(FsStore::open(&config.cache_dir).context("opening cache store")?);
    let upstream = Arc::new(
        ReqwestUpstreamClient::new(config.connect_timeout, config.read_timeout, config.spool_dir())
            .context("building upstream client")?,
    );
    let mirrors = Arc::new(MirrorSet::new(
        config.debian_mirror.clone(),
        config.ubuntu_mirror.clone(),
        config.centos_mirror.clone(),
    ));
    let handler = Arc::new(CacheHandler::new(store, upstream, mirrors, system_clock()));

    repocache::server::serve(config.listen, handler)
        .await
        .context("serving requests")?;

    Ok(())
}
