//! On-disk persistence for cached [`Resource`]s: a small JSON sidecar
//! holding status/headers/timestamps next to a body blob, committed with a
//! temp-file-then-rename so a reader never observes a half-written entry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use fs_err as fs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::resource::{Body, Resource};

/// Where cached entries live and how they're written and read back.
///
/// Implementations must make `put` atomic with respect to concurrent
/// `get`s: a reader must either see the entry before the write or the
/// entry fully after it, never a partial one.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: Fingerprint) -> Result<Option<Resource>>;
    async fn put(&self, key: Fingerprint, resource: &Resource) -> Result<()>;
    async fn delete(&self, key: Fingerprint) -> Result<()>;
}

/// On-disk metadata sidecar, independent of the body's own bytes.
#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    status: u16,
    headers: Vec<(String, String)>,
    request_time: u64,
    response_time: u64,
}

impl Metadata {
    fn from_resource(resource: &Resource) -> Self {
        let headers = resource
            .header()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_owned(), v.to_owned()))
            })
            .collect();
        Self {
            status: resource.status().as_u16(),
            headers,
            request_time: to_unix(resource.request_time()),
            response_time: to_unix(resource.response_time()),
        }
    }
}

fn to_unix(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn from_unix(secs: u64) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_secs(secs)
}

/// A filesystem-backed [`Store`]: one shard directory per fingerprint,
/// holding `meta.json` and `body`.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Opens (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(Error::Store)?;
        let gitignore = root.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, b"*\n").map_err(Error::Store)?;
        }
        Ok(Self { root })
    }

    fn shard_dir(&self, key: Fingerprint) -> PathBuf {
        let hex = key.as_hex();
        self.root.join(&hex[0..2]).join(hex)
    }

    fn meta_path(&self, key: Fingerprint) -> PathBuf {
        self.shard_dir(key).join("meta.json")
    }

    fn body_path(&self, key: Fingerprint) -> PathBuf {
        self.shard_dir(key).join("body")
    }
}

#[async_trait::async_trait]
impl Store for FsStore {
    async fn get(&self, key: Fingerprint) -> Result<Option<Resource>> {
        let meta_path = self.meta_path(key);
        let body_path = self.body_path(key);

        let meta_bytes = match fs::tokio::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::Store(err)),
        };
        let meta: Metadata = serde_json::from_slice(&meta_bytes)
            .map_err(|err| Error::parse("cache metadata", err.to_string()))?;

        let mut header = http::HeaderMap::with_capacity(meta.headers.len());
        for (name, value) in &meta.headers {
            if let (Ok(name), Ok(value)) = (
                http::HeaderName::from_bytes(name.as_bytes()),
                http::HeaderValue::from_str(value),
            ) {
                header.append(name, value);
            }
        }

        let status = http::StatusCode::from_u16(meta.status)
            .map_err(|err| Error::parse("cached status code", err.to_string()))?;

        let body = if body_path.exists() {
            Body::File(Arc::new(body_path))
        } else {
            Body::Empty
        };

        Ok(Some(Resource::new(
            status,
            header,
            body,
            from_unix(meta.request_time),
            from_unix(meta.response_time),
        )))
    }

    async fn put(&self, key: Fingerprint, resource: &Resource) -> Result<()> {
        let shard = self.shard_dir(key);
        fs::tokio::create_dir_all(&shard).await.map_err(Error::Store)?;

        let metadata = Metadata::from_resource(resource);
        let meta_json = serde_json::to_vec(&metadata)
            .map_err(|err| Error::parse("cache metadata", err.to_string()))?;
        write_atomic(&shard, &self.meta_path(key), &meta_json).await?;

        let body_bytes = materialize_body(resource.body()).await?;
        match body_bytes {
            Some(bytes) => write_atomic(&shard, &self.body_path(key), &bytes).await?,
            None => {
                let _ = fs::tokio::remove_file(self.body_path(key)).await;
            }
        }

        Ok(())
    }

    async fn delete(&self, key: Fingerprint) -> Result<()> {
        let shard = self.shard_dir(key);
        match fs::tokio::remove_dir_all(&shard).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Store(err)),
        }
    }
}

/// Reads a body's bytes in full for writing to the store. Callers are
/// expected to only persist a [`Body::Live`] once it's finished (see
/// [`crate::resource::LiveBody::completion`]), at which point its spool
/// file holds the same complete bytes a [`Body::File`] would.
async fn materialize_body(body: &Body) -> Result<Option<Bytes>> {
    match body {
        Body::Empty => Ok(None),
        Body::Bytes(b) => Ok(Some(b.clone())),
        Body::File(path) => {
            let bytes = fs::tokio::read(path.as_path()).await.map_err(Error::Store)?;
            Ok(Some(Bytes::from(bytes)))
        }
        Body::Live(live) => {
            let bytes = fs::tokio::read(live.path()).await.map_err(Error::Store)?;
            Ok(Some(Bytes::from(bytes)))
        }
    }
}

/// Writes `contents` to a sibling temp file inside `dir` and renames it
/// over `target`, so concurrent readers of `target` never see a partial
/// write.
async fn write_atomic(dir: &Path, target: &Path, contents: &[u8]) -> Result<()> {
    let dir = dir.to_path_buf();
    let target = target.to_path_buf();
    let contents = contents.to_vec();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(Error::Store)?;
        use std::io::Write;
        tmp.write_all(&contents).map_err(Error::Store)?;
        tmp.persist(&target).map_err(|err| Error::Store(err.error))?;
        Ok(())
    })
    .await
    .map_err(|join_err| Error::InvariantViolation(join_err.to_string()))?
}
