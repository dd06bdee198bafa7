//! The local object pool: a flat directory holding one file per
//! materialized CAS object, named by its lower-hex digest.
//!
//! Scratch files (`tmp_<digest>` for downloads, `_bundle` for the bundler)
//! live inside the pool directory itself, so installing an object is always
//! a same-filesystem `rename` and therefore atomic.

use std::io;
use std::path::{Path, PathBuf};

use tonic::async_trait;
use tracing::instrument;

use crate::CasDigest;

/// Prefix for in-flight download scratch files. Never treated as a valid
/// object; leaked scratch after a crash is garbage, not corruption.
pub const TMP_PREFIX: &str = "tmp_";

/// Scratch name used by the bundler while filling a container.
pub const BUNDLE_SCRATCH: &str = "_bundle";

/// Something that can produce a readable file positioned on an object body.
///
/// The pool itself is the trivial, local-only implementation. The store
/// layer wraps it with a fetching resolver exposing the same interface, and
/// the filesystem adapter is generic over which one it gets.
#[async_trait]
pub trait ObjectService: Send + Sync {
    /// Open the object for `digest`. `zstd` tells fetching implementations
    /// that the remote copy is a Zstandard frame; pooled bodies are always
    /// the logical bytes.
    async fn open_object(&self, digest: &CasDigest, zstd: bool) -> io::Result<tokio::fs::File>;
}

#[derive(Clone, Debug)]
pub struct ObjectPool {
    path: PathBuf,
}

impl ObjectPool {
    /// Opens (creating if needed) the pool at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        std::fs::create_dir_all(path.as_ref())?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final resting place of the object for `digest`.
    pub fn object_path(&self, digest: &CasDigest) -> PathBuf {
        self.path.join(digest.to_string())
    }

    /// Download scratch path for `digest`.
    pub fn tmp_path(&self, digest: &CasDigest) -> PathBuf {
        self.path.join(format!("{}{}", TMP_PREFIX, digest))
    }

    /// Scratch path used while a bundle container is being filled.
    pub fn bundle_scratch_path(&self) -> PathBuf {
        self.path.join(BUNDLE_SCRATCH)
    }

    pub async fn has(&self, digest: &CasDigest) -> io::Result<bool> {
        tokio::fs::try_exists(self.object_path(digest)).await
    }

    /// Opens the object if present, `None` on a pool miss.
    pub async fn open_read(&self, digest: &CasDigest) -> io::Result<Option<tokio::fs::File>> {
        match tokio::fs::File::open(self.object_path(digest)).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Atomically installs `src`, a fully written scratch file inside the
    /// pool, as the object for `digest`.
    pub async fn install(&self, src: &Path, digest: &CasDigest) -> io::Result<()> {
        tokio::fs::rename(src, self.object_path(digest)).await
    }

    /// Hashes `src` and hardlinks it into the pool unless an object with
    /// that digest is already present. Returns the digest either way.
    #[instrument(skip(self), err)]
    pub fn stash_file(&self, src: &Path) -> io::Result<CasDigest> {
        let digest = CasDigest::from_file(src)?;
        match std::fs::hard_link(src, self.object_path(&digest)) {
            Ok(()) => Ok(digest),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(digest),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ObjectService for ObjectPool {
    async fn open_object(&self, digest: &CasDigest, _zstd: bool) -> io::Result<tokio::fs::File> {
        self.open_read(digest).await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("object {} not in pool", digest),
            )
        })
    }
}
