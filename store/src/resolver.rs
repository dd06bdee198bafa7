//! Lazy content resolution: pool first, remote fetch on a miss.
//!
//! The fetch path streams the response body straight into a `tmp_<digest>`
//! scratch file inside the pool and installs it with one rename, so a
//! half-written download can never be mistaken for a valid object and
//! racing writers collapse into a single winner with identical bytes.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_compression::tokio::bufread::ZstdDecoder;
use futures::TryStreamExt;
use tokio::io::{AsyncRead, BufReader};
use tokio_util::io::StreamReader;
use tonic::async_trait;
use tracing::{debug, instrument, warn};
use url::Url;

use merklefs_castore::pool::{ObjectPool, ObjectService};
use merklefs_castore::{CasDigest, Error};

use crate::location::LocationClient;

/// Upper bound on tracker polling for one object. Past this the read
/// fails with a remote error instead of wedging the reader forever.
const MAX_LOCATE_ATTEMPTS: u32 = 600;

/// Delay added per polling iteration: 0 ms, 100 ms, 200 ms, ...
const LOCATE_BACKOFF_STEP: Duration = Duration::from_millis(100);

/// An [ObjectService] that downloads missing objects from a remote origin
/// or a tracker-discovered peer, with optional Zstandard transfer decode.
pub struct FetchingObjectService {
    pool: ObjectPool,
    http_client: reqwest::Client,
    origin: Option<Url>,
    tracker: Option<LocationClient>,
    /// Per-digest single-flight guards: concurrent readers of the same
    /// missing object share one download.
    inflight: Mutex<HashMap<CasDigest, Arc<tokio::sync::Mutex<()>>>>,
}

impl FetchingObjectService {
    pub fn new(pool: ObjectPool, origin: Option<Url>, tracker: Option<LocationClient>) -> Self {
        Self {
            pool,
            http_client: reqwest::Client::new(),
            origin,
            tracker,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &ObjectPool {
        &self.pool
    }

    fn inflight_guard(&self, digest: &CasDigest) -> io::Result<Arc<tokio::sync::Mutex<()>>> {
        let mut inflight = self
            .inflight
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "inflight mutex poisoned"))?;
        Ok(inflight.entry(*digest).or_default().clone())
    }

    fn inflight_done(&self, digest: &CasDigest) {
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.remove(digest);
        }
    }

    /// Finds a URL serving `digest`: the statically configured origin, or
    /// a peer the tracker knows about. Tracker polling deliberately blocks
    /// the requesting reader; an empty answer only means "no peer yet".
    async fn locate(&self, digest: &CasDigest) -> Result<(Url, bool), Error> {
        if let Some(tracker) = &self.tracker {
            for attempt in 0..MAX_LOCATE_ATTEMPTS {
                if attempt > 0 {
                    tokio::time::sleep(LOCATE_BACKOFF_STEP * attempt).await;
                }
                match tracker.query(digest).await {
                    Ok(Some(url)) => return Ok((url, true)),
                    Ok(None) => debug!(attempt, "no peer for object yet"),
                    // rpc failures are non-fatal here; keep polling
                    Err(e) => warn!(attempt, "tracker query failed: {}", e),
                }
            }
            return Err(Error::Remote(format!(
                "no location for {} after {} tracker attempts",
                digest, MAX_LOCATE_ATTEMPTS
            )));
        }

        let origin = self
            .origin
            .as_ref()
            .ok_or_else(|| Error::Remote("no remote origin configured".to_string()))?;
        let url = origin
            .join(&digest.to_string())
            .map_err(|e| Error::Remote(format!("origin url: {}", e)))?;
        Ok((url, false))
    }

    /// Downloads `digest` into the pool. On return the object is installed
    /// and openable.
    #[instrument(skip(self), fields(object.digest = %digest), err)]
    async fn fetch(&self, digest: &CasDigest, zstd: bool) -> Result<(), Error> {
        let (url, via_tracker) = self.locate(digest).await?;

        let tmp_path = self.pool.tmp_path(digest);
        if let Err(e) = self.download(digest, zstd, &url, &tmp_path).await {
            // never leave scratch behind on a failed attempt
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        self.pool.install(&tmp_path, digest).await?;
        debug!(url = %url, "object installed");

        if via_tracker {
            if let Some(tracker) = &self.tracker {
                // the object is durably in the pool; a failed announcement
                // must not fail the read
                if let Err(e) = tracker.report(digest).await {
                    warn!("tracker report failed: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Streams the body into `tmp_path`. With the zstd flag set, the
    /// compressed variant is probed first and any non-200 answer falls
    /// back to the plain body served verbatim.
    async fn download(
        &self,
        digest: &CasDigest,
        zstd: bool,
        url: &Url,
        tmp_path: &Path,
    ) -> Result<(), Error> {
        if zstd {
            let zstd_url = zstd_variant(url, digest)?;
            match self.http_client.get(zstd_url.clone()).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    debug!(url = %zstd_url, "streaming compressed body");
                    let body = StreamReader::new(
                        resp.bytes_stream()
                            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())),
                    );
                    let mut decoder = ZstdDecoder::new(BufReader::new(body));
                    return spill(&mut decoder, tmp_path).await;
                }
                Ok(resp) => {
                    debug!(url = %zstd_url, status = %resp.status(), "no compressed variant, falling back")
                }
                Err(e) => warn!(url = %zstd_url, "compressed fetch failed, falling back: {}", e),
            }
        }

        let resp = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::Remote(format!("GET {}: {}", url, e)))?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(Error::Remote(format!(
                "GET {}: status {}",
                url,
                resp.status()
            )));
        }
        let mut body = StreamReader::new(
            resp.bytes_stream()
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())),
        );
        spill(&mut body, tmp_path).await
    }
}

/// Writes everything `r` yields into `path` and syncs it, ready for the
/// rename install.
async fn spill<R>(r: &mut R, path: &Path) -> Result<(), Error>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut out = tokio::fs::File::create(path).await?;
    tokio::io::copy(r, &mut out).await?;
    out.sync_all().await?;
    Ok(())
}

/// The `zstd/<digest>` sibling of an object URL.
fn zstd_variant(url: &Url, digest: &CasDigest) -> Result<Url, Error> {
    let mut zstd_url = url.clone();
    let digest_str = digest.to_string();
    {
        let mut segments = zstd_url
            .path_segments_mut()
            .map_err(|_| Error::Remote("object url cannot be a base".to_string()))?;
        segments.pop();
        segments.push("zstd");
        segments.push(&digest_str);
    }
    Ok(zstd_url)
}

#[async_trait]
impl ObjectService for FetchingObjectService {
    #[instrument(skip_all, fields(object.digest = %digest))]
    async fn open_object(&self, digest: &CasDigest, zstd: bool) -> io::Result<tokio::fs::File> {
        if let Some(file) = self.pool.open_read(digest).await? {
            return Ok(file);
        }

        let guard = self.inflight_guard(digest)?;
        let _locked = guard.lock().await;
        // the download may have completed while we waited for the guard
        if let Some(file) = self.pool.open_read(digest).await? {
            self.inflight_done(digest);
            return Ok(file);
        }

        let fetched = self.fetch(digest, zstd).await;
        self.inflight_done(digest);
        fetched.map_err(io::Error::from)?;

        // retry exactly once; a miss here is a genuine error
        self.pool.open_read(digest).await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("object {} missing after fetch", digest),
            )
        })
    }
}
