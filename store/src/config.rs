//! Runtime configuration shared by the mount and convert commands.
//!
//! The file format is a flat JSON object; every key is optional and the
//! CLI can override any of them. Loading is tolerant of a missing file so
//! commands that need none of these values keep working without one.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use url::Url;

use merklefs_castore::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/merklefs/config.json";

/// Default external compressor level when `zlevel` is unset.
const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local object pool directory.
    pub pool: Option<PathBuf>,
    /// Mirror directory holding Zstandard frames of pool objects.
    pub zpool: Option<PathBuf>,
    /// Remote origin serving objects over HTTP.
    pub remote: Option<String>,
    /// Tracker endpoint, e.g. `http://tracker:2333`.
    pub tracker: Option<String>,
    /// Port peers serve their pool on; composed into peer URLs.
    pub port: Option<u16>,
    /// Enable the tracker fetch path.
    pub fetcher: bool,
    /// Name this node announces to the tracker.
    pub host: Option<String>,
    /// Only compress objects at least this large.
    pub zsize: u64,
    /// Keep the compressed variant only when it is smaller than
    /// `original * zrate`.
    pub zrate: f64,
    /// External compressor level; 0 means the default.
    pub zlevel: i32,
    /// Bundle container target size; 0 disables bundling.
    pub bsize: u64,
    /// Bundle reference side table directory.
    pub brefs: Option<PathBuf>,
    /// Intra-container alignment; 0 disables.
    pub asize: u64,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::Structural(format!("{}: {}", path.display(), e)))
    }

    /// Like [Config::load], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, Error> {
        match Self::load(path) {
            Ok(cfg) => Ok(cfg),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Config::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn zstd_level(&self) -> i32 {
        if self.zlevel == 0 {
            DEFAULT_ZSTD_LEVEL
        } else {
            self.zlevel
        }
    }

    /// The origin as a URL with a trailing slash, so joining a digest
    /// appends rather than replaces the last path segment.
    pub fn remote_url(&self) -> Result<Option<Url>, Error> {
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        let mut remote = remote.clone();
        if !remote.ends_with('/') {
            remote.push('/');
        }
        Url::parse(&remote)
            .map(Some)
            .map_err(|e| Error::Structural(format!("remote {:?}: {}", remote, e)))
    }
}
