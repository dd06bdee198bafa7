//! Offline Zstandard pass over a built tree.
//!
//! Compression itself is delegated to the system `zstd` tool; this pass
//! only decides which objects are worth keeping compressed and flags their
//! nodes. A flagged node's pool object moves to `zpool/<digest>` as a
//! Zstandard frame and the uncompressed copy is dropped; the serve path
//! fetches `zstd/<digest>` from the origin and decodes on the fly.

use std::path::Path;
use std::process::Command;

use tracing::{debug, instrument, warn};

use merklefs_castore::pool::ObjectPool;
use merklefs_castore::{CasDigest, NodeKind, Tree};

#[derive(Debug, Clone)]
pub struct ZstdOptions {
    /// Only objects at least this large are considered.
    pub zsize: u64,
    /// Keep the frame only when smaller than `original * zrate`.
    pub zrate: f64,
    /// Compressor level passed to the external tool.
    pub level: i32,
}

/// Walks the regular-file nodes of `tree`, compressing eligible pool
/// objects into `zpool` and setting their `zstd` flag. Best-effort: any
/// failure leaves the node and its pool object untouched.
#[instrument(skip(tree, pool), fields(zpool = %zpool.display(), zsize = opts.zsize, zrate = opts.zrate))]
pub fn compress_tree(tree: &mut Tree, pool: &ObjectPool, zpool: &Path, opts: &ZstdOptions) {
    tree.walk_mut(|node| {
        let digest_str = match node.kind() {
            NodeKind::File { digest, zstd, .. } if !zstd => digest.to_owned(),
            _ => return,
        };
        let digest: CasDigest = match digest_str.parse() {
            Ok(d) => d,
            Err(_) => return,
        };
        let path = pool.object_path(&digest);
        let zpath = zpool.join(digest.to_string());

        // an earlier run already produced the frame
        if zpath.exists() {
            let _ = std::fs::remove_file(&path);
            node.zstd = true;
            return;
        }

        let size = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(_) => return,
        };
        if size < opts.zsize {
            return;
        }

        let status = Command::new("zstd")
            .arg(format!("-{}", opts.level))
            .arg("-q")
            .arg("-o")
            .arg(&zpath)
            .arg(&path)
            .status();
        match status {
            Ok(status) if status.success() => {}
            other => {
                warn!(object = %digest, "zstd invocation failed: {:?}", other);
                return;
            }
        }

        let zsize = match std::fs::metadata(&zpath) {
            Ok(meta) => meta.len(),
            Err(_) => return,
        };
        if (zsize as f64) < size as f64 * opts.zrate {
            debug!(object = %digest, size, zsize, "keeping compressed variant");
            let _ = std::fs::remove_file(&path);
            node.zstd = true;
        } else {
            let _ = std::fs::remove_file(&zpath);
        }
    });
}
