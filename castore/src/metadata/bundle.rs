//! Offline packing of small sibling files into shared container objects.
//!
//! Bundling rewrites regular-file nodes in place: `value` becomes the
//! container digest and `off` the byte offset of the member inside it.
//! With a brefs directory configured, every placement is also persisted as
//! a [Bref] keyed by the member's pre-bundling digest, so a later run over
//! a rebuilt manifest can reuse the containers without copying a byte.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::pool::ObjectPool;
use crate::{CasDigest, Error, Tree};

/// Durable record of where a pre-bundling object ended up: container
/// digest and byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bref {
    pub hash: String,
    pub off: u64,
}

/// Sentinel `hash` marking a reservation whose container has not been
/// sealed yet. Readers treat these records as absent.
pub const BREF_PENDING: &str = "dummy";

impl Bref {
    pub fn is_pending(&self) -> bool {
        self.hash == BREF_PENDING
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        Ok(std::fs::write(path, serde_json::to_vec(self)?)?)
    }

    pub fn restore(path: &Path) -> Result<Bref, Error> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Thresholds for a bundling pass.
#[derive(Debug, Clone)]
pub struct BundleOptions<'a> {
    /// Target container size; only files strictly smaller are candidates.
    pub bsize: u64,
    /// Intra-container alignment, 0 disables. Padding is zero-filled so
    /// container digests are reproducible.
    pub asize: u64,
    /// Side table directory for cross-run reuse.
    pub brefs: Option<&'a Path>,
}

/// Runs the bundling pass over every directory of `tree`.
///
/// Best-effort: a candidate whose pool object cannot be opened is skipped
/// (node untouched, offset not advanced, no Bref written), and a sealing
/// failure abandons the remainder of that directory while keeping every
/// container sealed so far valid.
#[instrument(skip_all, fields(bsize = opts.bsize, asize = opts.asize))]
pub fn bundle(tree: &mut Tree, pool: &ObjectPool, opts: &BundleOptions) {
    let dirs: Vec<u64> = tree
        .nodes()
        .iter()
        .filter(|n| n.is_dir())
        .map(|n| n.ino)
        .collect();
    for dir_ino in dirs {
        if let Err(e) = bundle_directory(tree, pool, opts, dir_ino) {
            warn!(dir.ino = dir_ino, "bundling aborted for directory: {}", e);
        }
    }
}

fn bundle_directory(
    tree: &mut Tree,
    pool: &ObjectPool,
    opts: &BundleOptions,
    dir_ino: u64,
) -> Result<(), Error> {
    // Candidates: regular-file children smaller than the container target.
    // `.` and `..` point back at directories and fall out naturally.
    let child_inos: Vec<u64> = match tree.get(dir_ino) {
        Some(dir) => dir.dirents.values().copied().collect(),
        None => return Ok(()),
    };
    let mut candidates: Vec<(u64, u64)> = Vec::new();
    for ino in child_inos {
        if let Some(child) = tree.get(ino) {
            if child.is_file() && child.size < opts.bsize {
                candidates.push((child.size, ino));
            }
        }
    }

    // Reuse placements recorded by an earlier run.
    if let Some(brefs) = opts.brefs {
        candidates.retain(|&(_, ino)| {
            let digest = match tree.get(ino) {
                Some(n) => n.value.clone(),
                None => return false,
            };
            match Bref::restore(&brefs.join(&digest)) {
                Ok(bref) if !bref.is_pending() => {
                    debug!(ino, container = %bref.hash, off = bref.off, "reusing bundle placement");
                    if let Some(node) = tree.node_mut(ino) {
                        node.value = bref.hash;
                        node.off = bref.off;
                    }
                    false
                }
                _ => true,
            }
        });
    }

    // Smallest first, ino as the tie-break, so identical inputs give
    // identical containers.
    candidates.sort_unstable();

    let scratch = pool.bundle_scratch_path();
    let mut out: Option<File> = None;
    // `off` is the next write position (post-alignment), `written` the
    // actual scratch length; the gap is zero-filled right before the next
    // member lands, so a sealed container never carries trailing padding.
    let mut off: u64 = 0;
    let mut written: u64 = 0;
    let mut pending: Vec<(u64, String)> = Vec::new();

    for (size, ino) in candidates {
        let orig = match tree.get(ino) {
            Some(n) => n.value.clone(),
            None => continue,
        };
        let digest: CasDigest = match orig.parse() {
            Ok(d) => d,
            Err(e) => {
                warn!(ino, "skipping candidate with malformed digest: {}", e);
                continue;
            }
        };
        let mut src = match File::open(pool.object_path(&digest)) {
            Ok(f) => f,
            Err(e) => {
                warn!(ino, object = %digest, "skipping unreadable candidate: {}", e);
                continue;
            }
        };

        if let Some(brefs) = opts.brefs {
            // reservation; replaced with the real placement at seal time
            let reservation = Bref {
                hash: BREF_PENDING.to_string(),
                off: 0,
            };
            if let Err(e) = reservation.save(&brefs.join(&orig)) {
                warn!(ino, "failed to reserve bundle reference: {}", e);
            }
        }

        if out.is_none() {
            out = Some(File::create(&scratch)?);
        }
        // `out` was just populated above
        let container = out.as_mut().expect("scratch file is open");
        if written < off {
            write_zeros(container, off - written)?;
        }
        io::copy(&mut src, container)?;
        written = off + size;
        if let Some(node) = tree.node_mut(ino) {
            node.off = off;
        }
        pending.push((ino, orig));
        off = written;
        if opts.asize > 0 {
            off = off.div_ceil(opts.asize) * opts.asize;
        }

        if off >= opts.bsize {
            // `out` still holds the scratch file here
            let container = out.take().expect("scratch file is open");
            seal(tree, pool, opts, &scratch, container, &mut pending)?;
            off = 0;
            written = 0;
        }
    }

    if let Some(container) = out.take() {
        if !pending.is_empty() {
            seal(tree, pool, opts, &scratch, container, &mut pending)?;
        }
    }
    Ok(())
}

/// Finalizes the scratch container: hash, atomic rename into the pool,
/// rewrite every pending node, and persist the placements.
fn seal(
    tree: &mut Tree,
    pool: &ObjectPool,
    opts: &BundleOptions,
    scratch: &Path,
    container: File,
    pending: &mut Vec<(u64, String)>,
) -> Result<(), Error> {
    container.sync_all()?;
    drop(container);
    let digest = CasDigest::from_file(scratch)?;
    std::fs::rename(scratch, pool.object_path(&digest))?;
    debug!(container = %digest, members = pending.len(), "sealed bundle container");

    for (ino, orig) in pending.drain(..) {
        let off = match tree.node_mut(ino) {
            Some(node) => {
                node.value = digest.to_string();
                node.off
            }
            None => continue,
        };
        if let Some(brefs) = opts.brefs {
            let rpath = brefs.join(&orig);
            // only replace our own reservation, never a placement another
            // run has already recorded
            let replace = match Bref::restore(&rpath) {
                Ok(existing) => existing.is_pending(),
                Err(_) => true,
            };
            if replace {
                let bref = Bref {
                    hash: digest.to_string(),
                    off,
                };
                if let Err(e) = bref.save(&rpath) {
                    warn!(ino, "failed to persist bundle reference: {}", e);
                }
            }
        }
    }
    Ok(())
}

fn write_zeros(out: &mut File, mut n: u64) -> io::Result<()> {
    const ZEROS: [u8; 4096] = [0u8; 4096];
    while n > 0 {
        let chunk = n.min(ZEROS.len() as u64) as usize;
        out.write_all(&ZEROS[..chunk])?;
        n -= chunk as u64;
    }
    Ok(())
}
