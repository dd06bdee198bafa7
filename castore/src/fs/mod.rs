//! A read-only FUSE filesystem serving a manifest [Tree] with file bodies
//! resolved through an [ObjectService].
//!
//! Manifest inos are dense and stable, and the root is ino 1, the same
//! value FUSE uses for the mount root, so manifest inos are used as FUSE
//! inode numbers directly, with no allocation or tracking in between.
//!
//! All metadata requests (lookup, getattr, readdir, readlink) are answered
//! from the in-memory tree and never block on I/O. `open` is the one
//! suspension point: it may trigger a download inside the object service,
//! bridged into the async runtime via a captured [tokio::runtime::Handle].
//! `read` is a positional read against the opened descriptor with the
//! node's bundle offset folded in.

mod file_attr;
pub mod fuse;

use std::collections::HashMap;
use std::ffi::CStr;
use std::io::{self, Cursor};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fuse_backend_rs::abi::fuse_abi::{stat64, OpenOptions};
use fuse_backend_rs::api::filesystem::{
    Context, DirEntry, Entry, FileSystem, FsOptions, ZeroCopyWriter, ROOT_ID,
};
use parking_lot::RwLock;
use tracing::{debug, warn};

use self::file_attr::fuse_attr;
use crate::metadata::{NodeAttr, NodeKind};
use crate::pool::ObjectService;
use crate::{CasDigest, Error, Node, Tree};

/// The tree never changes for the lifetime of a mount, so attributes and
/// entries never expire.
const TTL: Duration = Duration::MAX;

/// An open file: a descriptor on the (possibly shared container) pool
/// object, the window base inside it, and the logical file length.
#[derive(Debug)]
struct FileHandle {
    file: std::fs::File,
    base: u64,
    size: u64,
}

#[derive(Debug)]
pub struct MerkleFs<OS> {
    tree: Tree,
    object_service: OS,

    file_handles: RwLock<HashMap<u64, Arc<FileHandle>>>,
    next_file_handle: AtomicU64,

    tokio_handle: tokio::runtime::Handle,
}

impl<OS> MerkleFs<OS>
where
    OS: ObjectService,
{
    /// Wraps `tree` for serving. Panics if called outside the context of a
    /// tokio runtime.
    pub fn new(tree: Tree, object_service: OS) -> Result<Self, Error> {
        if !tree.get(ROOT_ID).map(Node::is_dir).unwrap_or(false) {
            return Err(Error::Structural(
                "tree root is missing or not a directory".to_string(),
            ));
        }
        Ok(Self {
            tree,
            object_service,
            file_handles: RwLock::new(HashMap::default()),
            next_file_handle: AtomicU64::new(1),
            tokio_handle: tokio::runtime::Handle::current(),
        })
    }

    fn node(&self, inode: u64) -> io::Result<&Node> {
        self.tree
            .get(inode)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn do_lookup(&self, parent: u64, name: &str) -> io::Result<Entry> {
        let parent_node = self.node(parent)?;
        let dirents = match parent_node.kind() {
            NodeKind::Directory(dirents) => dirents,
            _ => return Err(io::Error::from_raw_os_error(libc::ENOTDIR)),
        };
        let child_ino = dirents.get(name).copied().unwrap_or(0);
        if child_ino == 0 {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        let child = self.node(child_ino)?;
        Ok(Entry {
            inode: child.ino,
            attr: fuse_attr(NodeAttr::from(child)).into(),
            attr_timeout: TTL,
            entry_timeout: TTL,
            ..Default::default()
        })
    }

    /// Children of the directory at `inode` as readdir rows:
    /// (name, child ino, dirent type).
    fn dir_entries(&self, inode: u64) -> io::Result<Vec<(String, u64, u32)>> {
        let node = self.node(inode)?;
        let dirents = match node.kind() {
            NodeKind::Directory(dirents) => dirents,
            _ => return Err(io::Error::from_raw_os_error(libc::ENOTDIR)),
        };
        let mut entries = Vec::with_capacity(dirents.len());
        for (name, &child_ino) in dirents {
            let child = match self.tree.get(child_ino) {
                Some(child) => child,
                None => {
                    // dirent value 0 means "not found"; anything else
                    // dangling would have failed validation
                    continue;
                }
            };
            let dt = match child.kind() {
                NodeKind::Directory(_) => libc::DT_DIR as u32,
                NodeKind::File { .. } => libc::DT_REG as u32,
                NodeKind::Symlink { .. } => libc::DT_LNK as u32,
                NodeKind::Unknown => libc::DT_UNKNOWN as u32,
            };
            entries.push((name.clone(), child.ino, dt));
        }
        Ok(entries)
    }

    /// Opens the body behind `inode`, fetching it if the pool misses, and
    /// registers a file handle.
    fn do_open(&self, inode: u64) -> io::Result<u64> {
        let node = self.node(inode)?;
        let (digest, zstd, off) = match node.kind() {
            NodeKind::Directory(_) => {
                return Err(io::Error::from_raw_os_error(libc::EISDIR));
            }
            NodeKind::File { digest, zstd, off } => {
                let digest: CasDigest = digest.parse().map_err(|e| {
                    warn!(inode, "malformed digest in tree: {}", e);
                    io::Error::from_raw_os_error(libc::EIO)
                })?;
                (digest, zstd, off)
            }
            NodeKind::Symlink { .. } | NodeKind::Unknown => {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
        };

        let file = self
            .tokio_handle
            .block_on(async {
                let file = self.object_service.open_object(&digest, zstd).await?;
                Ok::<_, io::Error>(file.into_std().await)
            })
            .map_err(|e| {
                warn!(inode, object.digest = %digest, "failed to open object: {}", e);
                if e.raw_os_error().is_some() {
                    e
                } else {
                    io::Error::from_raw_os_error(libc::EIO)
                }
            })?;

        let fh = self.next_file_handle.fetch_add(1, Ordering::SeqCst);
        self.file_handles.write().insert(
            fh,
            Arc::new(FileHandle {
                file,
                base: off,
                size: node.size,
            }),
        );
        Ok(fh)
    }

    /// Positional read within the handle's window.
    fn do_read(&self, handle: u64, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        let fh = self
            .file_handles
            .read()
            .get(&handle)
            .cloned()
            .ok_or_else(|| {
                warn!(handle, "file handle unknown");
                io::Error::from_raw_os_error(libc::EIO)
            })?;

        // clamp to the window so a read near the end of a bundled file
        // cannot leak the next member's bytes
        if offset >= fh.size {
            return Ok(Vec::new());
        }
        let len = (size as u64).min(fh.size - offset) as usize;
        let mut buf = vec![0u8; len];
        let mut filled = 0usize;
        while filled < len {
            let n = fh
                .file
                .read_at(&mut buf[filled..], fh.base + offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn do_release(&self, handle: u64) {
        match self.file_handles.write().remove(&handle) {
            Some(fh) => drop(fh),
            None => {
                warn!(handle, "file handle not found");
            }
        }
    }

    fn do_readlink(&self, inode: u64) -> io::Result<Vec<u8>> {
        match self.node(inode)?.kind() {
            NodeKind::Symlink { target } => Ok(target.as_bytes().to_vec()),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }
}

impl<OS> FileSystem for MerkleFs<OS>
where
    OS: ObjectService,
{
    type Inode = u64;
    type Handle = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    #[tracing::instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn lookup(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
        debug!("lookup");
        let name = name
            .to_str()
            .map_err(|_| io::Error::from_raw_os_error(libc::ENOENT))?;
        self.do_lookup(parent, name)
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn getattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Option<Self::Handle>,
    ) -> io::Result<(stat64, Duration)> {
        // with an open descriptor, stat the descriptor; the tree otherwise
        if let Some(fh) = handle.and_then(|h| self.file_handles.read().get(&h).cloned()) {
            let meta = fh.file.metadata()?;
            use std::os::unix::fs::MetadataExt;
            let attr = fuse_backend_rs::abi::fuse_abi::Attr {
                ino: inode,
                size: meta.size(),
                blocks: meta.blocks(),
                blksize: meta.blksize() as u32,
                mode: meta.mode(),
                nlink: 1,
                ..Default::default()
            };
            return Ok((attr.into(), TTL));
        }
        let node = self.node(inode)?;
        Ok((fuse_attr(NodeAttr::from(node)).into(), TTL))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn open(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions, Option<u32>)> {
        let fh = self.do_open(inode)?;
        Ok((Some(fh), OpenOptions::empty(), None))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.handle = handle, rq.offset = offset, rq.size = size))]
    fn read(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let buf = self.do_read(handle, offset, size)?;

        // write must be called until the whole buffer reached the kernel
        let buf_len = buf.len();
        let bytes_written = io::copy(&mut Cursor::new(buf), w)?;
        if bytes_written != buf_len as u64 {
            warn!(bytes_written, buf_len, "unable to write all of buf to kernel");
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        Ok(bytes_written as usize)
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.handle = handle))]
    fn release(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        self.do_release(handle);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn opendir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        // the listing is served straight from the tree; no handle state
        if !self.node(inode)?.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
        }
        Ok((None, OpenOptions::empty()))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn readdir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        for (i, (name, ino, type_)) in self
            .dir_entries(inode)?
            .into_iter()
            .skip(offset as usize)
            .enumerate()
        {
            // the second parameter becomes the "offset" of the next call
            let written = add_entry(DirEntry {
                ino,
                offset: offset + i as u64 + 1,
                type_,
                name: name.as_bytes(),
            })?;
            // a full buffer reports 0 written
            if written == 0 {
                break;
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn readdirplus(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry, Entry) -> io::Result<usize>,
    ) -> io::Result<()> {
        for (i, (name, ino, type_)) in self
            .dir_entries(inode)?
            .into_iter()
            .skip(offset as usize)
            .enumerate()
        {
            let entry = self.do_lookup(inode, &name)?;
            let written = add_entry(
                DirEntry {
                    ino,
                    offset: offset + i as u64 + 1,
                    type_,
                    name: name.as_bytes(),
                },
                entry,
            )?;
            if written == 0 {
                break;
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn releasedir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        _handle: Self::Handle,
    ) -> io::Result<()> {
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn readlink(&self, _ctx: &Context, inode: Self::Inode) -> io::Result<Vec<u8>> {
        self.do_readlink(inode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{sample_tree, HELLO_BLOB, HELLO_DIGEST};
    use crate::pool::ObjectPool;
    use std::path::Path;

    fn pool_with_hello(dir: &Path) -> ObjectPool {
        let pool = ObjectPool::new(dir.join("pool")).unwrap();
        std::fs::write(pool.object_path(&HELLO_DIGEST), HELLO_BLOB).unwrap();
        pool
    }

    async fn with_fs<F, R>(f: F) -> R
    where
        F: FnOnce(&MerkleFs<ObjectPool>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with_hello(dir.path());
        let fs = MerkleFs::new(sample_tree(), pool).unwrap();
        // do_open bridges into the runtime with block_on, so exercise it
        // from a blocking thread the way the FUSE workers do
        tokio::task::spawn_blocking(move || f(&fs)).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lookup_finds_children() {
        with_fs(|fs| {
            let entry = fs.do_lookup(ROOT_ID, "hello.txt").unwrap();
            assert_eq!(entry.inode, 2);

            let err = fs.do_lookup(ROOT_ID, "missing").unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::ENOENT));

            // looking up inside a file is ENOTDIR
            let err = fs.do_lookup(2, "x").unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::ENOTDIR));
        })
        .await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_read_release() {
        with_fs(|fs| {
            let fh = fs.do_open(2).unwrap();
            assert_eq!(fs.do_read(fh, 0, 10).unwrap(), HELLO_BLOB);
            // offset past EOF yields no bytes
            assert!(fs.do_read(fh, 10, 10).unwrap().is_empty());
            fs.do_release(fh);
            let err = fs.do_read(fh, 0, 1).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EIO));
        })
        .await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_rejects_non_files() {
        with_fs(|fs| {
            let err = fs.do_open(ROOT_ID).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EISDIR));
            let err = fs.do_open(3).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        })
        .await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn readlink_contract() {
        with_fs(|fs| {
            assert_eq!(fs.do_readlink(3).unwrap(), b"hello.txt");
            let err = fs.do_readlink(2).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        })
        .await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn readdir_lists_the_tree() {
        with_fs(|fs| {
            let mut names: Vec<String> = fs
                .dir_entries(ROOT_ID)
                .unwrap()
                .into_iter()
                .map(|(name, _, _)| name)
                .collect();
            names.sort();
            assert_eq!(names, vec![".", "..", "hello.txt", "link", "sub"]);

            let err = fs.dir_entries(2).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::ENOTDIR));
        })
        .await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bundled_reads_stay_inside_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ObjectPool::new(dir.path().join("pool")).unwrap();
        // a container holding two members back to back
        let container = b"AAAAAAAAAABBBBBBBBBB";
        let digest = CasDigest::from_bytes(container);
        std::fs::write(pool.object_path(&digest), container).unwrap();

        let manifest = serde_json::json!([
            {
                "ino": 1, "mode": libc::S_IFDIR as u32 | 0o755, "size": 0,
                "dirents": { ".": 1, "..": 1, "a": 2, "b": 3 }
            },
            { "ino": 2, "mode": libc::S_IFREG as u32 | 0o644, "size": 10, "value": digest.to_string() },
            { "ino": 3, "mode": libc::S_IFREG as u32 | 0o644, "size": 10, "off": 10, "value": digest.to_string() },
        ]);
        let tree = Tree::load(&serde_json::to_vec(&manifest).unwrap()).unwrap();
        let fs = MerkleFs::new(tree, pool).unwrap();

        tokio::task::spawn_blocking(move || {
            let fh = fs.do_open(3).unwrap();
            assert_eq!(fs.do_read(fh, 0, 10).unwrap(), b"BBBBBBBBBB");
            assert_eq!(fs.do_read(fh, 5, 3).unwrap(), b"BBB");
            // a greedy read cannot cross the window into padding or peers
            assert_eq!(fs.do_read(fh, 0, 100).unwrap(), b"BBBBBBBBBB");
            fs.do_release(fh);

            let fh = fs.do_open(2).unwrap();
            assert_eq!(fs.do_read(fh, 0, 100).unwrap(), b"AAAAAAAAAA");
            fs.do_release(fh);
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn new_rejects_rootless_trees() {
        let err = MerkleFs::new(Tree::default(), ObjectPool::new("/tmp").unwrap()).unwrap_err();
        assert!(matches!(err, Error::Structural(_)));
    }
}
