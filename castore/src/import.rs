//! Build a manifest tree from a real filesystem.

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{instrument, warn};
use walkdir::WalkDir;

use crate::{CasDigest, Error, Tree};

/// Walks `root` and produces a fresh tree: one node per entry in dense ino
/// order, parents linked before their children.
///
/// `stash` is invoked for every regular file and returns the digest of its
/// body; it is also the hook through which the caller populates the pool
/// (hashing only, or hash plus hardlink).
///
/// Entries of unexpected types (sockets, fifos, devices) get a bare node
/// and a warning, matching what stat said about them but carrying no
/// content.
#[instrument(skip(stash), err)]
pub fn build_tree<F>(root: &Path, mut stash: F) -> Result<Tree, Error>
where
    F: FnMut(&Path) -> io::Result<CasDigest>,
{
    let mut tree = Tree::default();
    // path -> ino of every directory seen so far; the walk is pre-order, so
    // a parent is always present before its children.
    let mut dir_inos: HashMap<PathBuf, u64> = HashMap::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(walkdir_error)?;
        let meta = entry.metadata().map_err(walkdir_error)?;
        let file_type = entry.file_type();

        let ino = {
            let node = tree.new_node(meta.mode(), meta.len());
            if file_type.is_dir() {
                node.dirents.insert(".".to_string(), node.ino);
            } else if file_type.is_file() {
                node.value = stash(entry.path())?.to_string();
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                node.value = target.to_string_lossy().into_owned();
            } else {
                warn!(path = %entry.path().display(), "unexpected file type");
            }
            node.ino
        };

        if entry.depth() == 0 {
            if !file_type.is_dir() {
                return Err(Error::InvalidArgument(format!(
                    "{}: build root must be a directory",
                    root.display()
                )));
            }
            // the root's `..` points at itself
            if let Some(node) = tree.node_mut(ino) {
                node.dirents.insert("..".to_string(), ino);
            }
        } else {
            let parent = entry.path().parent().and_then(|p| dir_inos.get(p)).copied();
            let parent_ino = parent.ok_or_else(|| {
                Error::Structural(format!(
                    "{}: walked before its parent directory",
                    entry.path().display()
                ))
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(parent_node) = tree.node_mut(parent_ino) {
                parent_node.dirents.insert(name, ino);
            }
            if file_type.is_dir() {
                if let Some(node) = tree.node_mut(ino) {
                    node.dirents.insert("..".to_string(), parent_ino);
                }
            }
        }

        if file_type.is_dir() {
            dir_inos.insert(entry.path().to_path_buf(), ino);
        }
    }

    Ok(tree)
}

fn walkdir_error(e: walkdir::Error) -> Error {
    match e.into_io_error() {
        Some(io_err) => Error::Io(io_err),
        None => Error::Structural("filesystem loop during walk".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ObjectPool;
    use std::os::unix::fs::symlink;

    fn sample_source(dir: &Path) -> PathBuf {
        let src = dir.join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("hello.txt"), b"hi\n").unwrap();
        std::fs::write(src.join("sub").join("nested.txt"), b"nested body\n").unwrap();
        symlink("hello.txt", src.join("link")).unwrap();
        src
    }

    #[test]
    fn inos_are_dense() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_source(dir.path());
        let tree = build_tree(&src, |p| CasDigest::from_file(p)).unwrap();
        for (i, node) in tree.nodes().iter().enumerate() {
            assert_eq!(node.ino, i as u64 + 1);
        }
        tree.validate().unwrap();
    }

    #[test]
    fn resolution_agrees_with_source_stat() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_source(dir.path());
        let tree = build_tree(&src, |p| CasDigest::from_file(p)).unwrap();

        for rel in ["hello.txt", "sub", "sub/nested.txt"] {
            let node = tree.resolve(rel).unwrap_or_else(|| panic!("{rel} missing"));
            let meta = std::fs::symlink_metadata(src.join(rel)).unwrap();
            assert_eq!(node.mode, meta.mode(), "{rel} mode");
            assert_eq!(node.size, meta.len(), "{rel} size");
        }
        let link = tree.resolve("link").unwrap();
        assert!(link.is_symlink());
        assert_eq!(tree.get_link("/link").unwrap(), "hello.txt");
    }

    #[test]
    fn regular_files_carry_body_digests() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_source(dir.path());
        let tree = build_tree(&src, |p| CasDigest::from_file(p)).unwrap();
        assert_eq!(
            tree.get_content("/hello.txt").unwrap().digest,
            CasDigest::from_bytes(b"hi\n")
        );
        assert_eq!(
            tree.get_content("/sub/nested.txt").unwrap().digest,
            CasDigest::from_bytes(b"nested body\n")
        );
    }

    #[test]
    fn stash_populates_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_source(dir.path());
        let pool = ObjectPool::new(dir.path().join("pool")).unwrap();
        let tree = build_tree(&src, |p| pool.stash_file(p)).unwrap();

        let content = tree.get_content("/hello.txt").unwrap();
        assert_eq!(
            std::fs::read(pool.object_path(&content.digest)).unwrap(),
            b"hi\n"
        );
    }

    #[test]
    fn manifest_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_source(dir.path());
        let tree = build_tree(&src, |p| CasDigest::from_file(p)).unwrap();
        let meta = dir.path().join("meta.json");
        tree.save(&meta).unwrap();
        assert_eq!(Tree::restore(&meta).unwrap(), tree);
    }

    #[test]
    fn dirent_back_edges_are_wired() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_source(dir.path());
        let tree = build_tree(&src, |p| CasDigest::from_file(p)).unwrap();

        let root = tree.resolve("/").unwrap();
        assert_eq!(root.dirents.get("."), Some(&1));
        assert_eq!(root.dirents.get(".."), Some(&1));

        let sub = tree.resolve("/sub").unwrap();
        assert_eq!(sub.dirents.get("."), Some(&sub.ino));
        assert_eq!(sub.dirents.get(".."), Some(&1));
        // climbing out of sub lands back at a root child
        assert_eq!(
            tree.resolve("/sub/../hello.txt").unwrap().ino,
            tree.resolve("/hello.txt").unwrap().ino
        );
    }

    #[test]
    fn root_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            build_tree(&file, |p| CasDigest::from_file(p)),
            Err(Error::InvalidArgument(_))
        ));
    }
}
