use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::{CasDigest, Error, Node, NodeKind};

/// Block size reported by [Tree::stat].
const STAT_BLKSIZE: u64 = 4096;

/// Attributes projected from a node, shaped like a POSIX stat result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub ino: u64,
    pub mode: u32,
    pub size: u64,
    pub nlink: u32,
    pub blksize: u32,
    pub blocks: u64,
}

impl From<&Node> for NodeAttr {
    fn from(node: &Node) -> Self {
        NodeAttr {
            ino: node.ino,
            mode: node.mode,
            size: node.size,
            nlink: 1,
            blksize: STAT_BLKSIZE as u32,
            blocks: node.size.div_ceil(STAT_BLKSIZE),
        }
    }
}

/// Where a regular file's body lives: the pool object to open, whether the
/// remote copy is a Zstandard frame, and the window offset inside a shared
/// container (zero for standalone objects).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRef {
    pub digest: CasDigest,
    pub zstd: bool,
    pub off: u64,
}

/// The in-memory manifest: an append-only vector of nodes where
/// `nodes[i].ino == i + 1`. Index 0 is the root directory. A mounted tree
/// is never mutated; the bundler and the zstd pass rewrite nodes only
/// between build and serve.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node by inode number (1-based). Ino 0 is the "not found" sentinel in
    /// dirent values and never maps to a node.
    pub fn get(&self, ino: u64) -> Option<&Node> {
        if ino == 0 {
            return None;
        }
        self.nodes.get(ino as usize - 1)
    }

    /// Appends a bare node with the next dense ino and returns it for the
    /// builder to fill in.
    pub(crate) fn new_node(&mut self, mode: u32, size: u64) -> &mut Node {
        let ino = self.nodes.len() as u64 + 1;
        self.nodes.push(Node {
            ino,
            mode,
            size,
            ..Default::default()
        });
        // just pushed, cannot be empty
        self.nodes.last_mut().expect("nodes is non-empty")
    }

    pub(crate) fn node_mut(&mut self, ino: u64) -> Option<&mut Node> {
        if ino == 0 {
            return None;
        }
        self.nodes.get_mut(ino as usize - 1)
    }

    /// Applies `op` to every node in ino order. Offline passes (bundling,
    /// compression flagging) are built on this.
    pub fn walk_mut(&mut self, mut op: impl FnMut(&mut Node)) {
        for node in &mut self.nodes {
            op(node);
        }
    }

    /// Resolves `path` to a node, the single choke point for path lookups.
    ///
    /// Splits on `/`, skips empty segments (so leading, trailing and
    /// duplicate separators are tolerated) and follows every remaining
    /// segment, including `.` and `..`, through the dirent maps. Returns
    /// `None` if a segment is missing or the walk passes through a
    /// non-directory. The empty path and `/` resolve to the root.
    pub fn resolve(&self, path: &str) -> Option<&Node> {
        let mut idx = 0usize;
        for name in path.split('/') {
            if name.is_empty() {
                continue;
            }
            let ino = self
                .nodes
                .get(idx)?
                .dirents
                .get(name)
                .copied()
                .unwrap_or(0);
            if ino == 0 {
                return None;
            }
            idx = ino as usize - 1;
        }
        self.nodes.get(idx)
    }

    /// Dirent names of the directory at `path`, empty for anything else.
    /// The order carries no meaning.
    pub fn list_dir(&self, path: &str) -> Vec<String> {
        match self.resolve(path).map(Node::kind) {
            Some(NodeKind::Directory(dirents)) => dirents.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn stat(&self, path: &str) -> Result<NodeAttr, Error> {
        self.resolve(path)
            .map(NodeAttr::from)
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    pub fn get_link(&self, path: &str) -> Result<&str, Error> {
        let node = self
            .resolve(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        match node.kind() {
            NodeKind::Symlink { target } => Ok(target),
            _ => Err(Error::InvalidArgument(format!(
                "{}: not a symbolic link",
                path
            ))),
        }
    }

    /// The triple the content resolver needs to materialize `path`.
    pub fn get_content(&self, path: &str) -> Result<ContentRef, Error> {
        let node = self
            .resolve(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        match node.kind() {
            NodeKind::File { digest, zstd, off } => Ok(ContentRef {
                digest: digest
                    .parse()
                    .map_err(|e| Error::Structural(format!("{}: {}", path, e)))?,
                zstd,
                off,
            }),
            _ => Err(Error::InvalidArgument(format!(
                "{}: not a regular file",
                path
            ))),
        }
    }

    /// Serializes the manifest: a JSON array of node records.
    pub fn dump(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(&self.nodes)?)
    }

    /// Parses and structurally validates a manifest.
    pub fn load(data: &[u8]) -> Result<Tree, Error> {
        let tree = Tree {
            nodes: serde_json::from_slice(data)?,
        };
        tree.validate()?;
        Ok(tree)
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let data = self.dump()?;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(path)?;
        f.write_all(&data)?;
        Ok(())
    }

    pub fn restore(path: &Path) -> Result<Tree, Error> {
        let data = std::fs::read(path)?;
        Self::load(&data)
    }

    /// Checks the manifest invariants: dense inos, a self-rooted root
    /// directory, in-bounds dirent values, `..` present in every
    /// directory, and well-formed digests on regular files.
    pub fn validate(&self) -> Result<(), Error> {
        let root = self
            .nodes
            .first()
            .ok_or_else(|| Error::Structural("empty manifest".to_string()))?;
        if !root.is_dir() {
            return Err(Error::Structural("root is not a directory".to_string()));
        }
        if root.dirents.get(".") != Some(&1) || root.dirents.get("..") != Some(&1) {
            return Err(Error::Structural(
                "root must link `.` and `..` to itself".to_string(),
            ));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.ino != i as u64 + 1 {
                return Err(Error::Structural(format!(
                    "node at index {} has ino {}",
                    i, node.ino
                )));
            }
            match node.kind() {
                NodeKind::Directory(dirents) => {
                    if !dirents.contains_key("..") {
                        return Err(Error::Structural(format!(
                            "directory {} has no `..` entry",
                            node.ino
                        )));
                    }
                    for (name, &ino) in dirents {
                        // 0 is the "not found" sentinel and is tolerated
                        if ino > self.nodes.len() as u64 {
                            return Err(Error::Structural(format!(
                                "dirent {:?} in {} points at ino {} out of {}",
                                name,
                                node.ino,
                                ino,
                                self.nodes.len()
                            )));
                        }
                    }
                    self.check_parent_chain(node)?;
                }
                NodeKind::File { digest, .. } => {
                    digest.parse::<CasDigest>().map_err(|e| {
                        Error::Structural(format!("node {}: {}", node.ino, e))
                    })?;
                }
                NodeKind::Symlink { .. } | NodeKind::Unknown => {}
            }
        }
        Ok(())
    }

    /// Follows `..` upward from `start`. The chain must pass through
    /// directories only and reach the root within `len` hops; the bound
    /// also rejects cyclic parent links.
    fn check_parent_chain(&self, start: &Node) -> Result<(), Error> {
        let mut ino = start.ino;
        for _ in 0..=self.nodes.len() {
            if ino == 1 {
                return Ok(());
            }
            let dir = match self.get(ino) {
                Some(node) if node.is_dir() => node,
                _ => {
                    return Err(Error::Structural(format!(
                        "directory {}: `..` chain passes through non-directory {}",
                        start.ino, ino
                    )))
                }
            };
            ino = dir.dirents.get("..").copied().unwrap_or(0);
        }
        Err(Error::Structural(format!(
            "directory {}: `..` chain does not reach the root",
            start.ino
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{sample_tree, HELLO_BLOB, HELLO_DIGEST};
    use rstest::rstest;

    #[test]
    fn resolve_root() {
        let tree = sample_tree();
        for path in ["", "/", "//", "."] {
            let node = tree.resolve(path).expect("root must resolve");
            assert_eq!(node.ino, 1);
        }
    }

    #[rstest]
    #[case("/hello.txt")]
    #[case("hello.txt")]
    #[case("//hello.txt/")]
    #[case("./hello.txt")]
    #[case("sub/../hello.txt")]
    fn resolve_normalizes(#[case] path: &str) {
        let tree = sample_tree();
        let node = tree.resolve(path).expect("must resolve");
        assert_eq!(node.value, HELLO_DIGEST.to_string());
    }

    #[rstest]
    #[case("/missing")]
    #[case("/hello.txt/deeper")]
    #[case("/sub/missing")]
    fn resolve_misses(#[case] path: &str) {
        assert!(sample_tree().resolve(path).is_none());
    }

    #[test]
    fn resolve_nested_and_dotdot() {
        let tree = sample_tree();
        assert_eq!(tree.resolve("/sub/nested.txt").unwrap().ino, 5);
        assert_eq!(tree.resolve("/sub/./nested.txt").unwrap().ino, 5);
        assert_eq!(tree.resolve("/sub/..").unwrap().ino, 1);
        // `..` on the root loops back to the root
        assert_eq!(tree.resolve("/../../hello.txt").unwrap().ino, 2);
    }

    #[test]
    fn list_dir_contents() {
        let tree = sample_tree();
        let mut names = tree.list_dir("/");
        names.sort();
        assert_eq!(names, vec![".", "..", "hello.txt", "link", "sub"]);
        // listing a file or a missing path is empty, not an error
        assert!(tree.list_dir("/hello.txt").is_empty());
        assert!(tree.list_dir("/missing").is_empty());
    }

    #[test]
    fn stat_projection() {
        let tree = sample_tree();
        let attr = tree.stat("/hello.txt").unwrap();
        assert_eq!(attr.size, HELLO_BLOB.len() as u64);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.blksize, 4096);
        assert_eq!(attr.blocks, 1);
        assert!(matches!(
            tree.stat("/missing"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn stat_blocks_rounds_up() {
        let attr = NodeAttr::from(&Node {
            ino: 1,
            mode: libc::S_IFREG as u32 | 0o644,
            size: 4097,
            ..Default::default()
        });
        assert_eq!(attr.blocks, 2);
    }

    #[test]
    fn get_link_contract() {
        let tree = sample_tree();
        assert_eq!(tree.get_link("/link").unwrap(), "hello.txt");
        assert!(matches!(
            tree.get_link("/hello.txt"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(tree.get_link("/missing"), Err(Error::NotFound(_))));
    }

    #[test]
    fn get_content_contract() {
        let tree = sample_tree();
        let content = tree.get_content("/hello.txt").unwrap();
        assert_eq!(content.digest, *HELLO_DIGEST);
        assert!(!content.zstd);
        assert_eq!(content.off, 0);
        assert!(matches!(
            tree.get_content("/link"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            tree.get_content("/missing"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn dump_load_roundtrip() {
        let tree = sample_tree();
        let data = tree.dump().unwrap();
        let back = Tree::load(&data).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn save_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let tree = sample_tree();
        tree.save(&path).unwrap();
        assert_eq!(Tree::restore(&path).unwrap(), tree);
    }

    #[test]
    fn load_rejects_structural_errors() {
        // empty manifest
        assert!(matches!(Tree::load(b"[]"), Err(Error::Structural(_))));
        // root is a file
        let bad = br#"[{"ino":1,"mode":33188,"size":0}]"#;
        assert!(matches!(Tree::load(bad), Err(Error::Structural(_))));
        // non-dense ino
        let bad = br#"[{"ino":1,"mode":16877,"size":0,"dirents":{".":1,"..":1}},{"ino":5,"mode":16877,"size":0,"dirents":{"..":1}}]"#;
        assert!(matches!(Tree::load(bad), Err(Error::Structural(_))));
        // dirent out of bounds
        let bad = br#"[{"ino":1,"mode":16877,"size":0,"dirents":{".":1,"..":1,"x":9}}]"#;
        assert!(matches!(Tree::load(bad), Err(Error::Structural(_))));
        // regular file with a malformed digest
        let bad = br#"[{"ino":1,"mode":16877,"size":0,"dirents":{".":1,"..":1,"f":2}},{"ino":2,"mode":33188,"size":1,"value":"xyz"}]"#;
        assert!(matches!(Tree::load(bad), Err(Error::Structural(_))));
        // not json at all
        assert!(matches!(Tree::load(b"nope"), Err(Error::Structural(_))));
    }

    #[test]
    fn load_rejects_dotdot_not_an_ancestor() {
        // a directory whose `..` points at a regular file
        let bad = format!(
            r#"[{{"ino":1,"mode":16877,"size":0,"dirents":{{".":1,"..":1,"f":2,"d":3}}}},
                {{"ino":2,"mode":33188,"size":3,"value":"{}"}},
                {{"ino":3,"mode":16877,"size":0,"dirents":{{".":3,"..":2}}}}]"#,
            HELLO_DIGEST.to_string()
        );
        assert!(matches!(
            Tree::load(bad.as_bytes()),
            Err(Error::Structural(_))
        ));

        // a non-root directory claiming itself as its parent
        let selfish = br#"[{"ino":1,"mode":16877,"size":0,"dirents":{".":1,"..":1,"d":2}},
            {"ino":2,"mode":16877,"size":0,"dirents":{".":2,"..":2}}]"#;
        assert!(matches!(Tree::load(selfish), Err(Error::Structural(_))));

        // two directories pointing `..` at each other never reach the root
        let cyclic = br#"[{"ino":1,"mode":16877,"size":0,"dirents":{".":1,"..":1,"a":2,"b":3}},
            {"ino":2,"mode":16877,"size":0,"dirents":{".":2,"..":3}},
            {"ino":3,"mode":16877,"size":0,"dirents":{".":3,"..":2}}]"#;
        assert!(matches!(Tree::load(cyclic), Err(Error::Structural(_))));
    }

    #[test]
    fn dirent_value_zero_is_missing() {
        let data = br#"[{"ino":1,"mode":16877,"size":0,"dirents":{".":1,"..":1,"ghost":0}}]"#;
        let tree = Tree::load(data).unwrap();
        assert!(tree.resolve("/ghost").is_none());
    }
}
