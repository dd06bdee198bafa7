#![allow(clippy::unnecessary_cast)] // libc file type bits are u32 on Linux and u16 on MacOS

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One manifest record, one inode.
///
/// The wire form is a flat JSON object; [Node::kind] projects it into the
/// typed view the rest of the crate consumes. Empty optional fields are
/// omitted on output to keep manifests small, and unknown fields are
/// ignored on input.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "NodeWire")]
pub struct Node {
    /// 1-based dense index; equals position-in-array + 1.
    pub ino: u64,
    /// Full POSIX mode, including the file type bits.
    pub mode: u32,
    pub size: u64,
    /// Byte offset inside a bundle container; zero for standalone objects.
    #[serde(skip_serializing_if = "is_zero")]
    pub off: u64,
    /// Hex digest of the body for regular files, link target for symlinks.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// The remote copy of the body is a Zstandard frame.
    #[serde(skip_serializing_if = "is_false")]
    pub zstd: bool,
    /// Child name (including `.` and `..`) to child ino, for directories.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub dirents: BTreeMap<String, u64>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Input-side record accepting both manifest revisions: the unified `value`
/// field, and the older split `hash`/`link` pair.
#[derive(Deserialize)]
struct NodeWire {
    ino: u64,
    mode: u32,
    size: u64,
    #[serde(default)]
    off: u64,
    #[serde(default)]
    value: String,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    zstd: bool,
    #[serde(default)]
    dirents: BTreeMap<String, u64>,
}

impl From<NodeWire> for Node {
    fn from(w: NodeWire) -> Self {
        let value = if !w.value.is_empty() {
            w.value
        } else if !w.hash.is_empty() {
            w.hash
        } else {
            w.link
        };
        Node {
            ino: w.ino,
            mode: w.mode,
            size: w.size,
            off: w.off,
            value,
            zstd: w.zstd,
            dirents: w.dirents,
        }
    }
}

/// Typed view over a flat [Node].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind<'a> {
    Directory(&'a BTreeMap<String, u64>),
    File {
        /// Hex digest of the (possibly shared container) object.
        digest: &'a str,
        zstd: bool,
        off: u64,
    },
    Symlink {
        target: &'a str,
    },
    Unknown,
}

impl Node {
    pub fn kind(&self) -> NodeKind<'_> {
        match self.mode & libc::S_IFMT as u32 {
            t if t == libc::S_IFDIR as u32 => NodeKind::Directory(&self.dirents),
            t if t == libc::S_IFLNK as u32 && !self.value.is_empty() => NodeKind::Symlink {
                target: &self.value,
            },
            t if t == libc::S_IFREG as u32 && !self.value.is_empty() => NodeKind::File {
                digest: &self.value,
                zstd: self.zstd,
                off: self.off,
            },
            _ => NodeKind::Unknown,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind(), NodeKind::Directory(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind(), NodeKind::File { .. })
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind(), NodeKind::Symlink { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_node() -> Node {
        Node {
            ino: 2,
            mode: libc::S_IFREG as u32 | 0o644,
            size: 3,
            off: 0,
            value: "98ea6e4f216f2fb4b69fff9b3a44842c38686ca685f3f55dc48c5d3fb1107be4".into(),
            zstd: false,
            dirents: BTreeMap::new(),
        }
    }

    #[test]
    fn serialize_omits_empty_fields() {
        let json = serde_json::to_value(file_node()).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("ino"));
        assert!(obj.contains_key("value"));
        assert!(!obj.contains_key("off"));
        assert!(!obj.contains_key("zstd"));
        assert!(!obj.contains_key("dirents"));
    }

    #[test]
    fn roundtrip() {
        let node = file_node();
        let json = serde_json::to_vec(&node).unwrap();
        let back: Node = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn legacy_hash_and_link_fields_are_accepted() {
        let file: Node = serde_json::from_str(
            r#"{"ino":2,"mode":33188,"size":3,"hash":"98ea6e4f216f2fb4b69fff9b3a44842c38686ca685f3f55dc48c5d3fb1107be4"}"#,
        )
        .unwrap();
        assert!(matches!(file.kind(), NodeKind::File { .. }));

        let link: Node =
            serde_json::from_str(r#"{"ino":3,"mode":41471,"size":9,"link":"hello.txt"}"#).unwrap();
        assert_eq!(
            link.kind(),
            NodeKind::Symlink {
                target: "hello.txt"
            }
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let node: Node =
            serde_json::from_str(r#"{"ino":1,"mode":16877,"size":0,"future_field":true}"#).unwrap();
        assert_eq!(node.ino, 1);
    }

    #[test]
    fn missing_required_field_fails() {
        assert!(serde_json::from_str::<Node>(r#"{"ino":1,"size":0}"#).is_err());
    }

    #[test]
    fn kind_classification() {
        assert!(file_node().is_file());

        let dir = Node {
            ino: 1,
            mode: libc::S_IFDIR as u32 | 0o755,
            dirents: BTreeMap::from([(".".to_string(), 1), ("..".to_string(), 1)]),
            ..Default::default()
        };
        assert!(dir.is_dir());

        // a regular-file mode without a digest is not a usable file
        let bare = Node {
            ino: 4,
            mode: libc::S_IFREG as u32 | 0o644,
            ..Default::default()
        };
        assert_eq!(bare.kind(), NodeKind::Unknown);

        let fifo = Node {
            ino: 5,
            mode: libc::S_IFIFO as u32 | 0o644,
            ..Default::default()
        };
        assert_eq!(fifo.kind(), NodeKind::Unknown);
    }
}
