//! Shared fixtures for tests across the workspace.

use lazy_static::lazy_static;

use crate::{CasDigest, Tree};

pub const HELLO_BLOB: &[u8] = b"hi\n";
pub const NESTED_BLOB: &[u8] = b"nested body\n";

lazy_static! {
    pub static ref HELLO_DIGEST: CasDigest = CasDigest::from_bytes(HELLO_BLOB);
    pub static ref NESTED_DIGEST: CasDigest = CasDigest::from_bytes(NESTED_BLOB);
}

/// A small well-formed tree, parsed through the manifest wire form:
///
/// ```text
/// /
/// ├── hello.txt        "hi\n"
/// ├── link -> hello.txt
/// └── sub/
///     └── nested.txt   "nested body\n"
/// ```
pub fn sample_tree() -> Tree {
    let manifest = serde_json::json!([
        {
            "ino": 1, "mode": libc::S_IFDIR as u32 | 0o755, "size": 0,
            "dirents": { ".": 1, "..": 1, "hello.txt": 2, "link": 3, "sub": 4 }
        },
        {
            "ino": 2, "mode": libc::S_IFREG as u32 | 0o644, "size": HELLO_BLOB.len(),
            "value": HELLO_DIGEST.to_string()
        },
        {
            "ino": 3, "mode": libc::S_IFLNK as u32 | 0o777, "size": "hello.txt".len(),
            "value": "hello.txt"
        },
        {
            "ino": 4, "mode": libc::S_IFDIR as u32 | 0o755, "size": 0,
            "dirents": { ".": 4, "..": 1, "nested.txt": 5 }
        },
        {
            "ino": 5, "mode": libc::S_IFREG as u32 | 0o644, "size": NESTED_BLOB.len(),
            "value": NESTED_DIGEST.to_string()
        },
    ]);
    Tree::load(&serde_json::to_vec(&manifest).expect("fixture must serialize"))
        .expect("fixture manifest must be well-formed")
}
