//! Content-addressed storage primitives for merklefs: the manifest tree
//! and its index, the local object pool, the offline builder and bundler,
//! and a FUSE adapter serving a tree read-only.
//!
//! The online pieces (HTTP fetch, tracker discovery, configuration, the
//! CLI) live in the `merklefs-store` crate, which implements this crate's
//! [pool::ObjectService] with a lazily fetching resolver.

mod digests;
mod errors;

pub mod fixtures;
pub mod import;
pub mod metadata;
pub mod pool;

#[cfg(feature = "fuse")]
pub mod fs;

pub use digests::{CasDigest, DIGEST_LEN};
pub use errors::Error;
pub use metadata::{ContentRef, Node, NodeAttr, NodeKind, Tree};
