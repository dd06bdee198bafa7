//! The manifest model and the tree index layered on it.

mod bundle;
mod node;
mod tree;

pub use bundle::{bundle, Bref, BundleOptions, BREF_PENDING};
pub use node::{Node, NodeKind};
pub use tree::{ContentRef, NodeAttr, Tree};
