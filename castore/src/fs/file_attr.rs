use fuse_backend_rs::abi::fuse_abi::Attr;

use crate::metadata::NodeAttr;

/// Projects tree attributes into the FUSE wire form. Timestamps stay at
/// the epoch; the manifest does not carry them.
pub(super) fn fuse_attr(attr: NodeAttr) -> Attr {
    Attr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks,
        blksize: attr.blksize,
        mode: attr.mode,
        nlink: attr.nlink,
        ..Default::default()
    }
}
