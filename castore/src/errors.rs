use thiserror::Error;

/// Errors surfaced by the metadata tree, the pool and the content
/// resolvers. Filesystem callbacks project these to negated POSIX errno
/// via [Error::errno].
#[derive(Debug, Error)]
pub enum Error {
    /// Path missing from the tree, or object still absent after a fetch.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested operation does not match the node type.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Local I/O failure (open, read, rename, stat).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote origin misbehaved: non-200 on a non-fallback path,
    /// transport error, or a malformed compressed stream.
    #[error("remote error: {0}")]
    Remote(String),

    /// Tracker unreachable or deadline exceeded.
    #[error("tracker rpc error: {0}")]
    Rpc(String),

    /// Malformed manifest or bundle reference. Fatal at load time.
    #[error("structural error: {0}")]
    Structural(String),
}

impl Error {
    /// The POSIX errno this error surfaces as at the filesystem boundary.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Remote(_) | Error::Rpc(_) | Error::Structural(_) => libc::EIO,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e,
            e => std::io::Error::from_raw_os_error(e.errno()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Structural(value.to_string())
    }
}
