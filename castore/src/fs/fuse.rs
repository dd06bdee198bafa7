//! Kernel mounting for a [MerkleFs].
//!
//! A [Mount] owns the FUSE session and one channel worker per serving
//! thread. The served tree is immutable, so the session is always
//! established read-only; writes never reach the filesystem layer.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use fuse_backend_rs::api::server::Server;
use fuse_backend_rs::transport::{FuseChannel, FuseSession};
use tracing::{instrument, warn};

use super::MerkleFs;
use crate::pool::ObjectService;

/// Errno the transport reports on the wakeup after the session fd went
/// away, i.e. the session was shut down.
#[cfg(target_os = "linux")]
const SESSION_CLOSED: libc::c_int = libc::EBADFD;
#[cfg(target_os = "macos")]
const SESSION_CLOSED: libc::c_int = libc::EBADF;

/// A mounted [MerkleFs]: the FUSE session plus its worker threads.
/// Unmounts on drop if still serving.
pub struct Mount {
    session: FuseSession,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Mount {
    /// Mounts `fs` at `mountpoint` and starts `threads` request workers.
    #[instrument(skip(fs, mountpoint), fields(mountpoint = ?mountpoint), err)]
    pub fn new<OS>(
        fs: MerkleFs<OS>,
        mountpoint: &Path,
        threads: usize,
        allow_other: bool,
    ) -> io::Result<Self>
    where
        OS: ObjectService + 'static,
    {
        let mut session =
            FuseSession::new(mountpoint, "merklefs", "", true).map_err(session_error)?;
        #[cfg(target_os = "linux")]
        session.set_allow_other(allow_other);
        #[cfg(not(target_os = "linux"))]
        let _ = allow_other;
        session.mount().map_err(session_error)?;

        let server = Arc::new(Server::new(Arc::new(fs)));
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let server = server.clone();
            let channel = session.new_channel().map_err(session_error)?;
            workers.push(
                thread::Builder::new()
                    .name(format!("merklefs-fuse-{}", i))
                    .spawn(move || serve_channel(server, channel))?,
            );
        }

        Ok(Mount { session, workers })
    }

    /// Blocks until every worker exited, i.e. the session ended.
    pub fn wait(&mut self) {
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    /// Tears the mount down and waits for the workers. A session that was
    /// already unmounted externally only needs the join.
    #[instrument(skip_all, err)]
    pub fn unmount(&mut self) -> io::Result<()> {
        if !self.workers.iter().all(thread::JoinHandle::is_finished) {
            self.session.umount().map_err(session_error)?;
        }
        self.wait();
        Ok(())
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            if let Err(error) = self.unmount() {
                warn!(?error, "failed to unmount fuse filesystem");
            }
        }
    }
}

/// One worker: pulls requests off the channel and dispatches them into the
/// filesystem until the session goes away.
fn serve_channel<OS>(server: Arc<Server<Arc<MerkleFs<OS>>>>, mut channel: FuseChannel)
where
    OS: ObjectService + 'static,
{
    loop {
        match channel.get_request() {
            Ok(Some((reader, writer))) => {
                if let Err(e) = server.handle_message(reader, writer.into(), None, None) {
                    match e {
                        fuse_backend_rs::Error::EncodeMessage(e)
                            if e.raw_os_error() == Some(SESSION_CLOSED) =>
                        {
                            break;
                        }
                        error => warn!(?error, "failed to handle fuse request"),
                    }
                }
            }
            // the channel yields no request once the session is closed
            Ok(None) => break,
            Err(error) => {
                warn!(?error, "fuse channel broke");
                break;
            }
        }
    }
}

fn session_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}
