//! Disposable Unix sockets nobody else can reach.

use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use sockshim_protocol::SocketType;
use tempfile::TempDir;

use crate::ops::SocketOps;
use crate::sockaddr::SockAddr;

/// A socket path inside a private temporary directory. The directory (and
/// the receiving socket, if any) is removed on drop.
pub struct BlackHole {
    path: PathBuf,
    receiver: Option<(Arc<dyn SocketOps>, RawFd)>,
    // Dropped after the receiver is closed.
    _dir: TempDir,
}

impl BlackHole {
    /// Reserve a fresh path. Nothing listens on it.
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("sockshim-bh-").tempdir()?;
        Ok(Self {
            path: dir.path().join("socket"),
            receiver: None,
            _dir: dir,
        })
    }

    /// A black hole with a socket bound to it that accepts connections (or
    /// datagrams) and never reads from them.
    pub fn with_receiver(ops: Arc<dyn SocketOps>, socket_type: SocketType) -> io::Result<Self> {
        let mut hole = Self::new()?;
        let ty = match socket_type {
            SocketType::Tcp => libc::SOCK_STREAM,
            SocketType::Udp => libc::SOCK_DGRAM,
        };
        let fd = ops.socket(libc::AF_UNIX, ty | libc::SOCK_CLOEXEC, 0)?;
        hole.receiver = Some((ops.clone(), fd));
        ops.bind(fd, &hole.addr()?)?;
        if socket_type == SocketType::Tcp {
            ops.listen(fd, libc::SOMAXCONN)?;
        }
        debug!("black hole receiver fd {} at {}", fd, hole.path.display());
        Ok(hole)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn addr(&self) -> io::Result<SockAddr> {
        SockAddr::unix(self.path.clone())
    }
}

impl Drop for BlackHole {
    fn drop(&mut self) {
        if let Some((ops, fd)) = self.receiver.take() {
            let _ = ops.close(fd);
        }
    }
}
