//! Process-wide bookkeeping: tracked sockets by descriptor and the socket
//! paths currently in use.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::socket::Socket;

/// How a socket holds a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClaim {
    /// Bound by a socket of this process; removed from disk on close.
    Bound,
    /// Target of a live stream connection.
    Connected,
}

/// Outcome of [`PathSet::claim_for_connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectClaim {
    /// The path was free and now belongs to the caller.
    Claimed,
    /// A socket of this process is bound there; connect without a claim.
    Listener,
    /// Another live connection holds it.
    Taken,
}

/// Socket paths in use by this process.
#[derive(Debug, Default)]
pub struct PathSet {
    claims: Mutex<HashMap<PathBuf, PathClaim>>,
}

impl PathSet {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, PathClaim>> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim a path for binding. False if anything holds it already.
    pub fn try_claim(&self, path: &Path) -> bool {
        let mut claims = self.lock();
        if claims.contains_key(path) {
            return false;
        }
        claims.insert(path.to_path_buf(), PathClaim::Bound);
        true
    }

    pub fn claim_for_connect(&self, path: &Path) -> ConnectClaim {
        let mut claims = self.lock();
        match claims.get(path) {
            Some(PathClaim::Bound) => ConnectClaim::Listener,
            Some(PathClaim::Connected) => ConnectClaim::Taken,
            None => {
                claims.insert(path.to_path_buf(), PathClaim::Connected);
                ConnectClaim::Claimed
            }
        }
    }

    pub fn release(&self, path: &Path) {
        self.lock().remove(path);
    }

    #[cfg(test)]
    pub fn claim(&self, path: &Path) -> Option<PathClaim> {
        self.lock().get(path).copied()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// A tracked socket, shared between the registry and in-flight calls.
pub type SocketRef = Arc<Mutex<Socket>>;

/// Tracked sockets by descriptor.
#[derive(Default)]
pub struct Registry {
    sockets: Mutex<HashMap<RawFd, SocketRef>>,
}

impl Registry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RawFd, SocketRef>> {
        self.sockets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track `socket` under its descriptor, replacing a stale entry.
    pub fn insert(&self, socket: Socket) -> SocketRef {
        let fd = socket.fd();
        let socket = Arc::new(Mutex::new(socket));
        let stale = self.lock().insert(fd, socket.clone());
        // Dropped outside the lock, releasing its paths.
        drop(stale);
        socket
    }

    pub fn get(&self, fd: RawFd) -> Option<SocketRef> {
        self.lock().get(&fd).cloned()
    }

    pub fn remove(&self, fd: RawFd) -> Option<SocketRef> {
        self.lock().remove(&fd)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.lock().contains_key(&fd)
    }
}

/// Lock a tracked socket, ignoring poisoning.
pub fn lock(socket: &SocketRef) -> std::sync::MutexGuard<'_, Socket> {
    socket.lock().unwrap_or_else(|e| e.into_inner())
}
