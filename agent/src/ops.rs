//! The real socket primitive the state machine drives.

use std::io;
use std::os::fd::RawFd;

use crate::sockaddr::{Credentials, SockAddr};

/// Socket calls as performed against the kernel, bypassing the agent's own
/// overrides. Failures carry the raw OS errno.
pub trait SocketOps: Send + Sync {
    fn socket(&self, domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int)
        -> io::Result<RawFd>;

    fn bind(&self, fd: RawFd, addr: &SockAddr) -> io::Result<()>;

    fn listen(&self, fd: RawFd, backlog: libc::c_int) -> io::Result<()>;

    fn connect(&self, fd: RawFd, addr: &SockAddr) -> io::Result<()>;

    fn getsockname(&self, fd: RawFd) -> io::Result<SockAddr>;

    fn setsockopt(
        &self,
        fd: RawFd,
        level: libc::c_int,
        name: libc::c_int,
        value: &[u8],
    ) -> io::Result<()>;

    /// An ioctl taking a pointer to an `int`.
    fn ioctl_int(&self, fd: RawFd, request: libc::Ioctl, value: libc::c_int) -> io::Result<()>;

    /// uid, gid and pid of the process on the other end of `fd`.
    fn peer_credentials(&self, fd: RawFd) -> io::Result<Credentials>;

    /// File status flags (`F_GETFL`).
    fn status_flags(&self, fd: RawFd) -> io::Result<libc::c_int>;

    fn set_status_flags(&self, fd: RawFd, flags: libc::c_int) -> io::Result<()>;

    fn is_cloexec(&self, fd: RawFd) -> io::Result<bool>;

    /// Make `dst` refer to the socket of `src`, atomically replacing it.
    fn dup_onto(&self, src: RawFd, dst: RawFd, cloexec: bool) -> io::Result<()>;

    fn close(&self, fd: RawFd) -> io::Result<()>;
}

pub(crate) fn errno(code: libc::c_int) -> io::Error {
    io::Error::from_raw_os_error(code)
}
