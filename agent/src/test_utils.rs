//! Shared test utilities for the agent crate.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use crate::ops::SocketOps;
use crate::registry::PathSet;
use crate::sockaddr::{Credentials, SockAddr};
use crate::socket::Context;

/// A call made through [`MockOps`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Socket(libc::c_int),
    Bind(RawFd, SockAddr),
    Listen(RawFd),
    Connect(RawFd, SockAddr),
    GetSockName(RawFd),
    SetSockOpt(RawFd, libc::c_int, libc::c_int),
    Ioctl(RawFd, libc::Ioctl, libc::c_int),
    PeerCredentials(RawFd),
    StatusFlags(RawFd),
    SetStatusFlags(RawFd),
    IsCloexec(RawFd),
    DupOnto(RawFd, RawFd),
    Close(RawFd),
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    next_fd: RawFd,
    setsockopt_failures: HashMap<libc::c_int, libc::c_int>,
    bind_failure: Option<libc::c_int>,
    connect_failure: Option<libc::c_int>,
    credentials: Option<Credentials>,
    socknames: HashMap<RawFd, SockAddr>,
}

/// Scripted [`SocketOps`] that records every call instead of touching the
/// kernel. New descriptors are numbered from 100.
pub struct MockOps {
    state: Mutex<MockState>,
}

impl MockOps {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_fd: 100,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn fail_setsockopt(&self, name: libc::c_int, errno: libc::c_int) {
        self.state().setsockopt_failures.insert(name, errno);
    }

    pub fn fail_bind(&self, errno: Option<libc::c_int>) {
        self.state().bind_failure = errno;
    }

    pub fn fail_connect(&self, errno: Option<libc::c_int>) {
        self.state().connect_failure = errno;
    }

    pub fn set_peer_credentials(&self, cred: Credentials) {
        self.state().credentials = Some(cred);
    }

    pub fn set_sockname(&self, fd: RawFd, addr: SockAddr) {
        self.state().socknames.insert(fd, addr);
    }
}

fn fail(errno: Option<libc::c_int>) -> io::Result<()> {
    match errno {
        Some(e) => Err(io::Error::from_raw_os_error(e)),
        None => Ok(()),
    }
}

impl SocketOps for MockOps {
    fn socket(
        &self,
        domain: libc::c_int,
        _ty: libc::c_int,
        _protocol: libc::c_int,
    ) -> io::Result<RawFd> {
        let mut state = self.state();
        state.calls.push(Call::Socket(domain));
        let fd = state.next_fd;
        state.next_fd += 1;
        Ok(fd)
    }

    fn bind(&self, fd: RawFd, addr: &SockAddr) -> io::Result<()> {
        self.record(Call::Bind(fd, addr.clone()));
        let failure = self.state().bind_failure;
        fail(failure)
    }

    fn listen(&self, fd: RawFd, _backlog: libc::c_int) -> io::Result<()> {
        self.record(Call::Listen(fd));
        Ok(())
    }

    fn connect(&self, fd: RawFd, addr: &SockAddr) -> io::Result<()> {
        self.record(Call::Connect(fd, addr.clone()));
        let failure = self.state().connect_failure;
        fail(failure)
    }

    fn getsockname(&self, fd: RawFd) -> io::Result<SockAddr> {
        self.record(Call::GetSockName(fd));
        self.state()
            .socknames
            .get(&fd)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOTSOCK))
    }

    fn setsockopt(
        &self,
        fd: RawFd,
        level: libc::c_int,
        name: libc::c_int,
        _value: &[u8],
    ) -> io::Result<()> {
        self.record(Call::SetSockOpt(fd, level, name));
        let failure = self.state().setsockopt_failures.get(&name).copied();
        fail(failure)
    }

    fn ioctl_int(&self, fd: RawFd, request: libc::Ioctl, value: libc::c_int) -> io::Result<()> {
        self.record(Call::Ioctl(fd, request, value));
        Ok(())
    }

    fn peer_credentials(&self, fd: RawFd) -> io::Result<Credentials> {
        self.record(Call::PeerCredentials(fd));
        self.state()
            .credentials
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOTCONN))
    }

    fn status_flags(&self, fd: RawFd) -> io::Result<libc::c_int> {
        self.record(Call::StatusFlags(fd));
        Ok(libc::O_RDWR)
    }

    fn set_status_flags(&self, fd: RawFd, _flags: libc::c_int) -> io::Result<()> {
        self.record(Call::SetStatusFlags(fd));
        Ok(())
    }

    fn is_cloexec(&self, fd: RawFd) -> io::Result<bool> {
        self.record(Call::IsCloexec(fd));
        Ok(false)
    }

    fn dup_onto(&self, src: RawFd, dst: RawFd, _cloexec: bool) -> io::Result<()> {
        self.record(Call::DupOnto(src, dst));
        Ok(())
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        self.record(Call::Close(fd));
        Ok(())
    }
}

/// A state machine context on top of a fresh [`MockOps`].
pub fn mock_context() -> (Arc<MockOps>, Context) {
    let ops = Arc::new(MockOps::new());
    let context = Context {
        ops: ops.clone(),
        paths: Arc::new(PathSet::default()),
        port_range: (50000, 50099),
    };
    (ops, context)
}
