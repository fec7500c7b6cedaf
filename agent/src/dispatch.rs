//! Routing of intercepted calls: rule decisions, the socket registry and
//! the per-socket state machine.
//!
//! Every entry point returns `None` for descriptors the agent does not
//! track, in which case the caller performs the real call unchanged.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use log::{debug, info};
use sockshim_policy::{RuleEngine, Verdict};
use sockshim_protocol::{Direction, SocketType};

use crate::activation::ActivationSource;
use crate::ops::{errno, SocketOps};
use crate::registry::{lock, PathSet, Registry, SocketRef};
use crate::sockaddr::SockAddr;
use crate::socket::{Context, Socket};

/// Where a datagram addressed by the program should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    /// Send to this Unix address instead.
    Deliver(SockAddr),
    /// Drop it and report it as sent.
    Discard,
    /// Send without an address; the backing is already connected.
    Connected,
}

pub struct Shim {
    engine: RuleEngine,
    context: Context,
    registry: Registry,
    activation: Box<dyn ActivationSource>,
}

impl Shim {
    pub fn new(
        engine: RuleEngine,
        ops: Arc<dyn SocketOps>,
        port_range: (u16, u16),
        activation: Box<dyn ActivationSource>,
    ) -> Self {
        Self {
            engine,
            context: Context {
                ops,
                paths: Arc::new(PathSet::default()),
                port_range,
            },
            registry: Registry::default(),
            activation,
        }
    }

    /// Start tracking the result of a successful `socket()` call. Returns
    /// whether the socket is one we take over.
    pub fn on_socket(
        &self,
        fd: RawFd,
        domain: libc::c_int,
        type_arg: libc::c_int,
        protocol: libc::c_int,
    ) -> bool {
        let Some((family, socket_type)) = Socket::classify(domain, type_arg, protocol) else {
            return false;
        };
        self.registry.insert(Socket::new(
            fd,
            family,
            socket_type,
            type_arg,
            protocol,
            self.context.clone(),
        ));
        debug!("fd {}: tracking {:?} {} socket", fd, family, socket_type);
        true
    }

    pub fn is_tracked(&self, fd: RawFd) -> bool {
        self.registry.contains(fd)
    }

    pub fn is_converted(&self, fd: RawFd) -> bool {
        self.registry.get(fd).is_some_and(|socket| {
            let socket = lock(&socket);
            socket.is_converted()
        })
    }

    /// Whether datagram sources on `fd` must be rewritten.
    pub fn rewrites_source(&self, fd: RawFd) -> bool {
        self.registry.get(fd).is_some_and(|socket| {
            let socket = lock(&socket);
            socket.is_converted() && socket.socket_type() == SocketType::Udp
        })
    }

    fn verdict(&self, direction: Direction, socket: &Socket, addr: &SockAddr) -> Verdict {
        self.engine
            .evaluate(direction, socket.socket_type(), addr.host().as_deref(), addr.port())
            .verdict
    }

    /// The tracked socket for `fd`, if `addr` is an IP address we handle.
    fn target(&self, fd: RawFd, addr: Option<&SockAddr>) -> Option<SocketRef> {
        match addr {
            Some(SockAddr::Inet(_)) => self.registry.get(fd),
            _ => None,
        }
    }

    pub fn bind(&self, fd: RawFd, addr: Option<&SockAddr>) -> Option<io::Result<()>> {
        let socket = self.target(fd, addr)?;
        let addr = addr?;
        let mut socket = lock(&socket);
        let result = match self.verdict(Direction::Incoming, &socket, addr) {
            Verdict::Translate(template) => socket.bind(addr, Some(&template)),
            Verdict::Reject(code) => Err(errno(code)),
            Verdict::BlackHole => socket.bind(addr, None),
            Verdict::Activate(name) => self
                .activation
                .take(name.as_deref())
                .and_then(|activation| socket.activate(activation, addr)),
        };
        Some(result)
    }

    pub fn listen(&self, fd: RawFd, backlog: libc::c_int) -> Option<io::Result<()>> {
        let socket = self.registry.get(fd)?;
        let result = lock(&socket).listen(backlog);
        Some(result)
    }

    pub fn connect(&self, fd: RawFd, addr: Option<&SockAddr>) -> Option<io::Result<()>> {
        let socket = self.target(fd, addr)?;
        let addr = addr?;
        let mut socket = lock(&socket);
        if let Some(result) = socket.connect_peermap(addr) {
            return Some(result);
        }
        Some(self.connect_outgoing(&mut socket, addr))
    }

    fn connect_outgoing(&self, socket: &mut Socket, addr: &SockAddr) -> io::Result<()> {
        match self.verdict(Direction::Outgoing, socket, addr) {
            Verdict::Translate(template) => socket.connect(addr, &template),
            Verdict::Reject(code) => Err(errno(code)),
            Verdict::BlackHole => socket.connect_black_hole(addr),
            Verdict::Activate(_) => {
                info!(
                    "fd {}: activation rule matched an outgoing connection",
                    socket.fd()
                );
                Err(errno(libc::EINVAL))
            }
        }
    }

    /// Track a descriptor returned by a real `accept()` on the listener
    /// `fd`. Returns the peer address to present.
    pub fn accept(
        &self,
        fd: RawFd,
        new_fd: RawFd,
        real_peer: Option<SockAddr>,
    ) -> Option<io::Result<SockAddr>> {
        let listener = self.registry.get(fd)?;
        let accepted = lock(&listener).accept(new_fd, real_peer);
        let result = accepted.and_then(|socket| {
            let peer = socket.getpeername()?;
            self.registry.insert(socket);
            debug!("fd {}: accepted fd {} from {}", fd, new_fd, peer);
            Ok(peer)
        });
        Some(result)
    }

    pub fn getsockname(&self, fd: RawFd) -> Option<io::Result<SockAddr>> {
        let socket = self.registry.get(fd)?;
        let result = lock(&socket).getsockname();
        Some(result)
    }

    pub fn getpeername(&self, fd: RawFd) -> Option<io::Result<SockAddr>> {
        let socket = self.registry.get(fd)?;
        let result = lock(&socket).getpeername();
        Some(result)
    }

    pub fn setsockopt(
        &self,
        fd: RawFd,
        level: libc::c_int,
        name: libc::c_int,
        value: &[u8],
    ) -> Option<io::Result<()>> {
        let socket = self.registry.get(fd)?;
        let result = lock(&socket).setsockopt(level, name, value);
        Some(result)
    }

    pub fn ioctl_int(
        &self,
        fd: RawFd,
        request: libc::Ioctl,
        value: libc::c_int,
    ) -> Option<io::Result<()>> {
        let socket = self.registry.get(fd)?;
        let result = lock(&socket).ioctl_int(request, value);
        Some(result)
    }

    /// Where data for `addr` sent on `fd` should go.
    ///
    /// A stream socket that is not connected yet (`MSG_FASTOPEN`) is
    /// connected first, under the same rules as `connect()`.
    pub fn send_target(&self, fd: RawFd, addr: &SockAddr) -> Option<io::Result<SendTarget>> {
        let socket = self.target(fd, Some(addr))?;
        let mut socket = lock(&socket);
        if socket.socket_type() == SocketType::Tcp {
            let result = if socket.is_converted() {
                Ok(SendTarget::Connected)
            } else {
                self.connect_outgoing(&mut socket, addr)
                    .map(|()| SendTarget::Connected)
            };
            return Some(result);
        }
        if let Some(dest) = socket.rewrite_dest_peermap(addr) {
            return Some(Ok(SendTarget::Deliver(dest)));
        }
        let result = match self.verdict(Direction::Outgoing, &socket, addr) {
            Verdict::Translate(template) => socket
                .rewrite_dest(addr, &template)
                .map(SendTarget::Deliver),
            Verdict::Reject(code) => Err(errno(code)),
            Verdict::BlackHole => Ok(SendTarget::Discard),
            Verdict::Activate(_) => Err(errno(libc::EINVAL)),
        };
        Some(result)
    }

    /// The address to present for a datagram received on `fd` from the
    /// Unix address `real`. `Some(None)` means the sender is unnamed.
    pub fn recv_source(&self, fd: RawFd, real: &SockAddr) -> Option<Option<SockAddr>> {
        let socket = self.registry.get(fd)?;
        let mut socket = lock(&socket);
        if !socket.is_converted() || socket.socket_type() != SocketType::Udp {
            return None;
        }
        Some(socket.rewrite_src(real))
    }

    pub fn close(&self, fd: RawFd) -> Option<io::Result<()>> {
        let socket = self.registry.remove(fd)?;
        let result = lock(&socket).close();
        Some(result)
    }
}
