//! Per-socket state: the IP identity the program sees and the Unix socket
//! actually backing it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, MutexGuard};

use log::{debug, info, warn};
use sockshim_protocol::SocketType;

use crate::activation::Activation;
use crate::blackhole::BlackHole;
use crate::ops::{errno, SocketOps};
use crate::ports::{self, PortAllocator, SharedPorts};
use crate::registry::{ConnectClaim, PathSet};
use crate::sockaddr::{format_sockpath, random_host, Credentials, Family, SockAddr};
use crate::sockopts::{is_ip_only, OptionCache};

/// What every socket needs from the outside world.
#[derive(Clone)]
pub struct Context {
    pub ops: Arc<dyn SocketOps>,
    pub paths: Arc<PathSet>,
    pub port_range: (u16, u16),
}

/// What the descriptor currently refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Still the IP socket the program created.
    Declared,
    /// A Unix socket exists and options are being replayed onto it.
    Converting,
    /// The descriptor now refers to a Unix socket.
    Converted,
}

pub struct Socket {
    fd: RawFd,
    family: Family,
    socket_type: SocketType,
    type_arg: libc::c_int,
    protocol: libc::c_int,
    backing: Backing,
    bound: bool,
    activated: bool,
    black_holed: bool,
    binding: Option<SockAddr>,
    connection: Option<SockAddr>,
    /// Path this socket bound, claimed as bound.
    bound_path: Option<PathBuf>,
    /// Path this socket connected to, claimed as connected.
    connected_path: Option<PathBuf>,
    options: OptionCache,
    /// Shared with the listener this socket was accepted from.
    ports: SharedPorts,
    /// Port made up for the peer of an accepted socket, held in `ports`.
    peer_port: Option<u16>,
    peermap: HashMap<SocketAddr, PathBuf>,
    revpeermap: HashMap<PathBuf, SocketAddr>,
    black_holes: Vec<BlackHole>,
    context: Context,
}

impl Socket {
    /// Family and type of a `socket()` call we take over, if any.
    pub fn classify(
        domain: libc::c_int,
        type_arg: libc::c_int,
        protocol: libc::c_int,
    ) -> Option<(Family, SocketType)> {
        let family = Family::from_domain(domain)?;
        let socket_type = match type_arg & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) {
            libc::SOCK_STREAM if matches!(protocol, 0 | libc::IPPROTO_TCP) => SocketType::Tcp,
            libc::SOCK_DGRAM if matches!(protocol, 0 | libc::IPPROTO_UDP) => SocketType::Udp,
            _ => return None,
        };
        Some((family, socket_type))
    }

    pub fn new(
        fd: RawFd,
        family: Family,
        socket_type: SocketType,
        type_arg: libc::c_int,
        protocol: libc::c_int,
        context: Context,
    ) -> Self {
        Self {
            fd,
            family,
            socket_type,
            type_arg,
            protocol,
            backing: Backing::Declared,
            bound: false,
            activated: false,
            black_holed: false,
            binding: None,
            connection: None,
            bound_path: None,
            connected_path: None,
            options: OptionCache::default(),
            ports: ports::shared(context.port_range),
            peer_port: None,
            peermap: HashMap::new(),
            revpeermap: HashMap::new(),
            black_holes: Vec::new(),
            context,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub fn backing(&self) -> Backing {
        self.backing
    }

    pub fn is_converted(&self) -> bool {
        self.backing == Backing::Converted
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn is_black_holed(&self) -> bool {
        self.black_holed
    }

    pub fn bound_path(&self) -> Option<&Path> {
        self.bound_path.as_deref()
    }

    fn ops(&self) -> &dyn SocketOps {
        &*self.context.ops
    }

    fn ports(&self) -> MutexGuard<'_, PortAllocator> {
        ports::lock(&self.ports)
    }

    /// Replace the IP socket behind the descriptor by a Unix socket, or by
    /// `existing` when one is supplied. On failure the descriptor is left
    /// untouched.
    fn make_unix(&mut self, existing: Option<RawFd>) -> io::Result<()> {
        if self.backing == Backing::Converted {
            return Ok(());
        }
        let ops = self.context.ops.clone();
        let new_fd = match existing {
            Some(fd) => fd,
            None => ops.socket(libc::AF_UNIX, self.type_arg, 0)?,
        };

        self.backing = Backing::Converting;
        let result = self
            .options
            .replay(&*ops, self.fd, new_fd)
            .and_then(|()| ops.is_cloexec(self.fd))
            .and_then(|cloexec| ops.dup_onto(new_fd, self.fd, cloexec));
        if existing.is_none() {
            let _ = ops.close(new_fd);
        }

        match result {
            Ok(()) => {
                self.backing = Backing::Converted;
                debug!("fd {}: now backed by a Unix socket", self.fd);
                Ok(())
            }
            Err(e) => {
                self.backing = Backing::Declared;
                warn!("fd {}: conversion failed: {}", self.fd, e);
                Err(e)
            }
        }
    }

    pub fn setsockopt(
        &mut self,
        level: libc::c_int,
        name: libc::c_int,
        value: &[u8],
    ) -> io::Result<()> {
        if self.backing == Backing::Converted {
            if is_ip_only(level, name) {
                debug!("fd {}: ignoring IP option {}/{}", self.fd, level, name);
                return Ok(());
            }
            return self.ops().setsockopt(self.fd, level, name, value);
        }
        self.ops().setsockopt(self.fd, level, name, value)?;
        self.options.cache_sockopt(level, name, value);
        Ok(())
    }

    pub fn ioctl_int(&mut self, request: libc::Ioctl, value: libc::c_int) -> io::Result<()> {
        self.ops().ioctl_int(self.fd, request, value)?;
        if self.backing != Backing::Converted {
            self.options.cache_ioctl(request, value);
        }
        Ok(())
    }

    /// Bind to the path `template` resolves to for `addr`, or to a black
    /// hole when `template` is `None`, the socket is already black-holed or
    /// the path is in use by this process.
    pub fn bind(&mut self, addr: &SockAddr, template: Option<&str>) -> io::Result<()> {
        if self.bound {
            return Err(errno(libc::EINVAL));
        }
        self.make_unix(None)?;

        let mut local = addr.clone();
        let mut ephemeral = None;
        if local.port() == Some(0) {
            let port = self.ports().acquire();
            local.set_port(port);
            ephemeral = Some(port);
        }

        if let Err(e) = self.bind_backing(&local, template) {
            if let Some(port) = ephemeral {
                self.ports().release(port);
            }
            return Err(e);
        }

        if let Some(port) = local.port() {
            self.ports().reserve(port);
        }
        self.bound = true;
        self.binding = Some(local);
        Ok(())
    }

    fn bind_backing(&mut self, local: &SockAddr, template: Option<&str>) -> io::Result<()> {
        let template = match template {
            Some(template) if !self.black_holed => template,
            _ => return self.bind_black_hole(),
        };
        let path = PathBuf::from(format_sockpath(template, local, Some(self.socket_type)));
        let dest = SockAddr::unix(path.clone())?;
        if !self.context.paths.try_claim(&path) {
            info!(
                "fd {}: {} is already in use, binding to a black hole",
                self.fd,
                path.display()
            );
            return self.bind_black_hole();
        }
        if let Err(e) = self.ops().bind(self.fd, &dest) {
            self.context.paths.release(&path);
            return Err(e);
        }
        debug!("fd {}: {} bound to {}", self.fd, local, path.display());
        self.bound_path = Some(path);
        Ok(())
    }

    fn bind_black_hole(&mut self) -> io::Result<()> {
        let hole = BlackHole::new()?;
        self.ops().bind(self.fd, &hole.addr()?)?;
        debug!("fd {}: bound to black hole {}", self.fd, hole.path().display());
        self.black_holed = true;
        self.black_holes.push(hole);
        Ok(())
    }

    /// Take over a descriptor from the service manager. The program's
    /// `declared` address is what it will see as its own unless the
    /// descriptor is bound to an IP address.
    pub fn activate(&mut self, activation: Activation, declared: &SockAddr) -> io::Result<()> {
        if self.bound || self.backing == Backing::Converted {
            return Err(errno(libc::EINVAL));
        }
        self.make_unix(Some(activation.fd))?;
        self.bound = true;
        self.activated = true;
        self.binding = Some(match activation.address {
            Some(addr @ SockAddr::Inet(_)) => addr,
            _ => declared.clone(),
        });
        info!("fd {}: activated from fd {}", self.fd, activation.fd);
        Ok(())
    }

    pub fn listen(&mut self, backlog: libc::c_int) -> io::Result<()> {
        if self.activated {
            return Ok(());
        }
        self.ops().listen(self.fd, backlog)
    }

    /// Connect a datagram socket to a peer seen before, if it is one.
    pub fn connect_peermap(&mut self, addr: &SockAddr) -> Option<io::Result<()>> {
        if self.socket_type != SocketType::Udp {
            return None;
        }
        let path = self.peermap.get(&addr.socket_addr()?)?.clone();
        let result = SockAddr::unix(path).and_then(|dest| self.ops().connect(self.fd, &dest));
        if result.is_ok() {
            self.connection = Some(addr.clone());
        }
        Some(result)
    }

    pub fn connect(&mut self, addr: &SockAddr, template: &str) -> io::Result<()> {
        if self.socket_type == SocketType::Udp && self.binding.is_none() {
            let dest = self.rewrite_dest(addr, template)?;
            self.ops().connect(self.fd, &dest)?;
            self.connection = Some(addr.clone());
            return Ok(());
        }

        let path = PathBuf::from(format_sockpath(template, addr, Some(self.socket_type)));
        let dest = SockAddr::unix(path.clone())?;
        let remote_port = addr.port().ok_or_else(|| errno(libc::EADDRNOTAVAIL))?;
        self.make_unix(None)?;

        let claimed = match self.socket_type {
            SocketType::Tcp => match self.context.paths.claim_for_connect(&path) {
                ConnectClaim::Claimed => true,
                ConnectClaim::Listener => false,
                ConnectClaim::Taken => {
                    info!(
                        "fd {}: {} is already connected, connecting to a black hole",
                        self.fd,
                        path.display()
                    );
                    return self.connect_black_hole(addr);
                }
            },
            SocketType::Udp => false,
        };

        if let Err(e) = self.ops().connect(self.fd, &dest) {
            if claimed {
                self.context.paths.release(&path);
            }
            return Err(e);
        }
        debug!("fd {}: {} connected via {}", self.fd, addr, path.display());
        if claimed {
            self.connected_path = Some(path);
        }

        if self.binding.is_none() {
            self.ports().reserve(remote_port);
            self.create_binding(addr);
        }
        self.connection = Some(addr.clone());
        Ok(())
    }

    /// Connect to a receiver nobody ever reads from.
    pub fn connect_black_hole(&mut self, addr: &SockAddr) -> io::Result<()> {
        self.make_unix(None)?;
        let hole = BlackHole::with_receiver(self.context.ops.clone(), self.socket_type)?;
        self.ops().connect(self.fd, &hole.addr()?)?;
        self.black_holed = true;
        self.black_holes.push(hole);

        if self.binding.is_none() {
            if let Some(port) = addr.port() {
                self.ports().reserve(port);
            }
            self.create_binding(addr);
        }
        self.connection = Some(addr.clone());
        Ok(())
    }

    /// Make up a local address for a socket that never bound explicitly.
    fn create_binding(&mut self, peer: &SockAddr) {
        let host = match peer.ip() {
            Some(ip) if ip.is_loopback() => ip,
            _ => Credentials::current().host(self.family),
        };
        let port = self.ports().acquire();
        self.binding = Some(SockAddr::inet(host, port));
    }

    /// Wrap a descriptor returned by a real `accept()` on this listener.
    pub fn accept(&mut self, new_fd: RawFd, real_peer: Option<SockAddr>) -> io::Result<Socket> {
        let local = self.binding.clone().ok_or_else(|| errno(libc::EINVAL))?;
        let local_port = local.port().ok_or_else(|| errno(libc::EINVAL))?;

        let mut peer_port = None;
        let peer = match real_peer {
            Some(peer @ SockAddr::Inet(_)) => peer,
            _ => {
                let host = match local.ip() {
                    Some(ip) if ip.is_loopback() => ip,
                    _ => self
                        .ops()
                        .peer_credentials(new_fd)
                        .map_err(|e| {
                            warn!("fd {}: no peer credentials: {}", new_fd, e);
                            errno(libc::EINVAL)
                        })?
                        .host(self.family),
                };
                let port = self.ports().acquire();
                peer_port = Some(port);
                SockAddr::inet(host, port)
            }
        };

        let mut socket = Socket::new(
            new_fd,
            self.family,
            self.socket_type,
            self.type_arg,
            self.protocol,
            self.context.clone(),
        );
        socket.backing = Backing::Converted;
        socket.ports = self.ports.clone();
        socket.peer_port = peer_port;
        self.ports().reserve(local_port);
        socket.binding = Some(local);
        socket.connection = Some(peer);
        Ok(socket)
    }

    /// The address to present for a datagram received from `real`.
    ///
    /// Each distinct sender path gets one made up address that stays the
    /// same for the lifetime of the socket. Unnamed senders have none.
    pub fn rewrite_src(&mut self, real: &SockAddr) -> Option<SockAddr> {
        let binding = self.binding.as_ref()?;
        let path = real.unix_path()?;
        if let Some(peer) = self.revpeermap.get(path) {
            return Some(SockAddr::Inet(*peer));
        }

        let host = match binding.ip() {
            Some(ip) if ip.is_loopback() => ip,
            _ => random_host(self.family),
        };
        let port = self.ports().acquire();
        let peer = SocketAddr::new(host, port);
        self.peermap.insert(peer, path.to_path_buf());
        self.revpeermap.insert(path.to_path_buf(), peer);
        debug!("fd {}: datagram peer {} is {}", self.fd, path.display(), peer);
        Some(SockAddr::Inet(peer))
    }

    /// Backing path of a datagram peer seen before.
    pub fn rewrite_dest_peermap(&self, addr: &SockAddr) -> Option<SockAddr> {
        let path = self.peermap.get(&addr.socket_addr()?)?;
        SockAddr::unix(path.clone()).ok()
    }

    /// Destination for a datagram sent to `addr`, giving the socket a
    /// black-holed binding first so the receiver can tell senders apart.
    pub fn rewrite_dest(&mut self, addr: &SockAddr, template: &str) -> io::Result<SockAddr> {
        if self.socket_type != SocketType::Udp {
            return Err(errno(libc::EINVAL));
        }
        let dest = SockAddr::unix(format_sockpath(template, addr, Some(self.socket_type)))?;
        self.make_unix(None)?;

        if self.binding.is_none() {
            let hole = BlackHole::new()?;
            self.ops().bind(self.fd, &hole.addr()?)?;
            self.black_holed = true;
            self.black_holes.push(hole);
            self.create_binding(addr);
        }
        Ok(dest)
    }

    pub fn getsockname(&self) -> io::Result<SockAddr> {
        self.binding.clone().ok_or_else(|| errno(libc::EFAULT))
    }

    pub fn getpeername(&self) -> io::Result<SockAddr> {
        self.connection.clone().ok_or_else(|| errno(libc::EFAULT))
    }

    /// Close the descriptor (unless it belongs to the service manager) and
    /// give up every path and port this socket holds.
    pub fn close(&mut self) -> io::Result<()> {
        let result = if self.activated {
            Ok(())
        } else {
            self.ops().close(self.fd)
        };
        self.release();
        result
    }

    fn release(&mut self) {
        if let Some(port) = self.peer_port.take() {
            self.ports().release(port);
        }
        if let Some(path) = self.bound_path.take() {
            if self.bound && !self.activated && !self.black_holed {
                let _ = std::fs::remove_file(&path);
            }
            self.context.paths.release(&path);
        }
        if let Some(path) = self.connected_path.take() {
            self.context.paths.release(&path);
        }
        self.black_holes.clear();
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.release();
    }
}
