//! Socket addresses as seen by the program (IP) and by the kernel (Unix).

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use sockshim_protocol::SocketType;

/// Placeholder for template fields that cannot be resolved.
const UNKNOWN: &str = "unknown";

fn sun_path_offset() -> usize {
    mem::offset_of!(libc::sockaddr_un, sun_path)
}

/// Address family of a declared socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Inet,
    Inet6,
}

impl Family {
    pub fn from_domain(domain: libc::c_int) -> Option<Self> {
        match domain {
            libc::AF_INET => Some(Family::Inet),
            libc::AF_INET6 => Some(Family::Inet6),
            _ => None,
        }
    }
}

/// Peer credentials as reported by `SO_PEERCRED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub pid: libc::pid_t,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

impl Credentials {
    /// Credentials of this process.
    pub fn current() -> Self {
        // SAFETY: these calls cannot fail.
        unsafe {
            Self {
                pid: libc::getpid(),
                uid: libc::getuid(),
                gid: libc::getgid(),
            }
        }
    }

    /// A stable stand-in host for these credentials.
    ///
    /// IPv4 hosts live in 127.0.0.0/8 and are derived from a hash, IPv6
    /// hosts embed uid, gid and pid verbatim below `fd00::/16`.
    pub fn host(&self, family: Family) -> IpAddr {
        match family {
            Family::Inet => {
                let mut hash: u32 = 0x811c_9dc5;
                for byte in (self.uid.to_be_bytes().into_iter())
                    .chain(self.gid.to_be_bytes())
                    .chain(self.pid.to_be_bytes())
                {
                    hash ^= u32::from(byte);
                    hash = hash.wrapping_mul(0x0100_0193);
                }
                let [_, a, b, c] = hash.to_be_bytes();
                IpAddr::V4(Ipv4Addr::new(127, a, b, 1 + c % 254))
            }
            Family::Inet6 => {
                let pid = self.pid as u32;
                IpAddr::V6(Ipv6Addr::new(
                    0xfd00,
                    0,
                    (self.uid >> 16) as u16,
                    self.uid as u16,
                    (self.gid >> 16) as u16,
                    self.gid as u16,
                    (pid >> 16) as u16,
                    pid as u16,
                ))
            }
        }
    }
}

/// An arbitrary host of the given family for peers we know nothing about.
pub fn random_host(family: Family) -> IpAddr {
    let bits: [u8; 8] = rand::random();
    match family {
        Family::Inet => IpAddr::V4(Ipv4Addr::new(127, bits[0], bits[1], 1 + bits[2] % 254)),
        Family::Inet6 => IpAddr::V6(Ipv6Addr::new(
            0xfd00,
            1,
            0,
            0,
            u16::from_be_bytes([bits[0], bits[1]]),
            u16::from_be_bytes([bits[2], bits[3]]),
            u16::from_be_bytes([bits[4], bits[5]]),
            u16::from_be_bytes([bits[6], bits[7]]),
        )),
    }
}

/// A socket endpoint of either family we deal with.
///
/// `Unix` with an empty path is an unnamed socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SockAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl SockAddr {
    /// A Unix address for `path`, rejecting paths the kernel would not take.
    pub fn unix(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let bytes = path.as_os_str().as_bytes();
        let capacity = mem::size_of::<libc::sockaddr_un>() - sun_path_offset();
        if bytes.is_empty() || bytes.len() >= capacity || bytes.contains(&0) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(SockAddr::Unix(path))
    }

    pub fn inet(ip: IpAddr, port: u16) -> Self {
        SockAddr::Inet(SocketAddr::new(ip, port))
    }

    /// Host part as used for rule matching and `%a`.
    pub fn host(&self) -> Option<String> {
        match self {
            SockAddr::Inet(addr) => Some(addr.ip().to_string()),
            SockAddr::Unix(_) => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            SockAddr::Inet(addr) => Some(addr.ip()),
            SockAddr::Unix(_) => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            SockAddr::Inet(addr) => Some(addr.port()),
            SockAddr::Unix(_) => None,
        }
    }

    /// Replace the port. Returns false for Unix addresses.
    pub fn set_port(&mut self, port: u16) -> bool {
        match self {
            SockAddr::Inet(addr) => {
                addr.set_port(port);
                true
            }
            SockAddr::Unix(_) => false,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.ip().is_some_and(|ip| ip.is_loopback())
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            SockAddr::Inet(addr) => Some(*addr),
            SockAddr::Unix(_) => None,
        }
    }

    /// Backing path of a named Unix address.
    pub fn unix_path(&self) -> Option<&Path> {
        match self {
            SockAddr::Unix(path) if !path.as_os_str().is_empty() => Some(path),
            _ => None,
        }
    }

    pub fn family(&self) -> libc::c_int {
        match self {
            SockAddr::Inet(SocketAddr::V4(_)) => libc::AF_INET,
            SockAddr::Inet(SocketAddr::V6(_)) => libc::AF_INET6,
            SockAddr::Unix(_) => libc::AF_UNIX,
        }
    }

    /// Encode as a kernel socket address.
    pub fn to_raw(&self) -> io::Result<(libc::sockaddr_storage, libc::socklen_t)> {
        // SAFETY: all-zero is a valid sockaddr_storage, and every struct
        // written below fits into it.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = match self {
            SockAddr::Inet(SocketAddr::V4(addr)) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: addr.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(addr.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
                }
                mem::size_of::<libc::sockaddr_in>()
            }
            SockAddr::Inet(SocketAddr::V6(addr)) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: addr.port().to_be(),
                    sin6_flowinfo: addr.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: addr.ip().octets(),
                    },
                    sin6_scope_id: addr.scope_id(),
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
                }
                mem::size_of::<libc::sockaddr_in6>()
            }
            SockAddr::Unix(path) => {
                let bytes = path.as_os_str().as_bytes();
                // SAFETY: sockaddr_un fits into sockaddr_storage.
                let sun = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_un) };
                sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
                if bytes.len() >= sun.sun_path.len() {
                    return Err(io::Error::from_raw_os_error(libc::EINVAL));
                }
                for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
                    *dst = *src as libc::c_char;
                }
                match bytes.first() {
                    None => sun_path_offset(),
                    // Abstract names are not NUL terminated.
                    Some(0) => sun_path_offset() + bytes.len(),
                    Some(_) => sun_path_offset() + bytes.len() + 1,
                }
            }
        };
        Ok((storage, len as libc::socklen_t))
    }

    /// Decode a kernel socket address of length `len`.
    pub fn from_storage(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<Self> {
        let len = (len as usize).min(mem::size_of::<libc::sockaddr_storage>());
        if len < mem::size_of::<libc::sa_family_t>() {
            return None;
        }
        match storage.ss_family as libc::c_int {
            libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
                // SAFETY: family and length checked.
                let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Some(SockAddr::Inet(SocketAddr::V4(SocketAddrV4::new(
                    ip,
                    u16::from_be(sin.sin_port),
                ))))
            }
            libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
                // SAFETY: family and length checked.
                let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                Some(SockAddr::Inet(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                ))))
            }
            libc::AF_UNIX => {
                // SAFETY: family checked, sun_path is read only up to len.
                let sun = unsafe { &*(storage as *const _ as *const libc::sockaddr_un) };
                let raw_len = len.saturating_sub(sun_path_offset()).min(sun.sun_path.len());
                let raw: Vec<u8> = sun.sun_path[..raw_len].iter().map(|&c| c as u8).collect();
                let bytes = match raw.first() {
                    Some(0) => &raw[..],
                    _ => raw.split(|&b| b == 0).next().unwrap_or_default(),
                };
                Some(SockAddr::Unix(PathBuf::from(OsStr::from_bytes(bytes))))
            }
            _ => None,
        }
    }

    /// Decode a caller supplied address.
    ///
    /// # Safety
    ///
    /// `addr` must be null or point to at least `len` readable bytes.
    pub unsafe fn from_raw(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<Self> {
        if addr.is_null() {
            return None;
        }
        let len = (len as usize).min(mem::size_of::<libc::sockaddr_storage>());
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        std::ptr::copy_nonoverlapping(
            addr as *const u8,
            &mut storage as *mut _ as *mut u8,
            len,
        );
        Self::from_storage(&storage, len as libc::socklen_t)
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockAddr::Inet(addr) => write!(f, "{}", addr),
            SockAddr::Unix(path) if path.as_os_str().is_empty() => f.write_str("<unnamed>"),
            SockAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Substitute the placeholders of a socket path template.
///
/// `%%` is a literal `%`, `%a` the host, `%p` the port and `%t` the socket
/// type. Anything else after `%` is kept as it is.
pub fn format_sockpath(template: &str, addr: &SockAddr, socket_type: Option<SocketType>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => out.push('%'),
            Some('a') => out.push_str(addr.host().as_deref().unwrap_or(UNKNOWN)),
            Some('p') => match addr.port() {
                Some(port) => out.push_str(&port.to_string()),
                None => out.push_str(UNKNOWN),
            },
            Some('t') => out.push_str(socket_type.map_or(UNKNOWN, |t| t.as_str())),
            _ => {
                out.push('%');
                continue;
            }
        }
        chars.next();
    }
    out
}

/// A caller supplied `(sockaddr *, socklen_t *)` pair.
///
/// Writes are truncated to the buffer capacity while the length always
/// reports the full size of the address.
pub struct AddrBuf<'a> {
    buf: &'a mut [u8],
    len: &'a mut libc::socklen_t,
}

impl<'a> AddrBuf<'a> {
    pub fn new(buf: &'a mut [u8], len: &'a mut libc::socklen_t) -> Self {
        Self { buf, len }
    }

    /// # Safety
    ///
    /// Unless null, `len` must be valid and `addr` must point to `*len`
    /// writable bytes, both for the lifetime `'a`.
    pub unsafe fn from_raw(addr: *mut libc::sockaddr, len: *mut libc::socklen_t) -> Option<Self> {
        if addr.is_null() || len.is_null() {
            return None;
        }
        let buf = std::slice::from_raw_parts_mut(addr as *mut u8, *len as usize);
        Some(Self::new(buf, &mut *len))
    }

    pub fn write(&mut self, addr: &SockAddr) -> io::Result<()> {
        let (storage, size) = addr.to_raw()?;
        // SAFETY: `size` never exceeds sockaddr_storage.
        let bytes =
            unsafe { std::slice::from_raw_parts(&storage as *const _ as *const u8, size as usize) };
        let n = bytes.len().min(self.buf.len());
        self.buf[..n].copy_from_slice(&bytes[..n]);
        *self.len = size;
        Ok(())
    }

    /// Report that there is no address.
    pub fn clear(&mut self) {
        *self.len = 0;
    }
}
