//! The libc implementations shadowed by the agent, resolved lazily with
//! `dlsym(RTLD_NEXT, ...)`.

use std::ffi::{c_void, CStr};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ops::SocketOps;
use crate::sockaddr::{Credentials, SockAddr};

unsafe fn resolve_next(symbol: &CStr) -> usize {
    libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr()) as usize
}

pub(crate) fn set_errno(code: libc::c_int) {
    // SAFETY: errno is thread-local.
    unsafe { *libc::__errno_location() = code }
}

macro_rules! real_fn {
    ($name:ident: fn($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        pub unsafe fn $name($($arg: $ty),*) -> $ret {
            static ADDR: AtomicUsize = AtomicUsize::new(0);
            let mut addr = ADDR.load(Ordering::Relaxed);
            if addr == 0 {
                let symbol = concat!(stringify!($name), "\0");
                addr = resolve_next(CStr::from_bytes_with_nul_unchecked(symbol.as_bytes()));
                if addr == 0 {
                    set_errno(libc::ENOSYS);
                    return -1;
                }
                ADDR.store(addr, Ordering::Relaxed);
            }
            let original: unsafe extern "C" fn($($ty),*) -> $ret = mem::transmute(addr);
            original($($arg),*)
        }
    };
}

pub mod real {
    use super::*;

    use libc::{c_int, msghdr, size_t, sockaddr, socklen_t, ssize_t};

    real_fn!(socket: fn(domain: c_int, ty: c_int, protocol: c_int) -> c_int);
    real_fn!(bind: fn(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int);
    real_fn!(listen: fn(fd: c_int, backlog: c_int) -> c_int);
    real_fn!(connect: fn(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int);
    real_fn!(accept: fn(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int);
    real_fn!(accept4: fn(
        fd: c_int, addr: *mut sockaddr, len: *mut socklen_t, flags: c_int
    ) -> c_int);
    real_fn!(getsockname: fn(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int);
    real_fn!(getpeername: fn(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int);
    real_fn!(setsockopt: fn(
        fd: c_int, level: c_int, name: c_int, value: *const c_void, len: socklen_t
    ) -> c_int);
    real_fn!(sendto: fn(
        fd: c_int,
        buf: *const c_void,
        n: size_t,
        flags: c_int,
        addr: *const sockaddr,
        len: socklen_t
    ) -> ssize_t);
    real_fn!(sendmsg: fn(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t);
    real_fn!(recvfrom: fn(
        fd: c_int,
        buf: *mut c_void,
        n: size_t,
        flags: c_int,
        addr: *mut sockaddr,
        len: *mut socklen_t
    ) -> ssize_t);
    real_fn!(recvmsg: fn(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t);
    real_fn!(close: fn(fd: c_int) -> c_int);

    /// `ioctl` is variadic, so it does not fit the macro.
    pub unsafe fn ioctl(fd: c_int, request: libc::Ioctl, arg: *mut c_void) -> c_int {
        static ADDR: AtomicUsize = AtomicUsize::new(0);
        let mut addr = ADDR.load(Ordering::Relaxed);
        if addr == 0 {
            addr = resolve_next(c"ioctl");
            if addr == 0 {
                set_errno(libc::ENOSYS);
                return -1;
            }
            ADDR.store(addr, Ordering::Relaxed);
        }
        let original: unsafe extern "C" fn(c_int, libc::Ioctl, ...) -> c_int = mem::transmute(addr);
        original(fd, request, arg)
    }
}

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// [`SocketOps`] backed by the real libc functions.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealCalls;

impl SocketOps for RealCalls {
    fn socket(
        &self,
        domain: libc::c_int,
        ty: libc::c_int,
        protocol: libc::c_int,
    ) -> io::Result<RawFd> {
        check(unsafe { real::socket(domain, ty, protocol) })
    }

    fn bind(&self, fd: RawFd, addr: &SockAddr) -> io::Result<()> {
        let (storage, len) = addr.to_raw()?;
        check(unsafe { real::bind(fd, &storage as *const _ as *const libc::sockaddr, len) })?;
        Ok(())
    }

    fn listen(&self, fd: RawFd, backlog: libc::c_int) -> io::Result<()> {
        check(unsafe { real::listen(fd, backlog) })?;
        Ok(())
    }

    fn connect(&self, fd: RawFd, addr: &SockAddr) -> io::Result<()> {
        let (storage, len) = addr.to_raw()?;
        check(unsafe { real::connect(fd, &storage as *const _ as *const libc::sockaddr, len) })?;
        Ok(())
    }

    fn getsockname(&self, fd: RawFd) -> io::Result<SockAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        check(unsafe {
            real::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        })?;
        SockAddr::from_storage(&storage, len)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EAFNOSUPPORT))
    }

    fn setsockopt(
        &self,
        fd: RawFd,
        level: libc::c_int,
        name: libc::c_int,
        value: &[u8],
    ) -> io::Result<()> {
        check(unsafe {
            real::setsockopt(
                fd,
                level,
                name,
                value.as_ptr() as *const c_void,
                value.len() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    fn ioctl_int(&self, fd: RawFd, request: libc::Ioctl, value: libc::c_int) -> io::Result<()> {
        let mut value = value;
        check(unsafe { real::ioctl(fd, request, &mut value as *mut _ as *mut c_void) })?;
        Ok(())
    }

    fn peer_credentials(&self, fd: RawFd) -> io::Result<Credentials> {
        let mut cred: libc::ucred = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
        check(unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut _ as *mut c_void,
                &mut len,
            )
        })?;
        Ok(Credentials {
            pid: cred.pid,
            uid: cred.uid,
            gid: cred.gid,
        })
    }

    fn status_flags(&self, fd: RawFd) -> io::Result<libc::c_int> {
        check(unsafe { libc::fcntl(fd, libc::F_GETFL) })
    }

    fn set_status_flags(&self, fd: RawFd, flags: libc::c_int) -> io::Result<()> {
        check(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })?;
        Ok(())
    }

    fn is_cloexec(&self, fd: RawFd) -> io::Result<bool> {
        let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
        Ok(flags & libc::FD_CLOEXEC != 0)
    }

    fn dup_onto(&self, src: RawFd, dst: RawFd, cloexec: bool) -> io::Result<()> {
        let flags = if cloexec { libc::O_CLOEXEC } else { 0 };
        check(unsafe { libc::dup3(src, dst, flags) })?;
        Ok(())
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        check(unsafe { real::close(fd) })?;
        Ok(())
    }
}
