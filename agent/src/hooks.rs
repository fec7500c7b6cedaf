//! The exported libc overrides.
//!
//! Each override asks the [`Shim`] first and falls back to the real libc
//! function for descriptors and addresses it does not handle.

use std::cell::Cell;
use std::ffi::c_void;
use std::io;
use std::mem;
use std::path::PathBuf;
use std::ptr;

use libc::{c_int, msghdr, size_t, sockaddr, sockaddr_storage, socklen_t, ssize_t};
use log::warn;

use crate::dispatch::{SendTarget, Shim};
use crate::ops::errno;
use crate::realcalls::{real, set_errno};
use crate::sockaddr::{AddrBuf, SockAddr};
use crate::sockopts::is_cached_ioctl;

// Thread-local re-entrancy guard. Socket calls made while handling a hook
// (logging, black hole setup) go straight to libc.
thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a hook; cleared on drop.
struct HookGuard;

impl HookGuard {
    fn enter() -> Option<Self> {
        if IN_HOOK.with(|h| h.replace(true)) {
            None
        } else {
            Some(Self)
        }
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        IN_HOOK.with(|h| h.set(false));
    }
}

/// The shim, unless the agent is dormant or this is a nested call.
fn active() -> Option<(&'static Shim, HookGuard)> {
    let shim = crate::shim()?;
    let guard = HookGuard::enter()?;
    Some((shim, guard))
}

fn fail(error: io::Error) -> c_int {
    set_errno(error.raw_os_error().unwrap_or(libc::EINVAL));
    -1
}

fn finish(result: io::Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

fn empty_storage() -> (sockaddr_storage, socklen_t) {
    // SAFETY: sockaddr_storage is plain data.
    let storage: sockaddr_storage = unsafe { mem::zeroed() };
    (storage, mem::size_of::<sockaddr_storage>() as socklen_t)
}

unsafe fn write_addr(
    result: io::Result<SockAddr>,
    addr: *mut sockaddr,
    len: *mut socklen_t,
) -> c_int {
    let value = match result {
        Ok(value) => value,
        Err(e) => return fail(e),
    };
    match AddrBuf::from_raw(addr, len) {
        Some(mut buf) => finish(buf.write(&value)),
        None => fail(errno(libc::EFAULT)),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = real::socket(domain, ty, protocol);
    if fd >= 0 {
        if let Some((shim, _guard)) = active() {
            shim.on_socket(fd, domain, ty, protocol);
        }
    }
    fd
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    value: *const c_void,
    len: socklen_t,
) -> c_int {
    if !value.is_null() {
        if let Some((shim, _guard)) = active() {
            let bytes = std::slice::from_raw_parts(value as *const u8, len as usize);
            if let Some(result) = shim.setsockopt(fd, level, name, bytes) {
                return finish(result);
            }
        }
    }
    real::setsockopt(fd, level, name, value, len)
}

/// Declared with a fixed third argument; on the supported ABIs a variadic
/// pointer argument is passed the same way.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ioctl(fd: c_int, request: libc::Ioctl, arg: *mut c_void) -> c_int {
    if is_cached_ioctl(request) && !arg.is_null() {
        if let Some((shim, _guard)) = active() {
            let value = *(arg as *const c_int);
            if let Some(result) = shim.ioctl_int(fd, request, value) {
                return finish(result);
            }
        }
    }
    real::ioctl(fd, request, arg)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn bind(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    if let Some((shim, _guard)) = active() {
        let decoded = SockAddr::from_raw(addr, len);
        if let Some(result) = shim.bind(fd, decoded.as_ref()) {
            return finish(result);
        }
    }
    real::bind(fd, addr, len)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn listen(fd: c_int, backlog: c_int) -> c_int {
    if let Some((shim, _guard)) = active() {
        if let Some(result) = shim.listen(fd, backlog) {
            return finish(result);
        }
    }
    real::listen(fd, backlog)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    if let Some((shim, _guard)) = active() {
        let decoded = SockAddr::from_raw(addr, len);
        if let Some(result) = shim.connect(fd, decoded.as_ref()) {
            return finish(result);
        }
    }
    real::connect(fd, addr, len)
}

unsafe fn real_accept(
    fd: c_int,
    addr: *mut sockaddr,
    len: *mut socklen_t,
    flags: Option<c_int>,
) -> c_int {
    match flags {
        Some(flags) => real::accept4(fd, addr, len, flags),
        None => real::accept(fd, addr, len),
    }
}

unsafe fn accept_with(
    fd: c_int,
    addr: *mut sockaddr,
    len: *mut socklen_t,
    flags: Option<c_int>,
) -> c_int {
    let Some((shim, _guard)) = active() else {
        return real_accept(fd, addr, len, flags);
    };
    if !shim.is_converted(fd) {
        return real_accept(fd, addr, len, flags);
    }

    let (mut storage, mut storage_len) = empty_storage();
    let new_fd = real_accept(fd, &mut storage as *mut _ as *mut sockaddr, &mut storage_len, flags);
    if new_fd < 0 {
        return new_fd;
    }
    let real_peer = SockAddr::from_storage(&storage, storage_len);

    let peer = match shim.accept(fd, new_fd, real_peer.clone()) {
        Some(Ok(peer)) => peer,
        Some(Err(e)) => {
            real::close(new_fd);
            return fail(e);
        }
        None => match real_peer {
            Some(peer) => peer,
            None => return new_fd,
        },
    };
    if let Some(mut buf) = AddrBuf::from_raw(addr, len) {
        if buf.write(&peer).is_err() {
            buf.clear();
        }
    }
    new_fd
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    accept_with(fd, addr, len, None)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn accept4(
    fd: c_int,
    addr: *mut sockaddr,
    len: *mut socklen_t,
    flags: c_int,
) -> c_int {
    accept_with(fd, addr, len, Some(flags))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn getsockname(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    if let Some((shim, _guard)) = active() {
        if let Some(result) = shim.getsockname(fd) {
            return write_addr(result, addr, len);
        }
    }
    real::getsockname(fd, addr, len)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn getpeername(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    if let Some((shim, _guard)) = active() {
        if let Some(result) = shim.getpeername(fd) {
            return write_addr(result, addr, len);
        }
    }
    real::getpeername(fd, addr, len)
}

/// What to do with the destination of an outgoing datagram.
enum Destination {
    Unchanged,
    Replace(sockaddr_storage, socklen_t),
    /// Send without an address.
    Omit,
    /// Report the data as sent without sending it.
    Discard,
    Fail(io::Error),
}

unsafe fn destination(fd: c_int, addr: *const sockaddr, len: socklen_t) -> Destination {
    let Some((shim, _guard)) = active() else {
        return Destination::Unchanged;
    };
    let Some(dest) = SockAddr::from_raw(addr, len) else {
        return Destination::Unchanged;
    };
    match shim.send_target(fd, &dest) {
        None => Destination::Unchanged,
        Some(Ok(SendTarget::Deliver(unix))) => match unix.to_raw() {
            Ok((storage, storage_len)) => Destination::Replace(storage, storage_len),
            Err(e) => Destination::Fail(e),
        },
        Some(Ok(SendTarget::Connected)) => Destination::Omit,
        Some(Ok(SendTarget::Discard)) => Destination::Discard,
        Some(Err(e)) => Destination::Fail(e),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    n: size_t,
    flags: c_int,
    addr: *const sockaddr,
    len: socklen_t,
) -> ssize_t {
    match destination(fd, addr, len) {
        Destination::Unchanged => real::sendto(fd, buf, n, flags, addr, len),
        Destination::Replace(storage, storage_len) => real::sendto(
            fd,
            buf,
            n,
            flags,
            &storage as *const _ as *const sockaddr,
            storage_len,
        ),
        Destination::Omit => {
            real::sendto(fd, buf, n, flags & !libc::MSG_FASTOPEN, ptr::null(), 0)
        }
        Destination::Discard => n as ssize_t,
        Destination::Fail(e) => fail(e) as ssize_t,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    if msg.is_null() {
        return real::sendmsg(fd, msg, flags);
    }
    let mut copy = *msg;
    let storage;
    match destination(fd, copy.msg_name as *const sockaddr, copy.msg_namelen) {
        Destination::Unchanged => return real::sendmsg(fd, msg, flags),
        Destination::Replace(replacement, storage_len) => {
            storage = replacement;
            copy.msg_name = &storage as *const _ as *mut c_void;
            copy.msg_namelen = storage_len;
        }
        Destination::Omit => {
            copy.msg_name = ptr::null_mut();
            copy.msg_namelen = 0;
            return real::sendmsg(fd, &copy, flags & !libc::MSG_FASTOPEN);
        }
        Destination::Discard => {
            let total: usize = if copy.msg_iov.is_null() {
                0
            } else {
                std::slice::from_raw_parts(copy.msg_iov, copy.msg_iovlen as usize)
                    .iter()
                    .map(|iov| iov.iov_len)
                    .sum()
            };
            return total as ssize_t;
        }
        Destination::Fail(e) => return fail(e) as ssize_t,
    }
    real::sendmsg(fd, &copy, flags)
}

/// Write the address to present for a datagram received from the Unix
/// address in `storage`. The datagram is already consumed, so an address
/// that cannot be written is reported as unnamed.
unsafe fn present_source(
    shim: &Shim,
    fd: c_int,
    storage: &sockaddr_storage,
    storage_len: socklen_t,
    addr: *mut sockaddr,
    len: *mut socklen_t,
) {
    let Some(mut out) = AddrBuf::from_raw(addr, len) else {
        return;
    };
    let real = SockAddr::from_storage(storage, storage_len)
        .unwrap_or(SockAddr::Unix(PathBuf::new()));
    let written = match shim.recv_source(fd, &real) {
        Some(Some(peer)) => out.write(&peer),
        Some(None) => {
            out.clear();
            Ok(())
        }
        None => out.write(&real),
    };
    if let Err(e) = written {
        warn!("fd {}: cannot present source address: {}", fd, e);
        out.clear();
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    n: size_t,
    flags: c_int,
    addr: *mut sockaddr,
    len: *mut socklen_t,
) -> ssize_t {
    if addr.is_null() || len.is_null() {
        return real::recvfrom(fd, buf, n, flags, addr, len);
    }
    let Some((shim, _guard)) = active() else {
        return real::recvfrom(fd, buf, n, flags, addr, len);
    };
    if !shim.rewrites_source(fd) {
        return real::recvfrom(fd, buf, n, flags, addr, len);
    }

    let (mut storage, mut storage_len) = empty_storage();
    let received = real::recvfrom(
        fd,
        buf,
        n,
        flags,
        &mut storage as *mut _ as *mut sockaddr,
        &mut storage_len,
    );
    if received < 0 {
        return received;
    }
    present_source(shim, fd, &storage, storage_len, addr, len);
    received
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    if msg.is_null() || (*msg).msg_name.is_null() {
        return real::recvmsg(fd, msg, flags);
    }
    let Some((shim, _guard)) = active() else {
        return real::recvmsg(fd, msg, flags);
    };
    if !shim.rewrites_source(fd) {
        return real::recvmsg(fd, msg, flags);
    }

    let (name, name_len) = ((*msg).msg_name, (*msg).msg_namelen);
    let (mut storage, storage_len) = empty_storage();
    (*msg).msg_name = &mut storage as *mut _ as *mut c_void;
    (*msg).msg_namelen = storage_len;
    let received = real::recvmsg(fd, msg, flags);
    let received_len = (*msg).msg_namelen;
    (*msg).msg_name = name;
    (*msg).msg_namelen = name_len;
    if received < 0 {
        return received;
    }

    present_source(
        shim,
        fd,
        &storage,
        received_len,
        name as *mut sockaddr,
        ptr::addr_of_mut!((*msg).msg_namelen),
    );
    received
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if let Some((shim, _guard)) = active() {
        if let Some(result) = shim.close(fd) {
            return finish(result);
        }
    }
    real::close(fd)
}
