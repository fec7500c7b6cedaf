//! Socket options and ioctls applied before a socket is converted, kept
//! so they can be applied again to the Unix backing.

use std::io;
use std::os::fd::RawFd;

use log::{debug, warn};

use crate::ops::SocketOps;

/// `SOL_SOCKET` options only meaningful for IP sockets.
const IP_ONLY_SOCKET_OPTIONS: &[libc::c_int] = &[
    libc::SO_REUSEPORT,
    libc::SO_BINDTODEVICE,
    libc::SO_BINDTOIFINDEX,
    libc::SO_INCOMING_CPU,
];

const IP_LEVELS: &[libc::c_int] = &[
    libc::IPPROTO_IP,
    libc::IPPROTO_IPV6,
    libc::IPPROTO_TCP,
    libc::IPPROTO_UDP,
];

/// Whether an option has no meaning for a Unix domain socket.
pub fn is_ip_only(level: libc::c_int, name: libc::c_int) -> bool {
    IP_LEVELS.contains(&level)
        || (level == libc::SOL_SOCKET && IP_ONLY_SOCKET_OPTIONS.contains(&name))
}

/// Ioctls taking an `int` that are worth carrying over.
pub fn is_cached_ioctl(request: libc::Ioctl) -> bool {
    request == libc::FIONBIO || request == libc::FIOASYNC
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    SockOpt {
        level: libc::c_int,
        name: libc::c_int,
        value: Vec<u8>,
    },
    Ioctl {
        request: libc::Ioctl,
        value: libc::c_int,
    },
}

/// Recorded configuration, in call order.
#[derive(Debug, Clone, Default)]
pub struct OptionCache {
    entries: Vec<Entry>,
}

impl OptionCache {
    /// Record an option whose real application already succeeded.
    pub fn cache_sockopt(&mut self, level: libc::c_int, name: libc::c_int, value: &[u8]) {
        if level != libc::SOL_SOCKET || is_ip_only(level, name) {
            return;
        }
        self.entries.push(Entry::SockOpt {
            level,
            name,
            value: value.to_vec(),
        });
    }

    /// Record an ioctl whose real application already succeeded.
    pub fn cache_ioctl(&mut self, request: libc::Ioctl, value: libc::c_int) {
        if is_cached_ioctl(request) {
            self.entries.push(Entry::Ioctl { request, value });
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Apply everything recorded to `new_fd`, then carry over the file
    /// status flags of `old_fd`. Stops at the first failure.
    pub fn replay(&self, ops: &dyn SocketOps, old_fd: RawFd, new_fd: RawFd) -> io::Result<()> {
        for entry in &self.entries {
            let result = match entry {
                Entry::SockOpt { level, name, value } => {
                    ops.setsockopt(new_fd, *level, *name, value)
                }
                Entry::Ioctl { request, value } => ops.ioctl_int(new_fd, *request, *value),
            };
            if let Err(e) = result {
                warn!("fd {}: replaying {:?} failed: {}", old_fd, entry, e);
                return Err(e);
            }
        }
        let flags = ops.status_flags(old_fd)?;
        ops.set_status_flags(new_fd, flags)?;
        debug!(
            "fd {}: replayed {} option(s) onto fd {}",
            old_fd,
            self.entries.len(),
            new_fd
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Call, MockOps};

    fn int_bytes(v: libc::c_int) -> Vec<u8> {
        v.to_ne_bytes().to_vec()
    }

    #[test]
    fn test_only_generic_socket_options_are_cached() {
        let mut cache = OptionCache::default();
        cache.cache_sockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, &int_bytes(1));
        cache.cache_sockopt(libc::SOL_SOCKET, libc::SO_REUSEPORT, &int_bytes(1));
        cache.cache_sockopt(libc::IPPROTO_TCP, libc::TCP_NODELAY, &int_bytes(1));
        cache.cache_sockopt(libc::IPPROTO_IP, libc::IP_TOS, &int_bytes(8));
        cache.cache_ioctl(libc::FIONBIO, 1);
        cache.cache_ioctl(libc::FIONREAD, 0);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_replay_in_call_order() {
        let ops = MockOps::new();
        let mut cache = OptionCache::default();
        cache.cache_sockopt(libc::SOL_SOCKET, libc::SO_SNDBUF, &int_bytes(4096));
        cache.cache_ioctl(libc::FIONBIO, 1);
        cache.cache_sockopt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, &int_bytes(1));

        cache.replay(&ops, 3, 9).unwrap();
        assert_eq!(
            ops.calls(),
            vec![
                Call::SetSockOpt(9, libc::SOL_SOCKET, libc::SO_SNDBUF),
                Call::Ioctl(9, libc::FIONBIO, 1),
                Call::SetSockOpt(9, libc::SOL_SOCKET, libc::SO_KEEPALIVE),
                Call::StatusFlags(3),
                Call::SetStatusFlags(9),
            ]
        );
    }

    #[test]
    fn test_replay_stops_at_first_failure() {
        let ops = MockOps::new();
        ops.fail_setsockopt(libc::SO_KEEPALIVE, libc::ENOPROTOOPT);
        let mut cache = OptionCache::default();
        cache.cache_sockopt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, &int_bytes(1));
        cache.cache_sockopt(libc::SOL_SOCKET, libc::SO_SNDBUF, &int_bytes(1));

        let err = cache.replay(&ops, 3, 9).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOPROTOOPT));
        assert_eq!(
            ops.calls(),
            vec![Call::SetSockOpt(9, libc::SOL_SOCKET, libc::SO_KEEPALIVE)]
        );
    }

    #[test]
    fn test_ip_only_options() {
        assert!(is_ip_only(libc::IPPROTO_TCP, libc::TCP_NODELAY));
        assert!(is_ip_only(libc::SOL_SOCKET, libc::SO_BINDTODEVICE));
        assert!(!is_ip_only(libc::SOL_SOCKET, libc::SO_REUSEADDR));
    }
}
