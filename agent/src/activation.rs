//! Descriptors handed over by a service manager (systemd `LISTEN_FDS`).

use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use log::{debug, error};

use crate::ops::{errno, SocketOps};
use crate::sockaddr::SockAddr;

/// First descriptor passed by the service manager.
const LISTEN_FDS_START: RawFd = 3;

/// An already open descriptor and what it is bound to, if known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub fd: RawFd,
    pub address: Option<SockAddr>,
}

/// Source of pre-opened descriptors for activation rules.
pub trait ActivationSource: Send + Sync {
    /// Hand out the next unused descriptor, or the first unused one called
    /// `fd_name`.
    fn take(&self, fd_name: Option<&str>) -> io::Result<Activation>;
}

#[derive(Debug)]
struct ListenFd {
    fd: RawFd,
    name: Option<String>,
    taken: bool,
}

/// Descriptors announced through `LISTEN_PID`, `LISTEN_FDS` and
/// `LISTEN_FDNAMES`.
pub struct SystemdFds {
    fds: Mutex<Vec<ListenFd>>,
    ops: Arc<dyn SocketOps>,
}

impl SystemdFds {
    pub fn from_env(ops: Arc<dyn SocketOps>) -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self::from_vars(
            var("LISTEN_PID").as_deref(),
            var("LISTEN_FDS").as_deref(),
            var("LISTEN_FDNAMES").as_deref(),
            std::process::id(),
            ops,
        )
    }

    /// Descriptors are only ours when `listen_pid` names this process.
    pub fn from_vars(
        listen_pid: Option<&str>,
        listen_fds: Option<&str>,
        listen_fdnames: Option<&str>,
        own_pid: u32,
        ops: Arc<dyn SocketOps>,
    ) -> Self {
        let ours = listen_pid.and_then(|p| p.trim().parse::<u32>().ok()) == Some(own_pid);
        let count = if ours {
            listen_fds
                .and_then(|n| n.trim().parse::<RawFd>().ok())
                .unwrap_or(0)
                .max(0)
        } else {
            0
        };
        let mut names = listen_fdnames
            .map(|n| n.split(':').map(str::to_string).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter();

        let fds = (0..count)
            .map(|i| ListenFd {
                fd: LISTEN_FDS_START + i,
                name: names.next().filter(|n| !n.is_empty()),
                taken: false,
            })
            .collect::<Vec<_>>();
        debug!("{} activation descriptor(s) available", fds.len());

        Self {
            fds: Mutex::new(fds),
            ops,
        }
    }
}

impl ActivationSource for SystemdFds {
    fn take(&self, fd_name: Option<&str>) -> io::Result<Activation> {
        let mut fds = self.fds.lock().unwrap_or_else(|e| e.into_inner());
        let found = fds
            .iter_mut()
            .find(|entry| {
                !entry.taken && fd_name.map_or(true, |name| entry.name.as_deref() == Some(name))
            });

        let Some(entry) = found else {
            error!(
                "no activation descriptor available{}",
                fd_name.map(|n| format!(" named '{}'", n)).unwrap_or_default()
            );
            return Err(errno(libc::EBADF));
        };
        entry.taken = true;

        let address = self.ops.getsockname(entry.fd).ok();
        debug!("activation descriptor {} bound to {:?}", entry.fd, address);
        Ok(Activation {
            fd: entry.fd,
            address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockOps;

    fn source(pid: &str, fds: &str, names: Option<&str>) -> SystemdFds {
        let ops = Arc::new(MockOps::new());
        ops.set_sockname(3, SockAddr::Unix("/run/a.sock".into()));
        SystemdFds::from_vars(Some(pid), Some(fds), names, 42, ops)
    }

    #[test]
    fn test_unnamed_requests_consume_in_order() {
        let fds = source("42", "2", None);
        let first = fds.take(None).unwrap();
        assert_eq!(first.fd, 3);
        assert_eq!(first.address, Some(SockAddr::Unix("/run/a.sock".into())));

        let second = fds.take(None).unwrap();
        assert_eq!(second.fd, 4);
        assert_eq!(second.address, None);

        let err = fds.take(None).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_named_requests() {
        let fds = source("42", "3", Some("web:dns:web"));
        assert_eq!(fds.take(Some("web")).unwrap().fd, 3);
        assert_eq!(fds.take(Some("web")).unwrap().fd, 5);
        assert!(fds.take(Some("web")).is_err());
        assert_eq!(fds.take(Some("dns")).unwrap().fd, 4);
        assert!(fds.take(Some("nope")).is_err());
    }

    #[test]
    fn test_other_process_descriptors_are_ignored() {
        let fds = source("7", "2", None);
        assert!(fds.take(None).is_err());

        let ops = Arc::new(MockOps::new());
        let fds = SystemdFds::from_vars(None, Some("2"), None, 42, ops);
        assert!(fds.take(None).is_err());
    }
}
