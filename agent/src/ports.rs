//! Ephemeral ports for addresses the kernel never assigned one to.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;
use sockshim_protocol::env::parse_port_range;

/// Used when neither the environment nor procfs provide a range.
pub const DEFAULT_PORT_RANGE: (u16, u16) = (32768, 60999);

const PROC_PORT_RANGE: &str = "/proc/sys/net/ipv4/ip_local_port_range";

/// Ephemeral port range of the host: an explicit override, else the
/// kernel's, else [`DEFAULT_PORT_RANGE`].
pub fn ephemeral_range(override_value: Option<&str>) -> (u16, u16) {
    if let Some(value) = override_value {
        match parse_port_range(value) {
            Some(range) => return range,
            None => warn!("ignoring invalid port range '{}'", value),
        }
    }
    std::fs::read_to_string(PROC_PORT_RANGE)
        .ok()
        .and_then(|s| parse_port_range(&s))
        .unwrap_or(DEFAULT_PORT_RANGE)
}

/// Hands out ports from an inclusive range, wrapping around. A port that is
/// reserved or still held is only handed out again once every port of the
/// range is in use.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    low: u16,
    high: u16,
    cursor: u16,
    taken: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new((low, high): (u16, u16)) -> Self {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        Self {
            low,
            high,
            cursor: low,
            taken: BTreeSet::new(),
        }
    }

    /// Next free port. With the whole range in use the port after the
    /// previous one is reused.
    pub fn acquire(&mut self) -> u16 {
        let span = u32::from(self.high - self.low) + 1;
        for _ in 0..span {
            let port = self.advance();
            if self.taken.insert(port) {
                return port;
            }
        }
        let port = self.advance();
        warn!(
            "all ports of {}-{} are in use, reusing {}",
            self.low, self.high, port
        );
        port
    }

    fn advance(&mut self) -> u16 {
        let port = self.cursor;
        self.cursor = if port == self.high { self.low } else { port + 1 };
        port
    }

    /// Mark `port` as used, e.g. after the program bound to it.
    pub fn reserve(&mut self, port: u16) {
        self.taken.insert(port);
    }

    pub fn release(&mut self, port: u16) {
        self.taken.remove(&port);
    }

    #[cfg(test)]
    pub fn is_taken(&self, port: u16) -> bool {
        self.taken.contains(&port)
    }
}

/// An allocator shared by a listener and the sockets accepted from it.
pub type SharedPorts = Arc<Mutex<PortAllocator>>;

pub fn shared(range: (u16, u16)) -> SharedPorts {
    Arc::new(Mutex::new(PortAllocator::new(range)))
}

pub fn lock(ports: &SharedPorts) -> MutexGuard<'_, PortAllocator> {
    ports.lock().unwrap_or_else(|e| e.into_inner())
}
