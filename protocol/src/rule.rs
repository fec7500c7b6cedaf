//! In-memory rule types shared between the launcher and the agent.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Direction of a socket operation as seen by the target program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// `bind()`, `listen()` and `accept()`.
    Incoming,
    /// `connect()` and `sendto()`.
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    Tcp,
    Udp,
}

impl SocketType {
    /// Token substituted for `%t` in socket path templates.
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketType::Tcp => "tcp",
            SocketType::Udp => "udp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "stream" => Some(SocketType::Tcp),
            "udp" | "datagram" | "dgram" => Some(SocketType::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Port filter of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortSpec {
    Single(u16),
    /// Inclusive range, `start <= end`.
    Range { start: u16, end: u16 },
}

impl PortSpec {
    pub fn contains(&self, port: u16) -> bool {
        match *self {
            PortSpec::Single(p) => p == port,
            PortSpec::Range { start, end } => start <= port && port <= end,
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Single(p) => write!(f, "{}", p),
            PortSpec::Range { start, end } => write!(f, "{}-{}", start, end),
        }
    }
}

/// What happens to a socket matched by a rule.
///
/// Exactly one action per rule; there is no "no action" value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Redirect to the Unix socket at this path template.
    SocketPath(String),
    /// Fail the call with `errno` (`EACCES` when unset).
    Reject { errno: Option<i32> },
    /// Back the socket with a disposable Unix socket nobody else can reach.
    BlackHole,
    /// Use a descriptor handed over by the service manager.
    Activate { fd_name: Option<String> },
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::SocketPath(path) => write!(f, "socket path {}", path),
            RuleAction::Reject { errno: Some(e) } => write!(f, "reject with errno {}", e),
            RuleAction::Reject { errno: None } => f.write_str("reject"),
            RuleAction::BlackHole => f.write_str("black hole"),
            RuleAction::Activate { fd_name: Some(name) } => {
                write!(f, "socket activation ({})", name)
            }
            RuleAction::Activate { fd_name: None } => f.write_str("socket activation"),
        }
    }
}

/// A single redirection rule. Every populated filter must agree for the
/// rule to match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_type: Option<SocketType>,
    /// Glob matched against the host part of the address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSpec>,
    pub action: RuleAction,
}

impl Rule {
    /// A rule without filters, matching everything.
    pub fn new(action: RuleAction) -> Self {
        Self {
            direction: None,
            socket_type: None,
            address: None,
            port: None,
            action,
        }
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn socket_type(mut self, socket_type: SocketType) -> Self {
        self.socket_type = Some(socket_type);
        self
    }

    pub fn address(mut self, pattern: impl Into<String>) -> Self {
        self.address = Some(pattern.into());
        self
    }

    pub fn port(mut self, port: PortSpec) -> Self {
        self.port = Some(port);
        self
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let any = "<any>";
        writeln!(
            f,
            "  Direction: {}",
            self.direction.map_or(any, |d| d.as_str())
        )?;
        writeln!(
            f,
            "  Socket type: {}",
            self.socket_type.map_or(any, |t| t.as_str())
        )?;
        writeln!(f, "  Address: {}", self.address.as_deref().unwrap_or(any))?;
        match &self.port {
            Some(ports @ PortSpec::Range { .. }) => writeln!(f, "  Ports: {}", ports)?,
            Some(port) => writeln!(f, "  Port: {}", port)?,
            None => writeln!(f, "  Port: {}", any)?,
        }
        write!(f, "  Action: {}", self.action)
    }
}
