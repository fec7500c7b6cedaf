use log::debug;
use sockshim_protocol::glob::matches_glob;
use sockshim_protocol::{Direction, Rule, RuleAction, SocketType};

use crate::error::Result;
use crate::yaml::parse_rules;

/// Evaluates socket operations against an ordered rule list.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

/// Result of a rule evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// What to do with the socket.
    pub verdict: Verdict,
    /// Index of the rule that matched; `None` for the fallback.
    pub matched_rule: Option<usize>,
}

/// The outcome of a decision, with defaults already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Redirect to this socket path template.
    Translate(String),
    /// Fail the call with this errno.
    Reject(i32),
    BlackHole,
    /// Take over a descriptor from the activation source.
    Activate(Option<String>),
}

impl Decision {
    fn fallback() -> Self {
        Self {
            verdict: Verdict::Reject(libc::ECONNREFUSED),
            matched_rule: None,
        }
    }
}

impl From<&RuleAction> for Verdict {
    fn from(action: &RuleAction) -> Self {
        match action {
            RuleAction::SocketPath(path) => Verdict::Translate(path.clone()),
            RuleAction::Reject { errno } => Verdict::Reject(errno.unwrap_or(libc::EACCES)),
            RuleAction::BlackHole => Verdict::BlackHole,
            RuleAction::Activate { fd_name } => Verdict::Activate(fd_name.clone()),
        }
    }
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Create an engine from a YAML or JSON rule document.
    pub fn from_yaml(document: &str) -> Result<Self> {
        Ok(Self::new(parse_rules(document)?))
    }

    /// Find the first rule matching the operation. Nothing matching means
    /// the operation is refused.
    ///
    /// `host` is the textual host of the address (`127.0.0.1`, `::1`); a
    /// rule with an address filter never matches when it is absent.
    pub fn evaluate(
        &self,
        direction: Direction,
        socket_type: SocketType,
        host: Option<&str>,
        port: Option<u16>,
    ) -> Decision {
        let found = self
            .rules
            .iter()
            .position(|rule| rule_matches(rule, direction, socket_type, host, port));

        let decision = match found {
            Some(index) => Decision {
                verdict: Verdict::from(&self.rules[index].action),
                matched_rule: Some(index),
            },
            None => Decision::fallback(),
        };

        debug!(
            "{} {} {}:{} -> {:?} (rule {:?})",
            direction,
            socket_type,
            host.unwrap_or("*"),
            port.map_or_else(|| "*".to_string(), |p| p.to_string()),
            decision.verdict,
            decision.matched_rule
        );
        decision
    }
}

fn rule_matches(
    rule: &Rule,
    direction: Direction,
    socket_type: SocketType,
    host: Option<&str>,
    port: Option<u16>,
) -> bool {
    if rule.direction.is_some_and(|d| d != direction) {
        return false;
    }
    if rule.socket_type.is_some_and(|t| t != socket_type) {
        return false;
    }
    if let Some(pattern) = &rule.address {
        match host {
            Some(host) if matches_glob(pattern, host) => {}
            _ => return false,
        }
    }
    if let Some(spec) = &rule.port {
        match port {
            Some(port) if spec.contains(port) => {}
            _ => return false,
        }
    }
    true
}
