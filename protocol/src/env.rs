//! Environment hand-off between the launcher and the preloaded agent.

use crate::rule::Rule;

/// JSON encoded rule list. The agent stays dormant without it.
pub const RULES_VAR: &str = "SOCKSHIM_RULES";
/// `env_logger` filter for the agent.
pub const LOG_VAR: &str = "SOCKSHIM_LOG";
/// Optional `LOW-HIGH` override of the ephemeral port range.
pub const PORT_RANGE_VAR: &str = "SOCKSHIM_PORT_RANGE";
/// Explicit path of the agent library, used by the launcher.
pub const AGENT_PATH_VAR: &str = "SOCKSHIM_AGENT";

/// Encode rules for [`RULES_VAR`].
pub fn encode_rules(rules: &[Rule]) -> serde_json::Result<String> {
    serde_json::to_string(rules)
}

/// Decode the value of [`RULES_VAR`].
pub fn decode_rules(encoded: &str) -> serde_json::Result<Vec<Rule>> {
    serde_json::from_str(encoded)
}

/// Parse a `LOW-HIGH` port range. Whitespace (as in
/// `/proc/sys/net/ipv4/ip_local_port_range`) works as separator too.
pub fn parse_port_range(value: &str) -> Option<(u16, u16)> {
    let mut parts = value
        .split(|c: char| c == '-' || c.is_whitespace())
        .filter(|s| !s.is_empty());
    let low = parts.next()?.parse::<u16>().ok()?;
    let high = parts.next()?.parse::<u16>().ok()?;
    if parts.next().is_some() || low == 0 || low > high {
        return None;
    }
    Some((low, high))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Direction, PortSpec, RuleAction, SocketType};

    #[test]
    fn test_rules_survive_environment_encoding() {
        let rules = vec![
            Rule::new(RuleAction::SocketPath("/run/app/%t-%p.sock".into()))
                .direction(Direction::Incoming)
                .socket_type(SocketType::Tcp)
                .port(PortSpec::Range {
                    start: 8000,
                    end: 8080,
                }),
            Rule::new(RuleAction::Reject { errno: Some(111) }).address("10.*"),
            Rule::new(RuleAction::Activate {
                fd_name: Some("web".into()),
            }),
            Rule::new(RuleAction::BlackHole),
        ];

        let encoded = encode_rules(&rules).expect("encode");
        let decoded = decode_rules(&encoded).expect("decode");
        assert_eq!(decoded, rules);
    }

    #[test]
    fn test_decode_rejects_rule_without_action() {
        assert!(decode_rules(r#"[{"direction":"incoming"}]"#).is_err());
    }

    #[test]
    fn test_parse_port_range_formats() {
        assert_eq!(parse_port_range("32768-60999"), Some((32768, 60999)));
        assert_eq!(parse_port_range("32768\t60999\n"), Some((32768, 60999)));
        assert_eq!(parse_port_range("2000-1000"), None);
        assert_eq!(parse_port_range("0-10"), None);
        assert_eq!(parse_port_range("1000"), None);
        assert_eq!(parse_port_range("1-2-3"), None);
    }
}
