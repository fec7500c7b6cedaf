//! Tests for rule evaluation.

use sockshim_protocol::{Direction, PortSpec, Rule, RuleAction, SocketType};

use crate::engine::{RuleEngine, Verdict};

fn engine_from_yaml(yaml: &str) -> RuleEngine {
    RuleEngine::from_yaml(yaml).unwrap()
}

// =============================================================================
// Basic Evaluation Tests
// =============================================================================

#[test]
fn test_eval_no_rules_refuses() {
    let engine = RuleEngine::default();
    let decision = engine.evaluate(Direction::Outgoing, SocketType::Tcp, Some("1.2.3.4"), Some(80));
    assert_eq!(decision.verdict, Verdict::Reject(libc::ECONNREFUSED));
    assert_eq!(decision.matched_rule, None);
}

#[test]
fn test_eval_translate_match() {
    let engine = engine_from_yaml(
        r#"
- direction: incoming
  type: tcp
  address: 127.0.0.1
  port: 8080
  socketPath: /tmp/test.sock
"#,
    );
    let decision = engine.evaluate(
        Direction::Incoming,
        SocketType::Tcp,
        Some("127.0.0.1"),
        Some(8080),
    );
    assert_eq!(decision.verdict, Verdict::Translate("/tmp/test.sock".into()));
    assert_eq!(decision.matched_rule, Some(0));

    // Every populated filter has to agree.
    for (direction, ty, host, port) in [
        (Direction::Outgoing, SocketType::Tcp, "127.0.0.1", 8080),
        (Direction::Incoming, SocketType::Udp, "127.0.0.1", 8080),
        (Direction::Incoming, SocketType::Tcp, "127.0.0.2", 8080),
        (Direction::Incoming, SocketType::Tcp, "127.0.0.1", 8081),
    ] {
        let decision = engine.evaluate(direction, ty, Some(host), Some(port));
        assert_eq!(decision.matched_rule, None);
    }
}

#[test]
fn test_eval_reject_default_errno() {
    let engine = RuleEngine::new(vec![Rule::new(RuleAction::Reject { errno: None })]);
    let decision = engine.evaluate(Direction::Outgoing, SocketType::Udp, None, None);
    assert_eq!(decision.verdict, Verdict::Reject(libc::EACCES));
}

#[test]
fn test_eval_reject_explicit_errno() {
    let engine = engine_from_yaml("- reject: true\n  rejectError: EHOSTUNREACH\n");
    let decision = engine.evaluate(Direction::Outgoing, SocketType::Tcp, Some("::1"), Some(1));
    assert_eq!(decision.verdict, Verdict::Reject(libc::EHOSTUNREACH));
}

#[test]
fn test_eval_first_match_wins() {
    let engine = RuleEngine::new(vec![
        Rule::new(RuleAction::BlackHole).port(PortSpec::Single(53)),
        Rule::new(RuleAction::SocketPath("/run/all.sock".into())),
    ]);
    let dns = engine.evaluate(Direction::Outgoing, SocketType::Udp, Some("8.8.8.8"), Some(53));
    assert_eq!(dns.verdict, Verdict::BlackHole);
    assert_eq!(dns.matched_rule, Some(0));

    let other = engine.evaluate(Direction::Outgoing, SocketType::Udp, Some("8.8.8.8"), Some(54));
    assert_eq!(other.verdict, Verdict::Translate("/run/all.sock".into()));
    assert_eq!(other.matched_rule, Some(1));
}

#[test]
fn test_eval_order_is_strict() {
    let broad_first = RuleEngine::new(vec![
        Rule::new(RuleAction::SocketPath("/run/broad.sock".into())),
        Rule::new(RuleAction::SocketPath("/run/narrow.sock".into())).port(PortSpec::Single(80)),
    ]);
    let decision =
        broad_first.evaluate(Direction::Outgoing, SocketType::Tcp, Some("1.1.1.1"), Some(80));
    assert_eq!(decision.verdict, Verdict::Translate("/run/broad.sock".into()));
}

#[test]
fn test_eval_port_range_inclusive() {
    let engine = RuleEngine::new(vec![
        Rule::new(RuleAction::BlackHole).port(PortSpec::Range { start: 100, end: 200 }),
    ]);
    for (port, hit) in [(99, false), (100, true), (150, true), (200, true), (201, false)] {
        let decision = engine.evaluate(Direction::Outgoing, SocketType::Tcp, None, Some(port));
        assert_eq!(decision.matched_rule.is_some(), hit, "port {}", port);
    }
}

#[test]
fn test_eval_address_glob() {
    let engine = engine_from_yaml(
        r#"
- address: "10.*"
  blackhole: true
- address: "fe80::[0-9]"
  reject: true
"#,
    );
    let decision = engine.evaluate(Direction::Outgoing, SocketType::Tcp, Some("10.1.2.3"), Some(1));
    assert_eq!(decision.verdict, Verdict::BlackHole);

    let decision = engine.evaluate(Direction::Outgoing, SocketType::Tcp, Some("fe80::7"), Some(1));
    assert_eq!(decision.verdict, Verdict::Reject(libc::EACCES));

    let decision = engine.evaluate(Direction::Outgoing, SocketType::Tcp, Some("11.0.0.1"), Some(1));
    assert_eq!(decision.matched_rule, None);
}

#[test]
fn test_eval_filters_need_address_parts() {
    let engine = RuleEngine::new(vec![
        Rule::new(RuleAction::BlackHole).address("*"),
        Rule::new(RuleAction::Reject { errno: None }).port(PortSpec::Single(1)),
    ]);
    // No host: the address rule cannot match.
    let decision = engine.evaluate(Direction::Outgoing, SocketType::Tcp, None, Some(1));
    assert_eq!(decision.matched_rule, Some(1));

    // No port: neither rule matches.
    let decision = engine.evaluate(Direction::Outgoing, SocketType::Tcp, None, None);
    assert_eq!(decision.matched_rule, None);
}

#[test]
fn test_eval_activation_verdict() {
    let engine =
        engine_from_yaml("- direction: incoming\n  socketActivation: true\n  fdName: web\n");
    let decision = engine.evaluate(Direction::Incoming, SocketType::Tcp, Some("0.0.0.0"), Some(80));
    assert_eq!(decision.verdict, Verdict::Activate(Some("web".into())));
}

#[test]
fn test_eval_server_client_scenario() {
    // A server binding port 1234 and a client connecting to it share one path.
    let engine = engine_from_yaml(
        r#"
- direction: incoming
  type: tcp
  port: 1234
  socketPath: /tmp/shim/%p.sock
- direction: outgoing
  type: tcp
  port: 1234
  socketPath: /tmp/shim/%p.sock
"#,
    );
    let bind = engine.evaluate(Direction::Incoming, SocketType::Tcp, Some("0.0.0.0"), Some(1234));
    let connect =
        engine.evaluate(Direction::Outgoing, SocketType::Tcp, Some("127.0.0.1"), Some(1234));
    assert_eq!(bind.verdict, connect.verdict);
    assert_eq!(bind.matched_rule, Some(0));
    assert_eq!(connect.matched_rule, Some(1));
}
