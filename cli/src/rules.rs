//! Loading rules from the command line sources.

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::warn;
use sockshim_policy::{load_rules_file, parse_rule_args, parse_rules, Rule};

/// Where the rules come from. Exactly one source per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RuleSource {
    File(PathBuf),
    Data(String),
    Args(Vec<String>),
}

pub(crate) fn load(source: &RuleSource) -> Result<Vec<Rule>> {
    let rules = match source {
        RuleSource::File(path) => load_rules_file(path)
            .with_context(|| format!("Failed to load rules from {}", path.display()))?,
        RuleSource::Data(document) => parse_rules(document).context("Invalid rule data")?,
        RuleSource::Args(args) => parse_rule_args(args).context("Invalid rule argument")?,
    };
    if rules.is_empty() {
        warn!("No rules given, every IP socket operation will be refused");
    }
    Ok(rules)
}

/// Human readable listing for `--print`.
pub(crate) fn format_rules(rules: &[Rule]) -> String {
    let mut out = String::new();
    for (i, rule) in rules.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&format!("Rule #{}:\n{}\n", i + 1, rule));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockshim_policy::{Direction, RuleAction};

    #[test]
    fn test_load_from_args() {
        let source = RuleSource::Args(vec![
            "in,tcp,port=80,path=/run/web.sock".to_string(),
            "reject".to_string(),
        ]);
        let rules = load(&source).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].direction, Some(Direction::Incoming));
        assert_eq!(rules[1].action, RuleAction::Reject { errno: None });
    }

    #[test]
    fn test_load_from_data() {
        let source = RuleSource::Data(r#"[{"direction": "outgoing", "blackhole": true}]"#.into());
        let rules = load(&source).unwrap();
        assert_eq!(rules[0].action, RuleAction::BlackHole);
    }

    #[test]
    fn test_load_errors_carry_context() {
        let err = load(&RuleSource::File("/nonexistent/rules.yaml".into())).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/rules.yaml"));

        let err = load(&RuleSource::Args(vec!["in,bogus".into()])).unwrap_err();
        assert!(format!("{:#}", err).starts_with("Invalid rule argument"));
    }

    #[test]
    fn test_format_rules_numbers_entries() {
        let rules = load(&RuleSource::Args(vec![
            "out,blackhole".into(),
            "reject=EPERM".into(),
        ]))
        .unwrap();
        let text = format_rules(&rules);
        assert!(text.starts_with("Rule #1:\n  Direction: outgoing\n"));
        assert!(text.contains("\nRule #2:\n"));
        assert!(text.contains("  Action: black hole\n"));
        assert!(text.contains(&format!("  Action: reject with errno {}\n", libc_eperm())));
    }

    fn libc_eperm() -> i32 {
        sockshim_policy::errno_from_name("EPERM").unwrap()
    }
}
