//! Compact rule arguments as given on the command line with `-r`.
//!
//! `in,tcp,port=8080,path=/run/app.sock` or `out,addr=10.*,reject=ECONNREFUSED`.
//! A backslash escapes the next character, so paths may contain commas.

use sockshim_protocol::Rule;

use crate::error::{Result, RuleError};
use crate::validate::validate_entry;
use crate::yaml::{ErrnoValue, RuleEntry};

/// Parse one `-r` argument. `position` is the 1-based index used in errors.
pub fn parse_rule_arg(position: usize, arg: &str) -> Result<Rule> {
    let invalid = |message: String| RuleError::InvalidArgument { position, message };

    let mut entry = RuleEntry::default();
    for token in split_escaped(arg) {
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (token.as_str(), None),
        };
        match (key, value) {
            ("in" | "incoming", None) => entry.direction = Some("incoming".into()),
            ("out" | "outgoing", None) => entry.direction = Some("outgoing".into()),
            ("tcp" | "udp" | "stream" | "datagram" | "dgram", None) => {
                entry.socket_type = Some(key.into())
            }
            ("addr" | "address", Some(v)) => entry.address = Some(v.into()),
            ("port", Some(v)) => {
                let (start, end) = parse_ports(v)
                    .ok_or_else(|| invalid(format!("invalid port specification '{}'", v)))?;
                entry.port = Some(start);
                entry.port_end = end;
            }
            ("path", Some(v)) => entry.socket_path = Some(v.into()),
            ("reject", v) => {
                entry.reject = true;
                entry.reject_error = v.map(|name| match name.parse::<i32>() {
                    Ok(n) => ErrnoValue::Number(n),
                    Err(_) => ErrnoValue::Name(name.into()),
                });
            }
            ("blackhole", None) => entry.blackhole = true,
            ("systemd", v) => {
                entry.socket_activation = true;
                entry.fd_name = v.filter(|name| !name.is_empty()).map(Into::into);
            }
            ("", None) => return Err(invalid("empty rule option".into())),
            (_, Some(_)) => return Err(invalid(format!("unknown rule option '{}'", key))),
            (_, None) => return Err(invalid(format!("unknown rule flag '{}'", key))),
        }
    }

    validate_entry(&entry).map_err(|source| RuleError::Invalid { position, source })
}

/// Parse all `-r` arguments in order.
pub fn parse_rule_args<S: AsRef<str>>(args: &[S]) -> Result<Vec<Rule>> {
    args.iter()
        .enumerate()
        .map(|(i, arg)| parse_rule_arg(i + 1, arg.as_ref()))
        .collect()
}

fn parse_ports(spec: &str) -> Option<(u16, Option<u16>)> {
    match spec.split_once('-') {
        Some((start, end)) => Some((start.trim().parse().ok()?, Some(end.trim().parse().ok()?))),
        None => Some((spec.trim().parse().ok()?, None)),
    }
}

fn split_escaped(arg: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = arg.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' => tokens.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    tokens.push(current);
    tokens
}
