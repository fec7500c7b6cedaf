use sockshim_protocol::{Direction, PortSpec, Rule, RuleAction, SocketType};

use crate::errno::errno_from_name;
use crate::error::ValidationError;
use crate::yaml::{ErrnoValue, RuleEntry};

/// Turn a raw entry into a rule, checking that it names exactly one action
/// and that its filters are coherent.
pub fn validate_entry(entry: &RuleEntry) -> Result<Rule, ValidationError> {
    let direction = entry
        .direction
        .as_deref()
        .map(parse_direction)
        .transpose()?;

    let socket_type = entry
        .socket_type
        .as_deref()
        .map(|t| SocketType::parse(t).ok_or_else(|| ValidationError::InvalidSocketType(t.into())))
        .transpose()?;

    if entry.address.as_deref().is_some_and(str::is_empty) {
        return Err(ValidationError::EmptyAddress);
    }

    let port = match (entry.port, entry.port_end) {
        (None, None) => None,
        (None, Some(_)) => return Err(ValidationError::PortEndWithoutPort),
        (Some(p), None) => Some(PortSpec::Single(p)),
        (Some(start), Some(end)) if start == end => Some(PortSpec::Single(start)),
        (Some(start), Some(end)) if start < end => Some(PortSpec::Range { start, end }),
        (Some(start), Some(end)) => return Err(ValidationError::InvalidPortRange { start, end }),
    };

    let action = validate_action(entry, direction)?;

    Ok(Rule {
        direction,
        socket_type,
        address: entry.address.clone(),
        port,
        action,
    })
}

fn parse_direction(s: &str) -> Result<Direction, ValidationError> {
    match s.to_ascii_lowercase().as_str() {
        "in" | "incoming" => Ok(Direction::Incoming),
        "out" | "outgoing" => Ok(Direction::Outgoing),
        _ => Err(ValidationError::InvalidDirection(s.to_string())),
    }
}

fn validate_action(
    entry: &RuleEntry,
    direction: Option<Direction>,
) -> Result<RuleAction, ValidationError> {
    let mut named = Vec::new();
    if entry.socket_path.is_some() {
        named.push("socketPath");
    }
    if entry.reject {
        named.push("reject");
    }
    if entry.blackhole {
        named.push("blackhole");
    }
    if entry.socket_activation {
        named.push("socketActivation");
    }

    match named.len() {
        0 => return Err(ValidationError::NoAction),
        1 => {}
        _ => return Err(ValidationError::ConflictingActions(named)),
    }

    if entry.reject_error.is_some() && !entry.reject {
        return Err(ValidationError::RejectErrorWithoutReject);
    }
    if entry.fd_name.is_some() && !entry.socket_activation {
        return Err(ValidationError::FdNameWithoutActivation);
    }

    if let Some(path) = &entry.socket_path {
        if !path.starts_with('/') {
            return Err(ValidationError::RelativeSocketPath(path.clone()));
        }
        return Ok(RuleAction::SocketPath(path.clone()));
    }

    if entry.reject {
        let errno = match &entry.reject_error {
            None => None,
            Some(ErrnoValue::Number(n)) if *n > 0 => Some(*n),
            Some(ErrnoValue::Number(n)) => {
                return Err(ValidationError::UnknownErrno(n.to_string()))
            }
            Some(ErrnoValue::Name(name)) => Some(
                errno_from_name(name).ok_or_else(|| ValidationError::UnknownErrno(name.clone()))?,
            ),
        };
        return Ok(RuleAction::Reject { errno });
    }

    if entry.blackhole {
        return Ok(RuleAction::BlackHole);
    }

    if direction != Some(Direction::Incoming) {
        return Err(ValidationError::ActivationNotIncoming);
    }
    Ok(RuleAction::Activate {
        fd_name: entry.fd_name.clone(),
    })
}
