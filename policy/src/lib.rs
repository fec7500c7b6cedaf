//! Rule loading and evaluation for sockshim.
//!
//! Rules come from a YAML/JSON document or from compact command line
//! arguments, are validated into [`Rule`] values and evaluated in order by
//! the [`RuleEngine`].
//!
//! # Example
//!
//! ```
//! use sockshim_policy::{Direction, RuleEngine, SocketType, Verdict};
//!
//! let yaml = r#"
//! - direction: incoming
//!   type: tcp
//!   port: 8080
//!   socketPath: /run/app/http.sock
//! "#;
//!
//! let engine = RuleEngine::from_yaml(yaml).unwrap();
//!
//! let decision =
//!     engine.evaluate(Direction::Incoming, SocketType::Tcp, Some("0.0.0.0"), Some(8080));
//! assert_eq!(decision.verdict, Verdict::Translate("/run/app/http.sock".into()));
//!
//! let decision = engine.evaluate(Direction::Outgoing, SocketType::Tcp, Some("1.2.3.4"), Some(80));
//! assert_eq!(decision.verdict, Verdict::Reject(libc::ECONNREFUSED));
//! ```

mod engine;
mod errno;
mod error;
mod parser;
mod validate;
mod yaml;

#[cfg(test)]
mod tests;

pub use engine::{Decision, RuleEngine, Verdict};
pub use errno::{errno_from_name, errno_name};
pub use error::{Result, RuleError, ValidationError};
pub use parser::{parse_rule_arg, parse_rule_args};
pub use sockshim_protocol::{Direction, PortSpec, Rule, RuleAction, SocketType};
pub use validate::validate_entry;
pub use yaml::{load_rules_file, parse_rules, ErrnoValue, RuleEntry};
