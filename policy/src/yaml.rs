//! Rule documents in YAML (or JSON, which YAML accepts as well).
//!
//! ```yaml
//! - direction: incoming
//!   type: tcp
//!   port: 8080
//!   socketPath: /run/app/http.sock
//! - direction: outgoing
//!   address: "10.*"
//!   reject: true
//!   rejectError: ECONNREFUSED
//! ```

use std::path::Path;

use serde::Deserialize;
use sockshim_protocol::Rule;

use crate::error::{Result, RuleError};
use crate::validate::validate_entry;

/// A rule entry exactly as written in a document, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleEntry {
    pub direction: Option<String>,
    #[serde(rename = "type")]
    pub socket_type: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub port_end: Option<u16>,
    pub socket_path: Option<String>,
    #[serde(default)]
    pub reject: bool,
    pub reject_error: Option<ErrnoValue>,
    #[serde(default)]
    pub blackhole: bool,
    #[serde(default)]
    pub socket_activation: bool,
    pub fd_name: Option<String>,
}

/// `rejectError` may be a symbolic name or a number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ErrnoValue {
    Number(i32),
    Name(String),
}

/// Parse and validate a rule document.
pub fn parse_rules(document: &str) -> Result<Vec<Rule>> {
    let entries: Vec<RuleEntry> = serde_yaml::from_str(document)?;
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            validate_entry(entry).map_err(|source| RuleError::Invalid {
                position: i + 1,
                source,
            })
        })
        .collect()
}

/// Read, parse and validate a rule file.
pub fn load_rules_file(path: &Path) -> Result<Vec<Rule>> {
    let document = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_rules(&document)
}
