//! Run a program with the agent library preloaded.

use std::ffi::{OsStr, OsString};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use log::debug;
use sockshim_protocol::env::{encode_rules, AGENT_PATH_VAR, LOG_VAR, RULES_VAR};
use sockshim_protocol::Rule;

/// File name of the agent library.
pub(crate) const AGENT_LIB_NAME: &str = "libsockshim_agent.so";

/// Find the agent library: `SOCKSHIM_AGENT` if set, else next to the
/// executable or in the `lib` directory of its prefix.
pub(crate) fn find_agent_library() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(AGENT_PATH_VAR) {
        let path = PathBuf::from(path);
        return path
            .canonicalize()
            .with_context(|| format!("{} points to {}", AGENT_PATH_VAR, path.display()));
    }

    let mut candidates = Vec::new();
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            candidates.push(exe_dir.join(AGENT_LIB_NAME));
            // {prefix}/bin/../lib/
            candidates.push(exe_dir.join("..").join("lib").join(AGENT_LIB_NAME));
            candidates.push(exe_dir.join("..").join("lib").join("sockshim").join(AGENT_LIB_NAME));
        }
    }

    for candidate in &candidates {
        if candidate.is_file() {
            // Absolute path, the program may change directory.
            return candidate
                .canonicalize()
                .with_context(|| format!("Failed to canonicalize path: {:?}", candidate));
        }
    }

    anyhow::bail!(
        "Agent library {} not found. Build the workspace or set {}",
        AGENT_LIB_NAME,
        AGENT_PATH_VAR
    )
}

/// `LD_PRELOAD` with the agent in front of whatever was preloaded already.
pub(crate) fn preload_value(agent: &Path, existing: Option<&OsStr>) -> OsString {
    let mut value = OsString::from(agent.as_os_str());
    if let Some(existing) = existing.filter(|e| !e.is_empty()) {
        value.push(":");
        value.push(existing);
    }
    value
}

/// `SOCKSHIM_LOG` filter for a launcher verbosity, if any.
pub(crate) fn agent_log_filter(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    }
}

/// Environment handed to the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AgentEnv {
    pub preload: OsString,
    pub rules: String,
    pub log: Option<&'static str>,
}

impl AgentEnv {
    pub(crate) fn new(agent: &Path, rules: &[Rule], verbose: u8) -> Result<Self> {
        let rules = encode_rules(rules).context("Failed to encode rules")?;
        Ok(Self {
            preload: preload_value(agent, std::env::var_os("LD_PRELOAD").as_deref()),
            rules,
            log: agent_log_filter(verbose),
        })
    }

    pub(crate) fn apply(&self, command: &mut Command) {
        command.env("LD_PRELOAD", &self.preload);
        command.env(RULES_VAR, &self.rules);
        if let Some(filter) = self.log {
            command.env(LOG_VAR, filter);
        }
    }
}

/// Replace this process with `program`. Only returns on failure.
pub(crate) fn exec_with_agent(program: &[String], rules: &[Rule], verbose: u8) -> Result<()> {
    let (name, args) = program.split_first().context("No program given")?;
    let agent = find_agent_library()?;
    debug!("Agent library: {}", agent.display());

    let env = AgentEnv::new(&agent, rules, verbose)?;
    let mut command = Command::new(name);
    command.args(args);
    env.apply(&mut command);

    debug!("Executing {} with {} rule(s)", name, rules.len());
    let err = command.exec();
    Err(err).with_context(|| format!("Failed to execute {}", name))
}
