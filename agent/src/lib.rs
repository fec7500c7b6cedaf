//! sockshim agent - preloaded into a program to move its IP sockets onto
//! Unix domain sockets.
//!
//! The library is loaded via LD_PRELOAD and overrides the libc socket
//! calls. Rules arrive JSON encoded in `SOCKSHIM_RULES`; without that
//! variable the agent stays dormant and every call goes straight to libc.

pub mod activation;
pub mod blackhole;
pub mod dispatch;
#[cfg(all(target_os = "linux", not(test)))]
mod hooks;
pub mod ops;
pub mod ports;
pub mod realcalls;
pub mod registry;
pub mod sockaddr;
pub mod socket;
pub mod sockopts;

#[cfg(test)]
mod test_utils;

pub use dispatch::{SendTarget, Shim};

use std::sync::{Arc, OnceLock};

use log::{error, info};
use sockshim_policy::RuleEngine;
use sockshim_protocol::env::{decode_rules, LOG_VAR, PORT_RANGE_VAR, RULES_VAR};

use crate::activation::SystemdFds;
use crate::ops::SocketOps;
use crate::realcalls::RealCalls;

/// Global agent state, set once by [`sockshim_agent_init`].
static SHIM: OnceLock<Shim> = OnceLock::new();

/// The active shim, if the agent was initialized with rules.
pub fn shim() -> Option<&'static Shim> {
    SHIM.get()
}

fn init_logging() {
    let env = env_logger::Env::new().filter_or(LOG_VAR, "warn");
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .try_init();
}

/// Initialize the agent from the environment. Returns 0; a missing rule
/// set leaves the agent dormant.
#[unsafe(no_mangle)]
pub extern "C" fn sockshim_agent_init() -> i32 {
    let Ok(encoded) = std::env::var(RULES_VAR) else {
        return 0;
    };
    if SHIM.get().is_some() {
        return 0;
    }
    init_logging();

    // Malformed rules fail closed: every IP socket operation is refused.
    let rules = decode_rules(&encoded).unwrap_or_else(|e| {
        error!("invalid {}: {}", RULES_VAR, e);
        Vec::new()
    });
    let count = rules.len();

    let ops: Arc<dyn SocketOps> = Arc::new(RealCalls);
    let port_range = ports::ephemeral_range(std::env::var(PORT_RANGE_VAR).ok().as_deref());
    let activation = SystemdFds::from_env(ops.clone());
    let shim = Shim::new(RuleEngine::new(rules), ops, port_range, Box::new(activation));

    if SHIM.set(shim).is_ok() {
        info!(
            "sockshim agent active with {} rule(s), ports {}-{}",
            count, port_range.0, port_range.1
        );
    }
    0
}

/// Constructor attribute for automatic initialization on library load.
#[cfg(all(target_os = "linux", not(test)))]
#[unsafe(link_section = ".init_array")]
#[used]
static INIT: extern "C" fn() = {
    extern "C" fn init() {
        sockshim_agent_init();
    }
    init
};
