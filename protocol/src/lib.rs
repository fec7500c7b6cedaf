//! Common types shared between the sockshim launcher and agent.

pub mod env;
pub mod glob;
pub mod rule;

pub use rule::*;
