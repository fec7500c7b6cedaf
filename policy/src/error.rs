use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to parse rules: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to read rule file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rule #{position}: {source}")]
    Invalid {
        position: usize,
        #[source]
        source: ValidationError,
    },

    #[error("rule #{position}: {message}")]
    InvalidArgument { position: usize, message: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no action given; use one of socketPath, reject, blackhole or socketActivation")]
    NoAction,

    #[error("conflicting actions: {}", .0.join(", "))]
    ConflictingActions(Vec<&'static str>),

    #[error("invalid direction '{0}' (expected 'incoming' or 'outgoing')")]
    InvalidDirection(String),

    #[error("invalid socket type '{0}' (expected 'tcp' or 'udp')")]
    InvalidSocketType(String),

    #[error("address pattern must not be empty")]
    EmptyAddress,

    #[error("socket path must be absolute: {0}")]
    RelativeSocketPath(String),

    #[error("'portEnd' requires 'port'")]
    PortEndWithoutPort,

    #[error("invalid port range {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("unknown error code '{0}'")]
    UnknownErrno(String),

    #[error("'rejectError' is only valid together with 'reject'")]
    RejectErrorWithoutReject,

    #[error("'fdName' is only valid together with 'socketActivation'")]
    FdNameWithoutActivation,

    #[error("socket activation is only valid for incoming rules")]
    ActivationNotIncoming,
}

pub type Result<T> = std::result::Result<T, RuleError>;
