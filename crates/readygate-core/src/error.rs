//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or validating check definitions.
///
/// Any of these aborts the gate before a single probe runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("malformed inline check `{input}`: {reason}")]
    Inline { input: String, reason: String },

    #[error("check is missing required field `{field}`")]
    MissingField { field: &'static str },

    #[error("check `{check}`: unknown kind `{kind}` (expected http, tcp or cmd)")]
    UnknownKind { check: String, kind: String },

    #[error("check `{check}`: unknown backoff `{backoff}` (expected fixed or exponential)")]
    UnknownBackoff { check: String, backoff: String },

    #[error("check `{check}`: invalid duration for `{field}`: `{value}`")]
    InvalidDuration {
        check: String,
        field: &'static str,
        value: String,
    },

    #[error("check `{check}`: `{field}` must be positive")]
    NonPositive { check: String, field: &'static str },

    #[error("check `{check}`: invalid max-attempts `{value}`")]
    InvalidMaxAttempts { check: String, value: String },

    #[error("check `{check}`: invalid target `{target}`: {reason}")]
    InvalidTarget {
        check: String,
        target: String,
        reason: String,
    },

    #[error("check `{check}`: expect-body is only valid for http checks")]
    ExpectBodyNotHttp { check: String },

    #[error(
        "check `{check}`: max-attempts = until-deadline needs a per-check deadline or an overall timeout"
    )]
    Unbounded { check: String },

    #[error("duplicate check name `{0}`")]
    DuplicateName(String),

    #[error("invalid overall timeout `{0}`")]
    InvalidOverallTimeout(String),

    #[error("no checks configured")]
    NoChecks,
}

pub type ConfigResult<T> = Result<T, ConfigError>;
