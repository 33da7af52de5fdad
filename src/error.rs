//! Crate-level error types.
//!
//! Collaborator failures are caught at the call site by the reconciler and the
//! readiness tracker and end up in a log record or a domain event. These types
//! only travel as far as that call site, except for [`ConfigError`], which the
//! binary surfaces during bootstrap.

use thiserror::Error;

/// Failure of a broker-management call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// A TCP-level connection or request could not be completed.
    #[error("transport failure talking to {url}: {detail}")]
    Transport { url: String, detail: String },
    /// The management endpoint replied with a non-2xx HTTP status code.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },
    /// The broker rejected a management operation.
    #[error("{operation} failed: {detail}")]
    Command { operation: String, detail: String },
    /// A response could not be decoded into the expected shape.
    #[error("could not decode {what}: {detail}")]
    Decode { what: String, detail: String },
}

impl BrokerError {
    pub fn command(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        BrokerError::Command {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

/// Failure of a configuration-store call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// The version token moved between read and write.
    #[error("concurrent modification of {name}: expected version {expected}, found {found}")]
    Conflict {
        name: String,
        expected: u64,
        found: u64,
    },
    #[error("could not decode {name}: {detail}")]
    Decode { name: String, detail: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failure while loading the agent configuration or its seed data.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {path}: {detail}")]
    Parse { path: String, detail: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
