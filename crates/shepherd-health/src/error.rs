//! Health monitoring error types.

use thiserror::Error;

/// Errors raised while inspecting an instance. They are logged where they
/// occur and never escape the cleanup cycle.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("malformed instance address `{0}`: expected host:port")]
    MalformedAddress(String),

    #[error("invalid probe query name: {0}")]
    InvalidQueryName(String),

    #[error("state store error: {0}")]
    State(#[from] shepherd_state::StateError),
}

pub type MonitorResult<T> = Result<T, MonitorError>;
