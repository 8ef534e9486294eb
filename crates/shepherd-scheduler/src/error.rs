//! Scheduler error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while planning a reschedule.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("placement error: {0}")]
    Plan(#[from] shepherd_placement::PlanError),

    #[error("state store error: {0}")]
    State(#[from] shepherd_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Failure of a single recreate call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("connection to {destination} failed: {reason}")]
    Connect { destination: String, reason: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("instance rejected recreation with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("recreate call timed out after {0:?}")]
    Timeout(Duration),

    #[error("recreate task aborted: {0}")]
    Aborted(String),
}
