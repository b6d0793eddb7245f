//! Errors surfaced by actions and the components behind them.
use crate::model::LogPosition;
use crate::orchestration::OrchestrationError;
use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{operation} is not supported on {resource}")]
    UnsupportedOperation {
        resource: &'static str,
        operation: &'static str,
    },
    #[error("external write and local observation did not converge within {0:?}")]
    ConvergenceTimeout(Duration),
    #[error(transparent)]
    ExternalApi(#[from] OrchestrationError),
    #[error(
        "change log truncated: position {requested} precedes retained history (truncated through {truncated_through})"
    )]
    ChangeLogTruncated {
        requested: LogPosition,
        truncated_through: LogPosition,
    },
    #[error(transparent)]
    Store(StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ActionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ObjectNotFound(message) => ActionError::ObjectNotFound(message),
            StoreError::Conflict(message) => ActionError::Conflict(message),
            StoreError::ChangeLogTruncated {
                requested,
                truncated_through,
            } => ActionError::ChangeLogTruncated {
                requested,
                truncated_through,
            },
            other => ActionError::Store(other),
        }
    }
}

impl From<serde_json::Error> for ActionError {
    fn from(err: serde_json::Error) -> Self {
        ActionError::Validation(err.to_string())
    }
}

pub type ActionResult<T> = Result<T, ActionError>;
