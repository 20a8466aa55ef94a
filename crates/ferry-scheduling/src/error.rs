use std::sync::PoisonError;

use ferry_common::error::CommonError;
use thiserror::Error;
use tokio::task::JoinError;

pub type SchedulingResult<T> = Result<T, SchedulingError>;

/// The message carried by the gRPC status when the scheduler is not running.
/// Queriers match on this text to fail over without logging an error.
pub const SCHEDULER_NOT_RUNNING_MESSAGE: &str = "scheduler is not running";

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("too many outstanding requests")]
    TooManyRequests,
    #[error("queue is stopped")]
    QueueStopped,
    #[error("scheduler is not running")]
    SchedulerNotRunning,
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("error in common: {0}")]
    CommonError(#[from] CommonError),
    #[error("error in Tonic transport: {0}")]
    TonicTransportError(#[from] tonic::transport::Error),
    #[error("error in Tonic status: {0}")]
    TonicStatusError(#[from] tonic::Status),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl SchedulingError {
    pub fn invalid(message: impl Into<String>) -> Self {
        SchedulingError::InvalidArgument(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        SchedulingError::InternalError(message.into())
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        SchedulingError::Cancelled(message.into())
    }
}

impl From<JoinError> for SchedulingError {
    fn from(error: JoinError) -> Self {
        SchedulingError::InternalError(error.to_string())
    }
}

impl<T> From<PoisonError<T>> for SchedulingError {
    fn from(error: PoisonError<T>) -> Self {
        SchedulingError::InternalError(error.to_string())
    }
}

impl From<SchedulingError> for tonic::Status {
    fn from(e: SchedulingError) -> tonic::Status {
        match e {
            SchedulingError::TonicStatusError(e) => e,
            SchedulingError::SchedulerNotRunning => {
                tonic::Status::unavailable(SCHEDULER_NOT_RUNNING_MESSAGE)
            }
            x @ SchedulingError::TooManyRequests => tonic::Status::resource_exhausted(x.to_string()),
            x @ SchedulingError::QueueStopped => tonic::Status::unavailable(x.to_string()),
            x @ SchedulingError::Cancelled(_) => tonic::Status::cancelled(x.to_string()),
            x @ SchedulingError::InvalidArgument(_) => {
                tonic::Status::invalid_argument(x.to_string())
            }
            x => tonic::Status::internal(x.to_string()),
        }
    }
}
