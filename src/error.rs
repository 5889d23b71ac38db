use crate::retry::FailureRecord;
use crate::step::StepName;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A failure raised by an external collaborator (movie data, summarizer,
/// email transport, delivery status).
///
/// Collaborators report *what happened*; whether that is worth retrying is
/// decided separately by a [`RetryClassifier`](crate::RetryClassifier).
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CollaboratorError {
    /// The call did not answer in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The connection could not be established or was reset.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The service answered with a non-success status not covered by a
    /// more specific variant.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Response status code
        status: u16,
        /// Response body or summary
        message: String,
    },

    /// The requested entity does not exist, e.g. an unknown movie title.
    #[error("not found: {0}")]
    NotFound(String),

    /// The recipient address was rejected by the email transport.
    #[error("invalid recipient address: {0}")]
    InvalidAddress(String),

    /// Credentials were missing, wrong or lacked permission.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The summarization service refused the content.
    #[error("content policy rejection: {0}")]
    ContentPolicy(String),

    /// The service answered with something that could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The run was cancelled while waiting on this collaborator.
    #[error("cancelled")]
    Cancelled,
}

/// The inbound event failed shape validation; no run is created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// The trigger's event name is not the one this dispatcher handles.
    #[error("unexpected event name '{actual}', expected '{expected}'")]
    UnexpectedEventName {
        /// Configured event name
        expected: String,
        /// Name carried by the trigger
        actual: String,
    },

    /// A required field is absent or blank.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The recipient address is not syntactically an email address.
    #[error("malformed recipient email: {0}")]
    MalformedEmail(String),
}

/// Errors surfaced by [`StepRunner::run`](crate::StepRunner::run).
///
/// Retriable failures never appear here until they exhaust the retry
/// budget; they are retried inside the runner.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum StepError {
    /// The step failed with a Terminal classification; it was not retried.
    #[error("step '{step_name}' failed terminally: {}", .failure.cause)]
    Terminal {
        /// The failing step
        step_name: StepName,
        /// The classified failure
        failure: FailureRecord,
    },

    /// The step kept failing with Retriable errors until `max_attempts`.
    #[error("step '{step_name}' exhausted {attempts} attempts: {}", .failure.cause)]
    Exhausted {
        /// The failing step
        step_name: StepName,
        /// Attempts made, equal to the policy's `max_attempts`
        attempts: u32,
        /// The last classified failure
        failure: FailureRecord,
    },

    /// The run was cancelled before or between attempts.
    #[error("step '{step_name}' cancelled")]
    Cancelled {
        /// The step that was interrupted
        step_name: StepName,
    },

    /// The step's memoized value could not be decoded into its output type.
    #[error("step '{step_name}' produced an unreadable value: {details}")]
    Payload {
        /// The step whose value is unreadable
        step_name: StepName,
        /// Decoder message
        details: String,
    },
}

impl StepError {
    pub fn step_name(&self) -> &StepName {
        match self {
            StepError::Terminal { step_name, .. }
            | StepError::Exhausted { step_name, .. }
            | StepError::Cancelled { step_name }
            | StepError::Payload { step_name, .. } => step_name,
        }
    }
}

/// Why a run ended in `Failed`, as recorded in the outcome log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    NotFound,
    InvalidAddress,
    Unauthorized,
    ContentPolicy,
    MalformedResponse,
    UpstreamError,
    Exhausted,
    Cancelled,
    RunTimedOut,
    Bounced,
    DeliveryFailed,
    DeliveryTimedOut,
}

impl FailureReason {
    /// Reason for a failed step.
    pub fn from_step_error(error: &StepError) -> Self {
        match error {
            StepError::Terminal { failure, .. } => Self::from_cause(&failure.cause),
            StepError::Exhausted { .. } => FailureReason::Exhausted,
            StepError::Cancelled { .. } => FailureReason::Cancelled,
            StepError::Payload { .. } => FailureReason::MalformedResponse,
        }
    }

    fn from_cause(cause: &CollaboratorError) -> Self {
        match cause {
            CollaboratorError::NotFound(_) => FailureReason::NotFound,
            CollaboratorError::InvalidAddress(_) => FailureReason::InvalidAddress,
            CollaboratorError::Unauthorized(_) => FailureReason::Unauthorized,
            CollaboratorError::ContentPolicy(_) => FailureReason::ContentPolicy,
            CollaboratorError::MalformedResponse(_) => FailureReason::MalformedResponse,
            CollaboratorError::Cancelled => FailureReason::Cancelled,
            CollaboratorError::Timeout(_)
            | CollaboratorError::Connection(_)
            | CollaboratorError::Http { .. } => FailureReason::UpstreamError,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
