use crate::retry::FailureRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Type-safe step name wrapper.
///
/// Step names key the memo table together with the run id, so two steps of
/// one run must never share a name.
///
/// # Examples
///
/// ```
/// use cinemail::StepName;
///
/// let name = StepName::new("fetch-movie");
/// assert_eq!(name.as_str(), "fetch-movie");
///
/// let name: StepName = "send-email".into();
/// assert_eq!(name.to_string(), "send-email");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the step name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Lifecycle of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not attempted yet, or an attempt was interrupted before it finished.
    Pending,
    /// Finished successfully. The value is frozen from here on.
    Succeeded,
    /// The latest attempt failed; see [`StepResult::failure`].
    Failed,
}

/// The recorded state of one `(run, step)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: StepName,
    pub status: StepStatus,
    /// JSON payload produced by the step, set once `status` is `Succeeded`.
    pub value: Option<Value>,
    /// Failure of the latest attempt, set while `status` is `Failed`.
    pub failure: Option<FailureRecord>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl StepResult {
    /// A fresh result with no attempts recorded.
    pub fn pending(step_name: StepName) -> Self {
        Self {
            step_name,
            status: StepStatus::Pending,
            value: None,
            failure: None,
            attempt_count: 0,
            last_attempt_at: None,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}
