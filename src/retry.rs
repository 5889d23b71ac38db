//! Failure classification and retry backoff.

use crate::error::CollaboratorError;
use crate::step::StepName;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient; the same call may succeed later.
    Retriable,
    /// Permanent; retrying would fail identically.
    Terminal,
}

/// A classified step failure, attached to the step's [`StepResult`](crate::StepResult).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub cause: CollaboratorError,
    pub step_name: StepName,
    /// 1-based attempt number that produced this failure
    pub attempt: u32,
}

/// A collaborator failure together with its classification, before the memo
/// stamps it with the step name and attempt number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFailure {
    pub kind: FailureKind,
    pub cause: CollaboratorError,
}

/// Maps a collaborator failure to a [`FailureKind`].
///
/// # Examples
///
/// ```
/// use cinemail::{CollaboratorError, DefaultClassifier, FailureKind, RetryClassifier};
///
/// let classifier = DefaultClassifier::default();
/// let throttled = CollaboratorError::Http { status: 429, message: "slow down".into() };
/// assert_eq!(classifier.classify(&throttled), FailureKind::Retriable);
///
/// let unknown = CollaboratorError::NotFound("Movie not found!".into());
/// assert_eq!(classifier.classify(&unknown), FailureKind::Terminal);
/// ```
pub trait RetryClassifier: Send + Sync {
    fn classify(&self, error: &CollaboratorError) -> FailureKind;
}

/// The default policy table.
///
/// Timeouts, connection failures, HTTP 408, 429 and 5xx are Retriable;
/// everything else is Terminal. Individual HTTP statuses can be overridden
/// with [`DefaultClassifier::with_status`].
#[derive(Debug, Clone, Default)]
pub struct DefaultClassifier {
    status_overrides: HashMap<u16, FailureKind>,
}

impl DefaultClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify HTTP `status` as `kind`, taking precedence over the table.
    pub fn with_status(mut self, status: u16, kind: FailureKind) -> Self {
        self.status_overrides.insert(status, kind);
        self
    }

    fn classify_status(&self, status: u16) -> FailureKind {
        if let Some(kind) = self.status_overrides.get(&status) {
            return *kind;
        }
        match status {
            408 | 429 | 500..=599 => FailureKind::Retriable,
            _ => FailureKind::Terminal,
        }
    }
}

impl RetryClassifier for DefaultClassifier {
    fn classify(&self, error: &CollaboratorError) -> FailureKind {
        match error {
            CollaboratorError::Timeout(_) | CollaboratorError::Connection(_) => {
                FailureKind::Retriable
            }
            CollaboratorError::Http { status, .. } => self.classify_status(*status),
            CollaboratorError::NotFound(_)
            | CollaboratorError::InvalidAddress(_)
            | CollaboratorError::Unauthorized(_)
            | CollaboratorError::ContentPolicy(_)
            | CollaboratorError::MalformedResponse(_)
            | CollaboratorError::Cancelled => FailureKind::Terminal,
        }
    }
}

/// Error returned when [`RetryPolicy`] configuration is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyError(pub &'static str);

impl std::fmt::Display for RetryPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RetryPolicyError {}

/// Exponential backoff with jitter.
///
/// `max_attempts` counts every attempt, including the first one.
///
/// # Examples
///
/// ```
/// use cinemail::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(4, Duration::from_millis(100), Duration::from_secs(1))?;
///
/// // Before jitter: 100ms, 200ms, 400ms, then capped
/// assert_eq!(policy.backoff(1), Duration::from_millis(100));
/// assert_eq!(policy.backoff(2), Duration::from_millis(200));
/// assert_eq!(policy.backoff(5), Duration::from_secs(1));
/// assert!(policy.is_exhausted(4));
/// # Ok::<(), cinemail::RetryPolicyError>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default jitter of ±10%.
    ///
    /// # Errors
    ///
    /// Returns [`RetryPolicyError`] if:
    /// - `max_attempts` is 0
    /// - `max_delay` is less than `base_delay`
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self, RetryPolicyError> {
        if max_attempts == 0 {
            return Err(RetryPolicyError("max_attempts must be at least 1"));
        }
        if max_delay < base_delay {
            return Err(RetryPolicyError("max_delay must be >= base_delay"));
        }
        Ok(Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.1,
        })
    }

    /// Sets the jitter fraction applied to each delay.
    ///
    /// # Errors
    ///
    /// Returns [`RetryPolicyError`] if `jitter` is outside `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Result<Self, RetryPolicyError> {
        if !(0.0..=1.0).contains(&jitter) {
            return Err(RetryPolicyError("jitter must be between 0.0 and 1.0"));
        }
        self.jitter = jitter;
        Ok(self)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Returns `true` once `attempt_count` attempts leave no budget.
    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }

    /// Delay after failed attempt `attempt` (1-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u64 << exponent;
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as u64))
    }

    /// Delay after failed attempt `attempt` (1-based), with jitter applied.
    ///
    /// The result stays within `backoff(attempt) * (1 ± jitter)` and never
    /// exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if self.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64(1.0 + spread).min(self.max_delay)
    }
}
