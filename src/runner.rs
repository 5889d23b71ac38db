use crate::context::RunContext;
use crate::error::{CollaboratorError, StepError};
use crate::memo::StepMemo;
use crate::retry::{ClassifiedFailure, FailureKind, RetryClassifier, RetryPolicy};
use crate::step::{StepName, StepStatus};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Executes single steps with memoization, per-attempt timeouts and
/// classified retries.
#[derive(Clone)]
pub struct StepRunner {
    memo: Arc<StepMemo>,
    classifier: Arc<dyn RetryClassifier>,
    policy: RetryPolicy,
    step_timeout: Duration,
}

impl fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRunner")
            .field("memo_entries", &self.memo.len())
            .field("policy", &self.policy)
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}

impl StepRunner {
    pub fn new(
        memo: Arc<StepMemo>,
        classifier: Arc<dyn RetryClassifier>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            memo,
            classifier,
            policy,
            step_timeout: Duration::from_secs(30),
        }
    }

    /// Bounds each attempt; an attempt that overruns fails with
    /// [`CollaboratorError::Timeout`].
    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn memo(&self) -> &Arc<StepMemo> {
        &self.memo
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    /// Runs `step` for `ctx`'s run under `step_name` and returns its value.
    ///
    /// A value memoized by an earlier call (from this or a duplicate run
    /// context with the same run id) is returned without calling `step`.
    /// Retriable failures are retried after a jittered backoff until the
    /// policy's `max_attempts`; Terminal failures return immediately.
    ///
    /// # Errors
    ///
    /// - [`StepError::Terminal`] on a Terminal classification
    /// - [`StepError::Exhausted`] when Retriable failures use up the budget
    /// - [`StepError::Cancelled`] when the run is cancelled, including
    ///   mid-attempt; an interrupted attempt leaves the memo slot `Pending`
    /// - [`StepError::Payload`] when the value cannot be (de)serialized
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &mut RunContext,
        step_name: impl Into<StepName>,
        step: F,
    ) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        self.run_within(ctx, step_name, self.step_timeout, step).await
    }

    /// Like [`run`](Self::run), with `attempt_timeout` bounding each attempt
    /// instead of the runner's step timeout.
    pub async fn run_within<T, F, Fut>(
        &self,
        ctx: &mut RunContext,
        step_name: impl Into<StepName>,
        attempt_timeout: Duration,
        step: F,
    ) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let step_name = step_name.into();
        let run_id = ctx.run_id();

        loop {
            if ctx.is_cancelled() {
                return Err(StepError::Cancelled { step_name });
            }

            let cancel = ctx.cancellation().clone();
            let result = tokio::select! {
                result = self.memo.get_or_compute(run_id, &step_name, || {
                    self.attempt::<T, F, Fut>(&step, attempt_timeout)
                }) => result,
                _ = cancel.cancelled() => {
                    return Err(StepError::Cancelled { step_name: step_name.clone() });
                }
            };
            ctx.record(result.clone());

            match (result.status, result.value, result.failure) {
                (StepStatus::Succeeded, Some(value), _) => {
                    info!(run_id = %run_id, step = %step_name, attempts = result.attempt_count, "step completed");
                    return serde_json::from_value(value).map_err(|e| StepError::Payload {
                        step_name,
                        details: e.to_string(),
                    });
                }
                (StepStatus::Failed, _, Some(failure)) => match failure.kind {
                    FailureKind::Terminal => {
                        error!(run_id = %run_id, step = %step_name, attempt = failure.attempt, cause = %failure.cause, "step failed terminally");
                        return Err(StepError::Terminal { step_name, failure });
                    }
                    FailureKind::Retriable if self.policy.is_exhausted(result.attempt_count) => {
                        error!(run_id = %run_id, step = %step_name, attempts = result.attempt_count, cause = %failure.cause, "step exhausted retries");
                        return Err(StepError::Exhausted {
                            step_name,
                            attempts: result.attempt_count,
                            failure,
                        });
                    }
                    FailureKind::Retriable => {
                        let delay = self.policy.delay_for_attempt(result.attempt_count);
                        warn!(
                            "Step '{}' failed ({}), retrying ({}/{}) in {:?}",
                            step_name,
                            failure.cause,
                            result.attempt_count,
                            self.policy.max_attempts(),
                            delay
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = ctx.cancellation().cancelled() => {
                                return Err(StepError::Cancelled { step_name });
                            }
                        }
                    }
                },
                _ => {
                    return Err(StepError::Payload {
                        step_name,
                        details: "step result has no value or failure".to_string(),
                    });
                }
            }
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        step: &F,
        attempt_timeout: Duration,
    ) -> Result<Value, ClassifiedFailure>
    where
        T: Serialize,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let outcome = match timeout(attempt_timeout, step()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CollaboratorError::Timeout(format!(
                "attempt exceeded {attempt_timeout:?}"
            ))),
        };
        let value = outcome.map_err(|cause| ClassifiedFailure {
            kind: self.classifier.classify(&cause),
            cause,
        })?;
        serde_json::to_value(value).map_err(|e| ClassifiedFailure {
            kind: FailureKind::Terminal,
            cause: CollaboratorError::MalformedResponse(e.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Event, RunId};
    use crate::retry::DefaultClassifier;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn runner(max_attempts: u32) -> StepRunner {
        let policy =
            RetryPolicy::new(max_attempts, Duration::from_millis(100), Duration::from_secs(2))
                .unwrap();
        StepRunner::new(
            Arc::new(StepMemo::new()),
            Arc::new(DefaultClassifier::new()),
            policy,
        )
    }

    fn context() -> RunContext {
        RunContext::new(
            RunId::random(),
            Event {
                name: "movie.watched".to_string(),
                movie_title: "Beetlejuice".to_string(),
                recipient_email: "someone@example.com".to_string(),
                received_at: Utc::now(),
                idempotency_key: None,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let runner = runner(3);
        let mut ctx = context();

        let value: String = runner
            .run(&mut ctx, "summarize-plot", || async {
                Ok::<_, CollaboratorError>("short".to_string())
            })
            .await
            .unwrap();

        assert_eq!(value, "short");
        let result = ctx.result("summarize-plot").unwrap();
        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retriable_then_success() {
        let runner = runner(4);
        let mut ctx = context();
        let calls = AtomicU32::new(0);

        let value: u32 = runner
            .run(&mut ctx, "fetch-movie", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(CollaboratorError::Http {
                        status: 503,
                        message: "overloaded".to_string(),
                    })
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(ctx.result("fetch-movie").unwrap().attempt_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_max_attempts() {
        let runner = runner(3);
        let mut ctx = context();
        let calls = AtomicU32::new(0);

        let error = runner
            .run(&mut ctx, "fetch-movie", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CollaboratorError::Connection("reset".to_string()))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match error {
            StepError::Exhausted {
                attempts, failure, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(failure.attempt, 3);
                assert_eq!(failure.kind, FailureKind::Retriable);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(ctx.result("fetch-movie").unwrap().attempt_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_is_not_retried() {
        let runner = runner(5);
        let mut ctx = context();
        let calls = AtomicU32::new(0);

        let error = runner
            .run(&mut ctx, "fetch-movie", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CollaboratorError::NotFound("Movie not found!".to_string()))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(error, StepError::Terminal { ref failure, .. } if failure.attempt == 1));
        assert_eq!(ctx.result("fetch-movie").unwrap().attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_and_retries() {
        let runner = runner(2).with_step_timeout(Duration::from_secs(1));
        let mut ctx = context();
        let calls = AtomicU32::new(0);

        let value: String = runner
            .run(&mut ctx, "summarize-plot", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok::<_, CollaboratorError>("fast enough".to_string())
            })
            .await
            .unwrap();

        assert_eq!(value, "fast enough");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memoized_value_is_not_recomputed() {
        let runner = runner(3);
        let run_id = RunId::random();
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let mut ctx = RunContext::new(run_id, context().event().clone());
            let value: String = runner
                .run(&mut ctx, "send-email", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CollaboratorError>("msg-1".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "msg-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let runner = runner(10);
        let token = CancellationToken::new();
        let mut ctx =
            RunContext::with_cancellation(RunId::random(), context().event().clone(), token.clone());

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            canceller.cancel();
        });

        let error = runner
            .run(&mut ctx, "fetch-movie", || async {
                Err::<(), _>(CollaboratorError::Timeout("slow".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(error, StepError::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_attempt() {
        let runner = runner(3).with_step_timeout(Duration::from_secs(600));
        let token = CancellationToken::new();
        let mut ctx =
            RunContext::with_cancellation(RunId::random(), context().event().clone(), token.clone());

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let error = runner
            .run(&mut ctx, "summarize-plot", || async {
                tokio::time::sleep(Duration::from_secs(300)).await;
                Ok::<_, CollaboratorError>("too late".to_string())
            })
            .await
            .unwrap_err();
        assert!(matches!(error, StepError::Cancelled { .. }));

        let slot = runner
            .memo()
            .get(ctx.run_id(), &StepName::new("summarize-plot"))
            .await
            .unwrap();
        assert_eq!(slot.status, StepStatus::Pending);
    }
}
