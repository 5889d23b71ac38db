//! Per-step memoization with at-most-one concurrent execution per key.

use crate::context::RunId;
use crate::retry::{ClassifiedFailure, FailureRecord};
use crate::step::{StepName, StepResult, StepStatus};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

type MemoKey = (RunId, StepName);

/// Keyed store of step results.
///
/// Each `(run, step)` key owns its own async mutex, so unrelated keys never
/// contend and concurrent callers of one key serialize behind whoever got
/// there first.
#[derive(Debug, Default)]
pub struct StepMemo {
    slots: DashMap<MemoKey, Arc<Mutex<StepResult>>>,
}

impl StepMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the succeeded result for the key, or runs `compute` and records
    /// its outcome.
    ///
    /// `compute` is only invoked while holding the key's lock. A caller that
    /// arrives while another computes waits, then returns the cached value if
    /// the other caller succeeded. If the calling future is dropped mid-compute
    /// the slot stays `Pending` and the next caller computes again.
    pub async fn get_or_compute<F, Fut>(
        &self,
        run_id: RunId,
        step_name: &StepName,
        compute: F,
    ) -> StepResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ClassifiedFailure>>,
    {
        let slot = self.slot(run_id, step_name);
        let mut result = slot.lock().await;

        if result.status == StepStatus::Succeeded {
            debug!(run_id = %run_id, step = %step_name, "memo hit");
            return result.clone();
        }

        result.attempt_count += 1;
        result.last_attempt_at = Some(Utc::now());
        result.status = StepStatus::Pending;

        match compute().await {
            Ok(value) => {
                result.status = StepStatus::Succeeded;
                result.value = Some(value);
                result.failure = None;
            }
            Err(failure) => {
                result.status = StepStatus::Failed;
                result.failure = Some(FailureRecord {
                    kind: failure.kind,
                    cause: failure.cause,
                    step_name: step_name.clone(),
                    attempt: result.attempt_count,
                });
            }
        }

        result.clone()
    }

    /// Current result for a key, if the key has ever been touched.
    ///
    /// Waits for an in-progress computation on the key to finish.
    pub async fn get(&self, run_id: RunId, step_name: &StepName) -> Option<StepResult> {
        let slot = self
            .slots
            .get(&(run_id, step_name.clone()))
            .map(|entry| Arc::clone(entry.value()))?;
        let result = slot.lock().await;
        Some(result.clone())
    }

    /// Drops every entry belonging to `run_id`.
    pub fn evict_run(&self, run_id: RunId) {
        self.slots.retain(|(id, _), _| *id != run_id);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, run_id: RunId, step_name: &StepName) -> Arc<Mutex<StepResult>> {
        let entry = self
            .slots
            .entry((run_id, step_name.clone()))
            .or_insert_with(|| Arc::new(Mutex::new(StepResult::pending(step_name.clone()))));
        Arc::clone(entry.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorError;
    use crate::retry::FailureKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn step() -> StepName {
        StepName::new("fetch-movie")
    }

    #[tokio::test]
    async fn test_success_is_cached() {
        let memo = StepMemo::new();
        let run_id = RunId::random();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let result = memo
                .get_or_compute(run_id, &step(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ClassifiedFailure>(json!({"title": "Beetlejuice"}))
                })
                .await;
            assert_eq!(result.status, StepStatus::Succeeded);
            assert_eq!(result.value, Some(json!({"title": "Beetlejuice"})));
            assert_eq!(result.attempt_count, 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_recomputed() {
        let memo = StepMemo::new();
        let run_id = RunId::random();

        let failed = memo
            .get_or_compute(run_id, &step(), || async {
                Err(ClassifiedFailure {
                    kind: FailureKind::Retriable,
                    cause: CollaboratorError::Timeout("slow".to_string()),
                })
            })
            .await;
        assert_eq!(failed.status, StepStatus::Failed);
        let failure = failed.failure.unwrap();
        assert_eq!(failure.attempt, 1);
        assert_eq!(failure.kind, FailureKind::Retriable);
        assert_eq!(failure.step_name, step());

        let retried = memo
            .get_or_compute(run_id, &step(), || async { Ok::<_, ClassifiedFailure>(json!(42)) })
            .await;
        assert_eq!(retried.status, StepStatus::Succeeded);
        assert_eq!(retried.attempt_count, 2);
        assert!(retried.failure.is_none());
        assert!(retried.last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn test_keys_are_scoped_by_run_and_step() {
        let memo = StepMemo::new();
        let first = RunId::random();
        let second = RunId::random();

        memo.get_or_compute(first, &step(), || async { Ok::<_, ClassifiedFailure>(json!(1)) })
            .await;
        let other_run = memo
            .get_or_compute(second, &step(), || async { Ok::<_, ClassifiedFailure>(json!(2)) })
            .await;
        let other_step = memo
            .get_or_compute(first, &StepName::new("summarize-plot"), || async {
                Ok::<_, ClassifiedFailure>(json!(3))
            })
            .await;

        assert_eq!(other_run.value, Some(json!(2)));
        assert_eq!(other_step.value, Some(json!(3)));
        assert_eq!(memo.len(), 3);

        memo.evict_run(first);
        assert_eq!(memo.len(), 1);
        assert!(memo.get(first, &step()).await.is_none());
        assert!(memo.get(second, &step()).await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let memo = Arc::new(StepMemo::new());
        let run_id = RunId::random();
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let memo = Arc::clone(&memo);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                memo.get_or_compute(run_id, &step(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, ClassifiedFailure>(json!("done"))
                })
                .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.status, StepStatus::Succeeded);
            assert_eq!(result.value, Some(json!("done")));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_computation_leaves_slot_pending() {
        let memo = StepMemo::new();
        let run_id = RunId::random();

        let interrupted = tokio::time::timeout(
            Duration::from_millis(5),
            memo.get_or_compute(run_id, &step(), || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, ClassifiedFailure>(json!("never"))
            }),
        )
        .await;
        assert!(interrupted.is_err());

        let pending = memo.get(run_id, &step()).await.unwrap();
        assert_eq!(pending.status, StepStatus::Pending);
        assert_eq!(pending.attempt_count, 1);

        let result = memo
            .get_or_compute(run_id, &step(), || async { Ok::<_, ClassifiedFailure>(json!("second")) })
            .await;
        assert_eq!(result.value, Some(json!("second")));
        assert_eq!(result.attempt_count, 2);
    }
}
