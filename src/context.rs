use crate::delivery::DeliveryStatus;
use crate::step::{StepName, StepResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Namespace for run ids derived from idempotency keys.
const RUN_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c0b_2f1e_9a43_4d7e_b8f5_31c2_7e94_a0d6);

/// Identifier of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// A fresh random run id, for triggers without an idempotency key.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// A run id that is stable for a given event name and idempotency key,
    /// so re-deliveries of one logical event map to the same run.
    pub fn from_idempotency_key(event_name: &str, key: &str) -> Self {
        let name = format!("{event_name}:{key}");
        Self(Uuid::new_v5(&RUN_ID_NAMESPACE, name.as_bytes()))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A validated "movie watched" event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub movie_title: String,
    pub recipient_email: String,
    pub received_at: DateTime<Utc>,
    /// Producer-supplied key that identifies re-deliveries of the same event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Where a run is in the step chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    FetchingMovie,
    Summarizing,
    Rendering,
    Sending,
    TrackingDelivery,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-run execution state: the event, the step results recorded so far and
/// the run's cancellation token.
#[derive(Debug)]
pub struct RunContext {
    run_id: RunId,
    event: Event,
    state: RunState,
    results: HashMap<StepName, StepResult>,
    delivery: Option<DeliveryStatus>,
    cancel: CancellationToken,
    started_at: Instant,
}

impl RunContext {
    pub fn new(run_id: RunId, event: Event) -> Self {
        Self::with_cancellation(run_id, event, CancellationToken::new())
    }

    pub fn with_cancellation(run_id: RunId, event: Event, cancel: CancellationToken) -> Self {
        Self {
            run_id,
            event,
            state: RunState::Created,
            results: HashMap::new(),
            delivery: None,
            cancel,
            started_at: Instant::now(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: RunState) {
        self.state = state;
    }

    /// Stores the latest result for its step, replacing any earlier one.
    pub fn record(&mut self, result: StepResult) {
        self.results.insert(result.step_name.clone(), result);
    }

    pub fn result(&self, step_name: &str) -> Option<&StepResult> {
        self.results.get(step_name)
    }

    pub fn results(&self) -> impl Iterator<Item = &StepResult> {
        self.results.values()
    }

    pub fn delivery(&self) -> Option<&DeliveryStatus> {
        self.delivery.as_ref()
    }

    pub(crate) fn set_delivery(&mut self, status: DeliveryStatus) {
        self.delivery = Some(status);
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepStatus;

    fn event() -> Event {
        Event {
            name: "movie.watched".to_string(),
            movie_title: "Beetlejuice".to_string(),
            recipient_email: "someone@example.com".to_string(),
            received_at: Utc::now(),
            idempotency_key: None,
        }
    }

    #[test]
    fn test_run_id_from_idempotency_key_is_stable() {
        let a = RunId::from_idempotency_key("movie.watched", "evt-1");
        let b = RunId::from_idempotency_key("movie.watched", "evt-1");
        let c = RunId::from_idempotency_key("movie.watched", "evt-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(RunId::random(), RunId::random());
    }

    #[test]
    fn test_run_id_round_trips_through_display() {
        let id = RunId::random();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<RunId>().is_err());
    }

    #[test]
    fn test_context_records_latest_result_per_step() {
        let mut ctx = RunContext::new(RunId::random(), event());
        assert_eq!(ctx.state(), RunState::Created);

        let mut result = StepResult::pending(StepName::new("fetch-movie"));
        ctx.record(result.clone());
        result.status = StepStatus::Succeeded;
        result.attempt_count = 2;
        ctx.record(result);

        assert_eq!(ctx.results().count(), 1);
        let stored = ctx.result("fetch-movie").unwrap();
        assert_eq!(stored.status, StepStatus::Succeeded);
        assert_eq!(stored.attempt_count, 2);
        assert!(ctx.result("send-email").is_none());
    }

    #[test]
    fn test_context_cancellation() {
        let token = CancellationToken::new();
        let ctx = RunContext::with_cancellation(RunId::random(), event(), token.child_token());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_elapsed_follows_runtime_clock() {
        let ctx = RunContext::new(RunId::random(), event());
        tokio::time::sleep(std::time::Duration::from_secs(90)).await;
        assert!(ctx.elapsed() >= std::time::Duration::from_secs(90));
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Sending.is_terminal());
    }
}
