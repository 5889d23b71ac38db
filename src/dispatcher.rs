//! Entry point binding inbound triggers to workflow runs.

use crate::context::{Event, RunContext, RunId, RunState};
use crate::error::{FailureReason, ValidationError};
use crate::outcome::{OutcomeError, OutcomeLog, OutcomeRecord};
use crate::workflow::WorkflowEngine;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Inbound trigger as delivered by the event producer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub name: String,
    /// Idempotency key; re-deliveries of one event carry the same id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub data: TriggerData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerData {
    #[serde(default)]
    pub movie_title: Option<String>,
    #[serde(default)]
    pub recipient_email: Option<String>,
}

impl TriggerPayload {
    pub fn movie_watched(movie_title: &str, recipient_email: &str) -> Self {
        Self {
            name: "movie.watched".to_string(),
            id: None,
            data: TriggerData {
                movie_title: Some(movie_title.to_string()),
                recipient_email: Some(recipient_email.to_string()),
            },
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Only triggers with this name start runs (default: `movie.watched`)
    pub event_name: String,
    /// Upper bound on one run, delivery tracking included (default: 300s)
    pub run_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            event_name: "movie.watched".to_string(),
            run_timeout: Duration::from_secs(300),
        }
    }
}

/// Checks a trigger's shape and turns it into an [`Event`].
pub fn validate_trigger(
    trigger: &TriggerPayload,
    event_name: &str,
) -> Result<Event, ValidationError> {
    if trigger.name != event_name {
        return Err(ValidationError::UnexpectedEventName {
            expected: event_name.to_string(),
            actual: trigger.name.clone(),
        });
    }

    let movie_title = trigger
        .data
        .movie_title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ValidationError::MissingField("movie_title"))?;

    let recipient_email = trigger
        .data
        .recipient_email
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .ok_or(ValidationError::MissingField("recipient_email"))?;
    if !is_well_formed_email(recipient_email) {
        return Err(ValidationError::MalformedEmail(recipient_email.to_string()));
    }

    Ok(Event {
        name: trigger.name.clone(),
        movie_title: movie_title.to_string(),
        recipient_email: recipient_email.to_string(),
        received_at: Utc::now(),
        idempotency_key: trigger.id.clone().filter(|id| !id.is_empty()),
    })
}

/// Syntactic address check: one `@`, a non-empty local part, a dotted
/// domain without empty labels, no whitespace. Deliverability is the
/// transport's call.
pub fn is_well_formed_email(address: &str) -> bool {
    if address.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = address.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && domain.split('.').all(|label| !label.is_empty())
}

struct InFlight {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Starts one workflow run per distinct event and keeps track of the runs
/// still executing.
pub struct EventDispatcher {
    engine: Arc<WorkflowEngine>,
    outcomes: Arc<dyn OutcomeLog>,
    config: DispatchConfig,
    in_flight: Arc<DashMap<RunId, InFlight>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        outcomes: Arc<dyn OutcomeLog>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            engine,
            outcomes,
            config,
            in_flight: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn outcomes(&self) -> &Arc<dyn OutcomeLog> {
        &self.outcomes
    }

    /// Validates `trigger` and starts a run for it.
    ///
    /// A trigger whose run id is already executing or already has an outcome
    /// starts nothing; the existing run id is returned.
    pub async fn on_event(&self, trigger: TriggerPayload) -> Result<RunId, ValidationError> {
        let event = validate_trigger(&trigger, &self.config.event_name)?;
        let run_id = match &event.idempotency_key {
            Some(key) => RunId::from_idempotency_key(&event.name, key),
            None => RunId::random(),
        };

        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        match self.in_flight.entry(run_id) {
            Entry::Occupied(_) => {
                info!(run_id = %run_id, "run already in flight, ignoring duplicate event");
                return Ok(run_id);
            }
            Entry::Vacant(slot) => {
                slot.insert(InFlight {
                    cancel: cancel.clone(),
                    done: done_rx,
                });
            }
        }

        // The slot is claimed before the log is read, so a run that finishes
        // concurrently has already appended its outcome.
        match self.outcomes.get(run_id).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                self.in_flight.remove(&run_id);
                info!(run_id = %run_id, "run already concluded, ignoring duplicate event");
                return Ok(run_id);
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "could not read outcome log, starting run");
            }
        }

        info!(run_id = %run_id, movie = %event.movie_title, "starting run");
        let task = RunTask {
            engine: Arc::clone(&self.engine),
            outcomes: Arc::clone(&self.outcomes),
            in_flight: Arc::clone(&self.in_flight),
            run_timeout: self.config.run_timeout,
        };
        let span = info_span!("dispatch", run_id = %run_id);
        tokio::spawn(
            task.run(RunContext::with_cancellation(run_id, event, cancel), done_tx)
                .instrument(span),
        );
        Ok(run_id)
    }

    /// Waits for `run_id` to conclude and returns its outcome; `None` for
    /// a run this dispatcher has never seen.
    pub async fn wait_for(&self, run_id: RunId) -> Result<Option<OutcomeRecord>, OutcomeError> {
        let done = self
            .in_flight
            .get(&run_id)
            .map(|entry| entry.value().done.clone());
        if let Some(mut done) = done {
            // Err means the run task went away; the log below has the answer.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.outcomes.get(run_id).await
    }

    pub fn is_running(&self, run_id: RunId) -> bool {
        self.in_flight.contains_key(&run_id)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Cancels a running run. Returns `false` if it is not in flight.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.in_flight.get(&run_id) {
            Some(entry) => {
                info!(run_id = %run_id, "cancelling run");
                entry.value().cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every run and waits until each has recorded its outcome.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let pending: Vec<_> = self
            .in_flight
            .iter()
            .map(|entry| entry.value().done.clone())
            .collect();
        info!(runs = pending.len(), "cancelling in-flight runs");
        for mut done in pending {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}

struct RunTask {
    engine: Arc<WorkflowEngine>,
    outcomes: Arc<dyn OutcomeLog>,
    in_flight: Arc<DashMap<RunId, InFlight>>,
    run_timeout: Duration,
}

impl RunTask {
    async fn run(self, mut ctx: RunContext, done: watch::Sender<bool>) {
        let run_id = ctx.run_id();
        let outcome = match timeout(self.run_timeout, self.engine.execute(&mut ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                ctx.cancellation().cancel();
                warn!(state = %ctx.state(), "run timed out");
                OutcomeRecord::conclude(
                    &mut ctx,
                    RunState::Failed,
                    Some(FailureReason::RunTimedOut),
                    Some(format!("run exceeded {:?}", self.run_timeout)),
                )
            }
        };

        info!(
            final_state = %outcome.final_state,
            reason = ?outcome.failure_reason,
            elapsed_ms = ctx.elapsed().as_millis() as u64,
            "run concluded"
        );
        match self.outcomes.append(outcome).await {
            Ok(()) => self.engine.runner().memo().evict_run(run_id),
            Err(e) => error!(error = %e, "failed to record outcome"),
        }

        done.send_modify(|finished| *finished = true);
        self.in_flight.remove(&run_id);
    }
}
