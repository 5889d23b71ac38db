//! Delivery status tracking after an email has been handed to the transport.

use crate::collaborators::{DeliveryStatusSource, MessageId};
use crate::error::CollaboratorError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delivery state reported by the email transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Queued,
    Sent,
    Delivered,
    Bounced,
    Failed,
    /// No terminal state was observed before the tracking deadline.
    TimedOut,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Delivered
                | DeliveryState::Bounced
                | DeliveryState::Failed
                | DeliveryState::TimedOut
        )
    }

    fn rank(&self) -> u8 {
        match self {
            DeliveryState::Queued => 0,
            DeliveryState::Sent => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Latest known delivery state of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub message_id: MessageId,
    pub state: DeliveryState,
    pub observed_at: DateTime<Utc>,
}

impl DeliveryStatus {
    pub fn new(message_id: MessageId, state: DeliveryState) -> Self {
        Self {
            message_id,
            state,
            observed_at: Utc::now(),
        }
    }

    /// Moves to `next` if that is a forward transition.
    ///
    /// Terminal states are final and states never move backwards
    /// (`Sent` does not return to `Queued`). Returns whether the state changed.
    ///
    /// # Examples
    ///
    /// ```
    /// use cinemail::{DeliveryState, DeliveryStatus, MessageId};
    ///
    /// let mut status = DeliveryStatus::new(MessageId::new("m-1"), DeliveryState::Queued);
    /// assert!(status.advance(DeliveryState::Delivered));
    /// assert!(!status.advance(DeliveryState::Bounced));
    /// assert_eq!(status.state, DeliveryState::Delivered);
    /// ```
    pub fn advance(&mut self, next: DeliveryState) -> bool {
        if self.state.is_terminal() || next == self.state || next.rank() < self.state.rank() {
            return false;
        }
        self.state = next;
        self.observed_at = Utc::now();
        true
    }
}

/// Polling cadence for [`DeliveryTracker`].
#[derive(Debug, Clone, PartialEq)]
pub struct PollSchedule {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(5),
            multiplier: 1.5,
        }
    }
}

impl PollSchedule {
    /// Interval after `current`: grown by `multiplier`, capped at
    /// `max_interval` and never shorter than `initial_interval`.
    pub fn next_interval(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.multiplier)
            .min(self.max_interval)
            .max(self.initial_interval)
    }
}

/// Ends a source's watch on a message when tracking stops, including when
/// the tracking future is dropped.
struct WatchGuard<'a> {
    source: &'a dyn DeliveryStatusSource,
    message_id: &'a MessageId,
}

impl<'a> WatchGuard<'a> {
    fn new(source: &'a dyn DeliveryStatusSource, message_id: &'a MessageId) -> Self {
        source.watch(message_id);
        Self { source, message_id }
    }
}

impl Drop for WatchGuard<'_> {
    fn drop(&mut self) {
        self.source.forget(self.message_id);
    }
}

/// Observes a sent message until it reaches a terminal delivery state.
#[derive(Clone)]
pub struct DeliveryTracker {
    source: Arc<dyn DeliveryStatusSource>,
    schedule: PollSchedule,
}

impl fmt::Debug for DeliveryTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryTracker")
            .field("schedule", &self.schedule)
            .finish()
    }
}

impl DeliveryTracker {
    pub fn new(source: Arc<dyn DeliveryStatusSource>) -> Self {
        Self::with_schedule(source, PollSchedule::default())
    }

    pub fn with_schedule(source: Arc<dyn DeliveryStatusSource>, schedule: PollSchedule) -> Self {
        Self { source, schedule }
    }

    /// Polls until `Delivered`, `Bounced` or `Failed` is observed, or returns
    /// `TimedOut` once `limit` has elapsed.
    ///
    /// Poll failures are logged and polling continues. The only error is
    /// [`CollaboratorError::Cancelled`], when `cancel` fires first.
    pub async fn await_terminal(
        &self,
        message_id: &MessageId,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<DeliveryStatus, CollaboratorError> {
        let _watch = WatchGuard::new(self.source.as_ref(), message_id);
        let deadline = Instant::now() + limit;
        let mut status = DeliveryStatus::new(message_id.clone(), DeliveryState::Queued);
        let mut interval = self.schedule.initial_interval;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let polled = tokio::select! {
                polled = timeout(remaining, self.source.status(message_id)) => polled,
                _ = cancel.cancelled() => return Err(CollaboratorError::Cancelled),
            };
            match polled {
                Ok(Ok(observed)) => {
                    if status.advance(observed.state) {
                        debug!(message_id = %message_id, state = %status.state, "delivery state changed");
                    }
                    if status.state.is_terminal() {
                        info!(message_id = %message_id, state = %status.state, "delivery reached terminal state");
                        return Ok(status);
                    }
                }
                Ok(Err(e)) => {
                    warn!(message_id = %message_id, error = %e, "failed to check delivery status");
                }
                Err(_) => break,
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                _ = sleep(interval.min(remaining)) => {}
                _ = cancel.cancelled() => return Err(CollaboratorError::Cancelled),
            }
            interval = self.schedule.next_interval(interval);
        }

        warn!(message_id = %message_id, last_state = %status.state, "delivery still pending at deadline");
        status.advance(DeliveryState::TimedOut);
        Ok(status)
    }
}

/// Delivery states pushed by the transport's webhook.
///
/// Serves as a [`DeliveryStatusSource`] so the tracker reads pushed updates
/// the same way it reads polled ones. Only messages being tracked are kept:
/// updates for other ids are dropped, and a message's entry goes away when
/// its tracking ends.
#[derive(Debug, Default)]
pub struct PushedDeliveryStatus {
    states: DashMap<MessageId, DeliveryStatus>,
}

impl PushedDeliveryStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a pushed state change to a tracked message; updates for
    /// untracked messages, out-of-order or post-terminal updates are ignored.
    /// Returns whether the state changed.
    pub fn record(&self, message_id: MessageId, state: DeliveryState) -> bool {
        match self.states.get_mut(&message_id) {
            Some(mut entry) => entry.advance(state),
            None => {
                debug!(message_id = %message_id, state = %state, "update for untracked message dropped");
                false
            }
        }
    }

    pub fn get(&self, message_id: &MessageId) -> Option<DeliveryStatus> {
        self.states.get(message_id).map(|entry| entry.value().clone())
    }

    /// Number of messages currently tracked.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl DeliveryStatusSource for PushedDeliveryStatus {
    async fn status(&self, message_id: &MessageId) -> Result<DeliveryStatus, CollaboratorError> {
        Ok(self
            .get(message_id)
            .unwrap_or_else(|| DeliveryStatus::new(message_id.clone(), DeliveryState::Queued)))
    }

    fn watch(&self, message_id: &MessageId) {
        self.states
            .entry(message_id.clone())
            .or_insert_with(|| DeliveryStatus::new(message_id.clone(), DeliveryState::Queued));
    }

    fn forget(&self, message_id: &MessageId) {
        self.states.remove(message_id);
    }
}
