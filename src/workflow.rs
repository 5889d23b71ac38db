use crate::collaborators::{EmailSender, MessageId, MovieInfo, MovieInfoProvider, SummaryGenerator};
use crate::context::{RunContext, RunState};
use crate::delivery::{DeliveryState, DeliveryStatus, DeliveryTracker};
use crate::error::{CollaboratorError, FailureReason, StepError};
use crate::outcome::OutcomeRecord;
use crate::render::{render_movie_email, RenderedEmail};
use crate::runner::StepRunner;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub const FETCH_MOVIE: &str = "fetch-movie";
pub const SUMMARIZE_PLOT: &str = "summarize-plot";
pub const RENDER_EMAIL: &str = "render-email";
pub const SEND_EMAIL: &str = "send-email";
pub const TRACK_DELIVERY: &str = "track-delivery";

/// Runs the movie summary chain for one event:
/// fetch, summarize, render, send, then track delivery.
pub struct WorkflowEngine {
    runner: StepRunner,
    movies: Arc<dyn MovieInfoProvider>,
    summarizer: Arc<dyn SummaryGenerator>,
    sender: Arc<dyn EmailSender>,
    tracker: DeliveryTracker,
    delivery_timeout: Duration,
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("runner", &self.runner)
            .field("tracker", &self.tracker)
            .field("delivery_timeout", &self.delivery_timeout)
            .finish()
    }
}

impl WorkflowEngine {
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::new()
    }

    pub fn runner(&self) -> &StepRunner {
        &self.runner
    }

    /// Executes the chain for `ctx` and returns the run's outcome.
    ///
    /// Any step error moves the run straight to `Failed`; later steps do not
    /// run. Steps already succeeded for this run id are served from the memo,
    /// so executing a duplicate context never repeats a send.
    pub async fn execute(&self, ctx: &mut RunContext) -> OutcomeRecord {
        let span = info_span!("run", run_id = %ctx.run_id(), movie = %ctx.event().movie_title);
        async {
            match self.run_chain(ctx).await {
                Ok(status) => self.conclude_delivery(ctx, status),
                Err(e) => {
                    warn!(step = %e.step_name(), error = %e, "run failed");
                    OutcomeRecord::conclude(
                        ctx,
                        RunState::Failed,
                        Some(FailureReason::from_step_error(&e)),
                        Some(e.to_string()),
                    )
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_chain(&self, ctx: &mut RunContext) -> Result<DeliveryStatus, StepError> {
        let event = ctx.event().clone();
        let title = event.movie_title.as_str();
        let recipient = event.recipient_email.as_str();

        ctx.set_state(RunState::FetchingMovie);
        let movies = &self.movies;
        let movie: MovieInfo = self
            .runner
            .run(ctx, FETCH_MOVIE, || async move {
                let movie = movies.fetch(title).await?;
                if has_plot(&movie) {
                    Ok(movie)
                } else {
                    Err(CollaboratorError::NotFound(format!(
                        "no plot available for '{title}'"
                    )))
                }
            })
            .await?;

        ctx.set_state(RunState::Summarizing);
        let summarizer = &self.summarizer;
        let plot = movie.plot.as_str();
        let summary: String = self
            .runner
            .run(ctx, SUMMARIZE_PLOT, || async move {
                summarizer.summarize(plot).await
            })
            .await?;

        ctx.set_state(RunState::Rendering);
        let (movie_ref, summary_ref) = (&movie, summary.as_str());
        let email: RenderedEmail = self
            .runner
            .run(ctx, RENDER_EMAIL, || async move {
                Ok::<_, CollaboratorError>(render_movie_email(movie_ref, summary_ref, title))
            })
            .await?;

        ctx.set_state(RunState::Sending);
        let sender = &self.sender;
        let email_ref = &email;
        let message_id: MessageId = self
            .runner
            .run(ctx, SEND_EMAIL, || async move {
                sender
                    .send(recipient, &email_ref.subject, &email_ref.html, &email_ref.text)
                    .await
            })
            .await?;
        info!(message_id = %message_id, "email handed to transport");
        ctx.set_delivery(DeliveryStatus::new(message_id.clone(), DeliveryState::Queued));

        ctx.set_state(RunState::TrackingDelivery);
        let tracker = &self.tracker;
        let limit = self.delivery_timeout;
        let cancel = ctx.cancellation().clone();
        let (id, cancel_ref) = (&message_id, &cancel);
        let status: DeliveryStatus = self
            .runner
            .run_within(
                ctx,
                TRACK_DELIVERY,
                limit + self.runner.step_timeout(),
                || async move { tracker.await_terminal(id, limit, cancel_ref).await },
            )
            .await?;
        ctx.set_delivery(status.clone());
        Ok(status)
    }

    fn conclude_delivery(&self, ctx: &mut RunContext, status: DeliveryStatus) -> OutcomeRecord {
        let reason = match status.state {
            DeliveryState::Delivered => {
                info!(message_id = %status.message_id, "run completed");
                return OutcomeRecord::conclude(ctx, RunState::Completed, None, None);
            }
            DeliveryState::Bounced => FailureReason::Bounced,
            DeliveryState::Failed => FailureReason::DeliveryFailed,
            DeliveryState::TimedOut | DeliveryState::Queued | DeliveryState::Sent => {
                FailureReason::DeliveryTimedOut
            }
        };
        warn!(message_id = %status.message_id, state = %status.state, "delivery did not succeed");
        OutcomeRecord::conclude(
            ctx,
            RunState::Failed,
            Some(reason),
            Some(format!("message {} ended {}", status.message_id, status.state)),
        )
    }
}

fn has_plot(movie: &MovieInfo) -> bool {
    let plot = movie.plot.trim();
    !plot.is_empty() && plot != "N/A"
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("workflow engine requires a {0}")]
    Missing(&'static str),
}

pub struct WorkflowBuilder {
    runner: Option<StepRunner>,
    movies: Option<Arc<dyn MovieInfoProvider>>,
    summarizer: Option<Arc<dyn SummaryGenerator>>,
    sender: Option<Arc<dyn EmailSender>>,
    tracker: Option<DeliveryTracker>,
    delivery_timeout: Duration,
}

impl Default for WorkflowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self {
            runner: None,
            movies: None,
            summarizer: None,
            sender: None,
            tracker: None,
            delivery_timeout: Duration::from_secs(30),
        }
    }

    pub fn runner(mut self, runner: StepRunner) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn movies(mut self, movies: Arc<dyn MovieInfoProvider>) -> Self {
        self.movies = Some(movies);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn SummaryGenerator>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn sender(mut self, sender: Arc<dyn EmailSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn tracker(mut self, tracker: DeliveryTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// How long to wait for a terminal delivery state (default: 30s)
    pub fn delivery_timeout(mut self, delivery_timeout: Duration) -> Self {
        self.delivery_timeout = delivery_timeout;
        self
    }

    pub fn build(self) -> Result<WorkflowEngine, BuildError> {
        Ok(WorkflowEngine {
            runner: self.runner.ok_or(BuildError::Missing("step runner"))?,
            movies: self.movies.ok_or(BuildError::Missing("movie provider"))?,
            summarizer: self.summarizer.ok_or(BuildError::Missing("summary generator"))?,
            sender: self.sender.ok_or(BuildError::Missing("email sender"))?,
            tracker: self.tracker.ok_or(BuildError::Missing("delivery tracker"))?,
            delivery_timeout: self.delivery_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::DeliveryStatusSource;
    use crate::context::{Event, RunId};
    use crate::memo::StepMemo;
    use crate::retry::{DefaultClassifier, RetryPolicy};
    use crate::step::StepStatus;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Movies {
        plot: &'static str,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MovieInfoProvider for Movies {
        async fn fetch(&self, title: &str) -> Result<MovieInfo, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MovieInfo {
                title: title.to_string(),
                plot: self.plot.to_string(),
                ..MovieInfo::default()
            })
        }
    }

    struct Summarizer;

    #[async_trait]
    impl SummaryGenerator for Summarizer {
        async fn summarize(&self, plot: &str) -> Result<String, CollaboratorError> {
            Ok(format!("In short: {plot}"))
        }
    }

    struct Sender {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EmailSender for Sender {
        async fn send(
            &self,
            to: &str,
            _subject: &str,
            _html_body: &str,
            _text_body: &str,
        ) -> Result<MessageId, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if to.ends_with(".invalid") {
                return Err(CollaboratorError::InvalidAddress(to.to_string()));
            }
            Ok(MessageId::new("msg-1"))
        }
    }

    struct FixedStatus(DeliveryState);

    #[async_trait]
    impl DeliveryStatusSource for FixedStatus {
        async fn status(&self, id: &MessageId) -> Result<DeliveryStatus, CollaboratorError> {
            Ok(DeliveryStatus::new(id.clone(), self.0))
        }
    }

    struct Fixture {
        engine: WorkflowEngine,
        movies: Arc<Movies>,
        sender: Arc<Sender>,
    }

    fn fixture(plot: &'static str, delivery: DeliveryState) -> Fixture {
        let movies = Arc::new(Movies {
            plot,
            calls: AtomicU32::new(0),
        });
        let sender = Arc::new(Sender {
            calls: AtomicU32::new(0),
        });
        let runner = StepRunner::new(
            Arc::new(StepMemo::new()),
            Arc::new(DefaultClassifier::new()),
            RetryPolicy::default(),
        );
        let engine = WorkflowEngine::builder()
            .runner(runner)
            .movies(movies.clone())
            .summarizer(Arc::new(Summarizer))
            .sender(sender.clone())
            .tracker(DeliveryTracker::new(Arc::new(FixedStatus(delivery))))
            .delivery_timeout(Duration::from_secs(10))
            .build()
            .unwrap();
        Fixture {
            engine,
            movies,
            sender,
        }
    }

    fn context(email: &str) -> RunContext {
        RunContext::new(
            RunId::random(),
            Event {
                name: "movie.watched".to_string(),
                movie_title: "Beetlejuice".to_string(),
                recipient_email: email.to_string(),
                received_at: Utc::now(),
                idempotency_key: None,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_run_completes() {
        let fx = fixture("A ghost story.", DeliveryState::Delivered);
        let mut ctx = context("someone@example.com");

        let outcome = fx.engine.execute(&mut ctx).await;

        assert_eq!(outcome.final_state, RunState::Completed);
        assert_eq!(outcome.failure_reason, None);
        assert_eq!(outcome.delivery.unwrap().state, DeliveryState::Delivered);
        assert_eq!(ctx.state(), RunState::Completed);
        for step in [FETCH_MOVIE, SUMMARIZE_PLOT, RENDER_EMAIL, SEND_EMAIL, TRACK_DELIVERY] {
            assert_eq!(ctx.result(step).unwrap().status, StepStatus::Succeeded);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_plot_stops_before_send() {
        let fx = fixture("N/A", DeliveryState::Delivered);
        let mut ctx = context("someone@example.com");

        let outcome = fx.engine.execute(&mut ctx).await;

        assert_eq!(outcome.final_state, RunState::Failed);
        assert_eq!(outcome.failure_reason, Some(FailureReason::NotFound));
        assert_eq!(fx.movies.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.sender.calls.load(Ordering::SeqCst), 0);
        assert!(ctx.result(SUMMARIZE_PLOT).is_none());
        assert!(outcome.delivery.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_address_fails_after_one_attempt() {
        let fx = fixture("A plot.", DeliveryState::Delivered);
        let mut ctx = context("someone@example.invalid");

        let outcome = fx.engine.execute(&mut ctx).await;

        assert_eq!(outcome.failure_reason, Some(FailureReason::InvalidAddress));
        assert_eq!(fx.sender.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.result(SEND_EMAIL).unwrap().attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_outcomes_map_to_reasons() {
        for (state, reason) in [
            (DeliveryState::Bounced, FailureReason::Bounced),
            (DeliveryState::Failed, FailureReason::DeliveryFailed),
            (DeliveryState::Sent, FailureReason::DeliveryTimedOut),
        ] {
            let fx = fixture("A plot.", state);
            let mut ctx = context("someone@example.com");
            let outcome = fx.engine.execute(&mut ctx).await;
            assert_eq!(outcome.final_state, RunState::Failed);
            assert_eq!(outcome.failure_reason, Some(reason));
            assert_eq!(outcome.delivery.unwrap().message_id, MessageId::new("msg-1"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_context_does_not_resend() {
        let fx = fixture("A plot.", DeliveryState::Delivered);
        let mut first = context("someone@example.com");
        let mut second = RunContext::new(first.run_id(), first.event().clone());

        fx.engine.execute(&mut first).await;
        let outcome = fx.engine.execute(&mut second).await;

        assert!(outcome.is_completed());
        assert_eq!(fx.movies.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.sender.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let error = WorkflowEngine::builder().build().unwrap_err();
        assert_eq!(error, BuildError::Missing("step runner"));
        assert_eq!(error.to_string(), "workflow engine requires a step runner");
    }
}
