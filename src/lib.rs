//! # cinemail
//!
//! Turns a "movie watched" event into a summary email: fetch the movie's
//! metadata, summarize its plot, render an email, send it and follow it
//! until the transport reports a terminal delivery state.
//!
//! The core is a small step-execution engine that can serve other chains:
//!
//! - **Memoized steps**: [`StepMemo`] runs each `(run, step)` pair at most once
//!   to success; duplicate runs reuse the stored value
//! - **Classified retries**: a [`RetryClassifier`] splits failures into
//!   Retriable and Terminal; [`RetryPolicy`] adds exponential backoff with jitter
//! - **Per-attempt timeouts**: slow attempts fail as Retriable timeouts
//! - **Cancellation**: every run owns a `CancellationToken` checked between
//!   attempts and during backoff and delivery polling
//! - **Delivery tracking**: [`DeliveryTracker`] polls or reads pushed status
//!   until `Delivered`, `Bounced`, `Failed` or a deadline
//! - **Idempotent dispatch**: [`EventDispatcher`] maps an event's idempotency
//!   key to a stable run id and starts at most one run for it
//!
//! ## Running a step
//!
//! ```rust
//! use cinemail::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let runner = StepRunner::new(
//!     Arc::new(StepMemo::new()),
//!     Arc::new(DefaultClassifier::new()),
//!     RetryPolicy::default(),
//! );
//!
//! let event = Event {
//!     name: "movie.watched".to_string(),
//!     movie_title: "Beetlejuice".to_string(),
//!     recipient_email: "someone@example.com".to_string(),
//!     received_at: chrono::Utc::now(),
//!     idempotency_key: Some("evt-1".to_string()),
//! };
//! let run_id = RunId::from_idempotency_key(&event.name, "evt-1");
//! let mut ctx = RunContext::new(run_id, event);
//!
//! let title: String = runner
//!     .run(&mut ctx, "fetch-movie", || async {
//!         Ok::<_, CollaboratorError>("Beetlejuice (1988)".to_string())
//!     })
//!     .await
//!     .expect("step succeeds");
//!
//! assert_eq!(title, "Beetlejuice (1988)");
//! assert_eq!(ctx.result("fetch-movie").map(|r| r.attempt_count), Some(1));
//! # }
//! ```
//!
//! ## Handling step failures
//!
//! Terminal failures are not retried:
//!
//! ```rust
//! use cinemail::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! # let runner = StepRunner::new(
//! #     Arc::new(StepMemo::new()),
//! #     Arc::new(DefaultClassifier::new()),
//! #     RetryPolicy::default(),
//! # );
//! # let event = Event {
//! #     name: "movie.watched".to_string(),
//! #     movie_title: "The Godfather".to_string(),
//! #     recipient_email: "someone@example.com".to_string(),
//! #     received_at: chrono::Utc::now(),
//! #     idempotency_key: None,
//! # };
//! # let mut ctx = RunContext::new(RunId::random(), event);
//! let result = runner
//!     .run(&mut ctx, "send-email", || async {
//!         Err::<MessageId, _>(CollaboratorError::InvalidAddress("nobody@nowhere".to_string()))
//!     })
//!     .await;
//!
//! match result {
//!     Err(StepError::Terminal { step_name, failure }) => {
//!         assert_eq!(step_name.as_str(), "send-email");
//!         assert_eq!(failure.attempt, 1);
//!     }
//!     other => panic!("unexpected: {other:?}"),
//! }
//! # }
//! ```
//!
//! ## Wiring the service
//!
//! ```no_run
//! use cinemail::prelude::*;
//! use cinemail::providers::{OmdbClient, OpenAiSummarizer, ResendClient};
//! use secrecy::SecretString;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let key = |name: &str| SecretString::from(std::env::var(name).unwrap_or_default());
//! let resend = Arc::new(ResendClient::new(key("RESEND_API_KEY"), "Movies <movies@example.com>")?);
//!
//! let engine = WorkflowEngine::builder()
//!     .runner(StepRunner::new(
//!         Arc::new(StepMemo::new()),
//!         Arc::new(DefaultClassifier::new()),
//!         RetryPolicy::default(),
//!     ))
//!     .movies(Arc::new(OmdbClient::new(key("OMDB_API_KEY"))?))
//!     .summarizer(Arc::new(OpenAiSummarizer::new(key("OPENAI_API_KEY"))?))
//!     .sender(resend.clone())
//!     .tracker(DeliveryTracker::new(resend))
//!     .build()?;
//!
//! let dispatcher = EventDispatcher::new(
//!     Arc::new(engine),
//!     Arc::new(InMemoryOutcomeLog::new()),
//!     DispatchConfig::default(),
//! );
//! let run_id = dispatcher
//!     .on_event(TriggerPayload::movie_watched("Beetlejuice", "someone@example.com"))
//!     .await?;
//! let outcome = dispatcher.wait_for(run_id).await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

mod collaborators;
mod context;
mod delivery;
mod dispatcher;
mod error;
mod memo;
mod outcome;
mod render;
mod retry;
mod runner;
mod step;
mod workflow;

pub mod config;
pub mod prelude;
pub mod providers;
pub mod server;
pub mod telemetry;

pub use collaborators::{
    DeliveryStatusSource, EmailSender, MessageId, MovieInfo, MovieInfoProvider, SummaryGenerator,
};
pub use context::{Event, RunContext, RunId, RunState};
pub use delivery::{DeliveryState, DeliveryStatus, DeliveryTracker, PollSchedule, PushedDeliveryStatus};
pub use dispatcher::{
    is_well_formed_email, validate_trigger, DispatchConfig, EventDispatcher, TriggerData,
    TriggerPayload,
};
pub use error::{CollaboratorError, FailureReason, StepError, ValidationError};
pub use memo::StepMemo;
pub use outcome::{InMemoryOutcomeLog, JsonLinesOutcomeLog, OutcomeError, OutcomeLog, OutcomeRecord};
pub use render::{html_to_text, render_movie_email, RenderedEmail};
pub use retry::{
    ClassifiedFailure, DefaultClassifier, FailureKind, FailureRecord, RetryClassifier,
    RetryPolicy, RetryPolicyError,
};
pub use runner::StepRunner;
pub use step::{StepName, StepResult, StepStatus};
pub use workflow::{
    BuildError, WorkflowBuilder, WorkflowEngine, FETCH_MOVIE, RENDER_EMAIL, SEND_EMAIL,
    SUMMARIZE_PLOT, TRACK_DELIVERY,
};
