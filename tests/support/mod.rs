//! Fake collaborators and a dispatcher harness for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use cinemail::prelude::*;
use cinemail::{DispatchConfig, OutcomeLog, PushedDeliveryStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MAX_ATTEMPTS: u32 = 3;

pub fn movie(title: &str, plot: &str) -> MovieInfo {
    MovieInfo {
        title: title.to_string(),
        plot: plot.to_string(),
        year: Some("1988".to_string()),
        rated: Some("PG".to_string()),
        imdb_rating: Some("7.5".to_string()),
        ..MovieInfo::default()
    }
}

/// Movie catalog with loose title matching: case, punctuation and a leading
/// "the" are ignored, and a query contained in a title matches it.
pub struct FakeMovies {
    catalog: HashMap<String, MovieInfo>,
    failures_before_success: AtomicU32,
    delay: Duration,
    calls: AtomicU32,
}

impl FakeMovies {
    pub fn new() -> Self {
        let mut catalog = HashMap::new();
        for m in [
            movie(
                "Beetlejuice",
                "The spirits of a deceased couple are harassed by an unbearable family.",
            ),
            movie(
                "The Shawshank Redemption",
                "A banker convicted of uxoricide forms a friendship with a fellow inmate.",
            ),
            movie(
                "The Godfather",
                "The aging patriarch of an organized crime dynasty transfers control to his son.",
            ),
            movie("Plotless", "N/A"),
        ] {
            catalog.insert(normalize(&m.title), m);
        }
        Self {
            catalog,
            failures_before_success: AtomicU32::new(0),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    /// Fails the first `n` lookups with HTTP 503.
    pub fn failing_first(self, n: u32) -> Self {
        self.failures_before_success.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn normalize(title: &str) -> String {
    let lowered: String = title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    match words.split_first() {
        Some((&"the", rest)) => rest.join(" "),
        _ => words.join(" "),
    }
}

#[async_trait]
impl MovieInfoProvider for FakeMovies {
    async fn fetch(&self, title: &str) -> Result<MovieInfo, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let remaining = self.failures_before_success.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_before_success.store(remaining - 1, Ordering::SeqCst);
            return Err(CollaboratorError::Http {
                status: 503,
                message: "Service Unavailable".to_string(),
            });
        }

        let wanted = normalize(title);
        self.catalog
            .iter()
            .find(|(key, _)| **key == wanted || key.contains(&wanted))
            .map(|(_, m)| m.clone())
            .ok_or_else(|| CollaboratorError::NotFound("Movie not found!".to_string()))
    }
}

pub struct FakeSummarizer {
    calls: AtomicU32,
}

impl FakeSummarizer {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SummaryGenerator for FakeSummarizer {
    async fn summarize(&self, plot: &str) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let short: String = plot.split_whitespace().take(6).collect::<Vec<_>>().join(" ");
        Ok(format!("{short}..."))
    }
}

/// Accepts addresses under common top-level domains, rejecting the rest the
/// way a real transport rejects undeliverable recipients.
pub struct FakeSender {
    sent: Mutex<Vec<(String, String)>>,
    calls: AtomicU32,
}

impl FakeSender {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(recipient, subject)` of every accepted email.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailSender for FakeSender {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
        text_body: &str,
    ) -> Result<MessageId, CollaboratorError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let tld = to.rsplit('.').next().unwrap_or_default();
        if !["com", "org", "net", "edu", "io"].contains(&tld) {
            return Err(CollaboratorError::InvalidAddress(format!(
                "Invalid `to` field: {to}"
            )));
        }
        assert!(html_body.contains("<html>"));
        assert!(!text_body.contains('<'));
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string()));
        Ok(MessageId::new(format!("msg-{n}")))
    }
}

/// Reports `Sent` on the first poll of a message and `final_state` after.
pub struct FakeDeliveryStatus {
    final_state: DeliveryState,
    polls: Mutex<HashMap<MessageId, u32>>,
}

impl FakeDeliveryStatus {
    pub fn new(final_state: DeliveryState) -> Self {
        Self {
            final_state,
            polls: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DeliveryStatusSource for FakeDeliveryStatus {
    async fn status(&self, message_id: &MessageId) -> Result<DeliveryStatus, CollaboratorError> {
        let mut polls = self.polls.lock().unwrap();
        let count = polls.entry(message_id.clone()).or_insert(0);
        *count += 1;
        let state = if *count == 1 {
            DeliveryState::Sent
        } else {
            self.final_state
        };
        Ok(DeliveryStatus::new(message_id.clone(), state))
    }
}

pub enum Delivery {
    Polled(DeliveryState),
    Pushed(Arc<PushedDeliveryStatus>),
}

pub struct Harness {
    pub dispatcher: Arc<EventDispatcher>,
    pub movies: Arc<FakeMovies>,
    pub summarizer: Arc<FakeSummarizer>,
    pub sender: Arc<FakeSender>,
    pub outcomes: Arc<dyn OutcomeLog>,
}

pub struct HarnessBuilder {
    movies: FakeMovies,
    delivery: Delivery,
    outcomes: Arc<dyn OutcomeLog>,
    dispatch: DispatchConfig,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            movies: FakeMovies::new(),
            delivery: Delivery::Polled(DeliveryState::Delivered),
            outcomes: Arc::new(InMemoryOutcomeLog::new()),
            dispatch: DispatchConfig::default(),
        }
    }

    pub fn movies(mut self, movies: FakeMovies) -> Self {
        self.movies = movies;
        self
    }

    pub fn delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn outcomes(mut self, outcomes: Arc<dyn OutcomeLog>) -> Self {
        self.outcomes = outcomes;
        self
    }

    pub fn run_timeout(mut self, run_timeout: Duration) -> Self {
        self.dispatch.run_timeout = run_timeout;
        self
    }

    pub fn build(self) -> Harness {
        let movies = Arc::new(self.movies);
        let summarizer = Arc::new(FakeSummarizer::new());
        let sender = Arc::new(FakeSender::new());
        let source: Arc<dyn DeliveryStatusSource> = match self.delivery {
            Delivery::Polled(state) => Arc::new(FakeDeliveryStatus::new(state)),
            Delivery::Pushed(pushed) => pushed,
        };

        let policy = RetryPolicy::new(
            MAX_ATTEMPTS,
            Duration::from_millis(200),
            Duration::from_secs(5),
        )
        .unwrap();
        let runner = StepRunner::new(
            Arc::new(StepMemo::new()),
            Arc::new(DefaultClassifier::new()),
            policy,
        )
        .with_step_timeout(Duration::from_secs(10));

        let engine = WorkflowEngine::builder()
            .runner(runner)
            .movies(movies.clone())
            .summarizer(summarizer.clone())
            .sender(sender.clone())
            .tracker(DeliveryTracker::new(source))
            .delivery_timeout(Duration::from_secs(30))
            .build()
            .unwrap();

        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::new(engine),
            self.outcomes.clone(),
            self.dispatch,
        ));
        Harness {
            dispatcher,
            movies,
            summarizer,
            sender,
            outcomes: self.outcomes,
        }
    }
}

pub fn harness() -> Harness {
    HarnessBuilder::new().build()
}
