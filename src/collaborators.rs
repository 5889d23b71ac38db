//! Narrow interfaces to the external services a run talks to.

use crate::delivery::DeliveryStatus;
use crate::error::CollaboratorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Movie metadata as returned by a [`MovieInfoProvider`].
///
/// Optional fields are `None` when the provider has no value for them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieInfo {
    pub title: String,
    pub plot: String,
    pub year: Option<String>,
    pub rated: Option<String>,
    pub runtime: Option<String>,
    pub genre: Option<String>,
    pub director: Option<String>,
    pub actors: Option<String>,
    pub poster: Option<String>,
    pub imdb_rating: Option<String>,
    pub metascore: Option<String>,
}

/// Transport-assigned identifier of a sent email.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Looks up movie metadata by title. Matching (exact or fuzzy) is up to the
/// implementation.
#[async_trait]
pub trait MovieInfoProvider: Send + Sync {
    /// Returns [`CollaboratorError::NotFound`] when no movie matches.
    async fn fetch(&self, title: &str) -> Result<MovieInfo, CollaboratorError>;
}

/// Condenses a plot into a short summary.
#[async_trait]
pub trait SummaryGenerator: Send + Sync {
    /// Returns [`CollaboratorError::ContentPolicy`] when the service refuses
    /// the text.
    async fn summarize(&self, plot: &str) -> Result<String, CollaboratorError>;
}

/// Hands an email to the transport.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Returns [`CollaboratorError::InvalidAddress`] when the recipient is
    /// rejected.
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
        text_body: &str,
    ) -> Result<MessageId, CollaboratorError>;
}

/// Reports the transport's current view of a sent email.
#[async_trait]
pub trait DeliveryStatusSource: Send + Sync {
    async fn status(&self, message_id: &MessageId) -> Result<DeliveryStatus, CollaboratorError>;

    /// Called when tracking of `message_id` starts.
    fn watch(&self, _message_id: &MessageId) {}

    /// Called when tracking of `message_id` ends, however it ends.
    fn forget(&self, _message_id: &MessageId) {}
}
