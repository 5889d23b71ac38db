//! reqwest-backed implementations of the collaborator traits.

mod omdb;
mod openai;
mod resend;

pub use omdb::OmdbClient;
pub use openai::OpenAiSummarizer;
pub use resend::{delivery_state_from_event, ResendClient};

use crate::error::CollaboratorError;
use std::time::Duration;
use thiserror::Error;

/// Errors constructing a provider client.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Default bound on one HTTP exchange with a collaborator.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("cinemail/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Maps a non-success status to a collaborator error.
pub(crate) fn status_error(status: u16, body: String) -> CollaboratorError {
    match status {
        401 | 403 => CollaboratorError::Unauthorized(body),
        404 => CollaboratorError::NotFound(body),
        _ => CollaboratorError::Http {
            status,
            message: body,
        },
    }
}

pub(crate) fn transport_error(e: reqwest::Error) -> CollaboratorError {
    if e.is_timeout() {
        CollaboratorError::Timeout(e.to_string())
    } else if e.is_decode() {
        CollaboratorError::MalformedResponse(e.to_string())
    } else if let Some(status) = e.status() {
        status_error(status.as_u16(), e.to_string())
    } else {
        CollaboratorError::Connection(e.to_string())
    }
}

/// Passes successful responses through; otherwise reads the body and maps
/// the status.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, CollaboratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status.as_u16(), body))
}
