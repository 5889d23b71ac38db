use super::{
    check_status, http_client, status_error, transport_error, ProviderError,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::collaborators::{DeliveryStatusSource, EmailSender, MessageId};
use crate::delivery::{DeliveryState, DeliveryStatus};
use crate::error::CollaboratorError;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Email transport backed by the Resend API. Also reports delivery status
/// for the messages it sent.
pub struct ResendClient {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    from: String,
}

impl ResendClient {
    pub fn new(api_key: SecretString, from: impl Into<String>) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(DEFAULT_REQUEST_TIMEOUT)?,
            api_key,
            base_url: "https://api.resend.com".to_string(),
            from: from.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
    tags: [Tag; 1],
}

#[derive(Serialize)]
struct Tag {
    name: &'static str,
    value: String,
}

#[derive(Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Deserialize)]
struct EmailResponse {
    last_event: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
}

#[async_trait]
impl EmailSender for ResendClient {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
        text_body: &str,
    ) -> Result<MessageId, CollaboratorError> {
        let tracking_id = Uuid::new_v4().to_string();
        let request = SendRequest {
            from: &self.from,
            to: [to],
            subject,
            html: html_body,
            text: text_body,
            tags: [Tag {
                name: "email_id",
                value: tracking_id.clone(),
            }],
        };

        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(send_error(status.as_u16(), body));
        }
        let sent: SendResponse = response.json().await.map_err(transport_error)?;
        info!(message_id = %sent.id, tracking_id = %tracking_id, "email accepted by transport");
        Ok(MessageId::new(sent.id))
    }
}

#[async_trait]
impl DeliveryStatusSource for ResendClient {
    async fn status(&self, message_id: &MessageId) -> Result<DeliveryStatus, CollaboratorError> {
        let response = self
            .client
            .get(format!("{}/emails/{}", self.base_url, message_id))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(transport_error)?;
        let email: EmailResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        let last_event = email.last_event.unwrap_or_default();
        debug!(message_id = %message_id, last_event = %last_event, "polled delivery status");
        let state = delivery_state_from_event(&last_event).unwrap_or(DeliveryState::Queued);
        Ok(DeliveryStatus::new(message_id.clone(), state))
    }
}

/// Delivery state for a Resend event name, either an email's `last_event`
/// (`delivered`) or a webhook event type (`email.delivered`).
///
/// Returns `None` for events that say nothing about delivery, such as opens
/// and clicks.
pub fn delivery_state_from_event(event: &str) -> Option<DeliveryState> {
    match event.strip_prefix("email.").unwrap_or(event) {
        "scheduled" | "queued" => Some(DeliveryState::Queued),
        "sent" | "delivery_delayed" => Some(DeliveryState::Sent),
        "delivered" | "complained" => Some(DeliveryState::Delivered),
        "bounced" => Some(DeliveryState::Bounced),
        "failed" | "canceled" => Some(DeliveryState::Failed),
        _ => None,
    }
}

fn send_error(status: u16, body: String) -> CollaboratorError {
    let parsed = serde_json::from_str::<ApiError>(&body).ok();
    match (status, parsed) {
        (422, Some(error)) if error.name == "validation_error" => {
            CollaboratorError::InvalidAddress(error.message)
        }
        (_, Some(error)) if !error.message.is_empty() => status_error(status, error.message),
        _ => status_error(status, body),
    }
}
