use super::{http_client, status_error, transport_error, ProviderError, DEFAULT_REQUEST_TIMEOUT};
use crate::collaborators::SummaryGenerator;
use crate::error::CollaboratorError;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Plot summaries from the OpenAI chat completions API.
pub struct OpenAiSummarizer {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
}

impl OpenAiSummarizer {
    pub fn new(api_key: SecretString) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(DEFAULT_REQUEST_TIMEOUT)?,
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            model: DEFAULT_MODEL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl SummaryGenerator for OpenAiSummarizer {
    async fn summarize(&self, plot: &str) -> Result<String, CollaboratorError> {
        let prompt = format!("Please provide a concise summary of this movie plot: {plot}");
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
        };
        debug!(model = %self.model, plot_len = plot.len(), "requesting summary");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_body(status.as_u16(), body));
        }
        let body: ChatResponse = response.json().await.map_err(transport_error)?;
        body.into_summary()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    refusal: Option<String>,
}

impl ChatResponse {
    fn into_summary(self) -> Result<String, CollaboratorError> {
        let choice = self.choices.into_iter().next().ok_or_else(|| {
            CollaboratorError::MalformedResponse("completion has no choices".to_string())
        })?;
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(CollaboratorError::ContentPolicy(
                "completion stopped by content filter".to_string(),
            ));
        }
        if let Some(refusal) = choice.message.refusal {
            return Err(CollaboratorError::ContentPolicy(refusal));
        }
        match choice.message.content.map(|c| c.trim().to_string()) {
            Some(summary) if !summary.is_empty() => Ok(summary),
            _ => Err(CollaboratorError::MalformedResponse(
                "completion has no content".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
    code: Option<String>,
}

fn error_from_body(status: u16, body: String) -> CollaboratorError {
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(ErrorEnvelope { error })
            if matches!(
                error.code.as_deref(),
                Some("content_filter" | "content_policy_violation")
            ) =>
        {
            CollaboratorError::ContentPolicy(error.message)
        }
        Ok(ErrorEnvelope { error }) => status_error(status, error.message),
        Err(_) => status_error(status, body),
    }
}
