//! Summarizer seam
//!
//! The core only orchestrates summarisation; prompt design and model
//! behaviour live behind this trait. One HTTP implementation is provided.

use crate::config::SummarizerConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Summarisation error with retry classification
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SummarizerError {
    pub kind: SummarizerErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizerErrorKind {
    /// Network issues, timeouts - retryable
    Network,
    /// Rate limited (429) - retryable with backoff
    RateLimit,
    /// Server error (5xx) - retryable
    ServerError,
    /// Authentication failed (401, 403) - not retryable
    Auth,
    /// Bad request (400) - not retryable
    InvalidRequest,
    Unknown,
}

impl SummarizerErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::RateLimit | Self::ServerError)
    }
}

impl SummarizerError {
    fn new(kind: SummarizerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What the summary processor hands over.
#[derive(Debug, Clone)]
pub struct SummaryRequest {
    pub subject: String,
    pub transcript_text: String,
    pub participant_names: Vec<String>,
    pub custom_instructions: Option<String>,
}

/// What comes back: the narrative plus structured extracts.
#[derive(Debug, Clone)]
pub struct SummaryResult {
    pub summary_text: String,
    pub action_items: Option<serde_json::Value>,
    pub decisions: Option<serde_json::Value>,
    pub topics: Option<serde_json::Value>,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// The one-method seam the summary processor calls.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResult, SummarizerError>;
}

/// HTTP summarizer against the Anthropic messages API.
pub struct HttpSummarizer {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl HttpSummarizer {
    pub fn new(config: &SummarizerConfig) -> Result<Self, SummarizerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| {
                SummarizerError::new(
                    SummarizerErrorKind::Network,
                    format!("Failed to create HTTP client: {e}"),
                )
            })?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn build_prompt(request: &SummaryRequest) -> String {
        let mut prompt = format!(
            "Summarize this meeting transcript.\n\nMeeting: {}\nParticipants: {}\n\n",
            request.subject,
            request.participant_names.join(", ")
        );
        if let Some(instructions) = &request.custom_instructions {
            prompt.push_str(&format!("Additional instructions: {instructions}\n\n"));
        }
        prompt.push_str(
            "Respond with JSON: {\"summary\": str, \"action_items\": [..], \
             \"decisions\": [..], \"topics\": [..]}\n\nTranscript:\n",
        );
        prompt.push_str(&request.transcript_text);
        prompt
    }

    fn classify_error(status: reqwest::StatusCode, body: &str) -> SummarizerError {
        let message = body.to_string();
        match status.as_u16() {
            401 | 403 => SummarizerError::new(
                SummarizerErrorKind::Auth,
                format!("Authentication failed: {message}"),
            ),
            429 => SummarizerError::new(
                SummarizerErrorKind::RateLimit,
                format!("Rate limited: {message}"),
            ),
            400 => SummarizerError::new(
                SummarizerErrorKind::InvalidRequest,
                format!("Invalid request: {message}"),
            ),
            500..=599 => SummarizerError::new(
                SummarizerErrorKind::ServerError,
                format!("Server error: {message}"),
            ),
            _ => SummarizerError::new(
                SummarizerErrorKind::Unknown,
                format!("HTTP {status}: {message}"),
            ),
        }
    }

    fn parse_structured(text: &str) -> (String, Option<serde_json::Value>, Option<serde_json::Value>, Option<serde_json::Value>) {
        // The model is asked for JSON but may wrap it in prose; fall back
        // to treating the whole response as the narrative.
        let candidate = text
            .find('{')
            .and_then(|start| text.rfind('}').map(|end| &text[start..=end]));
        if let Some(json_text) = candidate {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(json_text) {
                let summary = value
                    .get("summary")
                    .and_then(|v| v.as_str())
                    .unwrap_or(text)
                    .to_string();
                return (
                    summary,
                    value.get("action_items").cloned(),
                    value.get("decisions").cloned(),
                    value.get("topics").cloned(),
                );
            }
        }
        (text.to_string(), None, None, None)
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResult, SummarizerError> {
        let api_request = ApiRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![ApiMessage {
                role: "user".to_string(),
                content: Self::build_prompt(request),
            }],
        };

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SummarizerError::new(
                        SummarizerErrorKind::Network,
                        format!("Request timeout: {e}"),
                    )
                } else {
                    SummarizerError::new(
                        SummarizerErrorKind::Network,
                        format!("Request failed: {e}"),
                    )
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            SummarizerError::new(
                SummarizerErrorKind::Network,
                format!("Failed to read response: {e}"),
            )
        })?;

        if !status.is_success() {
            return Err(Self::classify_error(status, &body));
        }

        let api_response: ApiResponse = serde_json::from_str(&body).map_err(|e| {
            SummarizerError::new(
                SummarizerErrorKind::Unknown,
                format!("Failed to parse response: {e}"),
            )
        })?;

        let text = api_response
            .content
            .iter()
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() {
            return Err(SummarizerError::new(
                SummarizerErrorKind::Unknown,
                "Summarizer returned empty response",
            ));
        }

        let (summary_text, action_items, decisions, topics) = Self::parse_structured(&text);

        Ok(SummaryResult {
            summary_text,
            action_items,
            decisions,
            topics,
            model: self.model.clone(),
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
        })
    }
}

// API types

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    usage: ApiUsage,
}

#[derive(Deserialize)]
struct ApiContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: i64,
    output_tokens: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structured_json() {
        let text = r#"{"summary": "We planned Q3.", "action_items": ["ship it"], "decisions": [], "topics": ["planning"]}"#;
        let (summary, actions, decisions, topics) = HttpSummarizer::parse_structured(text);
        assert_eq!(summary, "We planned Q3.");
        assert_eq!(actions.unwrap()[0], "ship it");
        assert!(decisions.unwrap().as_array().unwrap().is_empty());
        assert_eq!(topics.unwrap()[0], "planning");
    }

    #[test]
    fn test_parse_structured_wrapped_in_prose() {
        let text = "Here is the summary:\n{\"summary\": \"Short.\", \"topics\": []}\nDone.";
        let (summary, _, _, topics) = HttpSummarizer::parse_structured(text);
        assert_eq!(summary, "Short.");
        assert!(topics.is_some());
    }

    #[test]
    fn test_parse_structured_fallback_to_plain_text() {
        let text = "Just a plain narrative summary with no JSON.";
        let (summary, actions, decisions, topics) = HttpSummarizer::parse_structured(text);
        assert_eq!(summary, text);
        assert!(actions.is_none() && decisions.is_none() && topics.is_none());
    }

    #[test]
    fn test_error_kinds_retryable() {
        assert!(SummarizerErrorKind::RateLimit.is_retryable());
        assert!(SummarizerErrorKind::ServerError.is_retryable());
        assert!(!SummarizerErrorKind::Auth.is_retryable());
        assert!(!SummarizerErrorKind::InvalidRequest.is_retryable());
    }
}
