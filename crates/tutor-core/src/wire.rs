//! Completion-service wire format and HTTP transport.
//!
//! Requests and responses follow the `generateContent` JSON shape:
//!
//! ```json
//! {"contents": [{"role": "user", "parts": [{"text": "..."}]}]}
//! ```
//!
//! A successful reply carries `candidates[0].content.parts[0].text`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::ApiConfig;
use crate::conversation::Turn;
use crate::error::{LlmErrorKind, Result, TutorError};

// ============================================================================
// Request
// ============================================================================

/// Body of a `generateContent` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Conversation context, oldest first.
    pub contents: Vec<Content>,
}

/// One turn on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// `user` or `model`.
    pub role: String,
    /// Text parts; this client always sends exactly one.
    pub parts: Vec<Part>,
}

/// A text part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// The text.
    pub text: String,
}

impl From<&Turn> for Content {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role().wire_name().to_string(),
            parts: vec![Part {
                text: turn.text().to_string(),
            }],
        }
    }
}

impl GenerateRequest {
    /// Builds a request from the history followed by `prompt`.
    ///
    /// The prompt is always appended, even when the history already ends
    /// with the same turn.
    #[must_use]
    pub fn from_history(history: &[Turn], prompt: &Turn) -> Self {
        let mut contents: Vec<Content> = history.iter().map(Content::from).collect();
        contents.push(Content::from(prompt));
        Self { contents }
    }
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

/// A 2xx response body, classified once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionReply {
    /// The first candidate's text.
    Candidate(String),
    /// No usable text; the reason is for logs.
    Malformed(String),
}

impl CompletionReply {
    /// Classifies a response body.
    ///
    /// # Examples
    ///
    /// ```
    /// use tutor_core::wire::CompletionReply;
    ///
    /// let body = r#"{"candidates":[{"content":{"parts":[{"text":"Hi!"}]}}]}"#;
    /// assert_eq!(CompletionReply::parse(body), CompletionReply::Candidate("Hi!".into()));
    /// assert!(matches!(CompletionReply::parse("{}"), CompletionReply::Malformed(_)));
    /// ```
    #[must_use]
    pub fn parse(body: &str) -> Self {
        let response: GenerateResponse = match serde_json::from_str(body) {
            Ok(response) => response,
            Err(e) => return Self::Malformed(format!("invalid JSON: {e}")),
        };

        let text = response
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .and_then(|content| content.parts.into_iter().next())
            .and_then(|part| part.text);

        match text {
            Some(text) if !text.is_empty() => Self::Candidate(text),
            _ => Self::Malformed(
                "LLM response format is unexpected or content is missing.".to_string(),
            ),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Raw outcome of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl TransportResponse {
    /// Creates a response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns `true` for 2xx statuses.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Sends one request to the completion service.
///
/// Any HTTP status is a successful exchange; `Err` means no response was
/// received.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// Performs a single network exchange.
    async fn send(&self, request: &GenerateRequest) -> Result<TransportResponse>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: String,
    api_key: String,
}

impl HttpTransport {
    /// Creates a transport from the API configuration.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::MissingApiKey` when no key is configured, or
    /// `TutorError::HttpClientBuild` if the HTTP client cannot be built.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let api_key = config.resolve_api_key().ok_or(TutorError::MissingApiKey)?;
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TutorError::HttpClientBuild(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    #[instrument(skip(self, request), fields(turns = request.contents.len()))]
    async fn send(&self, request: &GenerateRequest) -> Result<TransportResponse> {
        let response = self
            .http
            .post(&self.base_url)
            .query(&[("key", self.api_key.as_str())])
            .json(request)
            .send()
            .await
            .map_err(|e| TutorError::llm_api_error(LlmErrorKind::Network, e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TutorError::llm_api_error(LlmErrorKind::Network, e.to_string()))?;

        debug!(status, bytes = body.len(), "Completion service responded");
        Ok(TransportResponse { status, body })
    }
}
