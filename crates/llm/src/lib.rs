use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("inference request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("inference backend returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("malformed inference response: {0}")]
    MalformedResponse(String),
}

/// A tool-call body between markers that is not valid JSON.  Fatal to the
/// whole extraction: the caller gets no partial list.
#[derive(Debug, Error)]
#[error("malformed tool call body {snippet:?}: {source}")]
pub struct ToolCallParseError {
    pub snippet: String,
    #[source]
    source: serde_json::Error,
}

// ── Messages ─────────────────────────────────────────────────────────────────

/// Wire role for a chat message.  The backend knows only these two; tool
/// output is folded into `User` upstream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One element of a multi-part message body (text plus inline image).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: String },
}

/// Message content: plain text, or ordered parts when an image rides along.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// The image travels as a second content part after the text, in that
    /// order; the backend's template expects it there.
    pub fn user_with_image(text: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: image.into(),
                },
            ]),
        }
    }
}

// ── Requests and responses ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptor: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub system_message: String,
    pub stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptor: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub stream: bool,
    pub stop_sequences: Vec<String>,
}

/// Response shape shared by the chat and completion endpoints.  The backend
/// may omit anything except the generated text.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGeneration {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    /// Total generation time in milliseconds.
    #[serde(default)]
    time: Option<f64>,
    #[serde(default)]
    time_to_first_token: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Backend-assigned response id, used as the assistant turn key.
    pub id: Option<String>,
    /// Total generation time in milliseconds.
    pub elapsed_ms: Option<f64>,
    pub time_to_first_token: Option<f64>,
}

impl TryFrom<RawGeneration> for Generation {
    type Error = LlmError;

    fn try_from(raw: RawGeneration) -> Result<Self, Self::Error> {
        let Some(text) = raw.text else {
            return Err(LlmError::MalformedResponse(
                "response has no text field".to_string(),
            ));
        };
        Ok(Self {
            text,
            id: raw.id,
            elapsed_ms: raw.time,
            time_to_first_token: raw.time_to_first_token,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCount {
    #[serde(default)]
    pub token_count: u32,
}

/// Throughput for an assistant turn.  `None` when the backend reported no
/// elapsed time (or zero): the caller gets a defined sentinel instead of a
/// NaN or infinity reaching the display layer.
pub fn tokens_per_second(token_count: u32, elapsed_ms: Option<f64>) -> Option<f64> {
    match elapsed_ms {
        Some(ms) if ms > 0.0 => Some(f64::from(token_count) / (ms / 1000.0)),
        _ => None,
    }
}

// ── Backend seam ─────────────────────────────────────────────────────────────

/// The inference backend as the orchestrator sees it.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn exchange(&self, request: &ChatRequest) -> Result<Generation, LlmError>;
    async fn count_tokens(&self, model: &str, texts: &[String]) -> Result<TokenCount, LlmError>;
}

// ── HTTP client ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    base_url: String,
}

impl InferenceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        payload: &impl Serialize,
    ) -> Result<T, LlmError> {
        let endpoint = format!("{}{path}", self.base_url);
        let response = self.http.post(endpoint).json(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }
        Ok(response.json().await?)
    }

    /// Plain (non-chat) completion over an already rendered prompt.
    pub async fn completion(&self, request: &CompletionRequest) -> Result<Generation, LlmError> {
        debug!(model = %request.model, "sending completion");
        let raw: RawGeneration = self.post_json("/inference/completion", request).await?;
        raw.try_into()
    }

    /// Count tokens for assembled chat messages, letting the server apply the
    /// model's own prompt template.
    pub async fn count_chat_tokens(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<TokenCount, LlmError> {
        self.post_json(
            "/inference/count_chat_tokens",
            &json!({ "model": model, "messages": messages }),
        )
        .await
    }

    /// Coarse stop signal to the generation transport.  Does not cancel any
    /// in-flight orchestration; an active round runs to completion or failure.
    pub async fn stop_generation(&self) {
        let endpoint = format!("{}/inference/stop", self.base_url);
        if let Err(err) = self.http.get(endpoint).send().await {
            warn!("stop_generation failed: {err}");
        }
    }
}

#[async_trait]
impl InferenceBackend for InferenceClient {
    async fn exchange(&self, request: &ChatRequest) -> Result<Generation, LlmError> {
        debug!(model = %request.model, messages = request.messages.len(), "sending exchange");
        let raw: RawGeneration = self.post_json("/inference/chat", request).await?;
        raw.try_into()
    }

    async fn count_tokens(&self, model: &str, texts: &[String]) -> Result<TokenCount, LlmError> {
        self.post_json(
            "/inference/count_tokens",
            &json!({ "model": model, "texts": texts }),
        )
        .await
    }
}

// ── Tool-call extraction ─────────────────────────────────────────────────────

pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";

/// A function invocation the model embedded in its text output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: HashMap<String, serde_json::Value>,
}

/// Scan assistant text left to right for `<tool_call>` bodies.
///
/// An open marker with no matching close marker takes everything to the end
/// of the string as its body and terminates the scan; any later text is
/// ignored.  A body that is not valid JSON fails the whole extraction — the
/// caller must treat the assistant turn as failed, not skip the call.
pub fn extract_tool_calls(response: &str) -> Result<Vec<ToolCall>, ToolCallParseError> {
    let mut calls = Vec::new();
    let mut cursor = 0;

    while let Some(open) = response[cursor..].find(TOOL_CALL_OPEN) {
        let body_start = cursor + open + TOOL_CALL_OPEN.len();
        let (body, resume) = match response[body_start..].find(TOOL_CALL_CLOSE) {
            Some(close) => {
                let body_end = body_start + close;
                (
                    &response[body_start..body_end],
                    Some(body_end + TOOL_CALL_CLOSE.len()),
                )
            }
            None => (&response[body_start..], None),
        };

        let call = serde_json::from_str(body).map_err(|source| ToolCallParseError {
            snippet: snippet_of(body),
            source,
        })?;
        calls.push(call);

        match resume {
            Some(next) => cursor = next,
            None => break,
        }
    }

    Ok(calls)
}

fn snippet_of(body: &str) -> String {
    const MAX: usize = 80;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let cut = body
            .char_indices()
            .take_while(|(i, _)| *i < MAX)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…", &body[..cut])
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
