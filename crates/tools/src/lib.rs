use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ── Result envelope ──────────────────────────────────────────────────────────

/// Substituted into the tool turn when the backend reports an error without
/// saying anything useful.
pub const GENERIC_TOOL_ERROR: &str = "There was an unknown error calling the tool.";

/// Used when the tool backend's prompt endpoint is unreachable.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful chatbot assistant.";

/// What the tool backend returns for every invocation.  All fields optional:
/// the success rule below decides how to read a partially filled envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ToolEnvelope {
    /// Success iff a status is present, it is not `"error"`, and data is
    /// present.  Everything else is an error path.
    pub fn is_success(&self) -> bool {
        match &self.status {
            Some(status) => status != "error" && self.data.is_some(),
            None => false,
        }
    }

    /// Collapse the envelope into the text handed back to the model:
    /// the data on success, otherwise the backend's message, otherwise a
    /// generic error string.  Errors never abort the round — the model gets
    /// to react to them.
    pub fn into_exchange_text(self) -> String {
        if self.is_success() {
            match self.data {
                Some(serde_json::Value::String(text)) => text,
                Some(other) => other.to_string(),
                // is_success guarantees data is present
                None => unreachable!("success envelope without data"),
            }
        } else {
            self.message.unwrap_or_else(|| GENERIC_TOOL_ERROR.to_string())
        }
    }
}

// ── Backend seam ─────────────────────────────────────────────────────────────

/// The tool backend as the orchestrator sees it.  Invocations within one
/// round are made strictly sequentially; implementations need not serialize
/// anything themselves.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn call(
        &self,
        name: &str,
        arguments: &HashMap<String, serde_json::Value>,
    ) -> Result<ToolEnvelope>;

    /// The system prompt that primes the model for tool use.  Infallible:
    /// implementations fall back to [`DEFAULT_SYSTEM_PROMPT`].
    async fn system_prompt(&self) -> String;
}

// ── HTTP client ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ToolsClient {
    http: reqwest::Client,
    base_url: String,
}

impl ToolsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ToolBackend for ToolsClient {
    async fn call(
        &self,
        name: &str,
        arguments: &HashMap<String, serde_json::Value>,
    ) -> Result<ToolEnvelope> {
        let params = serde_json::to_string(arguments).context("encode tool arguments")?;
        debug!(tool = name, %params, "calling tool");

        let endpoint = format!("{}/tools/call/{name}", self.base_url);
        let response = self
            .http
            .get(endpoint)
            .query(&[("params", params.as_str())])
            .send()
            .await
            .with_context(|| format!("call tool {name}"))?;

        let envelope: ToolEnvelope = response
            .json()
            .await
            .with_context(|| format!("decode result of tool {name}"))?;
        Ok(envelope)
    }

    /// Fetch the agent system prompt.  Any transport or decode failure falls
    /// back to [`DEFAULT_SYSTEM_PROMPT`] rather than blocking the session.
    async fn system_prompt(&self) -> String {
        let endpoint = format!("{}/tools/prompt", self.base_url);
        let response = match self.http.get(endpoint).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!("system prompt fetch failed: {err}");
                return DEFAULT_SYSTEM_PROMPT.to_string();
            }
        };
        match response.json::<serde_json::Value>().await {
            Ok(serde_json::Value::String(prompt)) => prompt,
            Ok(other) => {
                warn!("system prompt endpoint returned non-string {other}; using default");
                DEFAULT_SYSTEM_PROMPT.to_string()
            }
            Err(err) => {
                warn!("system prompt decode failed: {err}");
                DEFAULT_SYSTEM_PROMPT.to_string()
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
