//! Conversation persistence against the experiment server.
//!
//! The store keeps a conversation as `{conversation_id, conversation}` where
//! the `conversation` payload is itself a JSON-encoded string of the turn
//! array.  That double encoding is the store's contract, handled only here.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::turn::Turn;

// ── Seam ─────────────────────────────────────────────────────────────────────

/// Where finished rounds are persisted.  Saves always carry the full current
/// turn sequence; the store applies last-write-wins per conversation id.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn save(&self, experiment_id: &str, conversation_id: &str, turns: &[Turn])
    -> Result<()>;
    async fn list(&self, experiment_id: &str) -> Result<Vec<SavedConversation>>;
}

/// A stored conversation as returned by the list endpoint.  Entries may be
/// partially filled; the contents stay in their double-encoded form until a
/// caller asks for the turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedConversation {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
}

impl SavedConversation {
    /// Decode the stored turn sequence, if any.
    pub fn turns(&self) -> Result<Vec<Turn>> {
        match &self.conversation {
            Some(raw) => serde_json::from_str(raw).context("decode stored conversation"),
            None => Ok(vec![]),
        }
    }
}

// ── Wire shape ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SaveBody<'a> {
    conversation_id: &'a str,
    /// JSON string of the turn array, not a nested array.
    conversation: String,
}

fn save_body<'a>(conversation_id: &'a str, turns: &[Turn]) -> Result<SaveBody<'a>> {
    Ok(SaveBody {
        conversation_id,
        conversation: serde_json::to_string(turns).context("serialize turns")?,
    })
}

// ── HTTP client ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpConversationStore {
    http: reqwest::Client,
    base_url: String,
}

impl HttpConversationStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ConversationStore for HttpConversationStore {
    async fn save(
        &self,
        experiment_id: &str,
        conversation_id: &str,
        turns: &[Turn],
    ) -> Result<()> {
        debug!(experiment_id, conversation_id, turns = turns.len(), "saving conversation");
        let body = save_body(conversation_id, turns)?;
        let endpoint = format!(
            "{}/experiment/{experiment_id}/conversations/save",
            self.base_url
        );
        let response = self
            .http
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .context("save conversation")?;
        response
            .error_for_status()
            .context("save conversation rejected")?;
        Ok(())
    }

    async fn list(&self, experiment_id: &str) -> Result<Vec<SavedConversation>> {
        let endpoint = format!(
            "{}/experiment/{experiment_id}/conversations/list",
            self.base_url
        );
        let response = self
            .http
            .get(endpoint)
            .send()
            .await
            .context("list conversations")?;
        let conversations = response
            .json()
            .await
            .context("decode conversation list")?;
        Ok(conversations)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
