//! Conversation model: turns, append-only history, backend message assembly.
//!
//! The serialized turn format matches what the conversation store already
//! holds (`t` / `user` / `key` field names with `human` / `bot` / `tool`
//! role tags), so saved sessions stay readable by existing frontends.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use promptlab_llm::ChatMessage;

// ── Turns ────────────────────────────────────────────────────────────────────

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnRole {
    #[serde(rename = "human")]
    Human,
    #[serde(rename = "bot")]
    Assistant,
    #[serde(rename = "tool")]
    Tool,
}

/// Generation metrics attached to assistant turns.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TurnMetrics {
    pub token_count: Option<u32>,
    /// Milliseconds until the first token arrived.
    pub time_to_first_token: Option<f64>,
    /// `None` when the backend reported no (or zero) elapsed time.
    pub tokens_per_second: Option<f64>,
}

/// One exchange unit in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    #[serde(rename = "t")]
    pub text: String,
    #[serde(rename = "user")]
    pub role: TurnRole,
    /// Display key.  Backend response id for assistant turns, generated for
    /// the rest.  Not an ordering guarantee.
    #[serde(rename = "key")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(
        rename = "numberOfTokens",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub token_count: Option<u32>,
    #[serde(
        rename = "timeToFirstToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub time_to_first_token: Option<f64>,
    #[serde(
        rename = "tokensPerSecond",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tokens_per_second: Option<f64>,
}

impl Turn {
    pub fn human(text: impl Into<String>, image: Option<String>) -> Self {
        Self {
            text: text.into(),
            role: TurnRole::Human,
            id: Uuid::new_v4().to_string(),
            image,
            token_count: None,
            time_to_first_token: None,
            tokens_per_second: None,
        }
    }

    pub fn tool(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            role: TurnRole::Tool,
            id: Uuid::new_v4().to_string(),
            image: None,
            token_count: None,
            time_to_first_token: None,
            tokens_per_second: None,
        }
    }

    /// `id` falls back to a generated key when the backend omitted one.
    pub fn assistant(text: impl Into<String>, id: Option<String>, metrics: TurnMetrics) -> Self {
        Self {
            text: text.into(),
            role: TurnRole::Assistant,
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            image: None,
            token_count: metrics.token_count,
            time_to_first_token: metrics.time_to_first_token,
            tokens_per_second: metrics.tokens_per_second,
        }
    }
}

// ── Conversation ─────────────────────────────────────────────────────────────

/// Random base-36 token used as a conversation id, generated client-side on
/// first persistence and stable for the rest of the session.
fn conversation_token() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n = Uuid::new_v4().as_u128();
    let mut token = String::with_capacity(7);
    for _ in 0..7 {
        token.push(ALPHABET[(n % 36) as usize] as char);
        n /= 36;
    }
    token
}

/// An ordered, append-only sequence of turns.  Turns are never reordered or
/// removed within a session; the only mutation is [`Conversation::push`].
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    id: Option<String>,
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Assign the conversation id on first use; later calls return the same
    /// token (persistence is last-write-wins on it).
    pub fn ensure_id(&mut self) -> &str {
        self.id.get_or_insert_with(conversation_token)
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Map the history into the backend's message shape.
    ///
    /// Assistant turns keep the `assistant` role; human *and tool* turns are
    /// sent as `user` — the backend has no tool role yet, so tool output is
    /// folded in (known backend limitation, preserved for compatibility).
    /// Prior-turn images are not re-sent; only text survives into history.
    pub fn to_backend_messages(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .map(|turn| match turn.role {
                TurnRole::Assistant => ChatMessage::assistant(turn.text.clone()),
                TurnRole::Human | TurnRole::Tool => ChatMessage::user(turn.text.clone()),
            })
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use promptlab_llm::Role;

    #[test]
    fn turn_serde_uses_store_field_names() {
        let turn = Turn::assistant(
            "hello",
            Some("resp-9".to_string()),
            TurnMetrics {
                token_count: Some(12),
                time_to_first_token: Some(34.5),
                tokens_per_second: Some(6.7),
            },
        );
        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(value["t"], "hello");
        assert_eq!(value["user"], "bot");
        assert_eq!(value["key"], "resp-9");
        assert_eq!(value["numberOfTokens"], 12);
        assert_eq!(value["timeToFirstToken"], 34.5);
        assert_eq!(value["tokensPerSecond"], 6.7);
    }

    #[test]
    fn turn_serde_roundtrip() {
        let turn = Turn::human("hi there", Some("data:image/png;base64,abc".to_string()));
        let json = serde_json::to_string(&turn).unwrap();
        let back: Turn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, turn);
    }

    #[test]
    fn role_tags_match_store_values() {
        assert_eq!(serde_json::to_value(TurnRole::Human).unwrap(), "human");
        assert_eq!(serde_json::to_value(TurnRole::Assistant).unwrap(), "bot");
        assert_eq!(serde_json::to_value(TurnRole::Tool).unwrap(), "tool");
    }

    #[test]
    fn metric_fields_omitted_when_absent() {
        let value = serde_json::to_value(Turn::human("hi", None)).unwrap();
        assert!(value.get("numberOfTokens").is_none());
        assert!(value.get("tokensPerSecond").is_none());
        assert!(value.get("image").is_none());
    }

    #[test]
    fn generated_turn_ids_are_distinct() {
        let a = Turn::human("a", None);
        let b = Turn::human("b", None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn assistant_without_backend_id_gets_generated_key() {
        let turn = Turn::assistant("x", None, TurnMetrics::default());
        assert!(!turn.id.is_empty());
    }

    #[test]
    fn ensure_id_is_stable_and_base36() {
        let mut conversation = Conversation::new();
        assert!(conversation.id().is_none());
        let first = conversation.ensure_id().to_string();
        assert_eq!(first.len(), 7);
        assert!(first.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_eq!(conversation.ensure_id(), first);
        assert_eq!(conversation.id(), Some(first.as_str()));
    }

    #[test]
    fn conversation_tokens_are_distinct() {
        assert_ne!(conversation_token(), conversation_token());
    }

    #[test]
    fn push_appends_in_order() {
        let mut conversation = Conversation::new();
        conversation.push(Turn::human("one", None));
        conversation.push(Turn::assistant("two", None, TurnMetrics::default()));
        conversation.push(Turn::tool("three"));
        let texts: Vec<&str> = conversation.turns().iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, ["one", "two", "three"]);
        assert_eq!(conversation.len(), 3);
    }

    #[test]
    fn backend_messages_fold_tool_into_user_role() {
        let mut conversation = Conversation::new();
        conversation.push(Turn::human("ask", None));
        conversation.push(Turn::assistant("answer", None, TurnMetrics::default()));
        conversation.push(Turn::tool("tool output"));

        let messages = conversation.to_backend_messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[2].role, Role::User);
    }

    #[test]
    fn backend_messages_drop_history_images() {
        let mut conversation = Conversation::new();
        conversation.push(Turn::human("look at this", Some("data:...".to_string())));
        let messages = conversation.to_backend_messages();
        let value = serde_json::to_value(&messages[0]).unwrap();
        assert_eq!(value["content"], "look at this");
    }
}
