//! The conversation orchestrator.
//!
//! Drives one round at a time against the inference backend, optionally
//! augmented by a single tool round-trip: exchange, scan the response for
//! tool calls, invoke them sequentially, feed the joined output back, and
//! take exactly one followup exchange as the final answer.  The session owns
//! its conversation exclusively; nothing else appends between suspension
//! points.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use promptlab_config::GenerationConfig;
use promptlab_llm::{
    ChatMessage, ChatRequest, Generation, InferenceBackend, extract_tool_calls,
    tokens_per_second,
};
use promptlab_tools::ToolBackend;

use crate::store::ConversationStore;
use crate::turn::{Conversation, Turn, TurnMetrics};

// ── Settings ─────────────────────────────────────────────────────────────────

/// Everything a session needs to talk to the backend.  Replaced wholesale via
/// [`ChatSession::update_settings`] when the active model or knobs change.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub experiment_id: String,
    pub model: String,
    pub adaptor: Option<String>,
    /// System message for plain chat rounds.  Agent rounds fetch theirs from
    /// the tool backend instead.
    pub system_message: String,
    pub generation: GenerationConfig,
}

// ── Session ──────────────────────────────────────────────────────────────────

pub struct ChatSession {
    llm: Arc<dyn InferenceBackend>,
    tools: Arc<dyn ToolBackend>,
    store: Arc<dyn ConversationStore>,
    settings: SessionSettings,
    conversation: Conversation,
    pending_save: Option<JoinHandle<()>>,
}

impl ChatSession {
    pub fn new(
        llm: Arc<dyn InferenceBackend>,
        tools: Arc<dyn ToolBackend>,
        store: Arc<dyn ConversationStore>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            llm,
            tools,
            store,
            settings,
            conversation: Conversation::new(),
            pending_save: None,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn update_settings(&mut self, settings: SessionSettings) {
        self.settings = settings;
    }

    /// One plain chat round: append the user turn, exchange once, append the
    /// assistant turn, persist.
    pub async fn send_message(&mut self, text: &str, image: Option<String>) -> Result<Turn> {
        let image = image.filter(|image| !image.is_empty());
        let mut messages = self.conversation.to_backend_messages();
        push_user_input(&mut messages, text, image.as_deref());
        self.conversation.push(Turn::human(text, image.clone()));

        let request = self.chat_request(messages, self.settings.system_message.clone(), image);
        let generation = self.llm.exchange(&request).await?;

        let turn = self.assistant_turn(generation).await;
        self.conversation.push(turn.clone());
        self.persist();
        Ok(turn)
    }

    /// One tool-augmented round.
    ///
    /// The response is scanned once for tool-call markup.  When calls are
    /// present they run strictly sequentially in document order, their
    /// outputs are joined with newlines into a single tool turn, and exactly
    /// one followup exchange produces the final answer — the followup is
    /// never re-scanned, so a round ends after at most one tool round-trip.
    /// A malformed tool-call body fails the whole round.
    pub async fn send_agent_message(&mut self, text: &str, image: Option<String>) -> Result<Turn> {
        let image = image.filter(|image| !image.is_empty());
        let system_message = self.tools.system_prompt().await;

        let mut messages = self.conversation.to_backend_messages();
        push_user_input(&mut messages, text, image.as_deref());
        self.conversation.push(Turn::human(text, image.clone()));

        let request = self.chat_request(messages.clone(), system_message.clone(), image.clone());
        let mut generation = self.llm.exchange(&request).await?;

        let calls = extract_tool_calls(&generation.text)
            .context("assistant response contains a malformed tool call")?;

        if !calls.is_empty() {
            info!(count = calls.len(), "assistant requested tool calls");

            // The raw response, markup included, joins the history so the
            // followup sees what the model asked for.
            messages.push(ChatMessage::assistant(generation.text.clone()));
            let turn = self.assistant_turn(generation).await;
            self.conversation.push(turn);

            let mut outputs = Vec::with_capacity(calls.len());
            for call in &calls {
                debug!(tool = %call.name, "invoking tool");
                let envelope = self
                    .tools
                    .call(&call.name, &call.arguments)
                    .await
                    .with_context(|| format!("tool {} failed", call.name))?;
                outputs.push(envelope.into_exchange_text());
            }
            let combined = outputs.join("\n");

            // Tool output travels under the user role; see
            // `Conversation::to_backend_messages`.
            messages.push(ChatMessage::user(combined.clone()));
            self.conversation.push(Turn::tool(combined));

            let followup = self.chat_request(messages, system_message, image);
            generation = self.llm.exchange(&followup).await?;
        }

        let turn = self.assistant_turn(generation).await;
        self.conversation.push(turn.clone());
        self.persist();
        Ok(turn)
    }

    /// Wait for an in-flight save, if any.  Saves are otherwise
    /// fire-and-forget.
    pub async fn flush(&mut self) {
        if let Some(handle) = self.pending_save.take() {
            let _ = handle.await;
        }
    }

    fn chat_request(
        &self,
        messages: Vec<ChatMessage>,
        system_message: String,
        image: Option<String>,
    ) -> ChatRequest {
        let generation = &self.settings.generation;
        ChatRequest {
            model: self.settings.model.clone(),
            adaptor: self.settings.adaptor.clone(),
            messages,
            temperature: generation.temperature,
            max_tokens: generation.max_tokens,
            top_p: generation.top_p,
            frequency_penalty: generation.frequency_penalty,
            system_message,
            stop_sequences: generation.stop.clone(),
            image,
        }
    }

    /// Build the assistant turn, metrics attached.  Token counting is
    /// best-effort: a failed count leaves the metrics empty rather than
    /// failing a round that already produced text.
    async fn assistant_turn(&self, generation: Generation) -> Turn {
        let token_count = match self
            .llm
            .count_tokens(&self.settings.model, &[generation.text.clone()])
            .await
        {
            Ok(count) => Some(count.token_count),
            Err(err) => {
                warn!("token count failed: {err}");
                None
            }
        };

        let metrics = TurnMetrics {
            token_count,
            time_to_first_token: generation.time_to_first_token,
            tokens_per_second: token_count
                .and_then(|count| tokens_per_second(count, generation.elapsed_ms)),
        };
        Turn::assistant(generation.text, generation.id, metrics)
    }

    /// Persist the full current turn sequence without blocking the round.
    /// No retry: a failed save is logged and dropped.
    fn persist(&mut self) {
        let conversation_id = self.conversation.ensure_id().to_string();
        let experiment_id = self.settings.experiment_id.clone();
        let turns = self.conversation.turns().to_vec();
        let store = Arc::clone(&self.store);
        self.pending_save = Some(tokio::spawn(async move {
            if let Err(err) = store.save(&experiment_id, &conversation_id, &turns).await {
                warn!("conversation save failed: {err}");
            }
        }));
    }
}

fn push_user_input(messages: &mut Vec<ChatMessage>, text: &str, image: Option<&str>) {
    match image {
        Some(image) => messages.push(ChatMessage::user_with_image(text, image)),
        None => messages.push(ChatMessage::user(text)),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
