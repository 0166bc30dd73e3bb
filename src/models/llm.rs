//! Multimodal LLM HTTP adapter
//!
//! Speaks the OpenAI-compatible `/chat/completions` shape: conversation
//! memory becomes the message list, screen captures become image content
//! parts. The screen-capture request arrives from the model as an explicit
//! sentinel token which this adapter strips and normalises into
//! [`LlmReply::needs_screen`], so no keyword heuristics live downstream.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ModelsConfig, PipelineConfig};
use crate::types::ConversationTurn;

use super::{
    map_status, map_transport_error, with_retry, LanguageModel, LlmReply, ModelError,
    RespondRequest, RetryPolicy,
};

/// Token the model emits when it needs a current screen image. An optional
/// reason may follow a colon: `[[capture_screen: user asked about the chart]]`.
const SCREEN_SENTINEL: &str = "[[capture_screen";

/// Marker wrapping the model's one-line screen description when an image was
/// attached: `[[screen: a spreadsheet with quarterly totals]]`.
const SCREEN_SUMMARY_MARKER: &str = "[[screen:";

const SYSTEM_PROMPT: &str = r#"You are a helpful AI assistant in a real-time voice conversation. The user speaks to you and sometimes shares their screen. Keep responses concise and conversational - aim for 1-3 sentences unless the user asks for detail. Do not use markdown, bullet points, or code blocks - your responses will be spoken aloud.

If answering requires seeing the user's current screen and no screenshot is attached, include the token [[capture_screen: brief reason]] in your reply and answer as best you can without it.

If a screenshot is attached, end your reply with a single line of the form [[screen: one-line description of what the screen shows]]."#;

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a concise summarizer. Fold the given conversation turns into the \
     existing summary, preserving topics discussed, decisions, user preferences, \
     and anything on screen that mattered. Output only the new summary text.";

pub struct HttpLlm {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    summary_model: String,
    deadline: Duration,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Value],
    max_tokens: u32,
    /// Correlation hint forwarded to the backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
}

impl HttpLlm {
    pub fn new(models: &ModelsConfig, pipeline: &PipelineConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: models.llm_url.trim_end_matches('/').to_string(),
            api_key: models.resolve_llm_api_key(),
            model: models.llm_model.clone(),
            summary_model: models.summary_model.clone(),
            deadline: pipeline.llm_deadline(),
            retry: RetryPolicy::default(),
        })
    }

    async fn attempt(
        &self,
        model: &str,
        messages: &[Value],
        session_hint: Option<&str>,
    ) -> Result<String, ModelError> {
        let request = ChatRequest { model, messages, max_tokens: 1024, user: session_hint };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = tokio::time::timeout(self.deadline, builder.send())
            .await
            .map_err(|_| ModelError::Timeout)?
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ModelError::Unavailable(format!("malformed LLM response: {e}")))?;

        Ok(extract_content(&body))
    }
}

#[async_trait]
impl LanguageModel for HttpLlm {
    async fn respond(
        &self,
        request: RespondRequest,
        cancel: CancellationToken,
    ) -> Result<LlmReply, ModelError> {
        if request.user_text.trim().is_empty() {
            return Err(ModelError::InvalidInput("empty user text".into()));
        }

        let started = Instant::now();
        let messages = build_messages(&request);
        debug!(
            "LLM request: {} messages, image={}, ~{} memory tokens",
            messages.len(),
            request.screen_image.is_some(),
            request.memory.estimated_tokens()
        );

        let content = with_retry("llm", &self.retry, &cancel, || {
            self.attempt(&self.model, &messages, Some(&request.session_hint))
        })
        .await?;

        let mut reply = parse_reply(&content);
        reply.processing_ms = started.elapsed().as_millis() as u64;
        Ok(reply)
    }

    async fn summarise(
        &self,
        turns: Vec<ConversationTurn>,
        existing_summary: String,
        cancel: CancellationToken,
    ) -> Result<String, ModelError> {
        let mut rendered = String::new();
        for turn in &turns {
            rendered.push_str(&format!("[user]: {}\n", turn.user_text));
            rendered.push_str(&format!("[assistant]: {}\n", turn.assistant_text));
            if let Some(screen) = &turn.screen_summary {
                rendered.push_str(&format!("[screen]: {screen}\n"));
            }
        }

        let prompt = if existing_summary.is_empty() {
            format!("Summarize these conversation turns:\n\n{rendered}")
        } else {
            format!(
                "Existing summary:\n{existing_summary}\n\nFold in these newer turns:\n\n{rendered}"
            )
        };

        let messages = vec![
            json!({ "role": "system", "content": SUMMARY_SYSTEM_PROMPT }),
            json!({ "role": "user", "content": prompt }),
        ];

        let summary = with_retry("summarise", &self.retry, &cancel, || {
            self.attempt(&self.summary_model, &messages, None)
        })
        .await?;

        Ok(summary.trim().to_string())
    }
}

/// Assemble the chat message list: system prompt, rolling summary, verbatim
/// turns, then the current utterance (with the screen image as a content
/// part when present).
fn build_messages(request: &RespondRequest) -> Vec<Value> {
    let mut messages = vec![json!({ "role": "system", "content": SYSTEM_PROMPT })];

    if !request.memory.summary.is_empty() {
        messages.push(json!({
            "role": "system",
            "content": format!(
                "Context from earlier in the conversation:\n{}",
                request.memory.summary
            ),
        }));
    }

    for turn in &request.memory.turns {
        messages.push(json!({ "role": "user", "content": turn.user_text.clone() }));
        messages.push(json!({ "role": "assistant", "content": turn.assistant_text.clone() }));
    }

    match &request.screen_image {
        Some(image) => messages.push(json!({
            "role": "user",
            "content": [
                { "type": "text", "text": request.user_text.clone() },
                { "type": "image_url", "image_url": { "url": image.to_data_uri() } }
            ],
        })),
        None => messages.push(json!({ "role": "user", "content": request.user_text.clone() })),
    }

    messages
}

/// Extract assistant text from a chat-completions body, handling both plain
/// string content and array-of-content-parts formats.
fn extract_content(body: &Value) -> String {
    let content = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"));

    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| {
                if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                    part.get("text").and_then(|t| t.as_str()).map(str::to_string)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Strip the screen sentinels out of the raw reply text.
fn parse_reply(raw: &str) -> LlmReply {
    let mut text = raw.to_string();
    let mut needs_screen = false;
    let mut screen_reason = None;
    let mut screen_summary = None;

    if let Some((stripped, inner)) = take_marker(&text, SCREEN_SENTINEL) {
        needs_screen = true;
        screen_reason = inner;
        text = stripped;
    }
    if let Some((stripped, inner)) = take_marker(&text, SCREEN_SUMMARY_MARKER) {
        screen_summary = inner;
        text = stripped;
    }

    LlmReply {
        text: text.trim().to_string(),
        processing_ms: 0,
        screen_summary,
        needs_screen,
        screen_reason,
    }
}

/// Remove one `marker ... ]]` span, returning the remaining text and the
/// payload after the marker's optional colon.
fn take_marker(text: &str, marker: &str) -> Option<(String, Option<String>)> {
    let start = text.find(marker)?;
    let after = &text[start + marker.len()..];
    let end_rel = after.find("]]")?;
    let inner = after[..end_rel].trim_start_matches(':').trim();
    let payload = if inner.is_empty() { None } else { Some(inner.to_string()) };

    let mut remaining = String::with_capacity(text.len());
    remaining.push_str(&text[..start]);
    remaining.push_str(&after[end_rel + 2..]);
    Some((remaining, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySnapshot;
    use chrono::Utc;

    #[test]
    fn test_parse_plain_reply() {
        let reply = parse_reply("The build failed because of a missing semicolon.");
        assert!(!reply.needs_screen);
        assert!(reply.screen_summary.is_none());
        assert_eq!(reply.text, "The build failed because of a missing semicolon.");
    }

    #[test]
    fn test_parse_capture_sentinel_with_reason() {
        let reply = parse_reply(
            "I can't see your editor yet. [[capture_screen: need the current error]]",
        );
        assert!(reply.needs_screen);
        assert_eq!(reply.screen_reason.as_deref(), Some("need the current error"));
        assert_eq!(reply.text, "I can't see your editor yet.");
    }

    #[test]
    fn test_parse_capture_sentinel_bare() {
        let reply = parse_reply("[[capture_screen]] Let me take a look.");
        assert!(reply.needs_screen);
        assert!(reply.screen_reason.is_none());
        assert_eq!(reply.text, "Let me take a look.");
    }

    #[test]
    fn test_parse_screen_summary() {
        let reply =
            parse_reply("That chart shows Q3 revenue.\n[[screen: a bar chart of revenue]]");
        assert!(!reply.needs_screen);
        assert_eq!(reply.screen_summary.as_deref(), Some("a bar chart of revenue"));
        assert_eq!(reply.text, "That chart shows Q3 revenue.");
    }

    #[test]
    fn test_extract_content_parts_format() {
        let body = json!({
            "choices": [{ "message": { "content": [
                { "type": "text", "text": "hello " },
                { "type": "text", "text": "world" }
            ]}}]
        });
        assert_eq!(extract_content(&body), "hello world");
    }

    #[test]
    fn test_build_messages_order() {
        let snapshot = MemorySnapshot {
            summary: "They discussed the weather.".into(),
            turns: vec![crate::types::ConversationTurn {
                seq: 0,
                user_text: "hi".into(),
                assistant_text: "hello".into(),
                screen_summary: None,
                created_at: Utc::now(),
            }],
        };
        let request = RespondRequest {
            user_text: "what now?".into(),
            memory: snapshot,
            screen_image: None,
            session_hint: "conn-1".into(),
        };
        let messages = build_messages(&request);
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "system");
        assert_eq!(messages[2]["content"], "hi");
        assert_eq!(messages[3]["role"], "assistant");
        assert_eq!(messages[4]["content"], "what now?");
    }
}
