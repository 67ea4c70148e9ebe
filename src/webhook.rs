//! Inbound event callbacks.
//!
//! Accepts both callback schemas the platform sends: v1 (fields at the top
//! level, `token` included) and v2 (`{"schema": "2.0", "header": {...},
//! "event": {...}}`). The HTTP answer is always 200; processing runs on a
//! tracked task after the acknowledgment.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::error::ParseError;
use crate::server::AppState;

/// A message event extracted from a callback body.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub event_type: Option<String>,
    pub message_id: String,
    pub raw_content: String,
    pub mentioned_user_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Callback {
    Verification { challenge: Value },
    Message(InboundEvent),
}

#[derive(Debug, Deserialize)]
struct RawCallback {
    #[serde(rename = "type")]
    kind: Option<String>,
    challenge: Option<Value>,
    token: Option<String>,
    header: Option<RawHeader>,
    event: Option<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    event_type: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    message_id: Option<String>,
    content: Option<String>,
    #[serde(default)]
    mentions: Option<Vec<RawMention>>,
}

#[derive(Debug, Deserialize)]
struct RawMention {
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    #[serde(default)]
    text: String,
}

impl RawCallback {
    fn verification_token(&self) -> Option<&str> {
        self.header
            .as_ref()
            .and_then(|h| h.token.as_deref())
            .or(self.token.as_deref())
    }
}

/// Parse a callback body into a verification challenge or a message event.
/// Also returns the verification token the body carried, if any.
pub fn parse_callback(body: &[u8]) -> Result<(Callback, Option<String>), ParseError> {
    let raw: RawCallback = serde_json::from_slice(body)?;
    let token = raw.verification_token().map(str::to_string);

    if raw.kind.as_deref() == Some("url_verification") {
        let challenge = raw.challenge.ok_or(ParseError::MissingField("challenge"))?;
        return Ok((Callback::Verification { challenge }, token));
    }

    let event = raw.event.ok_or(ParseError::MissingField("event"))?;
    let message = event.message.ok_or(ParseError::MissingField("event.message"))?;
    let message_id = message
        .message_id
        .filter(|id| !id.is_empty())
        .ok_or(ParseError::MissingField("event.message.message_id"))?;

    let raw_content = match message.content.as_deref() {
        None => String::new(),
        Some(content) => {
            serde_json::from_str::<TextContent>(content)
                .map_err(|e| ParseError::InvalidContent(e.to_string()))?
                .text
        }
    };

    let mentioned_user_keys = message
        .mentions
        .unwrap_or_default()
        .into_iter()
        .filter_map(|m| m.key)
        .collect();

    let event_type = raw.header.and_then(|h| h.event_type).or(event.kind);

    Ok((
        Callback::Message(InboundEvent {
            event_type,
            message_id,
            raw_content,
            mentioned_user_keys,
        }),
        token,
    ))
}

/// Remove every literal occurrence of every mention key, then trim the ends.
/// Inner whitespace is left as is.
pub fn strip_mentions(text: &str, mention_keys: &[String]) -> String {
    let mut stripped = text.to_string();
    for key in mention_keys.iter().filter(|k| !k.is_empty()) {
        stripped = stripped.replace(key.as_str(), "");
    }
    stripped.trim().to_string()
}

fn ack() -> Response {
    Json(json!({})).into_response()
}

/// `POST /` handler.
pub async fn handle_callback(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let (callback, token) = match parse_callback(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Ignoring unparseable callback: {}", e);
            return ack();
        }
    };

    if let Some(expected) = state.verification_token.as_deref() {
        if token.as_deref() != Some(expected) {
            warn!("Ignoring callback with mismatched verification token");
            return ack();
        }
    }

    match callback {
        Callback::Verification { challenge } => {
            info!("Answering URL verification challenge");
            Json(json!({ "challenge": challenge })).into_response()
        }
        Callback::Message(event) => {
            let span = tracing::info_span!(
                "event",
                delivery = %Uuid::new_v4(),
                message_id = %event.message_id
            );
            let worker = state.clone();
            state
                .tasks
                .spawn(async move { process_event(&worker, event).await }.instrument(span));
            ack()
        }
    }
}

/// Dedup, answer and reply for one message event. Failures are logged.
pub async fn process_event(state: &AppState, event: InboundEvent) {
    debug!(
        "Processing {} event",
        event.event_type.as_deref().unwrap_or("untyped")
    );

    if state.dedup.check_and_mark(&event.message_id).await {
        info!("Duplicate delivery of {}, skipping", event.message_id);
        return;
    }

    let query = strip_mentions(&event.raw_content, &event.mentioned_user_keys);
    if query.is_empty() {
        info!("Message {} has no text after mentions, skipping", event.message_id);
        return;
    }
    info!("Question from {}: {}", event.message_id, query);

    let answer = match state.answer.answer(&query, &[]).await {
        Ok(answer) => answer,
        Err(e) => {
            error!("Answer backend failed for {}: {:#}", event.message_id, e);
            return;
        }
    };
    if !answer.sources.is_empty() {
        debug!("Answer cites {} source(s)", answer.sources.len());
    }

    if let Err(e) = state.replier.reply(&event.message_id, &answer.text).await {
        error!("Failed to reply to {}: {}", event.message_id, e);
    }
}
