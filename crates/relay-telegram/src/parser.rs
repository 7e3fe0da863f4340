//! Raw Bot API update -> [`InboundMessage`].
//!
//! Parsing is total: malformed or unsupported payloads come back as a
//! [`SkipReason`] instead of an error, so the adapter can account for them
//! without aborting a batch.

use relay_core::domain::{InboundMessage, Metadata};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    InvalidUpdateId,
    UnsupportedUpdateType,
    UnsupportedMessageText,
    MissingChatOrUserId,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUpdateId => "invalid-update-id",
            Self::UnsupportedUpdateType => "unsupported-update-type",
            Self::UnsupportedMessageText => "unsupported-message-text",
            Self::MissingChatOrUserId => "missing-chat-or-user-id",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of parsing one update. Exactly one of `inbound` / `skip_reason` is set.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedUpdate {
    pub update_id: Option<i64>,
    pub inbound: Option<InboundMessage>,
    pub skip_reason: Option<SkipReason>,
}

impl ParsedUpdate {
    fn skipped(update_id: Option<i64>, reason: SkipReason) -> Self {
        Self {
            update_id,
            inbound: None,
            skip_reason: Some(reason),
        }
    }
}

/// Parse one update. Only `message.text` updates produce an inbound message.
pub fn parse_update(raw: &Map<String, Value>) -> ParsedUpdate {
    let Some(update_id) = raw.get("update_id").and_then(coerce_update_id) else {
        return ParsedUpdate::skipped(None, SkipReason::InvalidUpdateId);
    };

    let Some(message) = raw.get("message").and_then(Value::as_object) else {
        return ParsedUpdate::skipped(Some(update_id), SkipReason::UnsupportedUpdateType);
    };

    let text = match message.get("text").and_then(Value::as_str) {
        Some(t) if !t.trim().is_empty() => t,
        _ => {
            return ParsedUpdate::skipped(Some(update_id), SkipReason::UnsupportedMessageText)
        }
    };

    let chat_id = nested_id(message, "chat");
    let user_id = nested_id(message, "from");
    let (Some(chat_id), Some(user_id)) = (chat_id, user_id) else {
        return ParsedUpdate::skipped(Some(update_id), SkipReason::MissingChatOrUserId);
    };

    let mut metadata = Metadata::new();
    metadata.insert("source".to_string(), Value::from("telegram"));
    metadata.insert("update_type".to_string(), Value::from("message"));

    // All four required fields are non-blank here, so construction cannot fail.
    match InboundMessage::new(update_id.to_string(), chat_id, user_id, text) {
        Ok(inbound) => ParsedUpdate {
            update_id: Some(update_id),
            inbound: Some(
                inbound
                    .with_message_id(message.get("message_id").and_then(coerce_id))
                    .with_timestamp_seconds(message.get("date").and_then(coerce_int))
                    .with_metadata(metadata),
            ),
            skip_reason: None,
        },
        Err(_) => ParsedUpdate::skipped(Some(update_id), SkipReason::MissingChatOrUserId),
    }
}

/// Provider update ids are non-negative integers; anything else is unusable.
pub fn coerce_update_id(v: &Value) -> Option<i64> {
    let id = match v {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (id >= 0).then_some(id)
}

fn nested_id(message: &Map<String, Value>, key: &str) -> Option<String> {
    message
        .get(key)
        .and_then(Value::as_object)
        .and_then(|o| o.get("id"))
        .and_then(coerce_id)
}

fn coerce_id(v: &Value) -> Option<String> {
    let s = match v {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn coerce_int(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}
