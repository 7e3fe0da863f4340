use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

/// Free-form per-message annotations (source, update type, session id...).
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Provider-agnostic inbound message.
///
/// Built once by the wire parser and never mutated afterwards. `update_id`,
/// `chat_id`, `user_id` and `text` are guaranteed non-blank.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InboundMessage {
    update_id: String,
    chat_id: String,
    user_id: String,
    text: String,
    message_id: Option<String>,
    timestamp_seconds: Option<i64>,
    metadata: Metadata,
}

impl InboundMessage {
    pub fn new(
        update_id: impl Into<String>,
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Self> {
        let update_id = required("update_id", update_id.into())?;
        let chat_id = required("chat_id", chat_id.into())?;
        let user_id = required("user_id", user_id.into())?;
        let text = required("text", text.into())?;
        Ok(Self {
            update_id,
            chat_id,
            user_id,
            text,
            message_id: None,
            timestamp_seconds: None,
            metadata: Metadata::new(),
        })
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_timestamp_seconds(mut self, timestamp_seconds: Option<i64>) -> Self {
        self.timestamp_seconds = timestamp_seconds;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn update_id(&self) -> &str {
        &self.update_id
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn timestamp_seconds(&self) -> Option<i64> {
        self.timestamp_seconds
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

/// Provider-agnostic outbound message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutboundMessage {
    chat_id: String,
    text: String,
    reply_to_message_id: Option<String>,
    metadata: Metadata,
}

impl OutboundMessage {
    pub fn new(chat_id: impl Into<String>, text: impl Into<String>) -> Result<Self> {
        Ok(Self {
            chat_id: required("chat_id", chat_id.into())?,
            text: required("text", text.into())?,
            reply_to_message_id: None,
            metadata: Metadata::new(),
        })
    }

    pub fn with_reply_to(mut self, message_id: Option<String>) -> Self {
        self.reply_to_message_id = message_id;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn reply_to_message_id(&self) -> Option<&str> {
        self.reply_to_message_id.as_deref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

fn required(field: &str, value: String) -> Result<String> {
    if value.trim().is_empty() {
        return Err(Error::Contract(format!("{field} must be a non-empty string")));
    }
    Ok(value)
}

/// Stable machine-readable codes for non-fatal conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticCode {
    StaleDrop,
    CursorStateLoadError,
    CursorStateSaveError,
    AllowlistDrop,
    MemoryLookupError,
}

impl DiagnosticCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaleDrop => "stale-drop",
            Self::CursorStateLoadError => "cursor-state-load-error",
            Self::CursorStateSaveError => "cursor-state-save-error",
            Self::AllowlistDrop => "allowlist-drop",
            Self::MemoryLookupError => "memory-lookup-error",
        }
    }

    /// Drops are expected filtering outcomes, not failures.
    pub fn is_drop(self) -> bool {
        matches!(self, Self::StaleDrop | Self::AllowlistDrop)
    }
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal condition recorded by an adapter or handler and drained by the runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

impl Diagnostic {
    pub fn new(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            update_id: None,
            chat_id: None,
        }
    }

    pub fn for_update(mut self, update_id: impl ToString) -> Self {
        self.update_id = Some(update_id.to_string());
        self
    }

    pub fn for_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }
}
