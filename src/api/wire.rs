//! JSON shapes exchanged with the chat-history and workflow endpoints.
//!
//! Inbound types are deliberately lenient: the service has changed field
//! names over time (`type` vs `role`, `bot` vs `assistant`, `created_at` vs
//! `timestamp`) and a single odd message must not sink a whole list.

use crate::types::{
    Citation, Conversation, Feedback, FeedbackKind, FileInfo, Message, Role, format_timestamp,
    parse_timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

// ============================================
// Inbound
// ============================================

#[derive(Clone, Debug, Deserialize)]
pub struct ConversationSummary {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl ConversationSummary {
    pub fn created_at(&self) -> Option<OffsetDateTime> {
        self.created_at.as_deref().and_then(parse_timestamp)
    }

    /// Falls back to the creation time when the service omits `updated_at`.
    pub fn updated_at(&self) -> Option<OffsetDateTime> {
        self.updated_at
            .as_deref()
            .and_then(parse_timestamp)
            .or_else(|| self.created_at())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RemoteMessage {
    #[serde(default, deserialize_with = "optional_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub citations: Option<Value>,
    #[serde(default)]
    pub feedback: Option<Value>,
    #[serde(default)]
    pub file_info: Option<Value>,
}

impl RemoteMessage {
    pub fn role(&self) -> Option<Role> {
        self.role
            .as_deref()
            .or(self.kind.as_deref())
            .and_then(parse_role)
    }

    /// Converts to the domain message. Messages with an unknown role are
    /// dropped; a missing timestamp takes `fallback`.
    pub fn into_message(self, fallback: OffsetDateTime) -> Option<Message> {
        let Some(role) = self.role() else {
            tracing::warn!(role = ?self.role, kind = ?self.kind, "dropping message with unknown role");
            return None;
        };
        let timestamp = self
            .timestamp
            .as_deref()
            .or(self.created_at.as_deref())
            .and_then(parse_timestamp)
            .unwrap_or(fallback);

        let mut message = Message::new(role, self.content.unwrap_or_default(), timestamp);
        if let Some(id) = self.id {
            message.id = id;
        }
        message.thinking = self.thinking.unwrap_or_default();
        message.citations = self.citations.map(parse_citations).unwrap_or_default();
        message.feedback = self.feedback.as_ref().and_then(Feedback::from_value);
        message.file_info = self
            .file_info
            .and_then(|value| serde_json::from_value::<FileInfo>(value).ok());
        Some(message)
    }
}

pub fn parse_role(raw: &str) -> Option<Role> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "user" | "human" => Some(Role::User),
        "assistant" | "bot" | "ai" => Some(Role::Assistant),
        "system" => Some(Role::System),
        _ => None,
    }
}

/// Citations arrive as an array of loosely shaped objects; entries that are
/// not objects are skipped.
pub fn parse_citations(value: Value) -> Vec<Citation> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<Citation>(item).ok())
            .collect(),
        _ => Vec::new(),
    }
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(id) => Ok(id),
        Value::Number(id) => Ok(id.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(id)) => Some(id),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    })
}

/// Id echoed by `POST /conversations`. Older deployments wrap it in `data`.
pub(crate) fn saved_id(reply: &Value) -> Option<String> {
    let id = reply
        .get("id")
        .filter(|id| !id.is_null())
        .or_else(|| reply.get("data").and_then(|data| data.get("id")))?;
    match id {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

// ============================================
// Outbound
// ============================================

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutgoingMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub thinking: String,
    pub citations: Vec<Citation>,
    pub feedback: Option<Feedback>,
    pub file_info: Option<FileInfo>,
}

/// Full replacement payload for `POST /conversations`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RemoteConversation {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub messages: Vec<OutgoingMessage>,
}

impl RemoteConversation {
    /// Snapshot of a conversation as the service stores it. System messages
    /// and unfinished placeholders are not part of the remote record.
    pub fn from_conversation(conversation: &Conversation) -> Self {
        let id = conversation
            .server_id
            .clone()
            .unwrap_or_else(|| conversation.id.clone());
        let messages = conversation
            .messages
            .iter()
            .filter(|msg| msg.role != Role::System && !msg.loading)
            .map(|msg| OutgoingMessage {
                id: msg.id.clone(),
                conversation_id: id.clone(),
                role: msg.role,
                content: msg.content.clone(),
                timestamp: format_timestamp(msg.timestamp),
                thinking: msg.thinking.clone(),
                citations: msg.citations.clone(),
                feedback: msg.feedback.clone(),
                file_info: msg.file_info.clone(),
            })
            .collect();
        Self {
            id,
            title: conversation.title.clone(),
            created_at: format_timestamp(conversation.created_at),
            updated_at: format_timestamp(conversation.updated_at),
            messages,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MessageFeedback {
    pub message_id: String,
    pub feedback_type: &'static str,
    pub comment: String,
}

impl MessageFeedback {
    pub fn new(message_id: &str, kind: FeedbackKind, comment: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            feedback_type: kind.as_str(),
            comment: comment.to_string(),
        }
    }
}

/// Correction sent back to the knowledge base itself.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KnowledgeFeedback {
    pub question: String,
    pub answer: String,
    pub feedback_type: &'static str,
    pub correction: String,
    pub kb_name: String,
    pub vector_store_type: &'static str,
}

impl KnowledgeFeedback {
    pub fn new(
        question: impl Into<String>,
        answer: impl Into<String>,
        correct: bool,
        correction: impl Into<String>,
        kb_name: impl Into<String>,
    ) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            feedback_type: if correct { "correct" } else { "incorrect" },
            correction: correction.into(),
            kb_name: kb_name.into(),
            vector_store_type: "lancedb",
        }
    }
}
