use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};

pub const WELCOME_MESSAGE_ID: &str = "system-welcome";

const TITLE_MAX_CHARS: usize = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "bot")]
    Assistant,
    System,
}

/// A single source reference attached to an answer.
///
/// The service sends citations as loosely shaped objects; the fields we render
/// are pulled out and everything else is kept verbatim so a round trip through
/// the cache or the remote store loses nothing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedbackKind {
    Like,
    Dislike,
}

impl FeedbackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackKind::Like => "like",
            FeedbackKind::Dislike => "dislike",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Feedback {
    Like,
    Dislike { reason: String },
}

impl Feedback {
    pub fn kind(&self) -> FeedbackKind {
        match self {
            Feedback::Like => FeedbackKind::Like,
            Feedback::Dislike { .. } => FeedbackKind::Dislike,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Feedback::Like => None,
            Feedback::Dislike { reason } => Some(reason),
        }
    }

    /// Accepts both the tagged object form and the bare `"like"` / `"dislike"`
    /// strings older clients stored.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(kind) => match kind.as_str() {
                "like" => Some(Feedback::Like),
                "dislike" => Some(Feedback::Dislike {
                    reason: String::new(),
                }),
                _ => None,
            },
            serde_json::Value::Object(_) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thinking: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_info: Option<FileInfo>,
    #[serde(default)]
    pub loading: bool,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, timestamp: OffsetDateTime) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp,
            thinking: String::new(),
            citations: Vec::new(),
            feedback: None,
            file_info: None,
            loading: false,
        }
    }

    pub fn welcome(text: &str) -> Self {
        Self {
            id: WELCOME_MESSAGE_ID.to_string(),
            role: Role::System,
            content: text.to_string(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            thinking: String::new(),
            citations: Vec::new(),
            feedback: None,
            file_info: None,
            loading: false,
        }
    }

    pub fn notice(content: impl Into<String>) -> Self {
        Self::new(Role::System, content, OffsetDateTime::now_utc())
    }

    pub fn is_pending(&self) -> bool {
        self.role == Role::Assistant && self.loading
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub revision: u64,
    /// Whether the server's messages have been merged in. Conversations
    /// created on this device start loaded.
    #[serde(default)]
    pub history_loaded: bool,
}

impl Conversation {
    pub fn new_local(first_message: &str, now: OffsetDateTime) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            server_id: None,
            title: derive_title(first_message),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            synced: false,
            revision: 0,
            history_loaded: true,
        }
    }

    /// Marks a local mutation: bumps the revision, refreshes recency and
    /// flags the conversation as needing a push.
    pub fn touch(&mut self, now: OffsetDateTime) {
        self.updated_at = now;
        self.mark_dirty();
    }

    /// Flags a change that must reach the server without affecting recency.
    pub fn mark_dirty(&mut self) {
        self.revision += 1;
        self.synced = false;
    }

    pub fn find_message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|msg| msg.id == message_id)
    }

    /// A server-backed conversation whose remote messages are not known
    /// locally. Pushing it would replace the server's history.
    pub fn needs_history(&self) -> bool {
        self.server_id.is_some() && !self.history_loaded
    }

    pub fn has_pending_answer(&self) -> bool {
        self.messages.iter().any(Message::is_pending)
    }

    pub fn last_timestamp(&self) -> Option<OffsetDateTime> {
        self.messages.last().map(|msg| msg.timestamp)
    }
}

pub fn derive_title(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        let head: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{head}...")
    } else {
        trimmed.to_string()
    }
}

/// Returns a timestamp strictly after `previous`, so messages appended in the
/// same instant still sort in submission order.
pub fn next_timestamp(previous: Option<OffsetDateTime>) -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    match previous {
        Some(prev) if now <= prev => prev + Duration::milliseconds(1),
        _ => now,
    }
}

/// Parses server timestamps. RFC 3339 is preferred; naive ISO-8601 values
/// without an offset are read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(parsed);
    }
    let with_fraction =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
    let without_fraction = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    let spaced = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    [with_fraction, without_fraction, spaced]
        .iter()
        .find_map(|format| PrimitiveDateTime::parse(raw, format).ok())
        .map(PrimitiveDateTime::assume_utc)
}

pub fn format_timestamp(timestamp: OffsetDateTime) -> String {
    timestamp
        .format(&Rfc3339)
        .unwrap_or_else(|_| timestamp.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn title_is_truncated_on_char_boundary() {
        assert_eq!(derive_title("  short question "), "short question");
        let long = "知识库".repeat(20);
        let title = derive_title(&long);
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
    }

    #[test]
    fn next_timestamp_is_strictly_increasing() {
        let future = OffsetDateTime::now_utc() + Duration::hours(1);
        let next = next_timestamp(Some(future));
        assert!(next > future);
        assert!(next_timestamp(None) <= OffsetDateTime::now_utc());
    }

    #[test]
    fn parses_server_timestamp_shapes() {
        assert_eq!(
            parse_timestamp("2024-05-01T10:00:00Z"),
            Some(datetime!(2024-05-01 10:00:00 UTC))
        );
        assert_eq!(
            parse_timestamp("2024-05-01T10:00:00"),
            Some(datetime!(2024-05-01 10:00:00 UTC))
        );
        assert_eq!(
            parse_timestamp("2024-05-01T10:00:00.250"),
            Some(datetime!(2024-05-01 10:00:00.25 UTC))
        );
        assert_eq!(
            parse_timestamp("2024-05-01 10:00:00"),
            Some(datetime!(2024-05-01 10:00:00 UTC))
        );
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn feedback_accepts_legacy_strings() {
        assert_eq!(
            Feedback::from_value(&serde_json::json!("like")),
            Some(Feedback::Like)
        );
        assert_eq!(
            Feedback::from_value(&serde_json::json!({"type": "dislike", "reason": "wrong"})),
            Some(Feedback::Dislike {
                reason: "wrong".into()
            })
        );
        assert_eq!(Feedback::from_value(&serde_json::json!(3)), None);
    }

    #[test]
    fn role_accepts_legacy_bot_alias() {
        let role: Role = serde_json::from_str("\"bot\"").unwrap();
        assert_eq!(role, Role::Assistant);
    }
}
