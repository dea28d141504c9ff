use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store key under which this chat's state lives.
    pub fn state_key(&self) -> String {
        format!("{}_state", self.0)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChatId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Locally unique identifier for a model message (UUIDv7, time-sortable
/// for easier log correlation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier the messenger assigns to a visible message once it is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessengerMessageId(pub i64);

impl fmt::Display for MessengerMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Author role of a model message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// Media payload: either inline base64 bytes or a remote URL the messenger
/// can fetch lazily.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaData {
    Inline { data: String, mime: String },
    Remote { url: String, mime: String },
}

impl MediaData {
    /// Wrap raw bytes as an inline base64 payload.
    pub fn inline_from_bytes(bytes: &[u8], mime: impl Into<String>) -> Self {
        Self::Inline {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            mime: mime.into(),
        }
    }

    pub fn mime(&self) -> &str {
        match self {
            Self::Inline { mime, .. } | Self::Remote { mime, .. } => mime,
        }
    }
}

/// One item of a model message's ordered content sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text { text: String },
    Image { media: MediaData },
    Audio { media: MediaData },
    Video { media: MediaData },
    Document { media: MediaData },
    Json { value: serde_json::Value },
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A single message in the conversation model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    /// Display name of the author.
    pub name: String,
    pub content: Vec<ContentItem>,
    pub created_at: DateTime<Utc>,
    /// Messenger-side id of the first visible segment, set once confirmed sent.
    pub original_messenger_id: Option<MessengerMessageId>,
}

impl ChatMessage {
    pub fn new(role: Role, name: impl Into<String>, content: Vec<ContentItem>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            name: name.into(),
            content,
            created_at: Utc::now(),
            original_messenger_id: None,
        }
    }

    pub fn user(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Role::User, name, vec![ContentItem::text(text)])
    }

    pub fn assistant(name: impl Into<String>) -> Self {
        Self::new(Role::Assistant, name, Vec::new())
    }

    /// Concatenation of all text items, in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentItem::as_text)
            .collect()
    }
}

/// An inline action control attached to a visible message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionButton {
    /// Action identifier delivered back as a button-click event.
    pub action: String,
    /// Label shown to the user.
    pub label: String,
}

impl ActionButton {
    pub fn new(action: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            label: label.into(),
        }
    }

    pub fn cancel() -> Self {
        Self::new(actions::CANCEL, "Cancel")
    }

    pub fn stop() -> Self {
        Self::new(actions::STOP, "Stop")
    }

    pub fn continue_response() -> Self {
        Self::new(actions::CONTINUE, "Continue")
    }

    pub fn regenerate() -> Self {
        Self::new(actions::REGENERATE, "Regenerate")
    }

    pub fn retry() -> Self {
        Self::new(actions::RETRY, "Retry")
    }
}

/// Well-known action identifiers understood by the action processor.
pub mod actions {
    pub const CANCEL: &str = "cancel";
    pub const STOP: &str = "stop";
    pub const CONTINUE: &str = "continue";
    pub const REGENERATE: &str = "regenerate";
    pub const RETRY: &str = "retry";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_key_format() {
        let id = ChatId::from("42");
        assert_eq!(id.state_key(), "42_state");
    }

    #[test]
    fn message_text_concatenates_text_items_only() {
        let msg = ChatMessage::new(
            Role::Assistant,
            "bot",
            vec![
                ContentItem::text("Hello, "),
                ContentItem::Image {
                    media: MediaData::Remote {
                        url: "https://example.com/x.png".into(),
                        mime: "image/png".into(),
                    },
                },
                ContentItem::text("world"),
            ],
        );
        assert_eq!(msg.text(), "Hello, world");
    }

    #[test]
    fn message_ids_are_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
    }

    #[test]
    fn inline_media_is_base64() {
        let media = MediaData::inline_from_bytes(b"png-bytes", "image/png");
        match media {
            MediaData::Inline { data, mime } => {
                assert_eq!(mime, "image/png");
                assert_eq!(data, "cG5nLWJ5dGVz");
            }
            _ => panic!("expected inline media"),
        }
    }
}
