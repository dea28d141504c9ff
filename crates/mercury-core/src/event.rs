use serde::{Deserialize, Serialize};

use crate::types::{ChatId, ContentItem};

/// A message sent by the user through the messenger frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub username: String,
    pub text: String,
    /// Media attached to the message (photos, documents, …).
    #[serde(default)]
    pub attachments: Vec<ContentItem>,
}

impl IncomingMessage {
    pub fn text_only(username: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

/// Kind of a single inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A regular user message.
    Message(IncomingMessage),
    /// A slash command, e.g. `/reset`.
    Command { name: String, username: String },
    /// An inline-button click carrying its action identifier.
    Action { action: String },
    /// The chat's cached state reached its TTL.
    Expire,
    /// Desktop capture hotkey: grab a screenshot and describe it.
    HotkeyC,
    /// Desktop paste hotkey: grab a screenshot and answer from it.
    HotkeyV,
}

/// One inbound event, routed and ordered per chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub chat_id: ChatId,
    /// Producer-assigned sequence number; events within a batch are
    /// processed in ascending order.
    pub order_id: u64,
    pub kind: EventKind,
}

impl ChatEvent {
    pub fn new(chat_id: impl Into<ChatId>, order_id: u64, kind: EventKind) -> Self {
        Self {
            chat_id: chat_id.into(),
            order_id,
            kind,
        }
    }

    /// Username carried by this event, if any.
    pub fn username(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Message(m) => Some(&m.username),
            EventKind::Command { username, .. } => Some(username),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_extraction() {
        let msg = ChatEvent::new("1", 0, EventKind::Message(IncomingMessage::text_only("alice", "hi")));
        assert_eq!(msg.username(), Some("alice"));

        let cmd = ChatEvent::new(
            "1",
            1,
            EventKind::Command {
                name: "reset".into(),
                username: "bob".into(),
            },
        );
        assert_eq!(cmd.username(), Some("bob"));

        let expire = ChatEvent::new("1", 2, EventKind::Expire);
        assert_eq!(expire.username(), None);
    }
}
