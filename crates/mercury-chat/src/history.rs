//! Turn-structured conversation history.
//!
//! A turn begins with one or more user messages and may be followed by
//! assistant messages. Forced appends (system continuations such as
//! "please continue") land at the end of the last turn and are the one
//! sanctioned exception to the users-before-assistants ordering.

use serde::{Deserialize, Serialize};

use mercury_core::error::{MercuryError, Result};
use mercury_core::types::{ChatMessage, MessageId, MessengerMessageId, Role};

/// One contiguous block of user input followed by assistant output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub messages: Vec<ChatMessage>,
}

impl Turn {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Ordered sequence of turns for one chat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatHistory {
    turns: Vec<Turn>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Append user messages, either opening a new turn or (forced) extending
    /// the last one in place.
    pub fn add_user_messages(&mut self, messages: Vec<ChatMessage>, force_last_turn: bool) {
        if messages.is_empty() {
            return;
        }
        if force_last_turn {
            if let Some(last) = self.turns.last_mut() {
                last.messages.extend(messages);
                return;
            }
        }
        self.turns.push(Turn { messages });
    }

    /// Append an assistant message to the last turn.
    pub fn add_assistant_message(&mut self, msg: ChatMessage) -> Result<()> {
        match self.turns.last_mut() {
            Some(turn) => {
                turn.messages.push(msg);
                Ok(())
            }
            None => Err(MercuryError::InvalidState(
                "assistant message without a prior user turn".into(),
            )),
        }
    }

    /// Remove a message from the last turn by identity. Drops the turn if it
    /// becomes empty. Returns whether anything was removed.
    pub fn remove_message_from_last_turn(&mut self, id: &MessageId) -> bool {
        let Some(turn) = self.turns.last_mut() else {
            return false;
        };
        let before = turn.messages.len();
        turn.messages.retain(|m| &m.id != id);
        let removed = turn.messages.len() != before;
        if turn.is_empty() {
            self.turns.pop();
        }
        removed
    }

    /// Remove every assistant message from the last turn, in original order.
    pub fn remove_assistant_messages_from_last_turn(&mut self) -> Vec<ChatMessage> {
        let Some(turn) = self.turns.last_mut() else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        turn.messages.retain(|m| {
            if m.role == Role::Assistant {
                removed.push(m.clone());
                false
            } else {
                true
            }
        });
        if turn.is_empty() {
            self.turns.pop();
        }
        removed
    }

    /// Most recent assistant message of the last turn.
    pub fn last_assistant_message(&self) -> Option<&ChatMessage> {
        self.turns
            .last()?
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
    }

    /// Flat read-only snapshot in turn order, then in-turn order. No hidden
    /// trimming; the AI call sees everything.
    pub fn messages_for_ai(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .flat_map(|t| t.messages.iter().cloned())
            .collect()
    }

    pub fn find_message(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.turns
            .iter()
            .flat_map(|t| t.messages.iter())
            .find(|m| &m.id == id)
    }

    pub fn find_message_mut(&mut self, id: &MessageId) -> Option<&mut ChatMessage> {
        self.turns
            .iter_mut()
            .flat_map(|t| t.messages.iter_mut())
            .find(|m| &m.id == id)
    }

    /// Record the messenger-side id of the owning model message.
    pub fn set_original_messenger_id(&mut self, id: &MessageId, mid: MessengerMessageId) -> bool {
        match self.find_message_mut(id) {
            Some(m) => {
                m.original_messenger_id = Some(mid);
                true
            }
            None => false,
        }
    }

    /// Total number of messages across all turns.
    pub fn message_count(&self) -> usize {
        self.turns.iter().map(|t| t.messages.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mercury_core::types::ContentItem;

    fn user(text: &str) -> ChatMessage {
        ChatMessage::user("alice", text)
    }

    fn assistant(text: &str) -> ChatMessage {
        ChatMessage::new(Role::Assistant, "bot", vec![ContentItem::text(text)])
    }

    #[test]
    fn user_messages_open_new_turns() {
        let mut h = ChatHistory::new();
        h.add_user_messages(vec![user("a")], false);
        h.add_user_messages(vec![user("b")], false);
        assert_eq!(h.turns().len(), 2);
    }

    #[test]
    fn forced_append_extends_last_turn() {
        let mut h = ChatHistory::new();
        h.add_user_messages(vec![user("a")], false);
        h.add_assistant_message(assistant("x")).unwrap();
        h.add_user_messages(vec![user("please continue")], true);
        assert_eq!(h.turns().len(), 1);
        assert_eq!(h.turns()[0].messages.len(), 3);
    }

    #[test]
    fn forced_append_without_turn_opens_one() {
        let mut h = ChatHistory::new();
        h.add_user_messages(vec![user("a")], true);
        assert_eq!(h.turns().len(), 1);
    }

    #[test]
    fn assistant_without_turn_is_invalid_state() {
        let mut h = ChatHistory::new();
        assert!(matches!(
            h.add_assistant_message(assistant("x")),
            Err(MercuryError::InvalidState(_))
        ));
    }

    #[test]
    fn remove_by_identity_drops_empty_turn() {
        let mut h = ChatHistory::new();
        let msg = user("only");
        let id = msg.id.clone();
        h.add_user_messages(vec![msg], false);
        assert!(h.remove_message_from_last_turn(&id));
        assert!(h.is_empty());
        assert!(!h.remove_message_from_last_turn(&id));
    }

    #[test]
    fn remove_assistants_preserves_users_and_order() {
        let mut h = ChatHistory::new();
        h.add_user_messages(vec![user("q")], false);
        let a1 = assistant("first");
        let a2 = assistant("second");
        let (id1, id2) = (a1.id.clone(), a2.id.clone());
        h.add_assistant_message(a1).unwrap();
        h.add_assistant_message(a2).unwrap();

        let removed = h.remove_assistant_messages_from_last_turn();
        assert_eq!(removed.iter().map(|m| &m.id).collect::<Vec<_>>(), vec![&id1, &id2]);
        assert_eq!(h.turns()[0].messages.len(), 1);
    }

    #[test]
    fn last_assistant_scans_backwards() {
        let mut h = ChatHistory::new();
        h.add_user_messages(vec![user("q")], false);
        h.add_assistant_message(assistant("old")).unwrap();
        h.add_assistant_message(assistant("new")).unwrap();
        assert_eq!(h.last_assistant_message().unwrap().text(), "new");
    }

    #[test]
    fn snapshot_is_flat_and_ordered() {
        let mut h = ChatHistory::new();
        h.add_user_messages(vec![user("q1")], false);
        h.add_assistant_message(assistant("a1")).unwrap();
        h.add_user_messages(vec![user("q2")], false);

        let snap = h.messages_for_ai();
        let texts: Vec<String> = snap.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["q1", "a1", "q2"]);
    }

    #[test]
    fn messenger_id_lands_on_owner() {
        let mut h = ChatHistory::new();
        let msg = user("q");
        let id = msg.id.clone();
        h.add_user_messages(vec![msg], false);
        assert!(h.set_original_messenger_id(&id, MessengerMessageId(7)));
        assert_eq!(
            h.find_message(&id).unwrap().original_messenger_id,
            Some(MessengerMessageId(7))
        );
    }
}
