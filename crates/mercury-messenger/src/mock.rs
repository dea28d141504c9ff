//! In-memory messenger double.
//!
//! Keeps a live model of every visible message (text, buttons, edit
//! history, deleted flag) so tests can assert on what a user would see,
//! and supports scripting edit outcomes and send failures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use mercury_core::types::{ActionButton, ChatId, MediaData, MessengerMessageId};

use crate::error::{MessengerError, Result};
use crate::messenger::{EditOutcome, Messenger};

/// What one visible messenger bubble currently shows.
#[derive(Debug, Clone, Default)]
pub struct VisibleMessage {
    pub text: String,
    pub buttons: Vec<ActionButton>,
    pub is_photo: bool,
    pub deleted: bool,
    /// Every text this message has displayed, sends and edits included.
    pub history: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    messages: BTreeMap<i64, VisibleMessage>,
    scripted_edit_outcomes: Vec<EditOutcome>,
    fail_next_sends: usize,
    send_count: usize,
    edit_count: usize,
    delete_count: usize,
}

pub struct MockMessenger {
    next_id: AtomicI64,
    inner: Mutex<Inner>,
    max_text_len: usize,
    max_photo_caption_len: usize,
}

impl Default for MockMessenger {
    fn default() -> Self {
        Self::new(4090, 1018)
    }
}

impl MockMessenger {
    pub fn new(max_text_len: usize, max_photo_caption_len: usize) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            inner: Mutex::new(Inner::default()),
            max_text_len,
            max_photo_caption_len,
        }
    }

    /// Queue an outcome for the next edit (FIFO). Unscripted edits succeed.
    pub fn script_edit_outcome(&self, outcome: EditOutcome) {
        self.inner.lock().unwrap().scripted_edit_outcomes.push(outcome);
    }

    /// Make the next `n` sends fail with a transport error.
    pub fn fail_next_sends(&self, n: usize) {
        self.inner.lock().unwrap().fail_next_sends = n;
    }

    pub fn message(&self, id: MessengerMessageId) -> Option<VisibleMessage> {
        self.inner.lock().unwrap().messages.get(&id.0).cloned()
    }

    /// All live (not deleted) messages in send order.
    pub fn visible_messages(&self) -> Vec<(MessengerMessageId, VisibleMessage)> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|(_, m)| !m.deleted)
            .map(|(id, m)| (MessengerMessageId(*id), m.clone()))
            .collect()
    }

    /// Concatenated visible text, in send order.
    pub fn visible_text(&self) -> String {
        self.visible_messages()
            .iter()
            .map(|(_, m)| m.text.as_str())
            .collect()
    }

    /// Ids of messages currently carrying inline buttons.
    pub fn messages_with_buttons(&self) -> Vec<MessengerMessageId> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|(_, m)| !m.deleted && !m.buttons.is_empty())
            .map(|(id, _)| MessengerMessageId(*id))
            .collect()
    }

    pub fn send_count(&self) -> usize {
        self.inner.lock().unwrap().send_count
    }

    pub fn edit_count(&self) -> usize {
        self.inner.lock().unwrap().edit_count
    }

    pub fn delete_count(&self) -> usize {
        self.inner.lock().unwrap().delete_count
    }

    fn do_send(
        &self,
        text: &str,
        buttons: Option<&[ActionButton]>,
        is_photo: bool,
    ) -> Result<MessengerMessageId> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next_sends > 0 {
            inner.fail_next_sends -= 1;
            return Err(MessengerError::Transport("scripted send failure".into()));
        }
        inner.send_count += 1;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        inner.messages.insert(
            id,
            VisibleMessage {
                text: text.to_string(),
                buttons: buttons.map(<[_]>::to_vec).unwrap_or_default(),
                is_photo,
                deleted: false,
                history: vec![text.to_string()],
            },
        );
        Ok(MessengerMessageId(id))
    }

    fn do_edit(
        &self,
        message_id: MessengerMessageId,
        text: &str,
        buttons: Option<&[ActionButton]>,
    ) -> Result<EditOutcome> {
        let mut inner = self.inner.lock().unwrap();
        inner.edit_count += 1;
        if !inner.scripted_edit_outcomes.is_empty() {
            let outcome = inner.scripted_edit_outcomes.remove(0);
            if outcome == EditOutcome::MessageDeleted {
                if let Some(m) = inner.messages.get_mut(&message_id.0) {
                    m.deleted = true;
                }
            }
            return Ok(outcome);
        }
        match inner.messages.get_mut(&message_id.0) {
            None => Ok(EditOutcome::MessageDeleted),
            Some(m) if m.deleted => Ok(EditOutcome::MessageDeleted),
            Some(m) => {
                let same_buttons = match buttons {
                    Some(b) => m.buttons == b,
                    None => m.buttons.is_empty(),
                };
                if m.text == text && same_buttons {
                    return Ok(EditOutcome::NotModified);
                }
                m.text = text.to_string();
                m.buttons = buttons.map(<[_]>::to_vec).unwrap_or_default();
                m.history.push(text.to_string());
                Ok(EditOutcome::Success)
            }
        }
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn send_text(
        &self,
        _chat_id: &ChatId,
        text: &str,
        buttons: Option<&[ActionButton]>,
    ) -> Result<MessengerMessageId> {
        self.do_send(text, buttons, false)
    }

    async fn send_photo(
        &self,
        _chat_id: &ChatId,
        _media: &MediaData,
        caption: &str,
        buttons: Option<&[ActionButton]>,
    ) -> Result<MessengerMessageId> {
        self.do_send(caption, buttons, true)
    }

    async fn edit_text(
        &self,
        _chat_id: &ChatId,
        message_id: MessengerMessageId,
        text: &str,
        buttons: Option<&[ActionButton]>,
    ) -> Result<EditOutcome> {
        self.do_edit(message_id, text, buttons)
    }

    async fn edit_photo(
        &self,
        _chat_id: &ChatId,
        message_id: MessengerMessageId,
        caption: &str,
        buttons: Option<&[ActionButton]>,
    ) -> Result<EditOutcome> {
        self.do_edit(message_id, caption, buttons)
    }

    async fn delete_message(
        &self,
        _chat_id: &ChatId,
        message_id: MessengerMessageId,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.delete_count += 1;
        match inner.messages.get_mut(&message_id.0) {
            Some(m) if !m.deleted => {
                m.deleted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn max_text_len(&self) -> usize {
        self.max_text_len
    }

    fn max_photo_caption_len(&self) -> usize {
        self.max_photo_caption_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> ChatId {
        ChatId::from("c1")
    }

    #[tokio::test]
    async fn send_edit_delete_lifecycle() {
        let m = MockMessenger::default();
        let id = m.send_text(&chat(), "hello", None).await.unwrap();
        assert_eq!(m.message(id).unwrap().text, "hello");

        let outcome = m.edit_text(&chat(), id, "hello world", None).await.unwrap();
        assert_eq!(outcome, EditOutcome::Success);
        assert_eq!(m.message(id).unwrap().history, vec!["hello", "hello world"]);

        assert!(m.delete_message(&chat(), id).await.unwrap());
        assert!(!m.delete_message(&chat(), id).await.unwrap());
        assert!(m.visible_messages().is_empty());
    }

    #[tokio::test]
    async fn identical_edit_is_not_modified() {
        let m = MockMessenger::default();
        let id = m.send_text(&chat(), "same", None).await.unwrap();
        let outcome = m.edit_text(&chat(), id, "same", None).await.unwrap();
        assert_eq!(outcome, EditOutcome::NotModified);
    }

    #[tokio::test]
    async fn edit_of_missing_message_reports_deleted() {
        let m = MockMessenger::default();
        let outcome = m
            .edit_text(&chat(), MessengerMessageId(999), "x", None)
            .await
            .unwrap();
        assert_eq!(outcome, EditOutcome::MessageDeleted);
    }

    #[tokio::test]
    async fn scripted_outcomes_and_failures() {
        let m = MockMessenger::default();
        let id = m.send_text(&chat(), "a", None).await.unwrap();

        m.script_edit_outcome(EditOutcome::MessageDeleted);
        let outcome = m.edit_text(&chat(), id, "b", None).await.unwrap();
        assert_eq!(outcome, EditOutcome::MessageDeleted);
        assert!(m.message(id).unwrap().deleted);

        m.fail_next_sends(1);
        assert!(m.send_text(&chat(), "c", None).await.is_err());
        assert!(m.send_text(&chat(), "d", None).await.is_ok());
    }
}
