//! The contract the core speaks to the messaging frontend.
//!
//! Implementations wrap a concrete transport (Telegram, a test double, …)
//! and must be concurrency-safe: one shared adapter serves every chat.

use async_trait::async_trait;

use mercury_core::types::{ActionButton, ChatId, MediaData, MessengerMessageId};

use crate::error::Result;

/// Outcome of an edit. Three-valued so the common "user deleted the
/// message" case never surfaces as an error and is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Success,
    /// The new content equals the current content. Treated as success.
    NotModified,
    /// The target message no longer exists. The owning UI segment must be
    /// marked deleted; the edit must not be retried.
    MessageDeleted,
}

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a text message; returns the messenger-assigned id.
    async fn send_text(
        &self,
        chat_id: &ChatId,
        text: &str,
        buttons: Option<&[ActionButton]>,
    ) -> Result<MessengerMessageId>;

    /// Send a photo with a caption; returns the messenger-assigned id.
    async fn send_photo(
        &self,
        chat_id: &ChatId,
        media: &MediaData,
        caption: &str,
        buttons: Option<&[ActionButton]>,
    ) -> Result<MessengerMessageId>;

    async fn edit_text(
        &self,
        chat_id: &ChatId,
        message_id: MessengerMessageId,
        text: &str,
        buttons: Option<&[ActionButton]>,
    ) -> Result<EditOutcome>;

    async fn edit_photo(
        &self,
        chat_id: &ChatId,
        message_id: MessengerMessageId,
        caption: &str,
        buttons: Option<&[ActionButton]>,
    ) -> Result<EditOutcome>;

    /// Returns whether a message was actually deleted.
    async fn delete_message(&self, chat_id: &ChatId, message_id: MessengerMessageId) -> Result<bool>;

    /// Maximum characters per text message. Pure constant, used for splitting.
    fn max_text_len(&self) -> usize;

    /// Maximum characters per photo caption. Pure constant.
    fn max_photo_caption_len(&self) -> usize;
}
