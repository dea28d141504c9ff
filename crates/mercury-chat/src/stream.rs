//! The streaming pipeline.
//!
//! Reads deltas from a live AI stream, throttles messenger edits, splits
//! segments at the messenger's length limit, attaches final structured
//! content, and recovers from cancellation or transport failure. All
//! lengths are counted in characters, never bytes.

use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mercury_agent::agent::{AgentError, ResponseStream};
use mercury_core::types::{ActionButton, ContentItem, MediaData, MessageId};
use mercury_messenger::messenger::Messenger;

use crate::chat::{Chat, PLACEHOLDER_TEXT};
use crate::machine::Trigger;
use crate::ui::split_text_by_length;

/// An in-progress edit is pushed to the messenger every this many streamed
/// characters.
pub(crate) const MESSAGE_UPDATE_STEP_CHARS: usize = 168;

/// Everything the streaming state carries from initiate into streaming.
pub struct StreamingContext {
    pub model_id: MessageId,
    pub stream: Box<dyn ResponseStream>,
    pub cancel: CancellationToken,
}

impl fmt::Debug for StreamingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingContext")
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

/// Drive one streaming response to completion. Returns the internal trigger
/// the state machine consumes next.
pub(crate) async fn run(chat: &Chat, ctx: StreamingContext) -> Trigger {
    let StreamingContext { model_id, mut stream, cancel } = ctx;

    let max_len = chat.messenger().max_text_len();
    let mut cur_idx: usize = chat
        .load_state()
        .ui
        .segments_of(&model_id)
        .len()
        .saturating_sub(1);

    // Characters buffered for the current segment.
    let mut content = String::new();
    let mut content_chars: usize = 0;
    // Total text accumulated for the model message.
    let mut full = String::new();
    let mut chars_since_update: usize = 0;
    let mut has_overflowed = false;

    loop {
        if cancel.is_cancelled() {
            return cleanup_after_cancel(chat, &model_id, &full).await;
        }
        let delta = match stream.next_delta().await {
            Ok(Some(delta)) => delta,
            Ok(None) => break,
            Err(AgentError::Cancelled) => {
                return cleanup_after_cancel(chat, &model_id, &full).await;
            }
            Err(e) => {
                warn!(chat = %chat.chat_id(), error = %e, "AI stream failed");
                return cleanup_after_error(chat, &model_id, &full).await;
            }
        };
        if delta.is_empty() {
            continue;
        }

        let delta_chars = delta.chars().count();
        content.push_str(&delta);
        full.push_str(&delta);
        content_chars += delta_chars;
        chars_since_update += delta_chars;

        // Overflow: fill the current segment to the brim, push the tail into
        // a fresh builder, open the next segment.
        while content_chars >= max_len {
            let head: String = content.chars().take(max_len).collect();
            let tail: String = content.chars().skip(max_len).collect();

            let mut state = chat.load_state();
            if let Err(e) = chat
                .edit_segment(&mut state, &model_id, cur_idx, Some(&head), None)
                .await
            {
                warn!(chat = %chat.chat_id(), error = %e, "overflow edit failed");
                chat.save_state(state);
                return cleanup_after_error(chat, &model_id, &full).await;
            }
            let next_idx = state.ui.create_next_segment(&model_id).segment_index;
            chat.save_state(state);

            let buttons = vec![ActionButton::stop()];
            match chat
                .messenger()
                .send_text(chat.chat_id(), PLACEHOLDER_TEXT, Some(&buttons))
                .await
            {
                Ok(mid) => {
                    let mut state = chat.load_state();
                    state.ui.mark_as_sent(&model_id, next_idx, mid);
                    state.ui.set_active_buttons(&model_id, next_idx, buttons);
                    chat.save_state(state);
                }
                Err(e) => {
                    warn!(chat = %chat.chat_id(), error = %e, "failed to open next segment");
                    return cleanup_after_error(chat, &model_id, &full).await;
                }
            }

            cur_idx = next_idx;
            content = tail;
            content_chars -= max_len;
            chars_since_update = 0;
            has_overflowed = true;
        }

        // Throttled in-progress edit with a single Stop button.
        if chars_since_update >= MESSAGE_UPDATE_STEP_CHARS && content_chars > 0 {
            let buttons = vec![ActionButton::stop()];
            let mut state = chat.load_state();
            state.ui.set_active_buttons(&model_id, cur_idx, buttons.clone());
            if let Err(e) = chat
                .edit_segment(&mut state, &model_id, cur_idx, Some(&content), Some(&buttons))
                .await
            {
                warn!(chat = %chat.chat_id(), error = %e, "streaming edit failed");
                chat.save_state(state);
                return cleanup_after_error(chat, &model_id, &full).await;
            }
            chat.save_state(state);
            chars_since_update = 0;
        }
    }

    debug!(chat = %chat.chat_id(), chars = full.chars().count(), overflowed = has_overflowed,
           "delta sequence finished");
    finalize(chat, &model_id, content, full, stream.as_mut(), max_len, cur_idx).await
}

/// The post-stream phase: attach structured content, settle the final
/// segment texts, attach media, guard-split, hand out recovery buttons.
async fn finalize(
    chat: &Chat,
    model_id: &MessageId,
    content: String,
    full: String,
    stream: &mut dyn ResponseStream,
    max_len: usize,
    cur_idx: usize,
) -> Trigger {
    let structured = stream.structured_content();
    let has_structured = structured.as_ref().is_some_and(|v| !v.is_empty());

    if full.is_empty() && !has_structured {
        warn!(chat = %chat.chat_id(), "AI stream produced no content");
        return cleanup_after_error(chat, model_id, &full).await;
    }

    let _ = chat.take_pending_continue();

    let mut state = chat.load_state();
    let mut to_delete = Vec::new();

    // Structured content replaces the model message's content wholesale;
    // otherwise the accumulated text becomes its one text item.
    if let Some(msg) = state.history.find_message_mut(model_id) {
        msg.content = match &structured {
            Some(items) if has_structured => items.clone(),
            _ => vec![ContentItem::text(full.clone())],
        };
    }

    let media_items: Vec<MediaData> = structured
        .iter()
        .flatten()
        .filter_map(|item| match item {
            ContentItem::Image { media }
            | ContentItem::Audio { media }
            | ContentItem::Video { media }
            | ContentItem::Document { media } => Some(media.clone()),
            _ => None,
        })
        .collect();

    // Settle the current segment's final text. An empty trailing placeholder
    // is deleted rather than edited.
    if content.is_empty() {
        if let Some(seg) = state.ui.remove_last_ui_message(model_id) {
            if seg.is_sent && !seg.is_deleted {
                if let Some(mid) = seg.messenger_message_id {
                    to_delete.push(mid);
                }
            }
        }
    } else if let Err(e) = chat
        .edit_segment(&mut state, model_id, cur_idx, Some(&content), None)
        .await
    {
        warn!(chat = %chat.chat_id(), error = %e, "final segment edit failed");
        chat.save_state(state);
        flush_deletes(chat, to_delete).await;
        return cleanup_after_error(chat, model_id, &full).await;
    }

    // One new segment per media item.
    for media in media_items {
        let next_idx = {
            let seg = state.ui.create_next_segment(model_id);
            seg.media_content = Some(media.clone());
            seg.segment_index
        };
        match chat.messenger().send_photo(chat.chat_id(), &media, "", None).await {
            Ok(mid) => state.ui.mark_as_sent(model_id, next_idx, mid),
            Err(e) => {
                warn!(chat = %chat.chat_id(), error = %e, "failed to send media segment");
                chat.save_state(state);
                flush_deletes(chat, to_delete).await;
                return cleanup_after_error(chat, model_id, &full).await;
            }
        }
    }

    // Guard: nothing should exceed its limit at this point, but split
    // anything that still does. Photo captions have their own, shorter cap.
    let photo_max = chat.messenger().max_photo_caption_len();
    let seg_count = state.ui.segments_of(model_id).len();
    for idx in 0..seg_count {
        let (text, limit) = match state.ui.segment(model_id, idx) {
            Some(seg) => {
                let limit = if seg.media_content.is_some() { photo_max } else { max_len };
                if seg.text_content.chars().count() <= limit {
                    continue;
                }
                (seg.text_content.clone(), limit)
            }
            None => continue,
        };
        warn!(chat = %chat.chat_id(), idx, "segment over limit after streaming, splitting");
        let chunks = split_text_by_length(&text, limit);
        let _ = chat
            .edit_segment(&mut state, model_id, idx, Some(&chunks[0]), None)
            .await;
        for chunk in &chunks[1..] {
            let next_idx = {
                let seg = state.ui.create_next_segment(model_id);
                seg.text_content = chunk.clone();
                seg.segment_index
            };
            if let Ok(mid) = chat.messenger().send_text(chat.chat_id(), chunk, None).await {
                state.ui.mark_as_sent(model_id, next_idx, mid);
            }
        }
    }

    // Continue/Regenerate on the final segment; this also clears active
    // buttons from any earlier segment.
    let last_index = state.ui.last_segment(model_id).map(|s| s.segment_index);
    if let Some(index) = last_index {
        let buttons = vec![ActionButton::continue_response(), ActionButton::regenerate()];
        state.ui.set_active_buttons(model_id, index, buttons.clone());
        if let Err(e) = chat
            .edit_segment(&mut state, model_id, index, None, Some(&buttons))
            .await
        {
            warn!(chat = %chat.chat_id(), error = %e, "failed to set final buttons");
        }
    }

    chat.save_state(state);
    flush_deletes(chat, to_delete).await;
    Trigger::AiResponseFinished
}

async fn cleanup_after_cancel(chat: &Chat, model_id: &MessageId, full: &str) -> Trigger {
    cleanup(chat, model_id, full, true).await;
    Trigger::UserStop
}

async fn cleanup_after_error(chat: &Chat, model_id: &MessageId, full: &str) -> Trigger {
    cleanup(chat, model_id, full, false).await;
    Trigger::AiResponseError
}

/// Shared cancel/error recovery. Already-produced text is preserved; only
/// blank placeholders are removed. After a cancel, Continue/Regenerate land
/// on the new last segment; the error state appends its own notice instead.
async fn cleanup(chat: &Chat, model_id: &MessageId, full: &str, restore_buttons: bool) {
    let pending_continue = chat.take_pending_continue();
    let mut state = chat.load_state();
    let mut to_delete = Vec::new();

    if full.is_empty() {
        // Nothing was produced: drop the whole placeholder reply, and the
        // synthetic continue prompt that asked for it.
        state.history.remove_message_from_last_turn(model_id);
        for seg in state.ui.remove_ui_messages(model_id) {
            if seg.is_sent && !seg.is_deleted {
                if let Some(mid) = seg.messenger_message_id {
                    to_delete.push(mid);
                }
            }
        }
        if let Some(continue_id) = pending_continue {
            state.history.remove_message_from_last_turn(&continue_id);
        }
    } else {
        if let Some(msg) = state.history.find_message_mut(model_id) {
            msg.content = vec![ContentItem::text(full.to_string())];
        }
        while state.ui.last_segment(model_id).is_some_and(|s| s.is_blank()) {
            if let Some(seg) = state.ui.remove_last_ui_message(model_id) {
                if seg.is_sent && !seg.is_deleted {
                    if let Some(mid) = seg.messenger_message_id {
                        to_delete.push(mid);
                    }
                }
            }
        }
    }

    if restore_buttons {
        let last_index = state.ui.last_segment(model_id).map(|s| s.segment_index);
        match last_index {
            Some(index) => {
                let buttons =
                    vec![ActionButton::continue_response(), ActionButton::regenerate()];
                state.ui.set_active_buttons(model_id, index, buttons.clone());
                if let Err(e) = chat
                    .edit_segment(&mut state, model_id, index, None, Some(&buttons))
                    .await
                {
                    warn!(chat = %chat.chat_id(), error = %e, "failed to set recovery buttons");
                }
            }
            None => chat.restore_recovery_buttons(&mut state).await,
        }
    }

    chat.save_state(state);
    flush_deletes(chat, to_delete).await;
}

async fn flush_deletes(chat: &Chat, ids: Vec<mercury_core::types::MessengerMessageId>) {
    for mid in ids {
        if let Err(e) = chat.messenger().delete_message(chat.chat_id(), mid).await {
            warn!(chat = %chat.chat_id(), error = %e, "failed to delete segment");
        }
    }
}
