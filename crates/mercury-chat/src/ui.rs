//! UI view model: the mapping from one model message to N visible
//! messenger segments, plus the single active-buttons holder.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use mercury_core::types::{ActionButton, MediaData, MessageId, MessengerMessageId};

/// One visible messenger bubble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub parent_model_id: MessageId,
    /// 0-based position within the owning model message.
    pub segment_index: usize,
    pub text_content: String,
    pub media_content: Option<MediaData>,
    pub messenger_message_id: Option<MessengerMessageId>,
    pub is_sent: bool,
    pub is_deleted: bool,
    pub active_buttons: Option<Vec<ActionButton>>,
}

impl UiMessage {
    fn new(parent_model_id: MessageId, segment_index: usize) -> Self {
        Self {
            parent_model_id,
            segment_index,
            text_content: String::new(),
            media_content: None,
            messenger_message_id: None,
            is_sent: false,
            is_deleted: false,
            active_buttons: None,
        }
    }

    /// Empty both ways: no text and no media.
    pub fn is_blank(&self) -> bool {
        self.text_content.is_empty() && self.media_content.is_none()
    }
}

/// Pointer to one segment: `(parent model id, segment index)`.
pub type SegmentRef = (MessageId, usize);

/// Per-chat UI state. At most one segment across the whole chat carries
/// active buttons at any time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatUiState {
    segments: HashMap<MessageId, Vec<UiMessage>>,
    active_holder: Option<SegmentRef>,
}

impl ChatUiState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the first segment (index 0) for a model message, optionally
    /// owning active buttons. Replaces any previous segments for that id.
    pub fn create_initial_ui_message(
        &mut self,
        model_id: MessageId,
        buttons: Option<Vec<ActionButton>>,
    ) -> &mut UiMessage {
        let mut seg = UiMessage::new(model_id.clone(), 0);
        if let Some(buttons) = buttons.filter(|b| !b.is_empty()) {
            self.displace_holder();
            seg.active_buttons = Some(buttons);
            self.active_holder = Some((model_id.clone(), 0));
        }
        let list = self.segments.entry(model_id).or_default();
        list.clear();
        list.push(seg);
        &mut list[0]
    }

    /// Append a further segment with index = current count.
    pub fn create_next_segment(&mut self, model_id: &MessageId) -> &mut UiMessage {
        let list = self.segments.entry(model_id.clone()).or_default();
        let index = list.len();
        list.push(UiMessage::new(model_id.clone(), index));
        list.last_mut().expect("just pushed")
    }

    pub fn segments_of(&self, model_id: &MessageId) -> &[UiMessage] {
        self.segments.get(model_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn segment(&self, model_id: &MessageId, index: usize) -> Option<&UiMessage> {
        self.segments.get(model_id)?.get(index)
    }

    pub fn segment_mut(&mut self, model_id: &MessageId, index: usize) -> Option<&mut UiMessage> {
        self.segments.get_mut(model_id)?.get_mut(index)
    }

    pub fn last_segment(&self, model_id: &MessageId) -> Option<&UiMessage> {
        self.segments.get(model_id)?.last()
    }

    pub fn mark_as_sent(&mut self, model_id: &MessageId, index: usize, mid: MessengerMessageId) {
        if let Some(seg) = self.segment_mut(model_id, index) {
            seg.messenger_message_id = Some(mid);
            seg.is_sent = true;
        }
    }

    /// Current active-buttons holder, if any.
    pub fn active_holder(&self) -> Option<&SegmentRef> {
        self.active_holder.as_ref()
    }

    /// Give `buttons` to one segment. A non-empty list displaces any previous
    /// holder (its buttons are cleared here; the messenger-side strip is the
    /// caller's job). Returns the displaced holder.
    pub fn set_active_buttons(
        &mut self,
        model_id: &MessageId,
        index: usize,
        buttons: Vec<ActionButton>,
    ) -> Option<SegmentRef> {
        if buttons.is_empty() {
            return None;
        }
        let displaced = match &self.active_holder {
            Some((mid, idx)) if mid == model_id && *idx == index => None,
            other => other.clone(),
        };
        if displaced.is_some() {
            self.displace_holder();
        }
        if let Some(seg) = self.segment_mut(model_id, index) {
            seg.active_buttons = Some(buttons);
            self.active_holder = Some((model_id.clone(), index));
        }
        displaced
    }

    /// Clear the current holder, leaving zero holders. Returns the prior one.
    pub fn clear_active_buttons(&mut self) -> Option<SegmentRef> {
        let holder = self.active_holder.take();
        if let Some((mid, idx)) = &holder {
            if let Some(seg) = self.segment_mut(mid, *idx) {
                seg.active_buttons = None;
            }
        }
        holder
    }

    fn displace_holder(&mut self) {
        if let Some((mid, idx)) = self.active_holder.take() {
            if let Some(seg) = self.segment_mut(&mid, idx) {
                seg.active_buttons = None;
            }
        }
    }

    /// Remove every segment of a model message, returned in reverse order:
    /// the order they should be deleted from the messenger.
    pub fn remove_ui_messages(&mut self, model_id: &MessageId) -> Vec<UiMessage> {
        let Some(mut list) = self.segments.remove(model_id) else {
            return Vec::new();
        };
        if matches!(&self.active_holder, Some((mid, _)) if mid == model_id) {
            self.active_holder = None;
        }
        list.reverse();
        list
    }

    /// Remove the last segment of a model message.
    pub fn remove_last_ui_message(&mut self, model_id: &MessageId) -> Option<UiMessage> {
        let list = self.segments.get_mut(model_id)?;
        let seg = list.pop()?;
        if list.is_empty() {
            self.segments.remove(model_id);
        }
        if matches!(&self.active_holder, Some((mid, idx)) if mid == model_id && *idx == seg.segment_index)
        {
            self.active_holder = None;
        }
        Some(seg)
    }

    /// Count of live (not deleted) segments across all model messages.
    pub fn live_segment_count(&self) -> usize {
        self.segments
            .values()
            .flat_map(|l| l.iter())
            .filter(|s| !s.is_deleted)
            .count()
    }

    /// Number of segments currently carrying active buttons. Always 0 or 1.
    pub fn holders_count(&self) -> usize {
        self.segments
            .values()
            .flat_map(|l| l.iter())
            .filter(|s| s.active_buttons.as_ref().is_some_and(|b| !b.is_empty()))
            .count()
    }
}

/// Deterministic char-based splitting: the k-th chunk is
/// `text[k·max_len .. (k+1)·max_len]`, the last chunk is the remainder.
/// Empty input yields one empty chunk.
pub fn split_text_by_length(text: &str, max_len: usize) -> Vec<String> {
    if text.is_empty() || max_len == 0 {
        return vec![String::new()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_len)
        .map(|c| c.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mid() -> MessageId {
        MessageId::new()
    }

    #[test]
    fn initial_then_next_segments_are_indexed() {
        let mut ui = ChatUiState::new();
        let id = mid();
        ui.create_initial_ui_message(id.clone(), None);
        ui.create_next_segment(&id);
        ui.create_next_segment(&id);
        let idxs: Vec<usize> = ui.segments_of(&id).iter().map(|s| s.segment_index).collect();
        assert_eq!(idxs, vec![0, 1, 2]);
    }

    #[test]
    fn at_most_one_active_holder() {
        let mut ui = ChatUiState::new();
        let (a, b) = (mid(), mid());
        ui.create_initial_ui_message(a.clone(), Some(vec![ActionButton::cancel()]));
        assert_eq!(ui.holders_count(), 1);

        ui.create_initial_ui_message(b.clone(), Some(vec![ActionButton::stop()]));
        assert_eq!(ui.holders_count(), 1);
        assert_eq!(ui.active_holder(), Some(&(b.clone(), 0)));
        assert!(ui.segment(&a, 0).unwrap().active_buttons.is_none());

        let displaced = ui.set_active_buttons(&a, 0, vec![ActionButton::retry()]);
        assert_eq!(displaced, Some((b.clone(), 0)));
        assert_eq!(ui.holders_count(), 1);
    }

    #[test]
    fn empty_buttons_never_take_the_holder() {
        let mut ui = ChatUiState::new();
        let a = mid();
        ui.create_initial_ui_message(a.clone(), Some(Vec::new()));
        assert_eq!(ui.holders_count(), 0);
        assert!(ui.set_active_buttons(&a, 0, Vec::new()).is_none());
        assert_eq!(ui.holders_count(), 0);
    }

    #[test]
    fn clear_returns_prior_holder() {
        let mut ui = ChatUiState::new();
        let a = mid();
        ui.create_initial_ui_message(a.clone(), Some(vec![ActionButton::cancel()]));
        assert_eq!(ui.clear_active_buttons(), Some((a, 0)));
        assert_eq!(ui.clear_active_buttons(), None);
        assert_eq!(ui.holders_count(), 0);
    }

    #[test]
    fn removal_returns_reverse_order_and_clears_holder() {
        let mut ui = ChatUiState::new();
        let a = mid();
        ui.create_initial_ui_message(a.clone(), None);
        ui.create_next_segment(&a);
        ui.set_active_buttons(&a, 1, vec![ActionButton::stop()]);

        let removed = ui.remove_ui_messages(&a);
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].segment_index, 1);
        assert_eq!(removed[1].segment_index, 0);
        assert!(ui.active_holder().is_none());
    }

    #[test]
    fn remove_last_clears_holder_only_when_it_held() {
        let mut ui = ChatUiState::new();
        let a = mid();
        ui.create_initial_ui_message(a.clone(), Some(vec![ActionButton::cancel()]));
        ui.create_next_segment(&a);

        let seg = ui.remove_last_ui_message(&a).unwrap();
        assert_eq!(seg.segment_index, 1);
        assert_eq!(ui.active_holder(), Some(&(a.clone(), 0)));

        let seg = ui.remove_last_ui_message(&a).unwrap();
        assert_eq!(seg.segment_index, 0);
        assert!(ui.active_holder().is_none());
        assert!(ui.remove_last_ui_message(&a).is_none());
    }

    #[test]
    fn split_is_deterministic() {
        assert_eq!(split_text_by_length("", 10), vec![String::new()]);
        assert_eq!(split_text_by_length("abc", 10), vec!["abc"]);
        assert_eq!(split_text_by_length("abcdef", 2), vec!["ab", "cd", "ef"]);
        assert_eq!(split_text_by_length("abcdefg", 3), vec!["abc", "def", "g"]);
    }

    #[test]
    fn split_counts_chars_not_bytes() {
        let chunks = split_text_by_length("ééééé", 2);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
    }
}
