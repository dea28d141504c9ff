//! The per-chat state snapshot kept in the expiring store.

use crate::history::ChatHistory;
use crate::ui::ChatUiState;

/// Everything the store holds for one chat. Created lazily on first access,
/// replaced atomically on every mutation, removed on reset or expiry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatState {
    pub history: ChatHistory,
    pub ui: ChatUiState,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }
}
