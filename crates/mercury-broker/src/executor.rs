//! Per-chat batch executor.
//!
//! Serializes batches for one chat behind a `(lock, cancellation source,
//! queue)` triplet. A newer batch preempts the in-flight one by cancelling
//! its token before taking the lock. User messages are appended BEFORE the
//! cancellation check, inside the lock; that ordering is what guarantees
//! no message is ever lost, however batches overlap.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mercury_chat::Chat;
use mercury_core::error::{MercuryError, Result};
use mercury_core::event::{ChatEvent, EventKind, IncomingMessage};
use mercury_core::types::{ChatMessage, ContentItem, Role};

use crate::commands::{ActionProcessor, ChatCommandDispatcher, ScreenshotProvider};

/// Prompt attached to a capture-hotkey screenshot.
const HOTKEY_C_PROMPT: &str = "Describe what is on this screenshot.";
/// Prompt attached to a paste-hotkey screenshot.
const HOTKEY_V_PROMPT: &str = "Answer the question shown on this screenshot.";

/// One classified micro-batch, groups ordered by the original `order_id`.
#[derive(Debug)]
struct ClassifiedBatch {
    expire_count: usize,
    hotkey_c: usize,
    hotkey_v: usize,
    commands: Vec<String>,
    messages: Vec<IncomingMessage>,
    is_only_expire: bool,
    last_action: Option<String>,
}

impl ClassifiedBatch {
    fn classify(mut events: Vec<ChatEvent>) -> Self {
        events.sort_by_key(|e| e.order_id);
        let total = events.len();

        let mut batch = Self {
            expire_count: 0,
            hotkey_c: 0,
            hotkey_v: 0,
            commands: Vec::new(),
            messages: Vec::new(),
            is_only_expire: false,
            last_action: None,
        };
        for event in events {
            match event.kind {
                EventKind::Expire => batch.expire_count += 1,
                EventKind::HotkeyC => batch.hotkey_c += 1,
                EventKind::HotkeyV => batch.hotkey_v += 1,
                EventKind::Command { name, .. } => batch.commands.push(name),
                EventKind::Action { action } => batch.last_action = Some(action),
                EventKind::Message(msg) => batch.messages.push(msg),
            }
        }
        batch.is_only_expire = batch.expire_count > 0 && total == 1;
        batch
    }
}

pub struct ChatBatchExecutor {
    chat: Arc<Chat>,
    lock: tokio::sync::Mutex<()>,
    queue: Mutex<VecDeque<ClassifiedBatch>>,
    /// Token of the batch currently holding the lock, tagged for identity.
    current: Mutex<Option<(u64, CancellationToken)>>,
    op_seq: AtomicU64,
    dispatcher: Arc<dyn ChatCommandDispatcher>,
    actions: Arc<dyn ActionProcessor>,
    screenshots: Option<Arc<dyn ScreenshotProvider>>,
    disposed: AtomicBool,
}

impl ChatBatchExecutor {
    pub fn new(
        chat: Arc<Chat>,
        dispatcher: Arc<dyn ChatCommandDispatcher>,
        actions: Arc<dyn ActionProcessor>,
        screenshots: Option<Arc<dyn ScreenshotProvider>>,
    ) -> Self {
        Self {
            chat,
            lock: tokio::sync::Mutex::new(()),
            queue: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            op_seq: AtomicU64::new(0),
            dispatcher,
            actions,
            screenshots,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn chat(&self) -> &Arc<Chat> {
        &self.chat
    }

    /// Run one batch of events for this chat.
    ///
    /// Messages from every submitted batch reach the history exactly once;
    /// the response pipeline runs only for the batch that finds the queue
    /// empty (i.e. the newest one).
    pub async fn execute_batch(
        &self,
        events: Vec<ChatEvent>,
        external: &CancellationToken,
    ) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(MercuryError::Disposed("chat batch executor"));
        }

        self.queue.lock().unwrap().push_back(ClassifiedBatch::classify(events));

        // Preempt whatever batch is in flight; it will still append its
        // messages before noticing.
        if let Some((_, token)) = self.current.lock().unwrap().clone() {
            token.cancel();
        }

        let _guard = self.lock.lock().await;
        let op = external.child_token();
        let op_id = self.op_seq.fetch_add(1, Ordering::Relaxed);
        *self.current.lock().unwrap() = Some((op_id, op.clone()));

        let result = self.run_locked(&op).await;

        let mut current = self.current.lock().unwrap();
        if current.as_ref().is_some_and(|(id, _)| *id == op_id) {
            *current = None;
        }
        result
    }

    async fn run_locked(&self, op: &CancellationToken) -> Result<()> {
        let Some(batch) = self.queue.lock().unwrap().pop_front() else {
            return Ok(());
        };

        // Messages are appended unconditionally, before any cancellation
        // check: a preempted batch still persists its input.
        if !batch.messages.is_empty() {
            let messages: Vec<ChatMessage> = batch.messages.iter().map(to_chat_message).collect();
            self.chat
                .add_user_messages(messages, false, &CancellationToken::new())
                .await?;
        }

        if op.is_cancelled() {
            debug!(chat = %self.chat.chat_id(), "batch preempted after append");
            return Err(MercuryError::Cancelled);
        }

        // A newer batch is already queued; it owns the pipeline now.
        if !self.queue.lock().unwrap().is_empty() {
            debug!(chat = %self.chat.chat_id(), "newer batch queued, skipping pipeline");
            return Ok(());
        }

        // Phase 1: a lone expiry resets the chat.
        if batch.is_only_expire {
            return self.chat.reset(op).await;
        }

        // Phase 2: capture hotkeys: first one wins.
        if batch.hotkey_c > 0 {
            return self.respond_to_screenshot(HOTKEY_C_PROMPT, op).await;
        }
        if batch.hotkey_v > 0 {
            return self.respond_to_screenshot(HOTKEY_V_PROMPT, op).await;
        }

        // Phase 3: commands, in order.
        for command in &batch.commands {
            if op.is_cancelled() {
                return Err(MercuryError::Cancelled);
            }
            if let Err(e) = self.dispatcher.dispatch(&self.chat, command, op).await {
                if e.is_cancelled() {
                    return Err(e);
                }
                warn!(chat = %self.chat.chat_id(), command = %command, error = %e, "command failed");
            }
        }

        // Phase 4: the last button click, when the batch carried no text.
        if batch.messages.is_empty() {
            if let Some(action) = &batch.last_action {
                self.actions.process(&self.chat, action, op).await?;
            }
        }

        // Phase 5: respond to the appended messages.
        if !batch.messages.is_empty() {
            self.chat.do_response_to_last_message(op).await?;
        }

        Ok(())
    }

    async fn respond_to_screenshot(&self, prompt: &str, op: &CancellationToken) -> Result<()> {
        let Some(provider) = &self.screenshots else {
            debug!(chat = %self.chat.chat_id(), "no screenshot provider configured");
            return Ok(());
        };
        let media = provider.capture().await?;
        let message = ChatMessage::new(
            Role::User,
            "screen",
            vec![ContentItem::Image { media }, ContentItem::text(prompt)],
        );
        self.chat
            .add_user_messages(vec![message], false, &CancellationToken::new())
            .await?;
        self.chat.do_response_to_last_message(op).await
    }

    /// Cancel the in-flight batch and refuse further ones.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some((_, token)) = self.current.lock().unwrap().clone() {
            token.cancel();
        }
    }
}

impl Drop for ChatBatchExecutor {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn to_chat_message(msg: &IncomingMessage) -> ChatMessage {
    let mut content = Vec::with_capacity(1 + msg.attachments.len());
    if !msg.text.is_empty() {
        content.push(ContentItem::text(&msg.text));
    }
    content.extend(msg.attachments.iter().cloned());
    let name = if msg.username.is_empty() { "_" } else { &msg.username };
    ChatMessage::new(Role::User, name, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg_event(order: u64, text: &str) -> ChatEvent {
        ChatEvent::new(
            "c",
            order,
            EventKind::Message(IncomingMessage::text_only("alice", text)),
        )
    }

    #[test]
    fn classification_orders_by_order_id() {
        let events = vec![
            msg_event(3, "third"),
            ChatEvent::new("c", 1, EventKind::Command { name: "reset".into(), username: "a".into() }),
            msg_event(2, "second"),
            ChatEvent::new("c", 4, EventKind::Action { action: "stop".into() }),
        ];
        let batch = ClassifiedBatch::classify(events);
        let texts: Vec<&str> = batch.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["second", "third"]);
        assert_eq!(batch.commands, vec!["reset".to_string()]);
        assert_eq!(batch.last_action.as_deref(), Some("stop"));
        assert!(!batch.is_only_expire);
    }

    #[test]
    fn lone_expire_is_flagged() {
        let only = ClassifiedBatch::classify(vec![ChatEvent::new("c", 0, EventKind::Expire)]);
        assert!(only.is_only_expire);

        let mixed = ClassifiedBatch::classify(vec![
            ChatEvent::new("c", 0, EventKind::Expire),
            msg_event(1, "hi"),
        ]);
        assert!(!mixed.is_only_expire);
    }

    #[test]
    fn last_action_wins() {
        let batch = ClassifiedBatch::classify(vec![
            ChatEvent::new("c", 0, EventKind::Action { action: "continue".into() }),
            ChatEvent::new("c", 1, EventKind::Action { action: "regenerate".into() }),
        ]);
        assert_eq!(batch.last_action.as_deref(), Some("regenerate"));
    }

    #[test]
    fn empty_username_becomes_placeholder() {
        let m = to_chat_message(&IncomingMessage::text_only("", "x"));
        assert_eq!(m.name, "_");
    }
}
