//! Per-chat façade.
//!
//! Owns the chat's mode, its AI agent (replaced on mode change), and the
//! lifecycle machine. Every mutation of history and UI goes through store
//! snapshots: read, clone, mutate, write back. The caller (batch executor)
//! serializes access per chat, so snapshots never race.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mercury_agent::agent::{AgentError, AgentFactory, AiAgent};
use mercury_core::error::{MercuryError, Result};
use mercury_core::types::{ActionButton, ChatId, ChatMessage, ContentItem, MessageId, Role};
use mercury_messenger::messenger::{EditOutcome, Messenger};
use mercury_store::{ExpiringStore, Ttl};

use crate::machine::{
    interrupts_active_stream, ChatStateId, StateMachine, Trigger, TriggerKind,
};
use crate::state::ChatState;
use crate::stream::{self, StreamingContext};

/// Shown while a reply is being produced, before any content arrives.
pub(crate) const PLACEHOLDER_TEXT: &str = "…";
/// Appended on entering the error state, removed on leaving it.
pub(crate) const TRY_AGAIN_TEXT: &str = "Something went wrong, please try again.";
/// Synthetic user prompt appended by the continue operation.
const CONTINUE_PROMPT: &str = "please continue";

/// External collaborators and settings one chat needs.
pub struct ChatDeps {
    pub store: Arc<ExpiringStore>,
    pub messenger: Arc<dyn Messenger>,
    pub agent_factory: Arc<dyn AgentFactory>,
    /// TTL for this chat's cached state (premium chats pass `Ttl::Never`).
    pub state_ttl: Ttl,
    /// Display name used for assistant messages.
    pub bot_name: String,
}

enum InitiateKind {
    Fresh,
    Continue,
    Regenerate,
}

enum InitiateFailure {
    Cancelled,
    Error,
}

pub struct Chat {
    chat_id: ChatId,
    deps: ChatDeps,
    mode: Mutex<String>,
    /// Lazily built; cleared on failure so a later attempt may succeed.
    agent: tokio::sync::Mutex<Option<Arc<dyn AiAgent>>>,
    machine: StateMachine,
    /// Cancellation token of the operation currently owning the AI stream.
    current_op: Mutex<Option<CancellationToken>>,
    /// Synthetic continue message awaiting stream completion.
    pending_continue: Mutex<Option<MessageId>>,
    /// The "try again" notice appended by the error state.
    error_notice: Mutex<Option<MessageId>>,
}

impl Chat {
    pub fn new(chat_id: ChatId, mode: impl Into<String>, deps: ChatDeps) -> Self {
        Self {
            chat_id,
            deps,
            mode: Mutex::new(mode.into()),
            agent: tokio::sync::Mutex::new(None),
            machine: StateMachine::new(),
            current_op: Mutex::new(None),
            pending_continue: Mutex::new(None),
            error_notice: Mutex::new(None),
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn state(&self) -> ChatStateId {
        self.machine.current()
    }

    pub fn mode(&self) -> String {
        self.mode.lock().unwrap().clone()
    }

    pub fn can_fire(&self, trigger: TriggerKind) -> bool {
        self.machine.can_fire(trigger)
    }

    /// First entry into the waiting state: greet the user with the mode
    /// intro. Run once right after construction.
    pub async fn start(&self) {
        self.send_intro().await;
    }

    /// Fire a trigger. Fails with `InvalidState` when the trigger is not
    /// permitted from the current state; triggers arriving while a
    /// transition is in progress are queued and run FIFO afterwards.
    pub async fn fire(&self, trigger: Trigger, ct: &CancellationToken) -> Result<()> {
        if self.machine.is_busy() && interrupts_active_stream(self.machine.current(), trigger.kind())
        {
            self.cancel_active_operation();
        }
        let Some(first) = self.machine.begin(trigger)? else {
            return Ok(());
        };
        self.run_transitions(first, ct).await
    }

    /// Fire if permitted; reports whether the trigger was accepted.
    pub async fn try_fire(&self, trigger: Trigger, ct: &CancellationToken) -> Result<bool> {
        match self.fire(trigger, ct).await {
            Ok(()) => Ok(true),
            Err(MercuryError::InvalidState(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn add_user_messages(
        &self,
        messages: Vec<ChatMessage>,
        force_last_turn: bool,
        ct: &CancellationToken,
    ) -> Result<()> {
        self.fire(Trigger::UserAddMessages { messages, force_last_turn }, ct)
            .await
    }

    pub async fn do_response_to_last_message(&self, ct: &CancellationToken) -> Result<()> {
        self.fire(Trigger::UserRequestResponse, ct).await
    }

    pub async fn reset(&self, ct: &CancellationToken) -> Result<()> {
        self.fire(Trigger::UserReset, ct).await
    }

    /// Switch the chat's mode. Routes through the state machine where the
    /// transition table accepts the trigger; otherwise only swaps the agent.
    pub async fn set_mode(&self, mode: &str, ct: &CancellationToken) -> Result<()> {
        if self.machine.is_busy() || self.machine.can_fire(TriggerKind::UserSetMode) {
            self.fire(
                Trigger::UserSetMode { mode: mode.to_string() },
                ct,
            )
            .await
        } else {
            self.swap_agent(mode).await;
            Ok(())
        }
    }

    /// Cancel whatever operation currently owns the AI stream.
    pub fn cancel_active_operation(&self) {
        if let Some(op) = self.current_op.lock().unwrap().clone() {
            op.cancel();
        }
    }

    // ------------------------------------------------------------------
    // Transition engine
    // ------------------------------------------------------------------

    async fn run_transitions(&self, first: Trigger, ct: &CancellationToken) -> Result<()> {
        let mut pending = Some(first);
        loop {
            let trigger = match pending.take() {
                Some(t) => t,
                None => match self.machine.take_next() {
                    Some(t) => t,
                    None => return Ok(()),
                },
            };
            match self.execute_one(trigger, ct).await {
                Ok(produced) => pending = produced,
                Err(e) => {
                    let dropped = self.machine.finish_abnormally();
                    if dropped > 0 {
                        warn!(chat = %self.chat_id, dropped, "dropped queued triggers after failed transition");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Execute one transition; returns the internal continuation trigger,
    /// if the entry action produced one.
    async fn execute_one(
        &self,
        trigger: Trigger,
        ct: &CancellationToken,
    ) -> Result<Option<Trigger>> {
        let kind = trigger.kind();
        let Some((from, to)) = self.machine.advance(kind) else {
            debug!(chat = %self.chat_id, ?kind, state = ?self.machine.current(),
                   "queued trigger no longer permitted, dropped");
            return Ok(None);
        };
        info!(chat = %self.chat_id, ?from, ?to, ?kind, "transition");

        if from == ChatStateId::Error && to != ChatStateId::Error {
            self.on_exit_error().await;
        }

        let produced = match trigger {
            Trigger::UserAddMessages { messages, force_last_turn } => {
                self.apply_user_messages(messages, force_last_turn);
                None
            }
            Trigger::UserReset => {
                self.on_enter_waiting_for_first_message().await;
                None
            }
            Trigger::UserSetMode { mode } => {
                self.swap_agent(&mode).await;
                if to == ChatStateId::InitiateAiResponse {
                    Some(self.enter_initiate(InitiateKind::Fresh, ct).await)
                } else {
                    self.send_intro().await;
                    None
                }
            }
            Trigger::UserRequestResponse => {
                Some(self.enter_initiate(InitiateKind::Fresh, ct).await)
            }
            Trigger::UserContinue => {
                Some(self.enter_initiate(InitiateKind::Continue, ct).await)
            }
            Trigger::UserRegenerate => {
                Some(self.enter_initiate(InitiateKind::Regenerate, ct).await)
            }
            Trigger::AiProducedContent(ctx) => Some(self.enter_streaming(ctx).await),
            Trigger::AiResponseError => {
                self.on_enter_error().await;
                None
            }
            Trigger::AiResponseFinished | Trigger::UserStop | Trigger::UserCancel => None,
        };
        Ok(produced)
    }

    async fn enter_initiate(&self, kind: InitiateKind, ct: &CancellationToken) -> Trigger {
        let op = ct.child_token();
        *self.current_op.lock().unwrap() = Some(op.clone());

        let result = match kind {
            InitiateKind::Fresh => self.initiate_response(&op).await,
            InitiateKind::Continue => self.continue_response(&op).await,
            InitiateKind::Regenerate => self.regenerate_response(&op).await,
        };

        match result {
            // The operation token stays registered while streaming runs.
            Ok(ctx) => Trigger::AiProducedContent(ctx),
            Err(InitiateFailure::Cancelled) => {
                self.clear_current_op();
                Trigger::UserCancel
            }
            Err(InitiateFailure::Error) => {
                self.clear_current_op();
                Trigger::AiResponseError
            }
        }
    }

    async fn enter_streaming(&self, ctx: StreamingContext) -> Trigger {
        let trigger = stream::run(self, ctx).await;
        self.clear_current_op();
        trigger
    }

    fn clear_current_op(&self) {
        self.current_op.lock().unwrap().take();
    }

    // ------------------------------------------------------------------
    // State snapshots
    // ------------------------------------------------------------------

    pub(crate) fn load_state(&self) -> ChatState {
        self.deps
            .store
            .get::<ChatState>(&self.chat_id.state_key())
            .map(|s| (*s).clone())
            .unwrap_or_default()
    }

    pub(crate) fn save_state(&self, state: ChatState) {
        if let Err(e) = self
            .deps
            .store
            .set(&self.chat_id.state_key(), state, self.deps.state_ttl)
        {
            warn!(chat = %self.chat_id, error = %e, "failed to persist chat state");
        }
    }

    pub(crate) fn messenger(&self) -> &dyn Messenger {
        self.deps.messenger.as_ref()
    }

    pub(crate) fn take_pending_continue(&self) -> Option<MessageId> {
        self.pending_continue.lock().unwrap().take()
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    fn apply_user_messages(&self, messages: Vec<ChatMessage>, force_last_turn: bool) {
        let mut state = self.load_state();
        state.history.add_user_messages(messages, force_last_turn);
        self.save_state(state);
    }

    /// Clear cached state and greet. Runs on reset.
    async fn on_enter_waiting_for_first_message(&self) {
        self.deps.store.remove(&self.chat_id.state_key());
        self.pending_continue.lock().unwrap().take();
        self.error_notice.lock().unwrap().take();
        self.send_intro().await;
    }

    async fn send_intro(&self) {
        let text = format!("Mode '{}' is active. Send a message to begin.", self.mode());
        if let Err(e) = self.deps.messenger.send_text(&self.chat_id, &text, None).await {
            warn!(chat = %self.chat_id, error = %e, "failed to send mode intro");
        }
    }

    async fn swap_agent(&self, mode: &str) {
        match self.deps.agent_factory.create(&self.chat_id, mode).await {
            Ok(agent) => {
                *self.agent.lock().await = Some(agent);
                *self.mode.lock().unwrap() = mode.to_string();
                info!(chat = %self.chat_id, mode, "agent replaced");
            }
            Err(e) => {
                warn!(chat = %self.chat_id, mode, error = %e, "failed to build agent for mode");
            }
        }
    }

    /// The chat's agent, built on first use. A failed build leaves the slot
    /// empty so the next call retries.
    async fn agent(&self) -> std::result::Result<Arc<dyn AiAgent>, AgentError> {
        let mut guard = self.agent.lock().await;
        if let Some(agent) = guard.as_ref() {
            return Ok(agent.clone());
        }
        let mode = self.mode();
        let agent = self.deps.agent_factory.create(&self.chat_id, &mode).await?;
        *guard = Some(agent.clone());
        Ok(agent)
    }

    async fn initiate_response(
        &self,
        op: &CancellationToken,
    ) -> std::result::Result<StreamingContext, InitiateFailure> {
        // 1. Strip the active buttons from whoever holds them.
        let mut state = self.load_state();
        self.strip_active_buttons(&mut state).await;

        // 2. History snapshot for the AI call.
        let snapshot = state.history.messages_for_ai();

        // 3. New assistant message + placeholder segment with a Cancel button.
        let msg = ChatMessage::assistant(&self.deps.bot_name);
        let model_id = msg.id.clone();
        if let Err(e) = state.history.add_assistant_message(msg) {
            warn!(chat = %self.chat_id, error = %e, "cannot open assistant message");
            self.save_state(state);
            return Err(InitiateFailure::Error);
        }
        let buttons = vec![ActionButton::cancel()];
        state.ui.create_initial_ui_message(model_id.clone(), Some(buttons.clone()));
        self.save_state(state);

        match self
            .deps
            .messenger
            .send_text(&self.chat_id, PLACEHOLDER_TEXT, Some(&buttons))
            .await
        {
            Ok(mid) => {
                let mut state = self.load_state();
                state.ui.mark_as_sent(&model_id, 0, mid);
                state.history.set_original_messenger_id(&model_id, mid);
                self.save_state(state);
            }
            Err(e) => {
                warn!(chat = %self.chat_id, error = %e, "failed to send placeholder");
                self.undo_initiated_response(&model_id).await;
                return Err(InitiateFailure::Error);
            }
        }

        if op.is_cancelled() {
            self.undo_initiated_response(&model_id).await;
            return Err(InitiateFailure::Cancelled);
        }

        // 4. Open the AI stream.
        let agent = match self.agent().await {
            Ok(a) => a,
            Err(e) => {
                warn!(chat = %self.chat_id, error = %e, "agent unavailable");
                self.undo_initiated_response(&model_id).await;
                return Err(InitiateFailure::Error);
            }
        };
        match agent.open_stream(&self.chat_id, snapshot, op).await {
            Ok(stream) => Ok(StreamingContext {
                model_id,
                stream,
                cancel: op.clone(),
            }),
            Err(AgentError::Cancelled) => {
                self.undo_initiated_response(&model_id).await;
                Err(InitiateFailure::Cancelled)
            }
            Err(e) => {
                warn!(chat = %self.chat_id, error = %e, "failed to open AI stream");
                self.undo_initiated_response(&model_id).await;
                Err(InitiateFailure::Error)
            }
        }
    }

    async fn continue_response(
        &self,
        op: &CancellationToken,
    ) -> std::result::Result<StreamingContext, InitiateFailure> {
        let synthetic = ChatMessage::new(
            Role::User,
            "system",
            vec![ContentItem::text(CONTINUE_PROMPT)],
        );
        let synthetic_id = synthetic.id.clone();
        {
            let mut state = self.load_state();
            state.history.add_user_messages(vec![synthetic], true);
            self.save_state(state);
        }
        *self.pending_continue.lock().unwrap() = Some(synthetic_id.clone());

        match self.initiate_response(op).await {
            Ok(ctx) => Ok(ctx),
            Err(failure) => {
                self.pending_continue.lock().unwrap().take();
                let mut state = self.load_state();
                state.history.remove_message_from_last_turn(&synthetic_id);
                self.save_state(state);
                Err(failure)
            }
        }
    }

    async fn regenerate_response(
        &self,
        op: &CancellationToken,
    ) -> std::result::Result<StreamingContext, InitiateFailure> {
        let mut state = self.load_state();
        let removed_msgs = state.history.remove_assistant_messages_from_last_turn();
        let mut removed_segs = Vec::new();
        for msg in removed_msgs.iter().rev() {
            removed_segs.extend(state.ui.remove_ui_messages(&msg.id));
        }
        self.save_state(state);

        for seg in removed_segs {
            if seg.is_sent && !seg.is_deleted {
                if let Some(mid) = seg.messenger_message_id {
                    if let Err(e) = self.deps.messenger.delete_message(&self.chat_id, mid).await {
                        warn!(chat = %self.chat_id, error = %e, "failed to delete segment");
                    }
                }
            }
        }

        self.initiate_response(op).await
    }

    /// Roll an initiate back: drop the placeholder assistant message and its
    /// segments, and restore Continue/Regenerate on the prior reply.
    async fn undo_initiated_response(&self, model_id: &MessageId) {
        let mut state = self.load_state();
        state.history.remove_message_from_last_turn(model_id);
        let removed = state.ui.remove_ui_messages(model_id);
        self.restore_recovery_buttons(&mut state).await;
        self.save_state(state);

        for seg in removed {
            if seg.is_sent && !seg.is_deleted {
                if let Some(mid) = seg.messenger_message_id {
                    if let Err(e) = self.deps.messenger.delete_message(&self.chat_id, mid).await {
                        warn!(chat = %self.chat_id, error = %e, "failed to delete placeholder");
                    }
                }
            }
        }
    }

    /// Put Continue/Regenerate back on the last assistant message.
    pub(crate) async fn restore_recovery_buttons(&self, state: &mut ChatState) {
        let Some(prev) = state.history.last_assistant_message() else {
            return;
        };
        let prev_id = prev.id.clone();
        let Some(index) = state.ui.last_segment(&prev_id).map(|s| s.segment_index) else {
            return;
        };
        let buttons = vec![ActionButton::continue_response(), ActionButton::regenerate()];
        state.ui.set_active_buttons(&prev_id, index, buttons.clone());
        if let Err(e) = self
            .edit_segment(state, &prev_id, index, None, Some(&buttons))
            .await
        {
            warn!(chat = %self.chat_id, error = %e, "failed to restore recovery buttons");
        }
    }

    async fn strip_active_buttons(&self, state: &mut ChatState) {
        let Some((model_id, index)) = state.ui.clear_active_buttons() else {
            return;
        };
        if let Err(e) = self.edit_segment(state, &model_id, index, None, None).await {
            warn!(chat = %self.chat_id, error = %e, "failed to strip active buttons");
        }
    }

    /// Update a segment's text and/or buttons, in state and on the messenger.
    /// A `MessageDeleted` outcome marks the segment deleted and succeeds.
    pub(crate) async fn edit_segment(
        &self,
        state: &mut ChatState,
        model_id: &MessageId,
        index: usize,
        new_text: Option<&str>,
        buttons: Option<&[ActionButton]>,
    ) -> Result<()> {
        let (mid, text, is_photo) = {
            let Some(seg) = state.ui.segment_mut(model_id, index) else {
                return Ok(());
            };
            if let Some(text) = new_text {
                seg.text_content = text.to_string();
            }
            if !seg.is_sent || seg.is_deleted {
                return Ok(());
            }
            let Some(mid) = seg.messenger_message_id else {
                return Ok(());
            };
            (mid, seg.text_content.clone(), seg.media_content.is_some())
        };

        let outcome = if is_photo {
            self.deps
                .messenger
                .edit_photo(&self.chat_id, mid, &text, buttons)
                .await
        } else {
            self.deps
                .messenger
                .edit_text(&self.chat_id, mid, &text, buttons)
                .await
        };
        match outcome {
            Ok(EditOutcome::MessageDeleted) => {
                if let Some(seg) = state.ui.segment_mut(model_id, index) {
                    seg.is_deleted = true;
                }
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append the "try again" notice with its Retry button.
    async fn on_enter_error(&self) {
        let mut state = self.load_state();
        let msg = ChatMessage::new(
            Role::Assistant,
            &self.deps.bot_name,
            vec![ContentItem::text(TRY_AGAIN_TEXT)],
        );
        let model_id = msg.id.clone();
        if let Err(e) = state.history.add_assistant_message(msg) {
            warn!(chat = %self.chat_id, error = %e, "cannot append error notice");
            return;
        }
        let buttons = vec![ActionButton::retry()];
        {
            let seg = state
                .ui
                .create_initial_ui_message(model_id.clone(), Some(buttons.clone()));
            seg.text_content = TRY_AGAIN_TEXT.to_string();
        }
        self.save_state(state);

        match self
            .deps
            .messenger
            .send_text(&self.chat_id, TRY_AGAIN_TEXT, Some(&buttons))
            .await
        {
            Ok(mid) => {
                let mut state = self.load_state();
                state.ui.mark_as_sent(&model_id, 0, mid);
                state.history.set_original_messenger_id(&model_id, mid);
                self.save_state(state);
            }
            Err(e) => {
                warn!(chat = %self.chat_id, error = %e, "failed to send error notice");
            }
        }
        *self.error_notice.lock().unwrap() = Some(model_id);
    }

    /// Remove the "try again" notice appended by `on_enter_error`.
    async fn on_exit_error(&self) {
        let Some(model_id) = self.error_notice.lock().unwrap().take() else {
            return;
        };
        let mut state = self.load_state();
        state.history.remove_message_from_last_turn(&model_id);
        let removed = state.ui.remove_ui_messages(&model_id);
        self.save_state(state);

        for seg in removed {
            if seg.is_sent && !seg.is_deleted {
                if let Some(mid) = seg.messenger_message_id {
                    if let Err(e) = self.deps.messenger.delete_message(&self.chat_id, mid).await {
                        warn!(chat = %self.chat_id, error = %e, "failed to delete error notice");
                    }
                }
            }
        }
    }
}
