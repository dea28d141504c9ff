//! The chat lifecycle state machine.
//!
//! Transitions are serialized: while one is in progress, further triggers
//! queue and drain FIFO afterwards. Internal continuation triggers produced
//! by a transition's own action run before queued external ones. A queued
//! trigger that is no longer permitted when its turn comes is dropped with a
//! log line, never an error.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use mercury_core::error::{MercuryError, Result};
use mercury_core::types::ChatMessage;

use crate::stream::StreamingContext;

/// Lifecycle state of one chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatStateId {
    WaitingForFirstMessage,
    WaitingForNewMessages,
    InitiateAiResponse,
    Streaming,
    Error,
}

/// Payload-free trigger discriminant, used for table lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    UserAddMessages,
    UserRequestResponse,
    UserContinue,
    UserRegenerate,
    UserStop,
    UserReset,
    UserSetMode,
    UserCancel,
    AiProducedContent,
    AiResponseError,
    AiResponseFinished,
}

/// A trigger with its payload.
pub enum Trigger {
    UserAddMessages {
        messages: Vec<ChatMessage>,
        force_last_turn: bool,
    },
    UserRequestResponse,
    UserContinue,
    UserRegenerate,
    UserStop,
    UserReset,
    UserSetMode { mode: String },
    /// Internal: initiate was cancelled cooperatively.
    UserCancel,
    /// Internal: initiate succeeded and produced a live stream.
    AiProducedContent(StreamingContext),
    /// Internal: initiate or streaming failed.
    AiResponseError,
    /// Internal: streaming completed.
    AiResponseFinished,
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::UserAddMessages { .. } => TriggerKind::UserAddMessages,
            Trigger::UserRequestResponse => TriggerKind::UserRequestResponse,
            Trigger::UserContinue => TriggerKind::UserContinue,
            Trigger::UserRegenerate => TriggerKind::UserRegenerate,
            Trigger::UserStop => TriggerKind::UserStop,
            Trigger::UserReset => TriggerKind::UserReset,
            Trigger::UserSetMode { .. } => TriggerKind::UserSetMode,
            Trigger::UserCancel => TriggerKind::UserCancel,
            Trigger::AiProducedContent(_) => TriggerKind::AiProducedContent,
            Trigger::AiResponseError => TriggerKind::AiResponseError,
            Trigger::AiResponseFinished => TriggerKind::AiResponseFinished,
        }
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind())
    }
}

/// The transition table. `None` means the trigger is not permitted from
/// that state.
pub fn next_state(from: ChatStateId, trigger: TriggerKind) -> Option<ChatStateId> {
    use ChatStateId::*;
    use TriggerKind::*;

    match (from, trigger) {
        (WaitingForFirstMessage, UserAddMessages) => Some(WaitingForNewMessages),
        (WaitingForFirstMessage, UserReset) => Some(WaitingForFirstMessage),
        (WaitingForFirstMessage, UserSetMode) => Some(WaitingForFirstMessage),

        (WaitingForNewMessages, UserRequestResponse)
        | (WaitingForNewMessages, UserContinue)
        | (WaitingForNewMessages, UserRegenerate) => Some(InitiateAiResponse),
        (WaitingForNewMessages, UserAddMessages) => Some(WaitingForNewMessages),
        (WaitingForNewMessages, UserReset) => Some(WaitingForFirstMessage),

        (InitiateAiResponse, AiProducedContent) => Some(Streaming),
        (InitiateAiResponse, AiResponseError) => Some(Error),
        (InitiateAiResponse, UserCancel) => Some(WaitingForNewMessages),
        (InitiateAiResponse, UserAddMessages) => Some(WaitingForNewMessages),
        (InitiateAiResponse, UserReset) => Some(WaitingForFirstMessage),

        (Streaming, AiResponseFinished) => Some(WaitingForNewMessages),
        (Streaming, AiResponseError) => Some(Error),
        (Streaming, UserStop) => Some(WaitingForNewMessages),
        (Streaming, UserReset) => Some(WaitingForFirstMessage),
        (Streaming, UserAddMessages) => Some(WaitingForNewMessages),
        (Streaming, UserSetMode) => Some(InitiateAiResponse),

        (Error, UserRegenerate) => Some(InitiateAiResponse),
        (Error, UserAddMessages) => Some(WaitingForNewMessages),
        (Error, UserReset) => Some(WaitingForFirstMessage),

        _ => None,
    }
}

/// True when firing `trigger` would leave a state with a live AI stream;
/// such a trigger must cancel the current operation before it queues.
pub fn interrupts_active_stream(from: ChatStateId, trigger: TriggerKind) -> bool {
    matches!(
        from,
        ChatStateId::InitiateAiResponse | ChatStateId::Streaming
    ) && matches!(
        trigger,
        TriggerKind::UserAddMessages
            | TriggerKind::UserReset
            | TriggerKind::UserStop
            | TriggerKind::UserSetMode
            | TriggerKind::UserCancel
    )
}

struct Inner {
    state: ChatStateId,
    busy: bool,
    queue: VecDeque<Trigger>,
}

/// Serialized trigger gate. Owns only lifecycle bookkeeping; the actions
/// themselves are the chat's business.
pub struct StateMachine {
    inner: Mutex<Inner>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ChatStateId::WaitingForFirstMessage,
                busy: false,
                queue: VecDeque::new(),
            }),
        }
    }

    pub fn current(&self) -> ChatStateId {
        self.inner.lock().unwrap().state
    }

    /// Whether `trigger` is accepted from the current state.
    pub fn can_fire(&self, trigger: TriggerKind) -> bool {
        next_state(self.current(), trigger).is_some()
    }

    /// Admit a trigger. `Ok(Some)` hands it back for the caller to execute
    /// (the machine is now busy); `Ok(None)` means it was queued behind an
    /// in-progress transition; `Err` means it is not permitted right now.
    pub(crate) fn begin(&self, trigger: Trigger) -> Result<Option<Trigger>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.busy {
            inner.queue.push_back(trigger);
            return Ok(None);
        }
        if next_state(inner.state, trigger.kind()).is_none() {
            return Err(MercuryError::InvalidState(format!(
                "trigger {:?} not permitted in {:?}",
                trigger.kind(),
                inner.state
            )));
        }
        inner.busy = true;
        Ok(Some(trigger))
    }

    /// Whether a transition is currently in progress.
    pub fn is_busy(&self) -> bool {
        self.inner.lock().unwrap().busy
    }

    /// Resolve the transition for one trigger against the current state and
    /// move to the target. Returns the target, or `None` when the trigger is
    /// not permitted (the caller drops it).
    pub(crate) fn advance(&self, trigger: TriggerKind) -> Option<(ChatStateId, ChatStateId)> {
        let mut inner = self.inner.lock().unwrap();
        let from = inner.state;
        let to = next_state(from, trigger)?;
        inner.state = to;
        Some((from, to))
    }

    /// Pop the next queued trigger, or finish the busy phase when the queue
    /// is drained.
    pub(crate) fn take_next(&self) -> Option<Trigger> {
        let mut inner = self.inner.lock().unwrap();
        match inner.queue.pop_front() {
            Some(t) => Some(t),
            None => {
                inner.busy = false;
                None
            }
        }
    }

    /// Abort the busy phase, dropping any queued triggers.
    pub(crate) fn finish_abnormally(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.busy = false;
        let dropped = inner.queue.len();
        inner.queue.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChatStateId::*;
    use TriggerKind::*;

    #[test]
    fn initial_state_accepts_first_message() {
        let m = StateMachine::new();
        assert_eq!(m.current(), WaitingForFirstMessage);
        assert!(m.can_fire(UserAddMessages));
        assert!(!m.can_fire(UserRequestResponse));
    }

    #[test]
    fn table_matches_lifecycle() {
        assert_eq!(next_state(WaitingForFirstMessage, UserAddMessages), Some(WaitingForNewMessages));
        assert_eq!(next_state(WaitingForNewMessages, UserRequestResponse), Some(InitiateAiResponse));
        assert_eq!(next_state(InitiateAiResponse, AiProducedContent), Some(Streaming));
        assert_eq!(next_state(Streaming, AiResponseFinished), Some(WaitingForNewMessages));
        assert_eq!(next_state(Streaming, AiResponseError), Some(Error));
        assert_eq!(next_state(Streaming, UserSetMode), Some(InitiateAiResponse));
        assert_eq!(next_state(Error, UserRegenerate), Some(InitiateAiResponse));
        assert_eq!(next_state(Error, UserReset), Some(WaitingForFirstMessage));
        // Not permitted:
        assert_eq!(next_state(WaitingForNewMessages, UserStop), None);
        assert_eq!(next_state(WaitingForNewMessages, UserSetMode), None);
        assert_eq!(next_state(Error, UserRequestResponse), None);
    }

    #[test]
    fn rejected_trigger_is_invalid_state() {
        let m = StateMachine::new();
        let err = m.begin(Trigger::UserRequestResponse).unwrap_err();
        assert!(matches!(err, MercuryError::InvalidState(_)));
    }

    #[test]
    fn triggers_queue_while_busy_and_drain_fifo() {
        let m = StateMachine::new();
        let first = m
            .begin(Trigger::UserAddMessages { messages: vec![], force_last_turn: false })
            .unwrap();
        assert!(first.is_some());
        assert!(m.is_busy());

        assert!(m.begin(Trigger::UserReset).unwrap().is_none());
        assert!(m.begin(Trigger::UserStop).unwrap().is_none());

        assert_eq!(m.take_next().unwrap().kind(), UserReset);
        assert_eq!(m.take_next().unwrap().kind(), UserStop);
        assert!(m.take_next().is_none());
        assert!(!m.is_busy());
    }

    #[test]
    fn advance_moves_state_or_rejects() {
        let m = StateMachine::new();
        assert_eq!(m.advance(UserAddMessages), Some((WaitingForFirstMessage, WaitingForNewMessages)));
        assert_eq!(m.current(), WaitingForNewMessages);
        assert_eq!(m.advance(UserStop), None);
        assert_eq!(m.current(), WaitingForNewMessages);
    }

    #[test]
    fn interrupting_kinds_cover_stream_states() {
        assert!(interrupts_active_stream(Streaming, UserReset));
        assert!(interrupts_active_stream(Streaming, UserAddMessages));
        assert!(interrupts_active_stream(InitiateAiResponse, UserReset));
        assert!(!interrupts_active_stream(WaitingForNewMessages, UserReset));
        assert!(!interrupts_active_stream(Streaming, AiResponseFinished));
    }
}
