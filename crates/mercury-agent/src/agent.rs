//! The contract the core speaks to a streaming AI backend.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mercury_core::types::{ChatId, ChatMessage, ContentItem};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("AI transport error: {0}")]
    Transport(String),

    #[error("AI stream cancelled")]
    Cancelled,
}

impl From<AgentError> for mercury_core::MercuryError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Cancelled => mercury_core::MercuryError::Cancelled,
            other => mercury_core::MercuryError::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// One in-flight streaming response.
///
/// The delta sequence is lazy, finite, and non-restartable. Dropping the
/// stream cancels any in-flight work.
#[async_trait]
pub trait ResponseStream: Send {
    /// Next incremental text fragment. Fragments are never cumulative;
    /// empty fragments are permitted. `Ok(None)` ends the sequence.
    async fn next_delta(&mut self) -> Result<Option<String>>;

    /// Final structured payload, available once the delta sequence ended.
    /// `None` means the streamed text is the whole response.
    fn structured_content(&mut self) -> Option<Vec<ContentItem>>;
}

/// Common interface for all AI backends.
#[async_trait]
pub trait AiAgent: Send + Sync {
    /// Mode this agent was built for (names the prompt template).
    fn mode(&self) -> &str;

    /// Open a streaming response over a read-only history snapshot.
    async fn open_stream(
        &self,
        chat_id: &ChatId,
        history: Vec<ChatMessage>,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ResponseStream>>;
}

/// Builds the agent for a `(chat, mode)` pair. A chat owns exactly one
/// agent at a time and replaces it when the mode changes.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(&self, chat_id: &ChatId, mode: &str) -> Result<Arc<dyn AiAgent>>;
}

/// Adapt a [`ResponseStream`] into a `futures` stream of deltas. The
/// resulting stream ends on the first error, like the underlying sequence.
pub fn delta_stream(
    mut stream: Box<dyn ResponseStream>,
) -> impl futures_util::Stream<Item = Result<String>> + Send {
    async_stream::try_stream! {
        while let Some(delta) = stream.next_delta().await? {
            yield delta;
        }
    }
}

/// Factory from a plain closure, for wiring and tests.
pub struct FnAgentFactory<F>(pub F);

#[async_trait]
impl<F> AgentFactory for FnAgentFactory<F>
where
    F: Fn(&ChatId, &str) -> Result<Arc<dyn AiAgent>> + Send + Sync,
{
    async fn create(&self, chat_id: &ChatId, mode: &str) -> Result<Arc<dyn AiAgent>> {
        (self.0)(chat_id, mode)
    }
}
