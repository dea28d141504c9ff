//! Deterministic agent double for tests and demos.
//!
//! A [`Script`] describes one streaming response: deltas, optional delays,
//! an optional mid-stream failure, optional structured content. The agent
//! plays queued scripts in order, one per `open_stream`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mercury_core::types::{ChatId, ChatMessage, ContentItem};

use crate::agent::{AgentError, AiAgent, ResponseStream, Result};

#[derive(Debug, Clone)]
enum Step {
    Delta(String),
    Delay(Duration),
    Fail(String),
    /// Report cancellation immediately (a provider-side abort).
    Cancelled,
    /// Block until the caller cancels, then report cancellation.
    WaitCancelled,
}

/// One scripted streaming response.
#[derive(Debug, Clone, Default)]
pub struct Script {
    steps: Vec<Step>,
    structured: Option<Vec<ContentItem>>,
    fail_open: Option<String>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delta(mut self, text: impl Into<String>) -> Self {
        self.steps.push(Step::Delta(text.into()));
        self
    }

    /// Convenience: one delta per item.
    pub fn deltas<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for item in items {
            self.steps.push(Step::Delta(item.into()));
        }
        self
    }

    pub fn delay(mut self, d: Duration) -> Self {
        self.steps.push(Step::Delay(d));
        self
    }

    /// Fail mid-stream after the steps queued so far.
    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.steps.push(Step::Fail(message.into()));
        self
    }

    /// Throw cancellation from inside the stream after the steps so far.
    pub fn cancelled(mut self) -> Self {
        self.steps.push(Step::Cancelled);
        self
    }

    pub fn wait_cancelled(mut self) -> Self {
        self.steps.push(Step::WaitCancelled);
        self
    }

    pub fn structured(mut self, content: Vec<ContentItem>) -> Self {
        self.structured = Some(content);
        self
    }

    /// Make `open_stream` itself fail for this script.
    pub fn fail_open(mut self, message: impl Into<String>) -> Self {
        self.fail_open = Some(message.into());
        self
    }
}

pub struct ScriptedAgent {
    mode: String,
    scripts: Mutex<VecDeque<Script>>,
    histories: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedAgent {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            scripts: Mutex::new(VecDeque::new()),
            histories: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(mode: impl Into<String>, script: Script) -> Self {
        let agent = Self::new(mode);
        agent.push_script(script);
        agent
    }

    pub fn push_script(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// History snapshots observed by each `open_stream`, in call order.
    pub fn observed_histories(&self) -> Vec<Vec<ChatMessage>> {
        self.histories.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.histories.lock().unwrap().len()
    }
}

#[async_trait]
impl AiAgent for ScriptedAgent {
    fn mode(&self) -> &str {
        &self.mode
    }

    async fn open_stream(
        &self,
        _chat_id: &ChatId,
        history: Vec<ChatMessage>,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ResponseStream>> {
        self.histories.lock().unwrap().push(history);

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::Transport("no scripted response queued".into()))?;
        if let Some(msg) = script.fail_open {
            return Err(AgentError::Transport(msg));
        }

        Ok(Box::new(ScriptedStream {
            steps: script.steps.into(),
            structured: script.structured,
            cancel: cancel.clone(),
        }))
    }
}

struct ScriptedStream {
    steps: VecDeque<Step>,
    structured: Option<Vec<ContentItem>>,
    cancel: CancellationToken,
}

#[async_trait]
impl ResponseStream for ScriptedStream {
    async fn next_delta(&mut self) -> Result<Option<String>> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            match self.steps.pop_front() {
                None => return Ok(None),
                Some(Step::Delta(text)) => return Ok(Some(text)),
                Some(Step::Fail(msg)) => return Err(AgentError::Transport(msg)),
                Some(Step::Cancelled) => return Err(AgentError::Cancelled),
                Some(Step::Delay(d)) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(d) => {}
                    }
                }
                Some(Step::WaitCancelled) => {
                    self.cancel.cancelled().await;
                    return Err(AgentError::Cancelled);
                }
            }
        }
    }

    fn structured_content(&mut self) -> Option<Vec<ContentItem>> {
        self.structured.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plays_deltas_in_order() {
        let agent = ScriptedAgent::with_script(
            "default",
            Script::new().delta("Hello, ").delta("world"),
        );
        let cancel = CancellationToken::new();
        let mut stream = agent
            .open_stream(&ChatId::from("c"), Vec::new(), &cancel)
            .await
            .unwrap();

        assert_eq!(stream.next_delta().await.unwrap().as_deref(), Some("Hello, "));
        assert_eq!(stream.next_delta().await.unwrap().as_deref(), Some("world"));
        assert_eq!(stream.next_delta().await.unwrap(), None);
        assert!(stream.structured_content().is_none());
    }

    #[tokio::test]
    async fn cancellation_interrupts_delay() {
        let agent = ScriptedAgent::with_script(
            "default",
            Script::new().delay(Duration::from_secs(60)).delta("late"),
        );
        let cancel = CancellationToken::new();
        let mut stream = agent
            .open_stream(&ChatId::from("c"), Vec::new(), &cancel)
            .await
            .unwrap();

        cancel.cancel();
        assert!(matches!(
            stream.next_delta().await,
            Err(AgentError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn mid_stream_failure_surfaces() {
        let agent = ScriptedAgent::with_script(
            "default",
            Script::new().delta("partial").fail("provider 500"),
        );
        let cancel = CancellationToken::new();
        let mut stream = agent
            .open_stream(&ChatId::from("c"), Vec::new(), &cancel)
            .await
            .unwrap();

        assert_eq!(stream.next_delta().await.unwrap().as_deref(), Some("partial"));
        assert!(matches!(
            stream.next_delta().await,
            Err(AgentError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn delta_stream_adapter_yields_all_fragments() {
        use futures_util::StreamExt;

        let agent = ScriptedAgent::with_script(
            "default",
            Script::new().deltas(["a", "b", "c"]),
        );
        let cancel = CancellationToken::new();
        let stream = agent
            .open_stream(&ChatId::from("c"), Vec::new(), &cancel)
            .await
            .unwrap();

        let collected: Vec<String> = crate::agent::delta_stream(stream)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(collected, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn exhausted_scripts_fail_open() {
        let agent = ScriptedAgent::new("default");
        let cancel = CancellationToken::new();
        assert!(agent
            .open_stream(&ChatId::from("c"), Vec::new(), &cancel)
            .await
            .is_err());
    }
}
