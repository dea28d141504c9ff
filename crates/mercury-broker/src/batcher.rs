//! Event fan-in and per-chat micro-batching.
//!
//! Producers push `ChatEvent`s into one mpsc channel. The dispatcher groups
//! them by chat id and flushes a chat's buffer when the buffer window
//! elapses or the count threshold is hit, whichever first. Every flush is
//! processed on its own task so one slow chat never stalls the rest.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, OnceCell};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mercury_agent::agent::AgentFactory;
use mercury_chat::{Chat, ChatDeps};
use mercury_core::config::MercuryConfig;
use mercury_core::error::Result;
use mercury_core::event::ChatEvent;
use mercury_core::types::ChatId;
use mercury_messenger::Messenger;
use mercury_store::{ExpiringStore, Ttl};

use crate::access::AccessChecker;
use crate::commands::{ActionProcessor, ChatCommandDispatcher, ScreenshotProvider};
use crate::executor::ChatBatchExecutor;

/// Sent once to a chat that is not on the allow list.
const REJECTION_TEXT: &str = "Access denied. Ask the administrator to add you.";
/// Display name used for assistant messages.
const BOT_NAME: &str = "assistant";

/// Everything the per-chat processor wires into new chats.
pub struct ProcessorDeps {
    pub config: MercuryConfig,
    pub store: Arc<ExpiringStore>,
    pub messenger: Arc<dyn Messenger>,
    pub agent_factory: Arc<dyn AgentFactory>,
    pub dispatcher: Arc<dyn ChatCommandDispatcher>,
    pub actions: Arc<dyn ActionProcessor>,
    pub screenshots: Option<Arc<dyn ScreenshotProvider>>,
}

/// Consumes flushed batches: access check, lazy chat construction, batch
/// execution. Chats and executors are created behind one-shot cells; a
/// failed creation is evicted so a later batch may retry.
pub struct ChatEventProcessor {
    deps: ProcessorDeps,
    access: AccessChecker,
    executors: DashMap<ChatId, Arc<OnceCell<Arc<ChatBatchExecutor>>>>,
}

impl ChatEventProcessor {
    pub fn new(deps: ProcessorDeps) -> Self {
        let access = AccessChecker::new(&deps.config.access);
        Self {
            deps,
            access,
            executors: DashMap::new(),
        }
    }

    pub fn access(&self) -> &AccessChecker {
        &self.access
    }

    /// Executor for a chat, if one was already created.
    pub fn executor(&self, chat_id: &ChatId) -> Option<Arc<ChatBatchExecutor>> {
        self.executors
            .get(chat_id)
            .and_then(|cell| cell.get().cloned())
    }

    /// Handle one flushed micro-batch for one chat.
    pub async fn process_chat_events(
        &self,
        chat_id: ChatId,
        events: Vec<ChatEvent>,
        ct: &CancellationToken,
    ) {
        let username = events
            .iter()
            .find_map(|e| e.username())
            .unwrap_or("_")
            .to_string();

        let visitor = self.access.check(&chat_id, &username).await;
        if !visitor.access_granted {
            info!(chat = %chat_id, username = %visitor.username, "access denied");
            if let Err(e) = self
                .deps
                .messenger
                .send_text(&chat_id, REJECTION_TEXT, None)
                .await
            {
                warn!(chat = %chat_id, error = %e, "failed to send rejection");
            }
            return;
        }

        let executor = match self.executor_for(&chat_id, visitor.premium).await {
            Ok(executor) => executor,
            Err(e) => {
                warn!(chat = %chat_id, error = %e, "failed to create chat");
                return;
            }
        };

        match executor.execute_batch(events, ct).await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                debug!(chat = %chat_id, "batch preempted by newer events");
            }
            Err(e) => warn!(chat = %chat_id, error = %e, "batch execution failed"),
        }
    }

    async fn executor_for(
        &self,
        chat_id: &ChatId,
        premium: bool,
    ) -> Result<Arc<ChatBatchExecutor>> {
        let cell = self
            .executors
            .entry(chat_id.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let built = cell
            .get_or_try_init(|| async {
                let state_ttl = if premium {
                    Ttl::Never
                } else {
                    Ttl::After(self.deps.config.chat.cache_ttl())
                };
                let chat = Arc::new(Chat::new(
                    chat_id.clone(),
                    self.deps.config.modes.default_mode.clone(),
                    ChatDeps {
                        store: self.deps.store.clone(),
                        messenger: self.deps.messenger.clone(),
                        agent_factory: self.deps.agent_factory.clone(),
                        state_ttl,
                        bot_name: BOT_NAME.to_string(),
                    },
                ));
                chat.start().await;
                info!(chat = %chat_id, premium, "chat created");
                Ok::<_, mercury_core::MercuryError>(Arc::new(ChatBatchExecutor::new(
                    chat,
                    self.deps.dispatcher.clone(),
                    self.deps.actions.clone(),
                    self.deps.screenshots.clone(),
                )))
            })
            .await;

        match built {
            Ok(executor) => Ok(executor.clone()),
            Err(e) => {
                // Evict the poisoned cell so the next batch can retry.
                self.executors.remove(chat_id);
                Err(e)
            }
        }
    }
}

/// The fan-in front door: hand out senders to producers, buffer per chat,
/// flush on `(interval, max_events)`.
pub struct EventBatcher {
    tx: mpsc::Sender<ChatEvent>,
    shutdown: CancellationToken,
}

impl EventBatcher {
    pub fn start(processor: Arc<ChatEventProcessor>) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let shutdown = CancellationToken::new();
        let interval = processor.deps.config.batcher.interval();
        let max_events = processor.deps.config.batcher.max_events;
        tokio::spawn(run_dispatcher(
            rx,
            processor,
            interval,
            max_events,
            shutdown.clone(),
        ));
        Self { tx, shutdown }
    }

    /// A new producer handle. Each producer keeps its own sender; dropping
    /// it stops only that producer.
    pub fn sender(&self) -> mpsc::Sender<ChatEvent> {
        self.tx.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for EventBatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct PendingBuffer {
    events: Vec<ChatEvent>,
    deadline: Instant,
}

async fn run_dispatcher(
    mut rx: mpsc::Receiver<ChatEvent>,
    processor: Arc<ChatEventProcessor>,
    interval: std::time::Duration,
    max_events: usize,
    shutdown: CancellationToken,
) {
    let mut buffers: HashMap<ChatId, PendingBuffer> = HashMap::new();

    loop {
        let next_deadline = buffers.values().map(|b| b.deadline).min();
        let until_deadline = async {
            match next_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                None => break,
                Some(event) => {
                    let chat_id = event.chat_id.clone();
                    let should_flush = {
                        let buffer = buffers.entry(chat_id.clone()).or_insert_with(|| {
                            PendingBuffer {
                                events: Vec::new(),
                                deadline: Instant::now() + interval,
                            }
                        });
                        buffer.events.push(event);
                        buffer.events.len() >= max_events
                    };
                    if should_flush {
                        flush(&mut buffers, &chat_id, &processor, &shutdown);
                    }
                }
            },
            _ = until_deadline => {
                let now = Instant::now();
                let due: Vec<ChatId> = buffers
                    .iter()
                    .filter(|(_, b)| b.deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for chat_id in due {
                    flush(&mut buffers, &chat_id, &processor, &shutdown);
                }
            }
        }
    }

    // Drain whatever is still buffered before stopping.
    let remaining: Vec<ChatId> = buffers.keys().cloned().collect();
    for chat_id in remaining {
        flush(&mut buffers, &chat_id, &processor, &shutdown);
    }
    debug!("event batcher dispatcher stopped");
}

fn flush(
    buffers: &mut HashMap<ChatId, PendingBuffer>,
    chat_id: &ChatId,
    processor: &Arc<ChatEventProcessor>,
    shutdown: &CancellationToken,
) {
    let Some(buffer) = buffers.remove(chat_id) else {
        return;
    };
    if buffer.events.is_empty() {
        return;
    }
    debug!(chat = %chat_id, count = buffer.events.len(), "flushing batch");
    let processor = processor.clone();
    let chat_id = chat_id.clone();
    let ct = shutdown.child_token();
    tokio::spawn(async move {
        processor.process_chat_events(chat_id, buffer.events, &ct).await;
    });
}

/// Bridge store expirations back into the event stream as `Expire` events
/// for the owning chat.
pub fn spawn_expiration_bridge(
    store: &ExpiringStore,
    tx: mpsc::Sender<ChatEvent>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut expirations = store.expirations();
    tokio::spawn(async move {
        let mut order: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = expirations.recv() => match received {
                    Ok(expiration) => {
                        let Some(chat_id) = expiration.key.strip_suffix("_state") else {
                            continue;
                        };
                        let event = ChatEvent::new(
                            chat_id,
                            order,
                            mercury_core::event::EventKind::Expire,
                        );
                        order += 1;
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "expiration bridge lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("expiration bridge stopped");
    })
}
