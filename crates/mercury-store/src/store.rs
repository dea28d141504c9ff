//! Shared expiring store for per-chat state.
//!
//! Entries carry a per-instance TTL. Expiration marks an entry (it does not
//! remove it) and notifies subscribers at most once per stored instance; the
//! consumer decides whether to refresh or remove. The only authority for
//! chat state lives here; nothing is persisted across restarts.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

/// Time-to-live for one stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// The entry never expires.
    Never,
    /// The entry expires this long after the `set`.
    After(Duration),
}

impl From<Duration> for Ttl {
    fn from(d: Duration) -> Self {
        Ttl::After(d)
    }
}

/// Notification that an entry reached its deadline. The entry is still in
/// the store when this is observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiration {
    pub key: String,
}

struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    deadline: Option<Instant>,
    /// Monotonically increasing per-`set` id; an expiration is attributed to
    /// exactly one instance, so a concurrent `set` wins over the sweeper.
    instance: u64,
    expired: bool,
}

/// Keyed cache with per-entry TTL and an at-most-once expiration stream.
pub struct ExpiringStore {
    entries: Arc<DashMap<String, Entry>>,
    events: Mutex<Option<broadcast::Sender<Expiration>>>,
    instance_seq: AtomicU64,
    disposed: Arc<AtomicBool>,
    sweep_guard: Arc<AtomicBool>,
    sweeper: CancellationToken,
}

impl ExpiringStore {
    /// Create the store and start its background sweeper.
    pub fn new(check_interval: Duration) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        let store = Arc::new(Self {
            entries: Arc::new(DashMap::new()),
            events: Mutex::new(Some(event_tx)),
            instance_seq: AtomicU64::new(0),
            disposed: Arc::new(AtomicBool::new(false)),
            sweep_guard: Arc::new(AtomicBool::new(false)),
            sweeper: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&store);
        let cancel = store.sweeper.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(store) = weak.upgrade() else { break };
                store.sweep();
            }
            debug!("store sweeper stopped");
        });

        store
    }

    /// Insert or overwrite an entry.
    pub fn set<T: Any + Send + Sync>(&self, key: &str, value: T, ttl: Ttl) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StoreError::Disposed);
        }
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }

        let deadline = match ttl {
            Ttl::Never => None,
            Ttl::After(d) => Some(Instant::now() + d),
        };
        let instance = self.instance_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Arc::new(value),
                deadline,
                instance,
                expired: false,
            },
        );
        Ok(())
    }

    /// Typed read. Returns `None` when the key is absent, the store is
    /// closed, or the stored value has a different type (logged, soft).
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }
        let value = self.entries.get(key)?.value.clone();
        match value.downcast::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, expected = std::any::type_name::<T>(), "store type mismatch");
                None
            }
        }
    }

    /// Remove an entry. Silently reports absence after close.
    pub fn remove(&self, key: &str) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        !self.disposed.load(Ordering::Acquire) && self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the current keys.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Subscribe to expiration notifications. Any number of subscribers may
    /// listen; each stored instance produces at most one event total.
    pub fn expirations(&self) -> broadcast::Receiver<Expiration> {
        match &*self.events.lock().unwrap() {
            Some(tx) => tx.subscribe(),
            None => {
                // Closed: hand back an already-completed stream.
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    /// The expiration sequence as a `futures` stream.
    pub fn expirations_stream(&self) -> BroadcastStream<Expiration> {
        BroadcastStream::new(self.expirations())
    }

    /// One sweep pass. Overlapping invocations are dropped.
    ///
    /// An entry is marked expired only when the instance observed during the
    /// scan is still the one in the store, so a racing `set` always wins.
    pub fn sweep(&self) {
        if self.sweep_guard.swap(true, Ordering::AcqRel) {
            return;
        }

        let now = Instant::now();
        let due: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|e| !e.expired && e.deadline.is_some_and(|d| d <= now))
            .map(|e| (e.key().clone(), e.instance))
            .collect();

        for (key, instance) in due {
            let mut fired = false;
            if let Some(mut entry) = self.entries.get_mut(&key) {
                if entry.instance == instance && !entry.expired {
                    entry.expired = true;
                    fired = true;
                }
            }
            if fired {
                debug!(key = %key, "entry expired");
                let tx = self.events.lock().unwrap().clone();
                if let Some(tx) = tx {
                    let _ = tx.send(Expiration { key });
                }
            }
        }

        self.sweep_guard.store(false, Ordering::Release);
    }

    /// Stop the sweeper, complete the expiration stream, clear all entries.
    /// Subsequent `set` calls fail; reads report absence.
    pub fn close(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sweeper.cancel();
        self.events.lock().unwrap().take();
        self.entries.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for ExpiringStore {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    const SWEEP: Duration = Duration::from_millis(50);

    #[tokio::test(start_paused = true)]
    async fn set_get_roundtrip() {
        let store = ExpiringStore::new(SWEEP);
        store.set("k", String::from("v"), Ttl::Never).unwrap();
        assert_eq!(store.get::<String>("k").as_deref(), Some(&"v".to_string()));
        assert!(store.contains("k"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.keys(), vec!["k".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn typed_get_mismatch_is_soft_none() {
        let store = ExpiringStore::new(SWEEP);
        store.set("k", 7_u32, Ttl::Never).unwrap();
        assert!(store.get::<String>("k").is_none());
        // The entry itself is untouched.
        assert_eq!(store.get::<u32>("k").as_deref(), Some(&7));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_key_rejected() {
        let store = ExpiringStore::new(SWEEP);
        assert_eq!(store.set("", 1_u8, Ttl::Never), Err(StoreError::EmptyKey));
    }

    #[tokio::test(start_paused = true)]
    async fn close_semantics() {
        let store = ExpiringStore::new(SWEEP);
        store.set("k", 1_u8, Ttl::Never).unwrap();
        store.close();

        assert_eq!(store.set("x", 1_u8, Ttl::Never), Err(StoreError::Disposed));
        assert!(store.get::<u8>("k").is_none());
        assert!(!store.remove("k"));
        assert!(!store.contains("k"));

        // The expiration stream is completed.
        let mut rx = store.expirations();
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expiration_fires_once_and_keeps_entry() {
        let store = ExpiringStore::new(SWEEP);
        let mut rx = store.expirations();

        store
            .set("k", String::from("v"), Ttl::After(Duration::from_millis(10)))
            .unwrap();

        let ev = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("expiration within 2s")
            .unwrap();
        assert_eq!(ev.key, "k");

        // Mark-and-notify: the entry is still readable.
        assert_eq!(store.get::<String>("k").as_deref(), Some(&"v".to_string()));

        // No second event for the same instance.
        sleep(Duration::from_millis(500)).await;
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_with_never_suppresses_further_events() {
        let store = ExpiringStore::new(SWEEP);
        let mut rx = store.expirations();

        store
            .set("k", 1_u8, Ttl::After(Duration::from_millis(10)))
            .unwrap();
        let ev = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev.key, "k");

        // Consumer refreshes: a new never-expiring instance.
        store.set("k", 2_u8, Ttl::Never).unwrap();
        sleep(Duration::from_millis(500)).await;
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        // Removal never emits.
        assert!(store.remove("k"));
        sleep(Duration::from_millis(500)).await;
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn new_instance_expires_independently() {
        let store = ExpiringStore::new(SWEEP);
        let mut rx = store.expirations();

        store.set("k", 1_u8, Ttl::After(Duration::from_millis(10))).unwrap();
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();

        // A fresh instance under the same key gets its own notification.
        store.set("k", 2_u8, Ttl::After(Duration::from_millis(10))).unwrap();
        let ev = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev.key, "k");
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_sweep_is_dropped() {
        let store = ExpiringStore::new(SWEEP);
        store.sweep_guard.store(true, Ordering::Release);
        store
            .set("k", 1_u8, Ttl::After(Duration::from_millis(1)))
            .unwrap();
        sleep(Duration::from_millis(5)).await;
        store.sweep(); // guard held, no-op
        assert!(!store.entries.get("k").unwrap().expired);

        store.sweep_guard.store(false, Ordering::Release);
        store.sweep();
        assert!(store.entries.get("k").unwrap().expired);
    }
}
