use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::Serialize;
use tracing::error;

use crate::models::MessageState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// A message was added to the conversation.
    Appended,
    /// The in-flight message grew by one chunk.
    Chunk,
    /// The in-flight message was sealed (completed, truncated or error-marked).
    Completed,
}

/// One conversation mutation as seen by listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Update {
    pub index: usize,
    pub content: String,
    pub complete: bool,
    pub kind: UpdateKind,
    pub state: MessageState,
}

pub type Listener = Arc<dyn Fn(&Update) + Send + Sync>;

/// Listener registry. Safe to (un)subscribe while updates are being published.
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl Subscribers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, listener: impl Fn(&Update) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, Arc::new(listener)));
        Subscription { id, subscribers: Arc::downgrade(self) }
    }

    /// Calls every listener registered at the time of the call.
    /// The registry lock is not held while listeners run. A panicking listener
    /// misses this update but stays registered.
    pub fn publish(&self, update: &Update) {
        let listeners: Vec<(u64, Listener)> =
            self.lock().iter().map(|(id, l)| (*id, Arc::clone(l))).collect();
        for (id, listener) in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(update))).is_err() {
                error!(listener = id, index = update.index, kind = ?update.kind, "Listener panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.lock().retain(|(existing, _)| *existing != id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Listener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Subscribers>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    /// Keeps the listener registered for as long as the session lives.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.remove(self.id);
        }
    }
}
