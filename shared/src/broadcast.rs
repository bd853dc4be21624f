//! In-process pub/sub for settled save-state changes.
//!
//! Screens hold their own copy of the saved set; the broadcaster is how a
//! toggle on one screen reaches the others. Handlers registered when
//! [`ConsistencyBroadcaster::publish`] is called each run exactly once, in
//! subscription order, one after another.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, trace};

use crate::event::SaveEvent;

#[async_trait]
pub trait SaveEventHandler: Send + Sync {
    async fn on_save_event(&self, event: &SaveEvent);
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> SaveEventHandler for FnHandler<F>
where
    F: Fn(&SaveEvent) + Send + Sync,
{
    async fn on_save_event(&self, event: &SaveEvent) {
        (self.0)(event);
    }
}

type HandlerList = Vec<(u64, Arc<dyn SaveEventHandler>)>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    handlers: Mutex<HandlerList>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HandlerList> {
        // A handler never runs under this lock, so a poisoned guard still
        // holds a consistent list.
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: u64) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }
}

/// Cloneable handle; every clone shares one registry.
#[derive(Clone, Default)]
pub struct ConsistencyBroadcaster {
    registry: Arc<Registry>,
}

impl ConsistencyBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Arc<dyn SaveEventHandler>) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.lock().push((id, handler));
        debug!(subscription_id = id, "save-event subscriber added");
        Subscription {
            id,
            registry: Some(Arc::downgrade(&self.registry)),
        }
    }

    /// Registers a synchronous callback.
    pub fn subscribe_fn<F>(&self, f: F) -> Subscription
    where
        F: Fn(&SaveEvent) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnHandler(f)))
    }

    /// Delivers `event` to every current subscriber and returns how many
    /// handlers ran.
    pub async fn publish(&self, event: &SaveEvent) -> usize {
        let snapshot: Vec<Arc<dyn SaveEventHandler>> =
            self.registry.lock().iter().map(|(_, h)| Arc::clone(h)).collect();

        trace!(event = %event, subscribers = snapshot.len(), "publishing save event");
        for handler in &snapshot {
            handler.on_save_event(event).await;
        }
        snapshot.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().len()
    }
}

impl fmt::Debug for ConsistencyBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsistencyBroadcaster")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Option<Weak<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) else {
            return false;
        };
        let active = registry.lock().iter().any(|(id, _)| *id == self.id);
        active
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|w| w.upgrade()) {
            if registry.remove(self.id) {
                debug!(subscription_id = self.id, "save-event subscriber removed");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
