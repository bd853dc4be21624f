//! Saved-listing state with optimistic toggles.
//!
//! `SaveStateStore` owns the signed-in user's saved set. A toggle flips the
//! local value before the backend call, then commits or rolls back when the
//! call settles; only a committed change is announced on the broadcaster.
//! Confirmed membership follows whichever backend call settled last, while
//! the displayed value follows the newest call still in flight.
//! Each screen keeps its own [`SavedScreenCache`] and re-fetches when an
//! announcement arrives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::broadcast::{ConsistencyBroadcaster, SaveEventHandler, Subscription};
use crate::capabilities::{
    IdentityProvider, KeyNamespace, KeyValueStore, KvKey, SavedPropertiesApi,
};
use crate::event::{SaveAction, SaveEvent};
use crate::model::{PropertyId, UnixTimeMs, UserId};
use crate::offline_store::{load_snapshot, save_snapshot, StoreError};
use crate::{get_current_time_ms, AppError, ErrorKind};

const SNAPSHOT_KIND: &str = "saved_set";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaveState {
    Unsaved,
    Saved,
    /// Locally saved, backend call in flight.
    OptimisticSaved { mutation_id: String, previous: bool },
    /// Locally unsaved, backend call in flight.
    OptimisticUnsaved { mutation_id: String, previous: bool },
}

impl SaveState {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveState::Saved | SaveState::OptimisticSaved { .. })
    }

    pub fn is_pending(&self) -> bool {
        self.mutation_id().is_some()
    }

    pub fn mutation_id(&self) -> Option<&str> {
        match self {
            SaveState::OptimisticSaved { mutation_id, .. }
            | SaveState::OptimisticUnsaved { mutation_id, .. } => Some(mutation_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct OptimisticMutation {
    mutation_id: String,
    original: bool,
    target: bool,
    created_at_ms: u64,
}

impl OptimisticMutation {
    fn new(original: bool) -> Self {
        Self {
            mutation_id: Uuid::new_v4().to_string(),
            original,
            target: !original,
            created_at_ms: get_current_time_ms(),
        }
    }
}

#[derive(Debug, Default)]
struct SavedSetState {
    user: Option<UserId>,
    /// Membership confirmed by the backend.
    settled: BTreeSet<PropertyId>,
    /// In-flight toggles per property, oldest first.
    pending: HashMap<PropertyId, Vec<OptimisticMutation>>,
}

impl SavedSetState {
    /// Drops everything held for a previous user.
    fn ensure_user(&mut self, user: &UserId) {
        if self.user.as_ref() != Some(user) {
            if let Some(previous) = &self.user {
                debug!(previous = %previous, current = %user, "signed-in user changed, discarding saved set");
            }
            *self = Self {
                user: Some(user.clone()),
                ..Self::default()
            };
        }
    }

    fn state_of(&self, id: &PropertyId) -> SaveState {
        match self.pending.get(id).and_then(|chain| chain.last()) {
            Some(m) if m.target => SaveState::OptimisticSaved {
                mutation_id: m.mutation_id.clone(),
                previous: m.original,
            },
            Some(m) => SaveState::OptimisticUnsaved {
                mutation_id: m.mutation_id.clone(),
                previous: m.original,
            },
            None if self.settled.contains(id) => SaveState::Saved,
            None => SaveState::Unsaved,
        }
    }

    fn effective(&self) -> BTreeSet<PropertyId> {
        overlay(self.settled.clone(), &self.pending)
    }

    /// Stops tracking one in-flight call. False when it was not tracked,
    /// which happens after a user switch.
    fn finish(&mut self, id: &PropertyId, mutation_id: &str) -> bool {
        let Some(chain) = self.pending.get_mut(id) else {
            return false;
        };
        let before = chain.len();
        chain.retain(|m| m.mutation_id != mutation_id);
        let found = chain.len() != before;
        if chain.is_empty() {
            self.pending.remove(id);
        }
        found
    }

    fn set_settled(&mut self, id: &PropertyId, saved: bool) {
        if saved {
            self.settled.insert(id.clone());
        } else {
            self.settled.remove(id);
        }
    }
}

fn overlay(
    mut ids: BTreeSet<PropertyId>,
    pending: &HashMap<PropertyId, Vec<OptimisticMutation>>,
) -> BTreeSet<PropertyId> {
    for (id, m) in pending.iter().filter_map(|(id, chain)| Some((id, chain.last()?))) {
        if m.target {
            ids.insert(id.clone());
        } else {
            ids.remove(id);
        }
    }
    ids
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct SavedSnapshot {
    user_id: UserId,
    ids: BTreeSet<PropertyId>,
    fetched_at: UnixTimeMs,
}

enum Settle {
    Committed,
    RolledBack,
    Discarded,
}

pub struct SaveStateStore {
    api: Arc<dyn SavedPropertiesApi>,
    identity: Arc<dyn IdentityProvider>,
    kv: Arc<dyn KeyValueStore>,
    broadcaster: ConsistencyBroadcaster,
    state: Mutex<SavedSetState>,
}

impl SaveStateStore {
    pub fn new(
        api: Arc<dyn SavedPropertiesApi>,
        identity: Arc<dyn IdentityProvider>,
        kv: Arc<dyn KeyValueStore>,
        broadcaster: ConsistencyBroadcaster,
    ) -> Self {
        Self {
            api,
            identity,
            kv,
            broadcaster,
            state: Mutex::new(SavedSetState::default()),
        }
    }

    pub fn broadcaster(&self) -> &ConsistencyBroadcaster {
        &self.broadcaster
    }

    fn lock(&self) -> MutexGuard<'_, SavedSetState> {
        // Never held across an await; a poisoned guard is still coherent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetches the authoritative saved set for the current user.
    ///
    /// Never fails: without a user the set is empty, and a backend error
    /// falls back to the last persisted snapshot. Toggles still in flight
    /// are applied on top of whatever is returned.
    #[instrument(skip(self))]
    pub async fn list_saved_ids(&self) -> BTreeSet<PropertyId> {
        let Some(user) = self.identity.current_user() else {
            *self.lock() = SavedSetState::default();
            return BTreeSet::new();
        };

        match self.api.list_saved_ids(&user).await {
            Ok(ids) if self.identity.current_user().as_ref() != Some(&user) => {
                debug!(user_id = %user, "signed-in user changed during fetch, result not applied");
                ids
            }
            Ok(ids) => {
                let effective = {
                    let mut state = self.lock();
                    state.ensure_user(&user);
                    state.settled = ids.clone();
                    state.effective()
                };
                debug!(user_id = %user, count = ids.len(), "saved set refreshed");
                self.persist(&user, ids).await;
                effective
            }
            Err(e) => {
                warn!(user_id = %user, error = %e, "saved list fetch failed, using snapshot");
                let snapshot = self.load(&user).await.unwrap_or_default();
                let state = self.lock();
                if state.user.as_ref() == Some(&user) {
                    overlay(snapshot, &state.pending)
                } else {
                    snapshot
                }
            }
        }
    }

    /// Current local membership, optimistic values included.
    pub fn is_saved(&self, id: &PropertyId) -> bool {
        self.state_of(id).is_saved()
    }

    pub fn state_of(&self, id: &PropertyId) -> SaveState {
        let current = self.identity.current_user();
        let state = self.lock();
        if current.is_some() && state.user == current {
            state.state_of(id)
        } else {
            SaveState::Unsaved
        }
    }

    /// Local view of the saved set without a network round trip.
    pub fn saved_ids(&self) -> BTreeSet<PropertyId> {
        let current = self.identity.current_user();
        let state = self.lock();
        if current.is_some() && state.user == current {
            state.effective()
        } else {
            BTreeSet::new()
        }
    }

    /// Flips membership of `id` and returns the new value once the backend
    /// accepts it.
    ///
    /// The flip is visible through [`Self::is_saved`] before the backend is
    /// contacted. On failure the pre-toggle value is restored and the error
    /// returned. When toggles of the same id overlap, every successful call
    /// records its result as it settles, so the call that settles last
    /// decides the confirmed value.
    #[instrument(skip(self, id), fields(property_id = %id))]
    pub async fn toggle(&self, id: &PropertyId) -> Result<bool, AppError> {
        let user = self.identity.current_user().ok_or_else(|| {
            AppError::new(ErrorKind::Authentication, "Sign in to save properties")
                .with_context("property_id", id.as_str())
        })?;

        let mutation = {
            let mut state = self.lock();
            state.ensure_user(&user);
            let current = state.state_of(id).is_saved();
            let mutation = OptimisticMutation::new(current);
            state.pending.entry(id.clone()).or_default().push(mutation.clone());
            mutation
        };

        let result = if mutation.target {
            self.api.save_property(&user, id).await
        } else {
            self.api.unsave_property(&user, id).await
        };

        let (settle, snapshot) = {
            let mut state = self.lock();
            let tracked = state.user.as_ref() == Some(&user)
                && state.finish(id, &mutation.mutation_id);

            let settle = match (&result, tracked) {
                (_, false) => Settle::Discarded,
                (Ok(()), true) => {
                    state.set_settled(id, mutation.target);
                    Settle::Committed
                }
                // Confirmed membership is untouched, so dropping the call
                // restores the value shown before it.
                (Err(_), true) => Settle::RolledBack,
            };
            (settle, state.settled.clone())
        };

        let elapsed_ms = get_current_time_ms().saturating_sub(mutation.created_at_ms);
        match result {
            Ok(()) => {
                if matches!(settle, Settle::Committed) {
                    info!(saved = mutation.target, elapsed_ms, "save toggle committed");
                    self.persist(&user, snapshot).await;
                    let event = SaveEvent {
                        property_id: id.clone(),
                        action: SaveAction::from_saved(mutation.target),
                    };
                    self.broadcaster.publish(&event).await;
                } else {
                    debug!(user_id = %user, "toggle settled after sign-out or user switch");
                }
                Ok(mutation.target)
            }
            Err(e) => {
                if matches!(settle, Settle::RolledBack) {
                    warn!(error = %e, restored = mutation.original, elapsed_ms, "save toggle rolled back");
                } else {
                    debug!(error = %e, "toggle failed after sign-out or user switch");
                }
                Err(AppError::from(e).with_context("property_id", id.as_str()))
            }
        }
    }

    /// Warms the local set from the persisted snapshot. Returns whether a
    /// snapshot was applied; state already fetched this session is kept.
    #[instrument(skip(self))]
    pub async fn restore_snapshot(&self) -> bool {
        let Some(user) = self.identity.current_user() else {
            return false;
        };
        let Some(ids) = self.load(&user).await else {
            return false;
        };

        let mut state = self.lock();
        state.ensure_user(&user);
        if !state.settled.is_empty() {
            return false;
        }
        debug!(user_id = %user, count = ids.len(), "saved set restored from snapshot");
        state.settled = ids;
        true
    }

    /// Sign-out: forgets the in-memory set and the user's snapshot.
    #[instrument(skip(self))]
    pub async fn clear(&self) {
        let user = {
            let mut state = self.lock();
            let held = state.user.take();
            *state = SavedSetState::default();
            held
        }
        .or_else(|| self.identity.current_user());

        let Some(user) = user else { return };
        let key = match snapshot_key(&user) {
            Ok(key) => key,
            Err(e) => {
                warn!(user_id = %user, error = %e, "no valid snapshot key for user");
                return;
            }
        };
        if let Err(e) = self.kv.delete(&key).await {
            error!(user_id = %user, error = %e, "failed to delete saved-set snapshot");
        }
    }

    async fn persist(&self, user: &UserId, ids: BTreeSet<PropertyId>) {
        let snapshot = SavedSnapshot {
            user_id: user.clone(),
            ids,
            fetched_at: UnixTimeMs::now(),
        };
        let result = match snapshot_key(user) {
            Ok(key) => save_snapshot(self.kv.as_ref(), &key, SNAPSHOT_KIND, &snapshot).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(user_id = %user, error = %e, "failed to persist saved-set snapshot");
        }
    }

    async fn load(&self, user: &UserId) -> Option<BTreeSet<PropertyId>> {
        let key = snapshot_key(user).ok()?;
        match load_snapshot::<SavedSnapshot>(self.kv.as_ref(), &key, SNAPSHOT_KIND).await {
            Ok(Some(snapshot)) if snapshot.user_id == *user => Some(snapshot.ids),
            Ok(Some(_)) => {
                warn!(user_id = %user, "saved-set snapshot belongs to another user");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(user_id = %user, error = %e, "saved-set snapshot unreadable");
                None
            }
        }
    }
}

fn snapshot_key(user: &UserId) -> Result<KvKey, StoreError> {
    Ok(KvKey::new(KeyNamespace::Saved, user.as_str())?)
}

/// A screen's own copy of the saved set.
///
/// Mounting subscribes to the store's broadcaster and fetches once; every
/// announced change triggers another fetch. Unmounting (or dropping) stops
/// the updates.
pub struct SavedScreenCache {
    store: Arc<SaveStateStore>,
    ids: Arc<RwLock<BTreeSet<PropertyId>>>,
    subscription: Option<Subscription>,
}

struct RefetchOnSave {
    store: Weak<SaveStateStore>,
    ids: Weak<RwLock<BTreeSet<PropertyId>>>,
}

#[async_trait]
impl SaveEventHandler for RefetchOnSave {
    async fn on_save_event(&self, event: &SaveEvent) {
        let (Some(store), Some(ids)) = (self.store.upgrade(), self.ids.upgrade()) else {
            return;
        };
        debug!(event = %event, "refetching saved set for screen");
        let fresh = store.list_saved_ids().await;
        replace(&ids, fresh);
    }
}

fn replace(ids: &RwLock<BTreeSet<PropertyId>>, fresh: BTreeSet<PropertyId>) {
    match ids.write() {
        Ok(mut guard) => *guard = fresh,
        Err(poisoned) => *poisoned.into_inner() = fresh,
    }
}

impl SavedScreenCache {
    pub async fn mount(store: Arc<SaveStateStore>) -> Self {
        let ids = Arc::new(RwLock::new(BTreeSet::new()));
        let subscription = store.broadcaster().subscribe(Arc::new(RefetchOnSave {
            store: Arc::downgrade(&store),
            ids: Arc::downgrade(&ids),
        }));
        let cache = Self {
            store,
            ids,
            subscription: Some(subscription),
        };
        cache.on_focus().await;
        cache
    }

    /// Screen regained focus; pull the authoritative set again.
    pub async fn on_focus(&self) {
        let fresh = self.store.list_saved_ids().await;
        replace(&self.ids, fresh);
    }

    pub fn contains(&self, id: &PropertyId) -> bool {
        self.ids.read().map(|ids| ids.contains(id)).unwrap_or(false)
    }

    pub fn ids(&self) -> BTreeSet<PropertyId> {
        self.ids.read().map(|ids| ids.clone()).unwrap_or_default()
    }

    pub fn is_mounted(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn unmount(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}
