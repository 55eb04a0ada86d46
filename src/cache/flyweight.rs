//! Generic concurrent flyweight cache: one shared value per key, built at most
//! once at a time, evicted only when nobody outside the cache holds it.
//!
//! Each key maps to a slot. Claiming a slot is a single check-then-insert under
//! the map lock; the load itself runs with the map lock released, and callers
//! that find a slot still loading wait on that slot alone.

use std::hash::Hash;
use std::pin::pin;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;

/// Lets the cache produce an error for a load that ended without a result
/// (its job was dropped or panicked).
pub trait Abandon<K> {
    fn abandoned(key: &K) -> Self;
}

enum SlotState<V, E> {
    Loading,
    Ready(Arc<V>),
    Failed(E),
}

struct Slot<V, E> {
    state: Mutex<SlotState<V, E>>,
    ready: Condvar,
    notify: Notify,
}

impl<V, E: Clone> Slot<V, E> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Loading),
            ready: Condvar::new(),
            notify: Notify::new(),
        })
    }

    fn resolve(&self, state: SlotState<V, E>) {
        *self.state.lock() = state;
        self.ready.notify_all();
        self.notify.notify_waiters();
    }

    fn try_result(&self) -> Option<Result<Arc<V>, E>> {
        match &*self.state.lock() {
            SlotState::Loading => None,
            SlotState::Ready(value) => Some(Ok(Arc::clone(value))),
            SlotState::Failed(err) => Some(Err(err.clone())),
        }
    }

    fn ready_value(&self) -> Option<Arc<V>> {
        match &*self.state.lock() {
            SlotState::Ready(value) => Some(Arc::clone(value)),
            _ => None,
        }
    }

    fn wait(&self) -> Result<Arc<V>, E> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                SlotState::Loading => self.ready.wait(&mut state),
                SlotState::Ready(value) => return Ok(Arc::clone(value)),
                SlotState::Failed(err) => return Err(err.clone()),
            }
        }
    }
}

struct Entry<V, E> {
    slot: Arc<Slot<V, E>>,
    reserved: bool,
}

type Map<K, V, E> = FxHashMap<K, Entry<V, E>>;

/// Shared handle to one load. Every caller that asks for the same key while
/// it is loading gets a handle to the same slot.
pub struct LoadHandle<V, E> {
    slot: Arc<Slot<V, E>>,
}

impl<V, E> Clone for LoadHandle<V, E> {
    fn clone(&self) -> Self {
        Self { slot: Arc::clone(&self.slot) }
    }
}

impl<V, E> std::fmt::Debug for LoadHandle<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadHandle")
            .field("slot", &Arc::as_ptr(&self.slot))
            .finish()
    }
}

impl<V, E: Clone> LoadHandle<V, E> {
    /// Whether both handles observe the same load.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    pub fn is_completed(&self) -> bool {
        !matches!(*self.slot.state.lock(), SlotState::Loading)
    }

    /// The outcome if the load has finished. Never blocks.
    pub fn try_result(&self) -> Option<Result<Arc<V>, E>> {
        self.slot.try_result()
    }

    /// Block the calling thread until the load finishes.
    pub fn wait(&self) -> Result<Arc<V>, E> {
        self.slot.wait()
    }

    /// Wait for the load without blocking the executor.
    pub async fn resolved(&self) -> Result<Arc<V>, E> {
        loop {
            let mut notified = pin!(self.slot.notify.notified());
            // Register before checking so a completion in between is not missed.
            notified.as_mut().enable();
            if let Some(result) = self.slot.try_result() {
                return result;
            }
            notified.await;
        }
    }
}

/// Obligation to finish a claimed slot. Dropping it unfinished fails the
/// slot with [`Abandon::abandoned`] so waiters never hang.
pub struct Completion<K, V, E>
where
    K: Eq + Hash,
    E: Clone + Abandon<K>,
{
    entries: Arc<Mutex<Map<K, V, E>>>,
    key: K,
    slot: Arc<Slot<V, E>>,
    done: bool,
}

impl<K, V, E> Completion<K, V, E>
where
    K: Eq + Hash,
    E: Clone + Abandon<K>,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Publish the outcome. A failure is removed from the map before any
    /// waiter is woken, so failures are never cached.
    pub fn complete(mut self, result: Result<V, E>) -> Result<Arc<V>, E> {
        self.done = true;
        self.finish(result)
    }

    fn finish(&self, result: Result<V, E>) -> Result<Arc<V>, E> {
        match result {
            Ok(value) => {
                let value = Arc::new(value);
                self.slot.resolve(SlotState::Ready(Arc::clone(&value)));
                Ok(value)
            }
            Err(err) => {
                {
                    let mut map = self.entries.lock();
                    if map
                        .get(&self.key)
                        .is_some_and(|e| Arc::ptr_eq(&e.slot, &self.slot))
                    {
                        map.remove(&self.key);
                    }
                }
                self.slot.resolve(SlotState::Failed(err.clone()));
                Err(err)
            }
        }
    }
}

impl<K, V, E> Drop for Completion<K, V, E>
where
    K: Eq + Hash,
    E: Clone + Abandon<K>,
{
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!("load abandoned before completing");
            let _ = self.finish(Err(E::abandoned(&self.key)));
        }
    }
}

pub struct FlyweightCache<K, V, E> {
    entries: Arc<Mutex<Map<K, V, E>>>,
}

impl<K, V, E> Default for FlyweightCache<K, V, E> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }
}

impl<K, V, E> FlyweightCache<K, V, E>
where
    K: Eq + Hash + Clone,
    E: Clone + Abandon<K>,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing slot for `key`, or a fresh one inserted in the same critical
    /// section. The flag is true when the caller now owns the load.
    fn claim(&self, key: &K) -> (Arc<Slot<V, E>>, bool) {
        let mut map = self.entries.lock();
        if let Some(entry) = map.get(key) {
            return (Arc::clone(&entry.slot), false);
        }
        let slot = Slot::new();
        map.insert(
            key.clone(),
            Entry {
                slot: Arc::clone(&slot),
                reserved: false,
            },
        );
        (slot, true)
    }

    fn completion(&self, key: K, slot: Arc<Slot<V, E>>) -> Completion<K, V, E> {
        Completion {
            entries: Arc::clone(&self.entries),
            key,
            slot,
            done: false,
        }
    }

    /// Return the value for `key`, running `load` on this thread if no load
    /// is ready or in flight. Concurrent callers for the same key block until
    /// the single load finishes.
    pub fn get_or_load(&self, key: K, load: impl FnOnce(&K) -> Result<V, E>) -> Result<Arc<V>, E> {
        let (slot, owner) = self.claim(&key);
        if !owner {
            return slot.wait();
        }
        let completion = self.completion(key, slot);
        let result = load(completion.key());
        completion.complete(result)
    }

    /// Return the handle for `key`. If nothing is ready or in flight, `spawn`
    /// receives the [`Completion`] and is expected to finish it elsewhere.
    pub fn get_or_spawn(&self, key: K, spawn: impl FnOnce(Completion<K, V, E>)) -> LoadHandle<V, E> {
        let (slot, owner) = self.claim(&key);
        if owner {
            spawn(self.completion(key, Arc::clone(&slot)));
        }
        LoadHandle { slot }
    }

    /// Ready value for `key`. Never waits for an in-flight load.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let map = self.entries.lock();
        map.get(key).and_then(|e| e.slot.ready_value())
    }

    /// Handle for a ready or in-flight key.
    pub fn handle(&self, key: &K) -> Option<LoadHandle<V, E>> {
        let map = self.entries.lock();
        map.get(key).map(|e| LoadHandle { slot: Arc::clone(&e.slot) })
    }

    pub fn is_completed(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Pin or unpin an entry against [`FlyweightCache::remove_unused`].
    /// Returns false if `key` is not cached.
    pub fn set_reserved(&self, key: &K, reserved: bool) -> bool {
        match self.entries.lock().get_mut(key) {
            Some(entry) => {
                entry.reserved = reserved;
                true
            }
            None => false,
        }
    }

    /// Evict every ready, unreserved entry whose value and handles are held by
    /// nobody outside the cache. In-flight entries are never evicted.
    pub fn remove_unused(&self) -> usize {
        let mut map = self.entries.lock();
        let before = map.len();
        map.retain(|_, entry| {
            if entry.reserved || Arc::strong_count(&entry.slot) > 1 {
                return true;
            }
            match &*entry.slot.state.lock() {
                SlotState::Ready(value) => Arc::strong_count(value) > 1,
                SlotState::Loading | SlotState::Failed(_) => true,
            }
        });
        let evicted = before - map.len();
        if evicted > 0 {
            tracing::info!(evicted, remaining = map.len(), "evicted unused entries");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every entry. In-flight loads still finish for their waiters.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
