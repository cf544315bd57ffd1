//! Per-id hydration slots
//!
//! Each id owns a `OnceCell`; concurrent first access runs the fetch once and
//! every caller receives the same `Arc`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::OnceCell;
use uuid::Uuid;

type Slot<T> = Arc<OnceCell<Arc<T>>>;

#[derive(Debug)]
pub(crate) struct PermissibleCache<T> {
    slots: RwLock<HashMap<Uuid, Slot<T>>>,
}

impl<T> Default for PermissibleCache<T> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> PermissibleCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: Uuid) -> Slot<T> {
        if let Some(slot) = self.slots.read().get(&id) {
            return slot.clone();
        }
        self.slots.write().entry(id).or_default().clone()
    }

    /// Cached value, or the result of `fetch` stored for everyone else.
    /// The flag is true when this call ran the fetch.
    pub async fn get_or_try_init<E, F, Fut>(&self, id: Uuid, fetch: F) -> Result<(Arc<T>, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<T>, E>>,
    {
        let slot = self.slot(id);
        let mut fetched = false;
        let value = slot
            .get_or_try_init(|| {
                fetched = true;
                fetch()
            })
            .await?
            .clone();
        Ok((value, fetched))
    }

    /// Hydrated value, without fetching
    pub fn get(&self, id: Uuid) -> Option<Arc<T>> {
        self.slots.read().get(&id).and_then(|slot| slot.get().cloned())
    }

    /// Store an already hydrated value, replacing any previous slot
    pub fn insert(&self, id: Uuid, value: Arc<T>) {
        let slot = Arc::new(OnceCell::new_with(Some(value)));
        self.slots.write().insert(id, slot);
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<T>> {
        self.slots
            .write()
            .remove(&id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Every hydrated value
    pub fn values(&self) -> Vec<Arc<T>> {
        self.slots
            .read()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().values().filter(|s| s.initialized()).count()
    }

    pub fn clear(&self) {
        self.slots.write().clear();
    }
}
