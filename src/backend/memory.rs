//! In-process backend, the reference implementation

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{BackendError, NodeRecord, PermissionBackend};
use crate::namespace::Namespace;
use crate::permissible::{PermissibleKind, PermissibleRecord};
use crate::references::References;

#[derive(Debug, Default)]
struct MemoryStore {
    nodes: BTreeMap<Namespace, NodeRecord>,
    entities: HashMap<Uuid, PermissibleRecord>,
    groups: HashMap<Uuid, PermissibleRecord>,
    default_groups: HashMap<References, Uuid>,
}

/// Backend holding everything in memory; its image lives as long as the
/// backend instance does
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    store: RwLock<MemoryStore>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::named("memory")
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            store: RwLock::new(MemoryStore::default()),
        }
    }
}

#[async_trait]
impl PermissionBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn load_permissions(&self) -> Result<Vec<NodeRecord>, BackendError> {
        Ok(self.store.read().nodes.values().cloned().collect())
    }

    async fn load_groups(&self) -> Result<Vec<Uuid>, BackendError> {
        Ok(self.store.read().groups.keys().copied().collect())
    }

    async fn load_entities(&self) -> Result<Vec<Uuid>, BackendError> {
        Ok(self.store.read().entities.keys().copied().collect())
    }

    async fn get_entity(&self, id: Uuid) -> Result<PermissibleRecord, BackendError> {
        Ok(self
            .store
            .read()
            .entities
            .get(&id)
            .cloned()
            .unwrap_or_else(|| PermissibleRecord::empty(id, PermissibleKind::Entity)))
    }

    async fn get_group(&self, id: Uuid) -> Result<PermissibleRecord, BackendError> {
        Ok(self
            .store
            .read()
            .groups
            .get(&id)
            .cloned()
            .unwrap_or_else(|| PermissibleRecord::empty(id, PermissibleKind::Group)))
    }

    async fn get_default_group(
        &self,
        references: &References,
    ) -> Result<Option<Uuid>, BackendError> {
        Ok(self
            .store
            .read()
            .default_groups
            .get(&references.canonical())
            .copied())
    }

    async fn set_default_group(
        &self,
        id: Uuid,
        references: &References,
    ) -> Result<(), BackendError> {
        let key = references.canonical();
        let mut store = self.store.write();
        let previous = store.default_groups.insert(key.clone(), id);
        if let Some(previous) = previous {
            if let Some(record) = store.groups.get_mut(&previous) {
                record.default_scopes.retain(|s| !s.same_scope(&key));
            }
        }
        let record = store
            .groups
            .entry(id)
            .or_insert_with(|| PermissibleRecord::empty(id, PermissibleKind::Group));
        if !record.default_scopes.iter().any(|s| s.same_scope(&key)) {
            record.default_scopes.push(key);
        }
        Ok(())
    }

    async fn save_permission(&self, node: &NodeRecord) -> Result<(), BackendError> {
        self.store
            .write()
            .nodes
            .insert(node.namespace.clone(), node.clone());
        Ok(())
    }

    async fn save_entity(&self, record: &PermissibleRecord) -> Result<(), BackendError> {
        self.store.write().entities.insert(record.id, record.clone());
        Ok(())
    }

    async fn save_group(&self, record: &PermissibleRecord) -> Result<(), BackendError> {
        self.store.write().groups.insert(record.id, record.clone());
        Ok(())
    }

    async fn remove_entity(&self, id: Uuid) -> Result<(), BackendError> {
        self.store.write().entities.remove(&id);
        Ok(())
    }

    async fn remove_group(&self, id: Uuid) -> Result<(), BackendError> {
        let mut store = self.store.write();
        store.groups.remove(&id);
        store.default_groups.retain(|_, group| *group != id);
        Ok(())
    }

    async fn reload_backend(&self) -> Result<(), BackendError> {
        // The memory image is the store
        Ok(())
    }
}
