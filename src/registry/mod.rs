//! Permission registry
//!
//! `Permissions` is the context object callers pass around. It owns:
//! - the node tree and the reference inheritance table
//! - the registered backends, one of which is active once loaded
//! - per-id caches of entities and groups, hydrated on first access
//! - the event channel
//!
//! Resolution order for `check_permission` (first match wins):
//! 1. Direct live grant on the entity whose scope is visible to the query
//! 2. Groups joined under a visible scope, depth-first in join order; an
//!    entity with no memberships at all uses the default group for the scope,
//!    then the global default group
//! 3. The node default
//!
//! When ops are allowed and the entity is an op, the result reports true
//! regardless of the resolved value.

mod cache;
mod events;
mod result;

pub use events::{PermissibleEntityEvent, PermissibleSystemEvent, PermissionEvent};
pub use result::{PermissibleState, PermissionResult, ResultSource};

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{NodeRecord, PermissionBackend};
use crate::config::PermissionsConfig;
use crate::error::{PermissionError, Result};
use crate::namespace::{Namespace, NamespaceError};
use crate::node::{Permission, PermissionDefault, PermissionTree, PermissionValue};
use crate::permissible::{
    ChildPermission, Permissible, PermissibleEntity, PermissibleGroup, PermissibleKind,
    PermissibleRecord,
};
use crate::references::{RefInheritance, References};
use cache::PermissibleCache;

const EVENT_CAPACITY: usize = 256;

/// A cached entity or group
#[derive(Debug, Clone)]
pub enum Holder {
    Entity(Arc<PermissibleEntity>),
    Group(Arc<PermissibleGroup>),
}

impl Holder {
    pub fn as_entity(&self) -> Option<&Arc<PermissibleEntity>> {
        match self {
            Holder::Entity(entity) => Some(entity),
            Holder::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&Arc<PermissibleGroup>> {
        match self {
            Holder::Group(group) => Some(group),
            Holder::Entity(_) => None,
        }
    }
}

impl Deref for Holder {
    type Target = Permissible;

    fn deref(&self) -> &Permissible {
        match self {
            Holder::Entity(entity) => entity.as_ref().deref(),
            Holder::Group(group) => group.as_ref().deref(),
        }
    }
}

/// Everything fetched from a backend before it is installed
struct Snapshot {
    nodes: Vec<NodeRecord>,
    groups: Vec<PermissibleRecord>,
    entities: Vec<PermissibleRecord>,
}

/// Active backend and the caches built from it
struct LoadedState {
    backend: Option<Arc<dyn PermissionBackend>>,
    entities: PermissibleCache<PermissibleEntity>,
    groups: PermissibleCache<PermissibleGroup>,
    /// Canonical scope -> default group, `None` when the backend has none
    default_groups: RwLock<HashMap<References, Option<Uuid>>>,
}

impl LoadedState {
    fn new(backend: Option<Arc<dyn PermissionBackend>>) -> Self {
        Self {
            backend,
            entities: PermissibleCache::new(),
            groups: PermissibleCache::new(),
            default_groups: RwLock::new(HashMap::new()),
        }
    }

    fn backend(&self) -> Result<&Arc<dyn PermissionBackend>> {
        self.backend.as_ref().ok_or(PermissionError::NotLoaded)
    }

    fn clear(&self) {
        self.entities.clear();
        self.groups.clear();
        self.default_groups.write().clear();
    }

    fn holders(&self) -> Vec<Holder> {
        let mut holders: Vec<Holder> = self
            .entities
            .values()
            .into_iter()
            .map(Holder::Entity)
            .collect();
        holders.extend(self.groups.values().into_iter().map(Holder::Group));
        holders
    }
}

/// The permission registry
pub struct Permissions {
    config: RwLock<PermissionsConfig>,
    /// Where config toggles are written back, if anywhere
    config_path: Option<PathBuf>,
    tree: RwLock<PermissionTree>,
    inheritance: RefInheritance,
    backends: RwLock<HashMap<String, Arc<dyn PermissionBackend>>>,
    state: tokio::sync::RwLock<LoadedState>,
    /// Held from a holder change until its save lands
    writes: tokio::sync::Mutex<()>,
    events: broadcast::Sender<PermissionEvent>,
}

impl std::fmt::Debug for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut backends: Vec<String> = self.backends.read().keys().cloned().collect();
        backends.sort();
        f.debug_struct("Permissions")
            .field("config", &*self.config.read())
            .field("config_path", &self.config_path)
            .field("nodes", &self.tree.read().len())
            .field("backends", &backends)
            .finish()
    }
}

impl Permissions {
    /// Create an unloaded registry with the default nodes seeded
    pub fn new(config: PermissionsConfig) -> Self {
        let mut tree = PermissionTree::new();
        PermissionDefault::seed(&mut tree);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config: RwLock::new(config),
            config_path: None,
            tree: RwLock::new(tree),
            inheritance: RefInheritance::new(),
            backends: RwLock::new(HashMap::new()),
            state: tokio::sync::RwLock::new(LoadedState::new(None)),
            writes: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// Write config toggles back to `path`
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Create a shared instance
    pub fn shared(config: PermissionsConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Make a backend selectable by its name. Re-registering a name replaces it.
    pub fn register_backend(&self, backend: Arc<dyn PermissionBackend>) {
        let name = backend.name().to_string();
        debug!("Registered permission backend '{}'", name);
        self.backends.write().insert(name, backend);
    }

    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Name of the active backend, `None` while unloaded
    pub async fn active_backend(&self) -> Option<String> {
        self.state
            .read()
            .await
            .backend
            .as_ref()
            .map(|b| b.name().to_string())
    }

    pub fn config(&self) -> PermissionsConfig {
        self.config.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PermissionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: impl Into<PermissionEvent>) {
        // No receivers is fine
        let _ = self.events.send(event.into());
    }

    // ---- Backend lifecycle ----

    /// Load the backend named in the config
    pub async fn start(&self) -> Result<()> {
        let name = self.config.read().backend.clone();
        self.set_backend(&name).await
    }

    /// Switch to the named backend.
    ///
    /// Everything is fetched before the caches are touched, so a failing
    /// backend leaves the previous state (and backend) in place.
    pub async fn set_backend(&self, name: &str) -> Result<()> {
        let backend = self
            .backends
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PermissionError::UnknownBackend(name.to_string()))?;

        let mut state = self.state.write().await;
        info!("Loading permission backend '{}'", name);
        backend.initialize().await?;
        let snapshot = self.fetch_snapshot(&backend).await?;
        *state = self.install(backend, snapshot, None);
        drop(state);

        info!("Permission backend '{}' is active", name);
        self.emit(PermissibleSystemEvent::BackendChanged {
            backend: name.to_string(),
        });
        Ok(())
    }

    /// Re-read the active backend and rebuild the caches from it.
    ///
    /// Holders already cached are refreshed in place, so handles taken
    /// earlier see the reloaded grants. Holders the backend no longer lists
    /// are dropped from the cache and go stale.
    pub async fn reload(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let backend = state.backend()?.clone();
        backend.reload_backend().await?;
        let snapshot = self.fetch_snapshot(&backend).await?;
        let name = backend.name().to_string();
        let next = self.install(backend, snapshot, Some(&*state));
        *state = next;
        drop(state);

        info!("Reloaded permission backend '{}'", name);
        self.emit(PermissibleSystemEvent::Reloaded { backend: name });
        Ok(())
    }

    /// Clear entity, group and default-group caches. The node tree stays;
    /// missing default nodes are re-seeded.
    pub async fn reset(&self) {
        let state = self.state.write().await;
        state.clear();
        PermissionDefault::seed(&mut self.tree.write());
        info!("Permission caches reset");
    }

    /// Drop every node and re-seed the defaults
    pub fn reset_nodes(&self) {
        let mut tree = self.tree.write();
        tree.clear();
        PermissionDefault::seed(&mut tree);
        info!("Permission nodes reset");
    }

    /// Shutdown: clear the caches. Never fails.
    pub async fn end(&self) {
        self.reset().await;
        info!("Permission registry stopped");
    }

    async fn fetch_snapshot(&self, backend: &Arc<dyn PermissionBackend>) -> Result<Snapshot> {
        let nodes = backend.load_permissions().await?;

        let mut groups = Vec::new();
        for id in backend.load_groups().await? {
            groups.push(backend.get_group(id).await?);
        }

        let mut entities = Vec::new();
        for id in backend.load_entities().await? {
            entities.push(backend.get_entity(id).await?);
        }

        debug!(
            "Fetched {} nodes, {} groups, {} entities from '{}'",
            nodes.len(),
            groups.len(),
            entities.len(),
            backend.name()
        );
        Ok(Snapshot {
            nodes,
            groups,
            entities,
        })
    }

    /// Merge nodes into the tree (nodes first, assignments reference them)
    /// and build fresh caches. Holders cached in `previous` keep their `Arc`.
    fn install(
        &self,
        backend: Arc<dyn PermissionBackend>,
        snapshot: Snapshot,
        previous: Option<&LoadedState>,
    ) -> LoadedState {
        let state = LoadedState::new(Some(backend));
        let mut tree = self.tree.write();

        for node in snapshot.nodes {
            if let Err(e) = tree.create_node(&node.namespace, node.default_value) {
                warn!("Skipping node '{}': {}", node.namespace, e);
                continue;
            }
            if let Some(description) = node.description {
                tree.set_description(&node.namespace, description);
            }
        }
        PermissionDefault::seed(&mut tree);

        for record in snapshot.groups {
            ensure_assignment_nodes(&mut tree, &record);
            {
                let mut defaults = state.default_groups.write();
                for scope in &record.default_scopes {
                    defaults.insert(scope.canonical(), Some(record.id));
                }
            }
            let id = record.id;
            let group = match previous.and_then(|p| p.groups.get(id)) {
                Some(cached) => {
                    cached.replace_from(record);
                    cached
                }
                None => Arc::new(PermissibleGroup::from_record(record)),
            };
            state.groups.insert(id, group);
        }
        for record in snapshot.entities {
            ensure_assignment_nodes(&mut tree, &record);
            let id = record.id;
            let entity = match previous.and_then(|p| p.entities.get(id)) {
                Some(cached) => {
                    cached.replace_from(record);
                    cached
                }
                None => Arc::new(PermissibleEntity::from_record(record)),
            };
            state.entities.insert(id, entity);
        }

        state
    }

    // ---- Hydration ----

    async fn entity(&self, state: &LoadedState, id: Uuid) -> Result<Arc<PermissibleEntity>> {
        let backend = state.backend()?;
        let (entity, fetched) = state
            .entities
            .get_or_try_init(id, || async {
                let record = backend.get_entity(id).await?;
                ensure_assignment_nodes(&mut self.tree.write(), &record);
                Ok::<_, PermissionError>(Arc::new(PermissibleEntity::from_record(record)))
            })
            .await?;
        if fetched {
            debug!("Hydrated entity {}", id);
            self.emit(PermissibleEntityEvent::Loaded {
                id,
                kind: PermissibleKind::Entity,
            });
        }
        Ok(entity)
    }

    async fn group(&self, state: &LoadedState, id: Uuid) -> Result<Arc<PermissibleGroup>> {
        let backend = state.backend()?;
        let (group, fetched) = state
            .groups
            .get_or_try_init(id, || async {
                let record = backend.get_group(id).await?;
                ensure_assignment_nodes(&mut self.tree.write(), &record);
                Ok::<_, PermissionError>(Arc::new(PermissibleGroup::from_record(record)))
            })
            .await?;
        if fetched {
            debug!("Hydrated group {}", id);
            self.emit(PermissibleEntityEvent::Loaded {
                id,
                kind: PermissibleKind::Group,
            });
        }
        Ok(group)
    }

    async fn holder(&self, state: &LoadedState, kind: PermissibleKind, id: Uuid) -> Result<Holder> {
        Ok(match kind {
            PermissibleKind::Entity => Holder::Entity(self.entity(state, id).await?),
            PermissibleKind::Group => Holder::Group(self.group(state, id).await?),
        })
    }

    /// Entity by id, hydrated from the backend on first access.
    /// Unknown ids yield an empty entity.
    pub async fn get_entity(&self, id: Uuid) -> Result<Arc<PermissibleEntity>> {
        let state = self.state.read().await;
        self.entity(&state, id).await
    }

    pub async fn get_group(&self, id: Uuid) -> Result<Arc<PermissibleGroup>> {
        let state = self.state.read().await;
        self.group(&state, id).await
    }

    pub async fn get_holder(&self, kind: PermissibleKind, id: Uuid) -> Result<Holder> {
        let state = self.state.read().await;
        self.holder(&state, kind, id).await
    }

    /// Evict an entity; the next access fetches it again
    pub async fn reset_entity(&self, id: Uuid) -> bool {
        let evicted = self.state.read().await.entities.remove(id).is_some();
        if evicted {
            self.emit(PermissibleEntityEvent::Reset {
                id,
                kind: PermissibleKind::Entity,
            });
        }
        evicted
    }

    pub async fn reset_group(&self, id: Uuid) -> bool {
        let evicted = self.state.read().await.groups.remove(id).is_some();
        if evicted {
            self.emit(PermissibleEntityEvent::Reset {
                id,
                kind: PermissibleKind::Group,
            });
        }
        evicted
    }

    /// Cached holders granted anything under `pattern`
    pub async fn holders_of(&self, pattern: &Namespace) -> Vec<Holder> {
        let state = self.state.read().await;
        state
            .holders()
            .into_iter()
            .filter(|holder| holder.holds_under(pattern))
            .collect()
    }

    // ---- Resolution ----

    /// Resolve `namespace` for entity `id` under the query scope.
    ///
    /// Unknown nodes resolve as an unregistered node without a default, so
    /// they deny unless granted. The tree is not touched.
    pub async fn check_permission(
        &self,
        id: Uuid,
        namespace: &Namespace,
        references: &References,
    ) -> Result<PermissionResult> {
        if namespace.is_pattern() {
            return Err(NamespaceError::Wildcard(namespace.to_string()).into());
        }

        let state = self.state.read().await;
        let entity = self.entity(&state, id).await?;
        let result = self.resolve(&state, &entity, namespace, references).await?;

        let (allow_ops, debug_enabled) = {
            let config = self.config.read();
            (config.allow_ops, config.debug)
        };
        let op_namespace = PermissionDefault::Op.namespace();
        let op_override = allow_ops
            && *namespace != op_namespace
            && (entity.is_op()
                || self
                    .resolve(&state, &entity, &op_namespace, references)
                    .await?
                    .is_true());
        let result = result.with_op_override(op_override);

        if debug_enabled || entity.is_debug() {
            info!(
                "Permission check {} '{}' [{}]: {}",
                id, namespace, references, result
            );
        }
        Ok(result)
    }

    /// `check_permission` from plain strings
    pub async fn check(&self, id: Uuid, namespace: &str, references: &[&str]) -> Result<PermissionResult> {
        let namespace = Namespace::parse(namespace)?;
        self.check_permission(id, &namespace, &References::new(references.iter()))
            .await
    }

    /// Ban and whitelist gate, checked before any node
    pub async fn check_permissible_state(&self, id: Uuid) -> Result<PermissibleState> {
        let state = self.state.read().await;
        let entity = self.entity(&state, id).await?;
        let global = References::global();

        if entity.is_banned()
            || self
                .resolve(&state, &entity, &PermissionDefault::Banned.namespace(), &global)
                .await?
                .is_true()
        {
            return Ok(PermissibleState::Banned);
        }

        let whitelist = self.config.read().whitelist;
        if whitelist
            && !entity.is_whitelisted()
            && !self
                .resolve(
                    &state,
                    &entity,
                    &PermissionDefault::Whitelisted.namespace(),
                    &global,
                )
                .await?
                .is_true()
        {
            return Ok(PermissibleState::NotWhitelisted);
        }

        Ok(PermissibleState::Permitted)
    }

    async fn resolve(
        &self,
        state: &LoadedState,
        holder: &Permissible,
        namespace: &Namespace,
        references: &References,
    ) -> Result<PermissionResult> {
        let permission = self.lookup_permission(namespace);
        let now = Utc::now();
        let scope = self.inheritance.expand(references);
        let visible = |assigned: &References| assigned.is_global() || assigned.intersects(&scope);

        let (assignment, source) = match holder.find_assignment(namespace, now, visible) {
            Some(grant) => (Some(grant), ResultSource::Direct),
            None => match self
                .resolve_groups(state, holder, namespace, references, &scope, now)
                .await?
            {
                Some((group, grant)) => (Some(grant), ResultSource::Group(group)),
                None => (None, ResultSource::Default),
            },
        };

        let value = match &assignment {
            Some(grant) => grant
                .value_or(&permission.default_value)
                .coerce(permission.value_type)
                .unwrap_or_else(|raw| raw),
            None => permission.default_value.clone(),
        };

        Ok(PermissionResult::new(
            holder.id(),
            permission,
            references.clone(),
            value,
            source,
            assignment,
        ))
    }

    /// Depth-first over visible memberships; the visited set stops group cycles
    async fn resolve_groups(
        &self,
        state: &LoadedState,
        holder: &Permissible,
        namespace: &Namespace,
        references: &References,
        scope: &References,
        now: DateTime<Utc>,
    ) -> Result<Option<(Uuid, ChildPermission)>> {
        let visible = |assigned: &References| assigned.is_global() || assigned.intersects(scope);

        let mut pending = holder.matching_groups(now, visible);
        if pending.is_empty() && holder.kind() == PermissibleKind::Entity && holder.groups().is_empty()
        {
            if let Some(default) = self.default_group_id(state, references).await? {
                pending.push(default);
            }
        }
        pending.reverse();

        let mut visited = HashSet::from([holder.id()]);
        while let Some(group_id) = pending.pop() {
            if !visited.insert(group_id) {
                continue;
            }
            let group = self.group(state, group_id).await?;
            if let Some(grant) = group.find_assignment(namespace, now, visible) {
                return Ok(Some((group_id, grant)));
            }
            let mut nested = group.matching_groups(now, visible);
            nested.reverse();
            pending.extend(nested);
        }
        Ok(None)
    }

    // ---- Default groups ----

    async fn default_group_id(
        &self,
        state: &LoadedState,
        references: &References,
    ) -> Result<Option<Uuid>> {
        if let Some(id) = self.lookup_default(state, references).await? {
            return Ok(Some(id));
        }
        if references.is_global() {
            return Ok(None);
        }
        self.lookup_default(state, &References::global()).await
    }

    async fn lookup_default(
        &self,
        state: &LoadedState,
        references: &References,
    ) -> Result<Option<Uuid>> {
        let key = references.canonical();
        let cached = state.default_groups.read().get(&key).copied();
        if let Some(cached) = cached {
            return Ok(cached);
        }
        let found = state.backend()?.get_default_group(&key).await?;
        state.default_groups.write().insert(key, found);
        Ok(found)
    }

    /// Default group for exactly this scope
    pub async fn get_default_group(
        &self,
        references: &References,
    ) -> Result<Option<Arc<PermissibleGroup>>> {
        let state = self.state.read().await;
        match self.lookup_default(&state, references).await? {
            Some(id) => Ok(Some(self.group(&state, id).await?)),
            None => Ok(None),
        }
    }

    /// Make `group` the default group for the scope. The backend is written
    /// first; on failure the caches are untouched.
    pub async fn set_default_group(&self, group: Uuid, references: &References) -> Result<()> {
        let key = references.canonical();
        let _writes = self.writes.lock().await;
        let state = self.state.read().await;
        state.backend()?.set_default_group(group, &key).await?;

        for cached in state.groups.values() {
            if cached.id() != group {
                cached.remove_default_scope(&key);
            }
        }
        self.group(&state, group)
            .await?
            .add_default_scope(key.clone());
        state.default_groups.write().insert(key.clone(), Some(group));
        drop(state);

        info!("Default group for [{}] is now {}", key, group);
        self.emit(PermissibleSystemEvent::DefaultGroupChanged {
            group,
            references: key,
        });
        Ok(())
    }

    // ---- Mutation and persistence ----

    async fn persist(
        &self,
        state: &LoadedState,
        holder: &Holder,
        record: &PermissibleRecord,
    ) -> Result<()> {
        if holder.is_virtual() {
            debug!("Not saving virtual {} {}", holder.kind(), holder.id());
            return Ok(());
        }
        let backend = state.backend()?;
        match holder {
            Holder::Entity(_) => backend.save_entity(record).await?,
            Holder::Group(_) => backend.save_group(record).await?,
        }
        self.emit(PermissibleEntityEvent::Saved {
            id: holder.id(),
            kind: holder.kind(),
        });
        Ok(())
    }

    /// Run `change` on a scratch copy of the holder. If that dirtied the
    /// copy, save it and install it. A failed save leaves the cached holder
    /// as it was. Callers hold `writes`.
    async fn mutate<T, F>(&self, state: &LoadedState, holder: &Holder, change: F) -> Result<T>
    where
        F: FnOnce(&Permissible) -> T,
    {
        let scratch = Permissible::from_record(holder.to_record());
        let output = change(&scratch);
        if !scratch.is_dirty() {
            return Ok(output);
        }
        let record = scratch.to_record();
        self.persist(state, holder, &record).await?;
        holder.replace_from(record);
        Ok(output)
    }

    async fn fetch_record(
        &self,
        state: &LoadedState,
        kind: PermissibleKind,
        id: Uuid,
    ) -> Result<PermissibleRecord> {
        let backend = state.backend()?;
        let record = match kind {
            PermissibleKind::Entity => backend.get_entity(id).await?,
            PermissibleKind::Group => backend.get_group(id).await?,
        };
        ensure_assignment_nodes(&mut self.tree.write(), &record);
        Ok(record)
    }

    /// Write a holder to the active backend
    pub async fn save(&self, kind: PermissibleKind, id: Uuid) -> Result<()> {
        let _writes = self.writes.lock().await;
        let state = self.state.read().await;
        let holder = self.holder(&state, kind, id).await?;
        self.persist(&state, &holder, &holder.to_record()).await?;
        holder.mark_clean();
        Ok(())
    }

    /// Replace a holder's grants with the backend's copy, in place
    pub async fn reload_permissions(&self, kind: PermissibleKind, id: Uuid) -> Result<()> {
        let _writes = self.writes.lock().await;
        let state = self.state.read().await;
        let holder = self.holder(&state, kind, id).await?;
        let record = self.fetch_record(&state, kind, id).await?;
        holder.replace_permissions(record.permissions);
        self.emit(PermissibleEntityEvent::Reloaded { id, kind });
        Ok(())
    }

    /// Replace a holder's memberships with the backend's copy, in place
    pub async fn reload_groups(&self, kind: PermissibleKind, id: Uuid) -> Result<()> {
        let _writes = self.writes.lock().await;
        let state = self.state.read().await;
        let holder = self.holder(&state, kind, id).await?;
        let record = self.fetch_record(&state, kind, id).await?;
        holder.replace_groups(record.groups);
        self.emit(PermissibleEntityEvent::Reloaded { id, kind });
        Ok(())
    }

    /// Delete an entity from the backend and the cache
    pub async fn remove_entity(&self, id: Uuid) -> Result<()> {
        let state = self.state.read().await;
        state.backend()?.remove_entity(id).await?;
        state.entities.remove(id);
        drop(state);

        info!("Removed entity {}", id);
        self.emit(PermissibleEntityEvent::Removed {
            id,
            kind: PermissibleKind::Entity,
        });
        Ok(())
    }

    /// Delete a group, including any default-group pointers to it
    pub async fn remove_group(&self, id: Uuid) -> Result<()> {
        let state = self.state.read().await;
        state.backend()?.remove_group(id).await?;
        state.groups.remove(id);
        state
            .default_groups
            .write()
            .retain(|_, group| *group != Some(id));
        drop(state);

        info!("Removed group {}", id);
        self.emit(PermissibleEntityEvent::Removed {
            id,
            kind: PermissibleKind::Group,
        });
        Ok(())
    }

    /// Grant a node to a holder and save it. The node is created on demand
    /// and the value coerced to its type. Nothing changes if the save fails.
    pub async fn grant(
        &self,
        kind: PermissibleKind,
        id: Uuid,
        namespace: &Namespace,
        value: Option<PermissionValue>,
        references: References,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<ChildPermission> {
        let permission = self.get_permission(namespace)?;
        let value = match value {
            Some(value) => Some(value.coerce(permission.value_type).map_err(|value| {
                PermissionError::InvalidValue {
                    value,
                    expected: permission.value_type,
                }
            })?),
            None => None,
        };

        let _writes = self.writes.lock().await;
        let state = self.state.read().await;
        let holder = self.holder(&state, kind, id).await?;
        self.mutate(&state, &holder, |scratch| {
            scratch.add_permission(namespace.clone(), value, references, expiry)
        })
        .await
    }

    /// Revoke a grant; false when there was none
    pub async fn revoke(
        &self,
        kind: PermissibleKind,
        id: Uuid,
        namespace: &Namespace,
        references: &References,
    ) -> Result<bool> {
        let _writes = self.writes.lock().await;
        let state = self.state.read().await;
        let holder = self.holder(&state, kind, id).await?;
        self.mutate(&state, &holder, |scratch| {
            scratch.remove_permission(namespace, references)
        })
        .await
    }

    /// Join a group; false for a duplicate `(group, scope)` pair
    pub async fn add_membership(
        &self,
        kind: PermissibleKind,
        id: Uuid,
        group: Uuid,
        references: References,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let _writes = self.writes.lock().await;
        let state = self.state.read().await;
        let holder = self.holder(&state, kind, id).await?;
        self.group(&state, group).await?;
        self.mutate(&state, &holder, |scratch| {
            scratch.add_group(group, references, expiry)
        })
        .await
    }

    pub async fn remove_membership(
        &self,
        kind: PermissibleKind,
        id: Uuid,
        group: Uuid,
        references: &References,
    ) -> Result<bool> {
        let _writes = self.writes.lock().await;
        let state = self.state.read().await;
        let holder = self.holder(&state, kind, id).await?;
        self.mutate(&state, &holder, |scratch| {
            scratch.remove_group(group, references)
        })
        .await
    }

    /// Drop expired grants and memberships from every cached holder and
    /// save the holders that changed. A holder whose save fails keeps its
    /// expired entries.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let _writes = self.writes.lock().await;
        let state = self.state.read().await;
        let now = Utc::now();
        let mut total = 0;
        for holder in state.holders() {
            total += self
                .mutate(&state, &holder, |scratch| scratch.purge_expired(now))
                .await?;
        }
        if total > 0 {
            info!("Swept {} expired assignments", total);
        }
        Ok(total)
    }

    // ---- References ----

    /// Let `token` queries see assignments scoped to `implied`
    pub fn set_ref_inheritance<I, S>(&self, token: &str, implied: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inheritance.set_ref_inheritance(token, implied);
    }

    pub fn inheritance(&self) -> &RefInheritance {
        &self.inheritance
    }

    // ---- Nodes ----

    /// Register a node; the first explicit default wins
    pub fn create_node(&self, namespace: &Namespace, default: PermissionValue) -> Result<Permission> {
        Ok(self.tree.write().create_node(namespace, default)?)
    }

    pub fn get_node(&self, namespace: &Namespace) -> Option<Permission> {
        self.tree.read().get_node(namespace)
    }

    /// Every node matching `pattern`, in namespace order
    pub fn get_nodes(&self, pattern: &Namespace) -> Vec<Permission> {
        self.tree.read().get_nodes(pattern)
    }

    pub fn all_nodes(&self) -> Vec<Permission> {
        self.tree.read().all_nodes()
    }

    /// The registered node, or an unregistered stand-in without a default
    pub fn lookup_permission(&self, namespace: &Namespace) -> Permission {
        self.tree
            .read()
            .get_node(namespace)
            .unwrap_or_else(|| Permission::unregistered(namespace.clone()))
    }

    /// Get a node, creating it without a default if missing
    pub fn get_permission(&self, namespace: &Namespace) -> Result<Permission> {
        if let Some(node) = self.tree.read().get_node(namespace) {
            return Ok(node);
        }
        Ok(self.tree.write().ensure_node(namespace)?)
    }

    pub fn set_node_description(&self, namespace: &Namespace, description: &str) -> bool {
        self.tree.write().set_description(namespace, description)
    }

    /// Write a node definition to the active backend
    pub async fn save_node(&self, namespace: &Namespace) -> Result<Permission> {
        let node = self.get_permission(namespace)?;
        let state = self.state.read().await;
        state
            .backend()?
            .save_permission(&NodeRecord::from(&node))
            .await?;
        Ok(node)
    }

    // ---- Config toggles ----

    pub fn allow_ops(&self) -> bool {
        self.config.read().allow_ops
    }

    pub fn has_whitelist(&self) -> bool {
        self.config.read().whitelist
    }

    pub fn is_debug_enabled(&self) -> bool {
        self.config.read().debug
    }

    pub async fn set_allow_op(&self, allow_ops: bool) -> Result<()> {
        let config = {
            let mut config = self.config.write();
            config.allow_ops = allow_ops;
            config.clone()
        };
        self.write_config(&config).await?;
        self.emit(PermissibleSystemEvent::AllowOpToggle(allow_ops));
        Ok(())
    }

    pub async fn set_has_whitelist(&self, whitelist: bool) -> Result<()> {
        let config = {
            let mut config = self.config.write();
            config.whitelist = whitelist;
            config.clone()
        };
        self.write_config(&config).await?;
        self.emit(PermissibleSystemEvent::WhitelistToggle(whitelist));
        Ok(())
    }

    pub async fn set_debug_enabled(&self, debug: bool) -> Result<()> {
        let config = {
            let mut config = self.config.write();
            config.debug = debug;
            config.clone()
        };
        self.write_config(&config).await?;
        self.emit(PermissibleSystemEvent::DebugModeToggle(debug));
        Ok(())
    }

    async fn write_config(&self, config: &PermissionsConfig) -> Result<()> {
        if let Some(path) = &self.config_path {
            config.save(path).await?;
            debug!("Wrote config to {}", path.display());
        }
        Ok(())
    }
}

/// Nodes referenced by a record's grants must exist in the tree
fn ensure_assignment_nodes(tree: &mut PermissionTree, record: &PermissibleRecord) {
    for grant in &record.permissions {
        if let Err(e) = tree.ensure_node(&grant.namespace) {
            warn!(
                "{} {} holds unusable node '{}': {}",
                record.kind, record.id, grant.namespace, e
            );
        }
    }
}
