//! Flat-file backend
//!
//! One JSON document, laid out as dotted key paths:
//! - `permissions.<namespace/with/slashes>` -> `value`, `type`, `description`
//! - `entities.<uuid>.permissions.<namespace/with/slashes>` -> `value`, `type`, `refs`, `expiry`
//! - `entities.<uuid>.groups.<groupKey>` -> `refs`, `expiry`
//! - `groups.<uuid>...` laid out like entities
//! - `default_groups.<refs>` -> group uuid
//!
//! A node or group held under several scopes gets one key per scope, suffixed
//! with `@<ref+ref>`. The `refs` leaf (comma-joined) stays authoritative.
//!
//! Every write goes to `<file>.tmp` first and is renamed over the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BackendError, NodeRecord, PermissionBackend};
use crate::namespace::Namespace;
use crate::node::PermissionValue;
use crate::permissible::{ChildPermission, GroupMembership, PermissibleKind, PermissibleRecord};
use crate::references::References;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct FileDocument {
    #[serde(default)]
    permissions: BTreeMap<String, NodeEntry>,
    #[serde(default)]
    groups: BTreeMap<String, HolderEntry>,
    #[serde(default)]
    entities: BTreeMap<String, HolderEntry>,
    #[serde(default)]
    default_groups: BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct NodeEntry {
    #[serde(default)]
    value: String,
    #[serde(default, rename = "type")]
    value_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct HolderEntry {
    #[serde(default)]
    permissions: BTreeMap<String, AssignmentEntry>,
    #[serde(default)]
    groups: BTreeMap<String, AssignmentEntry>,
    #[serde(default, skip_serializing_if = "is_false")]
    banned: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    whitelisted: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    op: bool,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct AssignmentEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    value_type: Option<String>,
    #[serde(default)]
    refs: String,
    /// Unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiry: Option<i64>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Key for one slot: the base key, plus a scope suffix when scoped
fn slot_key(base: &str, references: &References) -> String {
    if references.is_global() {
        base.to_string()
    } else {
        format!("{}@{}", base, references.canonical().tokens().join("+"))
    }
}

fn base_key(key: &str) -> &str {
    key.split('@').next().unwrap_or(key)
}

/// Backend persisting to a single JSON file
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    document: RwLock<FileDocument>,
    write_lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            document: RwLock::new(FileDocument::default()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<FileDocument, BackendError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(FileDocument::default()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileDocument::default()),
            Err(e) => Err(BackendError::io(&self.path, e)),
        }
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Apply `change` to a copy of the document and write it out. The copy
    /// replaces the in-memory document only once it is on disk.
    async fn update<F>(&self, change: F) -> Result<(), BackendError>
    where
        F: FnOnce(&mut FileDocument),
    {
        let _guard = self.write_lock.lock().await;
        let mut next = self.document.read().clone();
        change(&mut next);
        let text = serde_json::to_string_pretty(&next)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::io(parent, e))?;
        }
        let staging = self.staging_path();
        tokio::fs::write(&staging, text)
            .await
            .map_err(|e| BackendError::io(&staging, e))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| BackendError::io(&self.path, e))?;

        *self.document.write() = next;
        Ok(())
    }

    fn holder_ids(holders: &BTreeMap<String, HolderEntry>, kind: PermissibleKind) -> Vec<Uuid> {
        holders
            .keys()
            .filter_map(|key| match Uuid::parse_str(key) {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!("Skipping {} with malformed id '{}'", kind, key);
                    None
                }
            })
            .collect()
    }

    fn to_record(
        id: Uuid,
        kind: PermissibleKind,
        entry: Option<&HolderEntry>,
        default_groups: &BTreeMap<String, String>,
    ) -> PermissibleRecord {
        let mut record = PermissibleRecord::empty(id, kind);
        if kind == PermissibleKind::Group {
            let id_text = id.to_string();
            record.default_scopes = default_groups
                .iter()
                .filter(|(_, group)| **group == id_text)
                .map(|(refs, _)| References::parse(refs))
                .collect();
        }
        let Some(entry) = entry else {
            return record;
        };

        record.banned = entry.banned;
        record.whitelisted = entry.whitelisted;
        record.op = entry.op;

        for (key, assignment) in &entry.permissions {
            let namespace = match Namespace::from_key(base_key(key)) {
                Ok(ns) => ns,
                Err(e) => {
                    warn!("Skipping permission '{}' on {} {}: {}", key, kind, id, e);
                    continue;
                }
            };
            let tag = assignment.value_type.as_deref().unwrap_or_default();
            let value = assignment.value.as_deref().map(|text| {
                PermissionValue::from_stored(text, tag).unwrap_or_else(|loose| {
                    warn!("Permission '{}' on {} {} is not a {}", key, kind, id, tag);
                    loose
                })
            });
            record.permissions.push(ChildPermission::new(
                id,
                namespace,
                value.filter(|v| !v.is_unset()),
                References::parse(&assignment.refs),
                assignment
                    .expiry
                    .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            ));
        }

        for (key, assignment) in &entry.groups {
            let group = match Uuid::parse_str(base_key(key)) {
                Ok(group) => group,
                Err(_) => {
                    warn!("Skipping group reference '{}' on {} {}", key, kind, id);
                    continue;
                }
            };
            record.groups.push(GroupMembership::new(
                group,
                References::parse(&assignment.refs),
                assignment
                    .expiry
                    .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            ));
        }

        record
    }

    fn to_entry(record: &PermissibleRecord) -> HolderEntry {
        let mut entry = HolderEntry {
            banned: record.banned,
            whitelisted: record.whitelisted,
            op: record.op,
            ..Default::default()
        };
        for grant in &record.permissions {
            entry.permissions.insert(
                slot_key(&grant.namespace.to_key(), &grant.references),
                AssignmentEntry {
                    value: grant.value.as_ref().map(|v| v.to_string()),
                    value_type: grant.value.as_ref().map(|v| v.value_type().to_string()),
                    refs: grant.references.to_string(),
                    expiry: grant.expiry.map(|at| at.timestamp()),
                },
            );
        }
        for membership in &record.groups {
            entry.groups.insert(
                slot_key(&membership.group.to_string(), &membership.references),
                AssignmentEntry {
                    value: None,
                    value_type: None,
                    refs: membership.references.to_string(),
                    expiry: membership.expiry.map(|at| at.timestamp()),
                },
            );
        }
        entry
    }
}

#[async_trait]
impl PermissionBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        let exists = tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| BackendError::io(&self.path, e))?;
        if !exists {
            debug!("Creating permissions file {}", self.path.display());
            *self.document.write() = FileDocument::default();
            return self.update(|_| {}).await;
        }
        self.reload_backend().await
    }

    async fn load_permissions(&self) -> Result<Vec<NodeRecord>, BackendError> {
        let document = self.document.read();
        let mut nodes = Vec::new();
        for (key, entry) in &document.permissions {
            let namespace = match Namespace::from_key(key) {
                Ok(ns) if !ns.is_pattern() => ns,
                Ok(_) => {
                    warn!("Skipping wildcard node '{}'", key);
                    continue;
                }
                Err(e) => {
                    warn!("Skipping node '{}': {}", key, e);
                    continue;
                }
            };
            let default_value = match PermissionValue::from_stored(&entry.value, &entry.value_type)
            {
                Ok(value) => value,
                Err(loose) => {
                    warn!(
                        "Node '{}' value '{}' is not a {}, keeping it untyped",
                        key, entry.value, entry.value_type
                    );
                    loose
                }
            };
            nodes.push(NodeRecord {
                namespace,
                default_value,
                description: entry.description.clone(),
            });
        }
        Ok(nodes)
    }

    async fn load_groups(&self) -> Result<Vec<Uuid>, BackendError> {
        Ok(Self::holder_ids(
            &self.document.read().groups,
            PermissibleKind::Group,
        ))
    }

    async fn load_entities(&self) -> Result<Vec<Uuid>, BackendError> {
        Ok(Self::holder_ids(
            &self.document.read().entities,
            PermissibleKind::Entity,
        ))
    }

    async fn get_entity(&self, id: Uuid) -> Result<PermissibleRecord, BackendError> {
        let document = self.document.read();
        Ok(Self::to_record(
            id,
            PermissibleKind::Entity,
            document.entities.get(&id.to_string()),
            &document.default_groups,
        ))
    }

    async fn get_group(&self, id: Uuid) -> Result<PermissibleRecord, BackendError> {
        let document = self.document.read();
        Ok(Self::to_record(
            id,
            PermissibleKind::Group,
            document.groups.get(&id.to_string()),
            &document.default_groups,
        ))
    }

    async fn get_default_group(
        &self,
        references: &References,
    ) -> Result<Option<Uuid>, BackendError> {
        let key = references.canonical().to_string();
        let document = self.document.read();
        let Some(value) = document.default_groups.get(&key) else {
            return Ok(None);
        };
        match Uuid::parse_str(value) {
            Ok(id) => Ok(Some(id)),
            Err(_) => {
                warn!("Ignoring malformed default group '{}' for '{}'", value, key);
                Ok(None)
            }
        }
    }

    async fn set_default_group(
        &self,
        id: Uuid,
        references: &References,
    ) -> Result<(), BackendError> {
        let key = references.canonical().to_string();
        self.update(|document| {
            document.default_groups.insert(key, id.to_string());
            document.groups.entry(id.to_string()).or_default();
        })
        .await
    }

    async fn save_permission(&self, node: &NodeRecord) -> Result<(), BackendError> {
        let entry = NodeEntry {
            value: node.default_value.to_string(),
            value_type: node.default_value.value_type().to_string(),
            description: node.description.clone(),
        };
        let key = node.namespace.to_key();
        self.update(|document| {
            document.permissions.insert(key, entry);
        })
        .await
    }

    async fn save_entity(&self, record: &PermissibleRecord) -> Result<(), BackendError> {
        let entry = Self::to_entry(record);
        let key = record.id.to_string();
        self.update(|document| {
            document.entities.insert(key, entry);
        })
        .await
    }

    async fn save_group(&self, record: &PermissibleRecord) -> Result<(), BackendError> {
        let entry = Self::to_entry(record);
        let key = record.id.to_string();
        self.update(|document| {
            document.groups.insert(key, entry);
        })
        .await
    }

    async fn remove_entity(&self, id: Uuid) -> Result<(), BackendError> {
        let key = id.to_string();
        self.update(|document| {
            document.entities.remove(&key);
        })
        .await
    }

    async fn remove_group(&self, id: Uuid) -> Result<(), BackendError> {
        let key = id.to_string();
        self.update(|document| {
            document.groups.remove(&key);
            document.default_groups.retain(|_, group| *group != key);
        })
        .await
    }

    async fn reload_backend(&self) -> Result<(), BackendError> {
        let _guard = self.write_lock.lock().await;
        let fresh = self.read_document().await?;
        debug!(
            "Read {} nodes, {} groups, {} entities from {}",
            fresh.permissions.len(),
            fresh.groups.len(),
            fresh.entities.len(),
            self.path.display()
        );
        *self.document.write() = fresh;
        Ok(())
    }
}
