//! Persistence backends
//!
//! A backend loads and saves nodes, permissibles and default-group pointers.
//! It never touches the registry caches; the registry asks it for records and
//! materializes them. Exactly one registered backend is active at a time.

mod file;
mod memory;
mod sql;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use sql::SqlBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::namespace::Namespace;
use crate::node::{Permission, PermissionValue};
use crate::permissible::PermissibleRecord;
use crate::references::References;

/// Backend failures. Recoverable: callers keep their previous state.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        BackendError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Stored definition of a permission node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub namespace: Namespace,
    pub default_value: PermissionValue,
    pub description: Option<String>,
}

impl From<&Permission> for NodeRecord {
    fn from(node: &Permission) -> Self {
        Self {
            namespace: node.namespace.clone(),
            default_value: node.default_value.clone(),
            description: node.description.clone(),
        }
    }
}

/// Storage provider for the permission registry
#[async_trait]
pub trait PermissionBackend: Send + Sync {
    /// Name the registry selects this backend by
    fn name(&self) -> &str;

    /// Prepare the store (create files, run migrations, check connectivity)
    async fn initialize(&self) -> Result<(), BackendError>;

    /// Every stored node definition. Malformed entries are skipped.
    async fn load_permissions(&self) -> Result<Vec<NodeRecord>, BackendError>;

    /// Ids of every stored group
    async fn load_groups(&self) -> Result<Vec<Uuid>, BackendError>;

    /// Ids of every stored entity
    async fn load_entities(&self) -> Result<Vec<Uuid>, BackendError>;

    /// Materialize-or-create: unknown ids yield an empty record
    async fn get_entity(&self, id: Uuid) -> Result<PermissibleRecord, BackendError>;

    /// Materialize-or-create: unknown ids yield an empty record
    async fn get_group(&self, id: Uuid) -> Result<PermissibleRecord, BackendError>;

    async fn get_default_group(&self, references: &References)
        -> Result<Option<Uuid>, BackendError>;

    async fn set_default_group(&self, id: Uuid, references: &References)
        -> Result<(), BackendError>;

    async fn save_permission(&self, node: &NodeRecord) -> Result<(), BackendError>;

    async fn save_entity(&self, record: &PermissibleRecord) -> Result<(), BackendError>;

    async fn save_group(&self, record: &PermissibleRecord) -> Result<(), BackendError>;

    /// Persistent deletion, distinct from evicting a cache slot
    async fn remove_entity(&self, id: Uuid) -> Result<(), BackendError>;

    async fn remove_group(&self, id: Uuid) -> Result<(), BackendError>;

    /// Re-read the underlying store, discarding anything cached locally
    async fn reload_backend(&self) -> Result<(), BackendError>;
}
