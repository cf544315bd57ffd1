//! permtree - hierarchical permission engine
//!
//! Permission nodes live in a dotted namespace tree. Entities and groups hold
//! scoped, optionally expiring grants of those nodes, and a registry resolves
//! checks against whichever persistence backend is active.

pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod namespace;
pub mod node;
pub mod permissible;
pub mod references;
pub mod registry;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

pub use backend::{BackendError, FileBackend, MemoryBackend, PermissionBackend, SqlBackend};
pub use config::{ConfigError, PermissionsConfig};
pub use error::{PermissionError, Result};
pub use namespace::{Namespace, NamespaceError};
pub use node::{Permission, PermissionDefault, PermissionType, PermissionValue};
pub use permissible::{
    ChildPermission, GroupMembership, PermissibleEntity, PermissibleGroup, PermissibleKind,
};
pub use references::{RefInheritance, References};
pub use registry::{
    Holder, PermissibleEntityEvent, PermissibleState, PermissibleSystemEvent, PermissionEvent,
    PermissionResult, Permissions, ResultSource,
};

/// Build a registry from config with its backends registered, then load the
/// configured backend.
///
/// `memory` and `file` are always registered. `sql` is registered only when
/// it is the configured backend, so the database file is not created
/// otherwise.
pub async fn open(config: PermissionsConfig, config_path: Option<PathBuf>) -> Result<Permissions> {
    let mut permissions = Permissions::new(config.clone());
    if let Some(path) = config_path {
        permissions = permissions.with_config_path(path);
    }

    permissions.register_backend(Arc::new(MemoryBackend::new()));
    permissions.register_backend(Arc::new(FileBackend::new(config.file.path.clone())));
    if config.backend == "sql" {
        let sql = SqlBackend::open(Some(&config.database.path)).await?;
        permissions.register_backend(Arc::new(sql));
    }

    permissions.start().await?;
    info!(
        "permtree ready with backend '{}' ({} nodes)",
        config.backend,
        permissions.all_nodes().len()
    );
    Ok(permissions)
}
