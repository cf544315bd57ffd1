//! Common test utilities - PermTest harness for end-to-end registry tests

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use permtree::backend::NodeRecord;
use permtree::permissible::PermissibleRecord;
use permtree::{
    BackendError, FileBackend, MemoryBackend, Namespace, PermissibleKind, PermissionBackend,
    PermissionValue, Permissions, PermissionsConfig, References,
};
use tempfile::TempDir;
use uuid::Uuid;

/// Registry with a memory backend (active) and a file backend in a temp dir
pub struct PermTest {
    pub permissions: Arc<Permissions>,
    pub memory: Arc<MemoryBackend>,
    pub file_path: PathBuf,
    pub dir: TempDir,
}

impl PermTest {
    pub async fn start() -> Result<Self> {
        Self::start_with(PermissionsConfig::default()).await
    }

    pub async fn start_with(config: PermissionsConfig) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let file_path = dir.path().join("permissions.json");

        let permissions = Arc::new(Permissions::new(config));
        let memory = Arc::new(MemoryBackend::new());
        permissions.register_backend(memory.clone());
        permissions.register_backend(Arc::new(FileBackend::new(file_path.clone())));
        permissions.set_backend("memory").await?;

        Ok(Self {
            permissions,
            memory,
            file_path,
            dir,
        })
    }

    /// Grant a boolean node
    pub async fn grant(
        &self,
        kind: PermissibleKind,
        id: Uuid,
        namespace: &str,
        value: bool,
        refs: &str,
    ) -> Result<()> {
        self.permissions
            .grant(
                kind,
                id,
                &ns(namespace),
                Some(PermissionValue::Bool(value)),
                References::parse(refs),
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn join(&self, entity: Uuid, group: Uuid, refs: &str) -> Result<bool> {
        Ok(self
            .permissions
            .add_membership(
                PermissibleKind::Entity,
                entity,
                group,
                References::parse(refs),
                None,
            )
            .await?)
    }

    pub async fn allowed(&self, entity: Uuid, namespace: &str, refs: &[&str]) -> Result<bool> {
        Ok(self.permissions.check(entity, namespace, refs).await?.is_true())
    }
}

pub fn ns(s: &str) -> Namespace {
    Namespace::parse(s).expect("valid namespace")
}

/// Memory backend that counts entity fetches and answers slowly
#[derive(Default)]
pub struct CountingBackend {
    inner: MemoryBackend,
    pub entity_fetches: AtomicUsize,
}

#[async_trait]
impl PermissionBackend for CountingBackend {
    fn name(&self) -> &str {
        "counting"
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        self.inner.initialize().await
    }

    async fn load_permissions(&self) -> Result<Vec<NodeRecord>, BackendError> {
        self.inner.load_permissions().await
    }

    async fn load_groups(&self) -> Result<Vec<Uuid>, BackendError> {
        self.inner.load_groups().await
    }

    async fn load_entities(&self) -> Result<Vec<Uuid>, BackendError> {
        self.inner.load_entities().await
    }

    async fn get_entity(&self, id: Uuid) -> Result<PermissibleRecord, BackendError> {
        self.entity_fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.get_entity(id).await
    }

    async fn get_group(&self, id: Uuid) -> Result<PermissibleRecord, BackendError> {
        self.inner.get_group(id).await
    }

    async fn get_default_group(
        &self,
        references: &References,
    ) -> Result<Option<Uuid>, BackendError> {
        self.inner.get_default_group(references).await
    }

    async fn set_default_group(
        &self,
        id: Uuid,
        references: &References,
    ) -> Result<(), BackendError> {
        self.inner.set_default_group(id, references).await
    }

    async fn save_permission(&self, node: &NodeRecord) -> Result<(), BackendError> {
        self.inner.save_permission(node).await
    }

    async fn save_entity(&self, record: &PermissibleRecord) -> Result<(), BackendError> {
        self.inner.save_entity(record).await
    }

    async fn save_group(&self, record: &PermissibleRecord) -> Result<(), BackendError> {
        self.inner.save_group(record).await
    }

    async fn remove_entity(&self, id: Uuid) -> Result<(), BackendError> {
        self.inner.remove_entity(id).await
    }

    async fn remove_group(&self, id: Uuid) -> Result<(), BackendError> {
        self.inner.remove_group(id).await
    }

    async fn reload_backend(&self) -> Result<(), BackendError> {
        self.inner.reload_backend().await
    }
}

/// Backend whose store can be taken offline
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    pub offline: AtomicBool,
}

impl FlakyBackend {
    fn check(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PermissionBackend for FlakyBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        self.check()
    }

    async fn load_permissions(&self) -> Result<Vec<NodeRecord>, BackendError> {
        self.check()?;
        self.inner.load_permissions().await
    }

    async fn load_groups(&self) -> Result<Vec<Uuid>, BackendError> {
        self.check()?;
        self.inner.load_groups().await
    }

    async fn load_entities(&self) -> Result<Vec<Uuid>, BackendError> {
        self.check()?;
        self.inner.load_entities().await
    }

    async fn get_entity(&self, id: Uuid) -> Result<PermissibleRecord, BackendError> {
        self.check()?;
        self.inner.get_entity(id).await
    }

    async fn get_group(&self, id: Uuid) -> Result<PermissibleRecord, BackendError> {
        self.check()?;
        self.inner.get_group(id).await
    }

    async fn get_default_group(
        &self,
        references: &References,
    ) -> Result<Option<Uuid>, BackendError> {
        self.check()?;
        self.inner.get_default_group(references).await
    }

    async fn set_default_group(
        &self,
        id: Uuid,
        references: &References,
    ) -> Result<(), BackendError> {
        self.check()?;
        self.inner.set_default_group(id, references).await
    }

    async fn save_permission(&self, node: &NodeRecord) -> Result<(), BackendError> {
        self.check()?;
        self.inner.save_permission(node).await
    }

    async fn save_entity(&self, record: &PermissibleRecord) -> Result<(), BackendError> {
        self.check()?;
        self.inner.save_entity(record).await
    }

    async fn save_group(&self, record: &PermissibleRecord) -> Result<(), BackendError> {
        self.check()?;
        self.inner.save_group(record).await
    }

    async fn remove_entity(&self, id: Uuid) -> Result<(), BackendError> {
        self.check()?;
        self.inner.remove_entity(id).await
    }

    async fn remove_group(&self, id: Uuid) -> Result<(), BackendError> {
        self.check()?;
        self.inner.remove_group(id).await
    }

    async fn reload_backend(&self) -> Result<(), BackendError> {
        self.check()
    }
}
