//! SQLite backend

use async_trait::async_trait;
use chrono::DateTime;
use tracing::warn;
use uuid::Uuid;

use super::{BackendError, NodeRecord, PermissionBackend};
use crate::db::Database;
use crate::namespace::Namespace;
use crate::node::PermissionValue;
use crate::permissible::{ChildPermission, GroupMembership, PermissibleKind, PermissibleRecord};
use crate::references::References;

/// Row type for SQLite queries
#[derive(sqlx::FromRow)]
struct NodeRow {
    namespace: String,
    value: String,
    value_type: String,
    description: Option<String>,
}

impl NodeRow {
    fn into_record(self) -> Option<NodeRecord> {
        let namespace = match Namespace::parse_concrete(&self.namespace) {
            Ok(ns) => ns,
            Err(e) => {
                warn!("Skipping node '{}': {}", self.namespace, e);
                return None;
            }
        };
        let default_value = PermissionValue::from_stored(&self.value, &self.value_type)
            .unwrap_or_else(|loose| {
                warn!(
                    "Node '{}' value '{}' is not a {}, keeping it untyped",
                    self.namespace, self.value, self.value_type
                );
                loose
            });
        Some(NodeRecord {
            namespace,
            default_value,
            description: self.description,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HolderRow {
    banned: bool,
    whitelisted: bool,
    op: bool,
}

#[derive(sqlx::FromRow)]
struct AssignmentRow {
    namespace: String,
    value: Option<String>,
    value_type: Option<String>,
    refs: String,
    expiry: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct MembershipRow {
    group_id: String,
    refs: String,
    expiry: Option<i64>,
}

/// Backend over the `permission_nodes` / `permissibles` schema
#[derive(Debug, Clone)]
pub struct SqlBackend {
    db: Database,
}

impl SqlBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Open (or create) the database at `path`, in memory when `None`
    pub async fn open(path: Option<&str>) -> Result<Self, BackendError> {
        Ok(Self::new(Database::new(path).await?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn load_ids(&self, kind: PermissibleKind) -> Result<Vec<Uuid>, BackendError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM permissibles WHERE kind = ? ORDER BY id")
                .bind(kind.to_string())
                .fetch_all(self.db.pool())
                .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(id,)| match Uuid::parse_str(&id) {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!("Skipping {} with malformed id '{}'", kind, id);
                    None
                }
            })
            .collect())
    }

    async fn load_record(
        &self,
        id: Uuid,
        kind: PermissibleKind,
    ) -> Result<PermissibleRecord, BackendError> {
        let pool = self.db.pool();
        let key = id.to_string();
        let kind_key = kind.to_string();
        let mut record = PermissibleRecord::empty(id, kind);

        let holder: Option<HolderRow> = sqlx::query_as(
            "SELECT banned, whitelisted, op FROM permissibles WHERE id = ? AND kind = ?",
        )
        .bind(&key)
        .bind(&kind_key)
        .fetch_optional(pool)
        .await?;
        if let Some(holder) = holder {
            record.banned = holder.banned;
            record.whitelisted = holder.whitelisted;
            record.op = holder.op;
        }

        let assignments: Vec<AssignmentRow> = sqlx::query_as(
            "SELECT namespace, value, value_type, refs, expiry FROM permissible_permissions WHERE holder_id = ? AND holder_kind = ? ORDER BY position",
        )
        .bind(&key)
        .bind(&kind_key)
        .fetch_all(pool)
        .await?;
        for row in assignments {
            let namespace = match Namespace::parse_concrete(&row.namespace) {
                Ok(ns) => ns,
                Err(e) => {
                    warn!("Skipping permission '{}' on {} {}: {}", row.namespace, kind, id, e);
                    continue;
                }
            };
            let tag = row.value_type.as_deref().unwrap_or_default();
            let value = row.value.as_deref().map(|text| {
                PermissionValue::from_stored(text, tag).unwrap_or_else(|loose| {
                    warn!(
                        "Permission '{}' on {} {} is not a {}",
                        row.namespace, kind, id, tag
                    );
                    loose
                })
            });
            record.permissions.push(ChildPermission::new(
                id,
                namespace,
                value.filter(|v| !v.is_unset()),
                References::parse(&row.refs),
                row.expiry.and_then(|secs| DateTime::from_timestamp(secs, 0)),
            ));
        }

        let memberships: Vec<MembershipRow> = sqlx::query_as(
            "SELECT group_id, refs, expiry FROM permissible_groups WHERE holder_id = ? AND holder_kind = ? ORDER BY position",
        )
        .bind(&key)
        .bind(&kind_key)
        .fetch_all(pool)
        .await?;
        for row in memberships {
            let Ok(group) = Uuid::parse_str(&row.group_id) else {
                warn!("Skipping group reference '{}' on {} {}", row.group_id, kind, id);
                continue;
            };
            record.groups.push(GroupMembership::new(
                group,
                References::parse(&row.refs),
                row.expiry.and_then(|secs| DateTime::from_timestamp(secs, 0)),
            ));
        }

        if kind == PermissibleKind::Group {
            let scopes: Vec<(String,)> =
                sqlx::query_as("SELECT refs FROM default_groups WHERE group_id = ? ORDER BY refs")
                    .bind(&key)
                    .fetch_all(pool)
                    .await?;
            record.default_scopes = scopes
                .into_iter()
                .map(|(refs,)| References::parse(&refs))
                .collect();
        }

        Ok(record)
    }

    /// Replace every row of a holder in one transaction
    async fn store_record(&self, record: &PermissibleRecord) -> Result<(), BackendError> {
        let key = record.id.to_string();
        let kind_key = record.kind.to_string();
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO permissibles (id, kind, banned, whitelisted, op, updated_at)
            VALUES (?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(id, kind) DO UPDATE SET
                banned = excluded.banned,
                whitelisted = excluded.whitelisted,
                op = excluded.op,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&key)
        .bind(&kind_key)
        .bind(record.banned)
        .bind(record.whitelisted)
        .bind(record.op)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM permissible_permissions WHERE holder_id = ? AND holder_kind = ?")
            .bind(&key)
            .bind(&kind_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM permissible_groups WHERE holder_id = ? AND holder_kind = ?")
            .bind(&key)
            .bind(&kind_key)
            .execute(&mut *tx)
            .await?;

        for (position, grant) in record.permissions.iter().enumerate() {
            sqlx::query(
                "INSERT INTO permissible_permissions (holder_id, holder_kind, namespace, value, value_type, refs, expiry, position) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&key)
            .bind(&kind_key)
            .bind(grant.namespace.to_string())
            .bind(grant.value.as_ref().map(|v| v.to_string()))
            .bind(grant.value.as_ref().map(|v| v.value_type().to_string()))
            .bind(grant.references.to_string())
            .bind(grant.expiry.map(|at| at.timestamp()))
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        for (position, membership) in record.groups.iter().enumerate() {
            sqlx::query(
                "INSERT INTO permissible_groups (holder_id, holder_kind, group_id, refs, expiry, position) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&key)
            .bind(&kind_key)
            .bind(membership.group.to_string())
            .bind(membership.references.to_string())
            .bind(membership.expiry.map(|at| at.timestamp()))
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PermissionBackend for SqlBackend {
    fn name(&self) -> &str {
        "sql"
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        self.db.health_check().await?;
        Ok(())
    }

    async fn load_permissions(&self) -> Result<Vec<NodeRecord>, BackendError> {
        let rows: Vec<NodeRow> = sqlx::query_as(
            "SELECT namespace, value, value_type, description FROM permission_nodes ORDER BY namespace",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.into_iter().filter_map(NodeRow::into_record).collect())
    }

    async fn load_groups(&self) -> Result<Vec<Uuid>, BackendError> {
        self.load_ids(PermissibleKind::Group).await
    }

    async fn load_entities(&self) -> Result<Vec<Uuid>, BackendError> {
        self.load_ids(PermissibleKind::Entity).await
    }

    async fn get_entity(&self, id: Uuid) -> Result<PermissibleRecord, BackendError> {
        self.load_record(id, PermissibleKind::Entity).await
    }

    async fn get_group(&self, id: Uuid) -> Result<PermissibleRecord, BackendError> {
        self.load_record(id, PermissibleKind::Group).await
    }

    async fn get_default_group(
        &self,
        references: &References,
    ) -> Result<Option<Uuid>, BackendError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT group_id FROM default_groups WHERE refs = ?")
                .bind(references.canonical().to_string())
                .fetch_optional(self.db.pool())
                .await?;
        Ok(row.and_then(|(group,)| match Uuid::parse_str(&group) {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("Ignoring malformed default group '{}'", group);
                None
            }
        }))
    }

    async fn set_default_group(
        &self,
        id: Uuid,
        references: &References,
    ) -> Result<(), BackendError> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("INSERT OR IGNORE INTO permissibles (id, kind) VALUES (?, ?)")
            .bind(id.to_string())
            .bind(PermissibleKind::Group.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO default_groups (refs, group_id) VALUES (?, ?) ON CONFLICT(refs) DO UPDATE SET group_id = excluded.group_id",
        )
        .bind(references.canonical().to_string())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_permission(&self, node: &NodeRecord) -> Result<(), BackendError> {
        sqlx::query(
            r#"
            INSERT INTO permission_nodes (namespace, value, value_type, description)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(namespace) DO UPDATE SET
                value = excluded.value,
                value_type = excluded.value_type,
                description = excluded.description
            "#,
        )
        .bind(node.namespace.to_string())
        .bind(node.default_value.to_string())
        .bind(node.default_value.value_type().to_string())
        .bind(node.description.as_deref())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn save_entity(&self, record: &PermissibleRecord) -> Result<(), BackendError> {
        self.store_record(record).await
    }

    async fn save_group(&self, record: &PermissibleRecord) -> Result<(), BackendError> {
        self.store_record(record).await
    }

    async fn remove_entity(&self, id: Uuid) -> Result<(), BackendError> {
        sqlx::query("DELETE FROM permissibles WHERE id = ? AND kind = ?")
            .bind(id.to_string())
            .bind(PermissibleKind::Entity.to_string())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    async fn remove_group(&self, id: Uuid) -> Result<(), BackendError> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("DELETE FROM default_groups WHERE group_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM permissibles WHERE id = ? AND kind = ?")
            .bind(id.to_string())
            .bind(PermissibleKind::Group.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reload_backend(&self) -> Result<(), BackendError> {
        // Nothing is cached above the pool
        self.db.health_check().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    async fn backend() -> SqlBackend {
        let backend = SqlBackend::new(test_db().await);
        backend.initialize().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_record_round_trip() {
        let backend = backend().await;
        let id = Uuid::new_v4();
        let group = Uuid::new_v4();

        let mut record = PermissibleRecord::empty(id, PermissibleKind::Entity);
        record.op = true;
        record.permissions.push(ChildPermission::new(
            id,
            Namespace::parse("io.amelia.user").unwrap(),
            Some(PermissionValue::Bool(false)),
            References::parse("worlda"),
            DateTime::from_timestamp(4_000_000_000, 0),
        ));
        record.permissions.push(ChildPermission::new(
            id,
            Namespace::parse("io.amelia.admin").unwrap(),
            None,
            References::global(),
            None,
        ));
        record
            .groups
            .push(GroupMembership::new(group, References::parse("worldb"), None));

        backend.save_entity(&record).await.unwrap();
        assert_eq!(backend.get_entity(id).await.unwrap(), record);
        assert_eq!(backend.load_entities().await.unwrap(), vec![id]);
        assert!(backend.load_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_typed_values_round_trip() {
        let backend = backend().await;
        let id = Uuid::new_v4();

        let mut record = PermissibleRecord::empty(id, PermissibleKind::Entity);
        for (node, value) in [
            ("io.amelia.homes", PermissionValue::Int(1)),
            ("io.amelia.spawns", PermissionValue::Int(0)),
            ("io.amelia.rank", PermissionValue::Enum("yes".into())),
        ] {
            record.permissions.push(ChildPermission::new(
                id,
                Namespace::parse(node).unwrap(),
                Some(value),
                References::global(),
                None,
            ));
        }
        backend.save_entity(&record).await.unwrap();
        assert_eq!(backend.get_entity(id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_entity_and_group_may_share_an_id() {
        let backend = backend().await;
        let id = Uuid::new_v4();

        let mut entity = PermissibleRecord::empty(id, PermissibleKind::Entity);
        entity.banned = true;
        entity.permissions.push(ChildPermission::new(
            id,
            Namespace::parse("io.amelia.user").unwrap(),
            Some(PermissionValue::Bool(true)),
            References::global(),
            None,
        ));
        let mut group = PermissibleRecord::empty(id, PermissibleKind::Group);
        group.permissions.push(ChildPermission::new(
            id,
            Namespace::parse("io.amelia.admin").unwrap(),
            Some(PermissionValue::Bool(false)),
            References::global(),
            None,
        ));

        backend.save_entity(&entity).await.unwrap();
        backend.save_group(&group).await.unwrap();

        assert_eq!(backend.get_entity(id).await.unwrap(), entity);
        assert_eq!(backend.get_group(id).await.unwrap(), group);
        assert_eq!(backend.load_entities().await.unwrap(), vec![id]);
        assert_eq!(backend.load_groups().await.unwrap(), vec![id]);

        backend.remove_group(id).await.unwrap();
        assert_eq!(backend.get_entity(id).await.unwrap(), entity);
        assert!(backend.load_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_replaces_rows() {
        let backend = backend().await;
        let id = Uuid::new_v4();

        let mut record = PermissibleRecord::empty(id, PermissibleKind::Group);
        record.permissions.push(ChildPermission::new(
            id,
            Namespace::parse("a.b").unwrap(),
            Some(PermissionValue::Int(2)),
            References::global(),
            None,
        ));
        backend.save_group(&record).await.unwrap();

        record.permissions.clear();
        backend.save_group(&record).await.unwrap();
        assert!(backend.get_group(id).await.unwrap().permissions.is_empty());
    }

    #[tokio::test]
    async fn test_nodes_upsert() {
        let backend = backend().await;
        let mut node = NodeRecord {
            namespace: Namespace::parse("io.amelia").unwrap(),
            default_value: PermissionValue::Bool(true),
            description: None,
        };
        backend.save_permission(&node).await.unwrap();
        node.description = Some("root".to_string());
        backend.save_permission(&node).await.unwrap();

        assert_eq!(backend.load_permissions().await.unwrap(), vec![node]);
    }

    #[tokio::test]
    async fn test_default_groups() {
        let backend = backend().await;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        backend
            .set_default_group(first, &References::parse("b,a"))
            .await
            .unwrap();
        backend
            .set_default_group(second, &References::global())
            .await
            .unwrap();

        assert_eq!(
            backend
                .get_default_group(&References::parse("a,b"))
                .await
                .unwrap(),
            Some(first)
        );
        assert_eq!(
            backend.get_default_group(&References::global()).await.unwrap(),
            Some(second)
        );
        assert_eq!(
            backend.get_group(first).await.unwrap().default_scopes,
            vec![References::parse("a,b")]
        );

        backend.remove_group(first).await.unwrap();
        assert_eq!(
            backend
                .get_default_group(&References::parse("a,b"))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_remove_entity_cascades() {
        let backend = backend().await;
        let id = Uuid::new_v4();
        let mut record = PermissibleRecord::empty(id, PermissibleKind::Entity);
        record.permissions.push(ChildPermission::new(
            id,
            Namespace::parse("a").unwrap(),
            None,
            References::global(),
            None,
        ));
        backend.save_entity(&record).await.unwrap();
        backend.remove_entity(id).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM permissible_permissions")
            .fetch_one(backend.database().pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(backend.get_entity(id).await.unwrap().permissions.is_empty());
    }
}
