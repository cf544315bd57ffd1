//! Database module - SQLite schema for the SQL permission backend

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

#[cfg(test)]
pub mod test_utils;

/// Database handle wrapping SQLite connection pool
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    /// If path is None, uses in-memory database (for testing)
    pub async fn new(path: Option<&str>) -> Result<Self, sqlx::Error> {
        let (conn_str, max_connections) = match path {
            Some(p) => (format!("sqlite:{}?mode=rwc", p), 10),
            // Every connection to :memory: is its own database
            None => ("sqlite::memory:".to_string(), 1),
        };

        let options = SqliteConnectOptions::from_str(&conn_str)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
        if path.is_none() {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        info!("Running database migrations...");

        // Node definitions, keyed by dotted namespace
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS permission_nodes (
                namespace TEXT PRIMARY KEY,
                value TEXT NOT NULL DEFAULT '',
                value_type TEXT NOT NULL DEFAULT 'unset',
                description TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Entities and groups; an entity and a group may share an id
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS permissibles (
                id TEXT NOT NULL,
                kind TEXT NOT NULL,
                banned INTEGER NOT NULL DEFAULT 0,
                whitelisted INTEGER NOT NULL DEFAULT 0,
                op INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (id, kind)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Assignments; refs is the comma-joined scope, '' for global
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS permissible_permissions (
                holder_id TEXT NOT NULL,
                holder_kind TEXT NOT NULL,
                namespace TEXT NOT NULL,
                value TEXT,
                value_type TEXT,
                refs TEXT NOT NULL DEFAULT '',
                expiry INTEGER,
                position INTEGER NOT NULL,
                PRIMARY KEY (holder_id, holder_kind, namespace, refs),
                FOREIGN KEY (holder_id, holder_kind)
                    REFERENCES permissibles(id, kind) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS permissible_groups (
                holder_id TEXT NOT NULL,
                holder_kind TEXT NOT NULL,
                group_id TEXT NOT NULL,
                refs TEXT NOT NULL DEFAULT '',
                expiry INTEGER,
                position INTEGER NOT NULL,
                PRIMARY KEY (holder_id, holder_kind, group_id, refs),
                FOREIGN KEY (holder_id, holder_kind)
                    REFERENCES permissibles(id, kind) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS default_groups (
                refs TEXT PRIMARY KEY,
                group_id TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Create indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_permissibles_kind ON permissibles(kind)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_default_groups_group ON default_groups(group_id)",
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check if database is healthy
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_db_creation() {
        let db = Database::new(None).await.unwrap();
        db.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_migrations_run() {
        let db = Database::new(None).await.unwrap();

        for table in [
            "permission_nodes",
            "permissibles",
            "permissible_permissions",
            "permissible_groups",
            "default_groups",
        ] {
            let result: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(db.pool())
                .await
                .unwrap();
            assert_eq!(result.0, 0, "table {} should start empty", table);
        }
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::new(None).await.unwrap();
        db.run_migrations().await.unwrap();
        db.health_check().await.unwrap();
    }
}
