//! Shared test utilities for database operations
//!
//! Provides a common test_db() function that creates an in-memory
//! database with the full schema, so SQL backend tests run against the
//! same migrations as production.

use super::Database;

/// Create an in-memory test database with full schema
pub async fn test_db() -> Database {
    Database::new(None)
        .await
        .expect("Failed to create test database")
}
