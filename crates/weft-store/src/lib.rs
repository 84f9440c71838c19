//! Persistence layer for the weft workflow engine.
//!
//! Implements the `weft_core::Store` trait twice: on SQLite via sqlx
//! (the production embedding) and in memory (tests, throwaway engines).

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use weft_core::{Error, Result};

/// Create a new database connection pool.
///
/// `database_url` follows sqlx conventions, e.g.
/// `sqlite:weft.db?mode=rwc` or `sqlite::memory:`.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    // An in-memory database exists per connection; more than one would
    // give each borrower a different (empty) database.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| Error::System(format!("connecting to {database_url}: {e}")))
}

/// Run database migrations.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| Error::System(format!("migrations: {e}")))
}
