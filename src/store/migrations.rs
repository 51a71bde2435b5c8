//! Schema migrations for the memento database
//!
//! When the schema version changes, migrations upgrade existing databases in
//! place without losing data.
//!
//! ## Adding a new migration
//!
//! 1. Increment `CURRENT_SCHEMA_VERSION` in `helpers.rs`
//! 2. Add a new migration function: `async fn migrate_vN_to_vM(conn) -> Result<()>`
//! 3. Add the case to `run_migration()`: `(N, M) => migrate_vN_to_vM(conn).await`
//! 4. Update `schema.sql` with the new schema
//!
//! ## Migration guidelines
//!
//! - Most changes are additive (new columns, new tables) - these preserve data
//! - For new columns with NOT NULL, use DEFAULT or populate from existing data
//! - Keep migrations idempotent where possible (use IF NOT EXISTS)

use sqlx::SqlitePool;

use super::helpers::StoreError;

/// Run all migrations from stored version to current version, in a single
/// transaction so a partial upgrade never persists.
pub async fn migrate(pool: &SqlitePool, from: i32, to: i32) -> Result<(), StoreError> {
    if from == to {
        return Ok(());
    }
    if from > to {
        return Err(StoreError::SchemaNewerThanBuild(from));
    }

    tracing::info!(
        from_version = from,
        to_version = to,
        "Starting schema migration"
    );

    let mut tx = pool.begin().await?;
    for version in from..to {
        tracing::info!(from = version, to = version + 1, "Running migration step");
        run_migration(&mut tx, version, version + 1).await?;
    }
    sqlx::query("UPDATE metadata SET value = ?1 WHERE key = 'schema_version'")
        .bind(to.to_string())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::info!(new_version = to, "Schema migration complete");

    Ok(())
}

/// Run a single migration step
async fn run_migration(
    conn: &mut sqlx::SqliteConnection,
    from: i32,
    to: i32,
) -> Result<(), StoreError> {
    match (from, to) {
        (1, 2) => migrate_v1_to_v2(conn).await,
        _ => Err(StoreError::MigrationNotSupported(from, to)),
    }
}

// ============================================================================
// Migration functions
// ============================================================================

/// Migrate from v1 to v2: add the (collection, ts) covering index and a
/// created_at column populated from ts for pre-existing rows.
async fn migrate_v1_to_v2(conn: &mut sqlx::SqliteConnection) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_memories_collection_ts ON memories(collection, ts DESC)",
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(session_id)")
        .execute(&mut *conn)
        .await?;

    // created_at did not exist in v1; backfill from the write timestamp
    let has_column: Option<(i64,)> = sqlx::query_as(
        "SELECT COUNT(*) FROM pragma_table_info('memories') WHERE name = 'created_at'",
    )
    .fetch_optional(&mut *conn)
    .await?;
    if has_column.map(|(n,)| n).unwrap_or(0) == 0 {
        sqlx::query("ALTER TABLE memories ADD COLUMN created_at TEXT NOT NULL DEFAULT ''")
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            "UPDATE memories SET created_at = datetime(ts, 'unixepoch') WHERE created_at = ''",
        )
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_not_supported_error() {
        let err = StoreError::MigrationNotSupported(5, 6);
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains('6'));
    }

    #[test]
    fn test_newer_schema_rejected() {
        let err = StoreError::SchemaNewerThanBuild(99);
        assert!(err.to_string().contains("99"));
    }
}
