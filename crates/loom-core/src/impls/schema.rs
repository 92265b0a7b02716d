//! Version-tracked schema migrations for the libsql task store.
//!
//! Each migration has a version number and SQL. `run_migrations()` reads the
//! highest applied version from `_migrations` and applies the newer ones in
//! order, each in its own write transaction. The version is re-read once the
//! write lock is held, so two processes opening the same file apply every
//! step exactly once.

use libsql::Connection;

use crate::ports::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                function TEXT NOT NULL,
                args TEXT NOT NULL,
                blob_arg TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                result TEXT,
                worker TEXT,
                error TEXT,
                log TEXT,
                broken_reason TEXT,
                date_created TEXT NOT NULL,
                date_modified TEXT NOT NULL,
                date_started TEXT,
                date_finished TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, date_created);
            CREATE INDEX IF NOT EXISTS idx_tasks_function_status ON tasks(function, status);
            CREATE INDEX IF NOT EXISTS idx_tasks_date_finished ON tasks(date_finished);
            CREATE INDEX IF NOT EXISTS idx_tasks_blob_arg ON tasks(blob_arg);

            CREATE TABLE IF NOT EXISTS task_dependencies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                prev TEXT NOT NULL REFERENCES tasks(id),
                next TEXT NOT NULL REFERENCES tasks(id),
                name TEXT NOT NULL,
                UNIQUE (prev, next, name)
            );
            CREATE INDEX IF NOT EXISTS idx_task_dependencies_next ON task_dependencies(next);
            CREATE INDEX IF NOT EXISTS idx_task_dependencies_prev ON task_dependencies(prev);
        "#,
    },
    Migration {
        version: 2,
        name: "attempt_tracking",
        sql: r#"
            ALTER TABLE tasks ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE tasks ADD COLUMN not_before TEXT;
            CREATE INDEX IF NOT EXISTS idx_tasks_running_modified ON tasks(status, date_modified);
        "#,
    },
    Migration {
        version: 3,
        name: "stats_snapshots",
        sql: r#"
            CREATE TABLE IF NOT EXISTS stats (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                date_modified TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 4,
        name: "crash_tracking",
        sql: r#"
            ALTER TABLE tasks ADD COLUMN crashes INTEGER NOT NULL DEFAULT 0;
        "#,
    },
];

/// Latest schema version this build knows about.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Create `_migrations` if needed and apply every migration not applied yet.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })?;

    for migration in MIGRATIONS {
        if migration.version > current_version(conn).await? {
            apply(conn, migration).await?;
        }
    }

    tracing::debug!(version = latest_version(), "schema up to date");
    Ok(())
}

/// Apply one migration in a write transaction, unless another connection
/// got there first.
async fn apply(conn: &Connection, migration: &Migration) -> Result<(), StoreError> {
    let tx_err = |e: libsql::Error| StoreError::Migration {
        version: migration.version,
        message: format!("{} transaction failed: {e}", migration.name),
    };
    conn.execute("BEGIN IMMEDIATE", ()).await.map_err(tx_err)?;
    let result = async {
        if current_version(conn).await? >= migration.version {
            return Ok(false);
        }
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applying migration"
        );
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                message: format!("{} failed: {e}", migration.name),
            })?;
        record_version(conn, migration).await?;
        Ok::<_, StoreError>(true)
    }
    .await;

    match result {
        Ok(applied) => {
            conn.execute("COMMIT", ()).await.map_err(tx_err)?;
            if !applied {
                tracing::debug!(version = migration.version, "migration applied elsewhere");
            }
            Ok(())
        }
        Err(e) => {
            if let Err(rollback) = conn.execute("ROLLBACK", ()).await {
                tracing::warn!(error = %rollback, "migration rollback failed");
            }
            Err(e)
        }
    }
}

/// Highest applied migration version, or 0 if none.
pub async fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Query(format!("failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Query(format!("failed to read migration version: {e}")))?;

    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::decode("_migrations.version", e)),
        None => Ok(0),
    }
}

async fn record_version(conn: &Connection, migration: &Migration) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![migration.version, migration.name],
    )
    .await
    .map_err(|e| StoreError::Migration {
        version: migration.version,
        message: format!("failed to record migration: {e}"),
    })?;
    Ok(())
}
