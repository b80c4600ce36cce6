use std::path::Path;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, Row, SqlitePool};
use tracing::{debug, info};

/// The two stores are deliberately separate database files with separate
/// schemas: the agent's lives under the user's data dir, the daemon's in
/// a root-only state dir. They share only the migration mechanics below.
///
/// Versions in each set must be strictly increasing; a store records
/// which versions it has run in its own `migrations` ledger table.
const AGENT_MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "agent_schema",
    include_str!("../migrations/20260301_000001_agent_schema.sql"),
)];

const DAEMON_MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "daemon_schema",
    include_str!("../migrations/20260301_000002_daemon_schema.sql"),
)];

/// Open (creating if missing) the agent's user-scoped store.
pub async fn create_agent_pool(db_path: &Path) -> Result<SqlitePool> {
    open_store(db_path, AGENT_MIGRATIONS).await
}

/// Open (creating if missing) the daemon's root-scoped store. The caller
/// is responsible for placing it in a root-only directory.
pub async fn create_daemon_pool(db_path: &Path) -> Result<SqlitePool> {
    open_store(db_path, DAEMON_MIGRATIONS).await
}

async fn open_store(db_path: &Path, migrations: &[(i64, &str, &str)]) -> Result<SqlitePool> {
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("preparing store directory {}", dir.display()))?;
    }

    // WAL keeps the agent's reconciler reads from blocking CLI writes;
    // foreign keys back the schedules -> bundles cascade.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("opening store {}", db_path.display()))?;

    bring_schema_current(&pool, migrations)
        .await
        .with_context(|| format!("migrating store {}", db_path.display()))?;

    info!(path = %db_path.display(), "store ready");
    Ok(pool)
}

async fn bring_schema_current(pool: &SqlitePool, migrations: &[(i64, &str, &str)]) -> Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            run_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        )",
    )
    .await
    .context("creating migration ledger")?;

    let latest: i64 = sqlx::query("SELECT COALESCE(MAX(version), 0) AS latest FROM migrations")
        .fetch_one(pool)
        .await
        .context("reading migration ledger")?
        .get("latest");

    let pending: Vec<&(i64, &str, &str)> = migrations.iter().filter(|(version, _, _)| *version > latest).collect();
    if pending.is_empty() {
        debug!(latest, "schema already current");
        return Ok(());
    }

    for &&(version, name, sql) in &pending {
        pool.execute(sql).await.with_context(|| format!("running {name} (v{version})"))?;
        sqlx::query("INSERT INTO migrations (version, name) VALUES (?, ?)")
            .bind(version)
            .bind(name)
            .execute(pool)
            .await
            .with_context(|| format!("recording {name} in the ledger"))?;
        debug!(version, name, "migration ran");
    }

    info!(count = pending.len(), "schema migrated");
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// In-memory agent store for tests.
    pub async fn memory_agent_pool() -> SqlitePool {
        memory_pool(AGENT_MIGRATIONS).await
    }

    /// In-memory daemon store for tests.
    pub async fn memory_daemon_pool() -> SqlitePool {
        memory_pool(DAEMON_MIGRATIONS).await
    }

    async fn memory_pool(migrations: &[(i64, &str, &str)]) -> SqlitePool {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("in-memory sqlite");
        bring_schema_current(&pool, migrations).await.expect("migrations");
        pool
    }
}
