//! Schema migrations. Each step is additive so existing rows survive.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, instrument};

use crate::error::{Result, VmforkError};

pub const SCHEMA_VERSION: i64 = 2;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(failed)?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await
        .map_err(failed)?;
    let current = current.unwrap_or(0);

    if current >= SCHEMA_VERSION {
        tracing::debug!(version = current, "registry schema is up to date");
        return Ok(());
    }

    info!(from = current, to = SCHEMA_VERSION, "migrating registry schema");

    if current < 1 {
        migrate_to_v1(pool).await?;
    }
    if current < 2 {
        migrate_to_v2(pool).await?;
    }

    Ok(())
}

fn failed(e: sqlx::Error) -> VmforkError {
    VmforkError::Registry {
        message: format!("migration failed: {e}"),
    }
}

/// Record `version` on the connection running the migration, so the bump
/// commits or rolls back with it.
async fn set_version(conn: &mut SqliteConnection, version: i64) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(conn)
        .await
        .map_err(failed)?;
    Ok(())
}

/// Projects, tasks and scoped secrets.
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await.map_err(failed)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            name TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            vm_handle TEXT NOT NULL,
            base_image_path TEXT NOT NULL,
            ip TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(failed)?;

    // project_name is NULL for orphan rows.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            project_name TEXT REFERENCES projects(name),
            provider TEXT NOT NULL,
            vm_handle TEXT NOT NULL,
            ip TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(failed)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_name)")
        .execute(&mut *tx)
        .await
        .map_err(failed)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS secrets (
            name TEXT NOT NULL,
            scope TEXT NOT NULL DEFAULT '',
            value BLOB NOT NULL,
            PRIMARY KEY (name, scope)
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(failed)?;

    set_version(&mut tx, 1).await?;
    tx.commit().await.map_err(failed)
}

/// Tasks record the base image of the project they were cloned from.
/// Databases written by older builds may already have the column without
/// the version bump, so its presence is checked first.
async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await.map_err(failed)?;

    let present: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('tasks') WHERE name = 'base_image_path'",
    )
    .fetch_one(&mut *tx)
    .await
    .map_err(failed)?;
    if present == 0 {
        sqlx::query("ALTER TABLE tasks ADD COLUMN base_image_path TEXT NOT NULL DEFAULT ''")
            .execute(&mut *tx)
            .await
            .map_err(failed)?;
    }

    set_version(&mut tx, 2).await?;
    tx.commit().await.map_err(failed)
}
