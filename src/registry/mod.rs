//! Durable registry of projects, tasks and encrypted secret values.
//!
//! Pure CRUD on SQLite. Uniqueness comes from primary keys; everything else
//! (the project→task delete guard, provider pinning) is enforced by the
//! orchestrator.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::instrument;

use crate::error::{Result, VmforkError};
use crate::types::{Project, Task, VmStatus};

pub mod migrations;


#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    /// Open (creating if needed) the registry at `db_path` and migrate it.
    #[instrument(skip(db_path))]
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                VmforkError::io(format!("creating directory {}", parent.display()), e)
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        tracing::debug!(path = %db_path.display(), "registry opened");
        Self::with_pool(pool).await
    }

    /// A private in-memory registry, for tests.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // Every connection to :memory: is its own database, so keep exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    // ── projects ──────────────────────────────────────────

    #[instrument(skip(self, project), fields(project = %project.name))]
    pub async fn insert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (name, provider, vm_handle, base_image_path, ip, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&project.name)
        .bind(&project.provider)
        .bind(&project.vm_handle)
        .bind(&project.base_image_path)
        .bind(&project.ip)
        .bind(project.status.as_str())
        .bind(project.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| unique_or("project", &project.name, e))?;
        Ok(())
    }

    pub async fn find_project(&self, name: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_project).transpose()
    }

    pub async fn get_project(&self, name: &str) -> Result<Project> {
        self.find_project(name)
            .await?
            .ok_or_else(|| VmforkError::ProjectNotFound {
                name: name.to_string(),
            })
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at, name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_project).collect()
    }

    #[instrument(skip(self))]
    pub async fn update_project_status(&self, name: &str, status: VmStatus) -> Result<()> {
        let done = sqlx::query("UPDATE projects SET status = ? WHERE name = ?")
            .bind(status.as_str())
            .bind(name)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(VmforkError::ProjectNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn update_project_ip(&self, name: &str, ip: Option<&str>) -> Result<()> {
        let done = sqlx::query("UPDATE projects SET ip = ? WHERE name = ?")
            .bind(ip)
            .bind(name)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(VmforkError::ProjectNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Remove a project row. Returns whether a row existed.
    #[instrument(skip(self))]
    pub async fn delete_project(&self, name: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM projects WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    // ── tasks ─────────────────────────────────────────────

    #[instrument(skip(self, task), fields(task = %task.id))]
    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        let project = (!task.project.is_empty()).then_some(task.project.as_str());
        sqlx::query(
            r#"
            INSERT INTO tasks (id, project_name, provider, vm_handle, base_image_path, ip, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(project)
        .bind(&task.provider)
        .bind(&task.vm_handle)
        .bind(&task.base_image_path)
        .bind(&task.ip)
        .bind(task.status.as_str())
        .bind(task.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| unique_or("task", &task.id, e))?;
        Ok(())
    }

    pub async fn find_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_task).transpose()
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        self.find_task(id)
            .await?
            .ok_or_else(|| VmforkError::TaskNotFound { id: id.to_string() })
    }

    /// All tasks, or only those cloned from `project`.
    pub async fn list_tasks(&self, project: Option<&str>) -> Result<Vec<Task>> {
        let rows = match project {
            Some(p) => {
                sqlx::query("SELECT * FROM tasks WHERE project_name = ? ORDER BY created_at, id")
                    .bind(p)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM tasks ORDER BY created_at, id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(row_to_task).collect()
    }

    /// Ids of tasks referencing `project`, sorted.
    pub async fn task_ids_for_project(&self, project: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM tasks WHERE project_name = ? ORDER BY id")
            .bind(project)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    #[instrument(skip(self))]
    pub async fn update_task_status(&self, id: &str, status: VmStatus) -> Result<()> {
        let done = sqlx::query("UPDATE tasks SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(VmforkError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn update_task_ip(&self, id: &str, ip: Option<&str>) -> Result<()> {
        let done = sqlx::query("UPDATE tasks SET ip = ? WHERE id = ?")
            .bind(ip)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(VmforkError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    // ── secrets ───────────────────────────────────────────

    /// Insert or overwrite the ciphertext stored under `(name, scope)`.
    #[instrument(skip(self, ciphertext))]
    pub async fn put_secret(&self, name: &str, scope: &str, ciphertext: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO secrets (name, scope, value) VALUES (?, ?, ?)
            ON CONFLICT (name, scope) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(name)
        .bind(scope)
        .bind(ciphertext)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_secret(&self, name: &str, scope: &str) -> Result<Option<Vec<u8>>> {
        let value = sqlx::query_scalar("SELECT value FROM secrets WHERE name = ? AND scope = ?")
            .bind(name)
            .bind(scope)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    #[instrument(skip(self))]
    pub async fn delete_secret(&self, name: &str, scope: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM secrets WHERE name = ? AND scope = ?")
            .bind(name)
            .bind(scope)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn secret_names(&self, scope: &str) -> Result<Vec<String>> {
        let names = sqlx::query_scalar("SELECT name FROM secrets WHERE scope = ? ORDER BY name")
            .bind(scope)
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    /// Every `(name, ciphertext)` pair stored at `scope`.
    pub async fn secrets_in_scope(&self, scope: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query("SELECT name, value FROM secrets WHERE scope = ? ORDER BY name")
            .bind(scope)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| Ok((row.try_get("name")?, row.try_get("value")?)))
            .collect()
    }
}

fn unique_or(kind: &'static str, name: &str, e: sqlx::Error) -> VmforkError {
    if let sqlx::Error::Database(db) = &e
        && db.is_unique_violation()
    {
        return VmforkError::AlreadyExists {
            kind,
            name: name.to_string(),
        };
    }
    e.into()
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| VmforkError::Registry {
            message: format!("bad timestamp '{raw}': {e}"),
        })
}

fn row_to_project(row: SqliteRow) -> Result<Project> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Project {
        name: row.try_get("name")?,
        provider: row.try_get("provider")?,
        vm_handle: row.try_get("vm_handle")?,
        base_image_path: row.try_get("base_image_path")?,
        ip: row.try_get("ip")?,
        status: status.parse()?,
        created_at: parse_time(&created_at)?,
    })
}

fn row_to_task(row: SqliteRow) -> Result<Task> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let project: Option<String> = row.try_get("project_name")?;
    Ok(Task {
        id: row.try_get("id")?,
        project: project.unwrap_or_default(),
        provider: row.try_get("provider")?,
        vm_handle: row.try_get("vm_handle")?,
        base_image_path: row.try_get("base_image_path")?,
        ip: row.try_get("ip")?,
        status: status.parse()?,
        created_at: parse_time(&created_at)?,
    })
}
