//! SQLite implementation of [`JobStore`] and [`TaskStore`].
//!
//! Uses [`sqlx`] with the `sqlite` feature. Migrations are run automatically
//! on startup via [`SqliteStore::connect`].
//!
//! # Migrations path
//!
//! `sqlx::migrate!("./migrations")` resolves the path **at compile time**
//! relative to `CARGO_MANIFEST_DIR` (the crate root), so the directory is
//! embedded into the binary. The database file location is chosen at runtime.
//!
//! # Queries
//!
//! The `sqlx::query` (runtime-verified) form is used so that no
//! `DATABASE_URL` environment variable is needed at compile time.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::runtime::types::{JobId, JobRecord, TaskId, TaskRecord, TaskStatus, TaskUpdate};
use crate::storage::{JobStore, StoreError, TaskStore};

/// Re-reads allowed when another writer changes a task mid-update.
const UPDATE_ATTEMPTS: usize = 8;

/// How long a connection waits for the write lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

type JobRow = (String, String, Option<String>, String);

type TaskRow = (
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
    String,
    String,
);

/// Durable job/task store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g. `"sqlite://lipsync.db"`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::migrate(pool).await
    }

    /// A private in-memory database, used by tests.
    ///
    /// Every SQLite in-memory connection is a separate database, so the pool
    /// is pinned to a single long-lived connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, StoreError> {
        // Path is resolved relative to CARGO_MANIFEST_DIR at compile time.
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(Self { pool })
    }
}

// ── JobStore ──────────────────────────────────────────────────────────────────

impl JobStore for SqliteStore {
    async fn create_job(&self, job: JobRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO jobs (id, input_path, preview_path, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(job.job_id.to_string())
        .bind(path_text(&job.input_path))
        .bind(job.preview_path.as_deref().map(path_text))
        .bind(job.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Duplicate(job.job_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, input_path, preview_path, created_at FROM jobs WHERE id = ?1",
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, input_path, preview_path, created_at)| {
            Ok(JobRecord {
                job_id: parse_id(&id)?,
                input_path: PathBuf::from(input_path),
                preview_path: preview_path.map(PathBuf::from),
                created_at: parse_timestamp(&id, "created_at", &created_at),
            })
        })
        .transpose()
    }
}

// ── TaskStore ─────────────────────────────────────────────────────────────────

impl TaskStore for SqliteStore {
    async fn create_task(&self, task: TaskRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO tasks (id, job_id, text, status, progress, output_path, error_message, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(task.task_id.to_string())
        .bind(task.job_id.to_string())
        .bind(&task.text)
        .bind(task.status.as_ref())
        .bind(i64::from(task.progress))
        .bind(task.output_path.as_deref().map(path_text))
        .bind(&task.error_message)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Duplicate(task.task_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let row: Option<TaskRow> = sqlx::query_as(
            "SELECT id, job_id, text, status, progress, output_path, error_message, created_at, updated_at \
             FROM tasks WHERE id = ?1",
        )
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(task_from_row).transpose()
    }

    async fn update_task(
        &self,
        task_id: TaskId,
        update: TaskUpdate,
    ) -> Result<TaskRecord, StoreError> {
        // Optimistic write: the UPDATE only lands if the row still holds the
        // state that was validated. A single autocommit statement takes the
        // write lock directly, so concurrent writers wait on busy_timeout
        // instead of failing a deferred lock upgrade.
        for _ in 0..UPDATE_ATTEMPTS {
            let row: Option<TaskRow> = sqlx::query_as(
                "SELECT id, job_id, text, status, progress, output_path, error_message, created_at, updated_at \
                 FROM tasks WHERE id = ?1",
            )
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Err(StoreError::NotFound(task_id.to_string()));
            };
            let (seen_status, seen_updated_at) = (row.3.clone(), row.8.clone());
            let mut record = task_from_row(row)?;
            record.apply(&update, Utc::now())?;

            let result = sqlx::query(
                "UPDATE tasks SET status = ?1, progress = ?2, output_path = ?3, error_message = ?4, updated_at = ?5 \
                 WHERE id = ?6 AND status = ?7 AND updated_at = ?8",
            )
            .bind(record.status.as_ref())
            .bind(i64::from(record.progress))
            .bind(record.output_path.as_deref().map(path_text))
            .bind(&record.error_message)
            .bind(record.updated_at.to_rfc3339())
            .bind(task_id.to_string())
            .bind(&seen_status)
            .bind(&seen_updated_at)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(record);
            }
            debug!(task_id = %task_id, "task changed underneath update; retrying");
        }
        Err(StoreError::Conflict(task_id.to_string()))
    }

    async fn list_unfinished(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, job_id, text, status, progress, output_path, error_message, created_at, updated_at \
             FROM tasks WHERE status NOT IN ('done', 'error') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(task_from_row).collect()
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn task_from_row(row: TaskRow) -> Result<TaskRecord, StoreError> {
    let (id, job_id, text, status, progress, output_path, error_message, created_at, updated_at) =
        row;
    let status = status
        .parse::<TaskStatus>()
        .map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            message: format!("unknown status '{status}': {e}"),
        })?;

    Ok(TaskRecord {
        task_id: parse_id(&id)?,
        job_id: parse_id(&job_id)?,
        text,
        status,
        progress: progress.clamp(0, 100) as u8,
        output_path: output_path.map(PathBuf::from),
        error_message,
        created_at: parse_timestamp(&id, "created_at", &created_at),
        updated_at: parse_timestamp(&id, "updated_at", &updated_at),
    })
}

fn parse_id(raw: &str) -> Result<Uuid, StoreError> {
    raw.parse::<Uuid>().map_err(|e| StoreError::Corrupt {
        id: raw.to_owned(),
        message: format!("invalid uuid: {e}"),
    })
}

fn parse_timestamp(id: &str, field: &str, raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|e: chrono::ParseError| {
        warn!(record = %id, field, raw = %raw, error = %e, "failed to parse timestamp; using now");
        Utc::now()
    })
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
