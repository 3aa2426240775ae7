use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;

use super::walker::Entry;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cached listing is corrupt: {0}")]
    Json(#[from] serde_json::Error),
    #[error("data directory is unavailable")]
    MissingDataDir,
    #[error("invalid task status: {0}")]
    InvalidStatus(String),
    #[error("task {0} not found")]
    TaskNotFound(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Copying,
    Finished,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Copying => "copying",
            TaskStatus::Finished => "finished",
            TaskStatus::Error => "error",
        }
    }

    fn parse(value: &str) -> Result<Self, LedgerError> {
        match value {
            "queued" => Ok(TaskStatus::Queued),
            "copying" => Ok(TaskStatus::Copying),
            "finished" => Ok(TaskStatus::Finished),
            "error" => Ok(TaskStatus::Error),
            other => Err(LedgerError::InvalidStatus(other.to_string())),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Copying)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: i64,
    pub source: String,
    pub target: String,
    pub status: TaskStatus,
    pub created_at: i64,
    pub finished_at: Option<i64>,
    pub error: Option<String>,
}

/// Result of trying to admit a run for a (source, target) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginRun {
    Started(i64),
    AlreadyRunning(i64),
}

impl BeginRun {
    pub fn task_id(&self) -> i64 {
        match self {
            BeginRun::Started(id) | BeginRun::AlreadyRunning(id) => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderMapping {
    pub seq: i64,
    pub source_id: String,
    pub target_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderSummary {
    pub file_count: u64,
    pub folder_count: u64,
    pub total_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedSummary {
    pub summary: FolderSummary,
    pub computed_at: i64,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProgress {
    pub task: TaskRecord,
    pub root_target: Option<String>,
    pub folders_done: u64,
    pub files_done: u64,
    pub folders_total: Option<u64>,
    pub files_total: Option<u64>,
    pub total_size: Option<u64>,
    pub percent: Option<u8>,
}

#[derive(Clone)]
pub struct ProgressLedger {
    pool: SqlitePool,
}

impl ProgressLedger {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, LedgerError> {
        let pool = SqlitePool::connect(database_url).await?;
        let ledger = Self { pool };
        ledger.init().await?;
        Ok(ledger)
    }

    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let ledger = Self { pool };
        ledger.init().await?;
        Ok(ledger)
    }

    pub async fn new_default() -> Result<Self, LedgerError> {
        Self::open(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), LedgerError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Admits a run in one statement: a new pair is inserted as `queued`, a
    /// finished or failed task is flipped back to `queued`, an active task is
    /// left alone.
    pub async fn begin_run(&self, source: &str, target: &str) -> Result<BeginRun, LedgerError> {
        let started: Option<i64> = sqlx::query_scalar(
            "INSERT INTO tasks (source, target, status, created_at, heartbeat_at)
             VALUES (?1, ?2, 'queued', ?3, ?3)
             ON CONFLICT(source, target) DO UPDATE SET
                status = 'queued',
                error = NULL,
                finished_at = NULL,
                heartbeat_at = excluded.heartbeat_at
             WHERE tasks.status NOT IN ('queued', 'copying')
             RETURNING id",
        )
        .bind(source)
        .bind(target)
        .bind(now_unix())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = started {
            return Ok(BeginRun::Started(id));
        }
        let id: i64 = sqlx::query_scalar("SELECT id FROM tasks WHERE source = ?1 AND target = ?2")
            .bind(source)
            .bind(target)
            .fetch_one(&self.pool)
            .await?;
        Ok(BeginRun::AlreadyRunning(id))
    }

    pub async fn set_status(&self, task_id: i64, status: TaskStatus) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE tasks SET status = ?1, heartbeat_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(now_unix())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        ensure_touched(result.rows_affected(), task_id)
    }

    /// Refreshes the liveness stamp of a running task.
    pub async fn touch_task(&self, task_id: i64) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE tasks SET heartbeat_at = ?1 WHERE id = ?2")
            .bind(now_unix())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        ensure_touched(result.rows_affected(), task_id)
    }

    pub async fn finish_task(&self, task_id: i64) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'finished', finished_at = ?1, error = NULL WHERE id = ?2",
        )
        .bind(now_unix())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        ensure_touched(result.rows_affected(), task_id)
    }

    pub async fn fail_task(&self, task_id: i64, message: &str) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'error', finished_at = ?1, error = ?2 WHERE id = ?3",
        )
        .bind(now_unix())
        .bind(message)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        ensure_touched(result.rows_affected(), task_id)
    }

    /// Tasks left `queued`/`copying` by a dead process become resumable
    /// errors. A task counts as dead once its heartbeat is `stale_after` old.
    pub async fn recover_interrupted(&self, stale_after: Duration) -> Result<u64, LedgerError> {
        let cutoff = now_unix().saturating_sub(to_i64(stale_after.as_secs()));
        let result = sqlx::query(
            "UPDATE tasks SET status = 'error', error = 'interrupted'
             WHERE status IN ('queued', 'copying') AND heartbeat_at <= ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, LedgerError> {
        let row = sqlx::query(
            "SELECT id, source, target, status, created_at, finished_at, error
             FROM tasks WHERE id = ?1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| task_from_row(&row)).transpose()
    }

    pub async fn find_task(
        &self,
        source: &str,
        target: &str,
    ) -> Result<Option<TaskRecord>, LedgerError> {
        let row = sqlx::query(
            "SELECT id, source, target, status, created_at, finished_at, error
             FROM tasks WHERE source = ?1 AND target = ?2",
        )
        .bind(source)
        .bind(target)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| task_from_row(&row)).transpose()
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, source, target, status, created_at, finished_at, error
             FROM tasks ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn active_tasks(&self) -> Result<Vec<TaskRecord>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, source, target, status, created_at, finished_at, error
             FROM tasks WHERE status IN ('queued', 'copying') ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Deletes the task together with its mapping and copied-file rows.
    pub async fn remove_task(&self, task_id: i64) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM copied_files WHERE task_id = ?1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM folder_mappings WHERE task_id = ?1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        ensure_touched(result.rows_affected(), task_id)?;
        tx.commit().await?;
        Ok(())
    }

    /// Removes every finished task, returning how many were dropped.
    pub async fn clear_finished_tasks(&self) -> Result<u64, LedgerError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM copied_files
             WHERE task_id IN (SELECT id FROM tasks WHERE status = 'finished')",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM folder_mappings
             WHERE task_id IN (SELECT id FROM tasks WHERE status = 'finished')",
        )
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM tasks WHERE status = 'finished'")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Appends `source -> target` as the next mapping row. A source folder
    /// that is already mapped keeps its first mapping.
    pub async fn append_mapping(
        &self,
        task_id: i64,
        source_id: &str,
        target_id: &str,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO folder_mappings (task_id, seq, source_id, target_id)
             SELECT ?1, COALESCE(MAX(seq), 0) + 1, ?2, ?3
             FROM folder_mappings WHERE task_id = ?1
             ON CONFLICT DO NOTHING",
        )
        .bind(task_id)
        .bind(source_id)
        .bind(target_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mapping(&self, task_id: i64) -> Result<Vec<FolderMapping>, LedgerError> {
        let rows = sqlx::query(
            "SELECT seq, source_id, target_id FROM folder_mappings
             WHERE task_id = ?1 ORDER BY seq ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(FolderMapping {
                seq: row.try_get("seq")?,
                source_id: row.try_get("source_id")?,
                target_id: row.try_get("target_id")?,
            });
        }
        Ok(out)
    }

    pub async fn mapping_len(&self, task_id: i64) -> Result<u64, LedgerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM folder_mappings WHERE task_id = ?1")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(to_u64(count))
    }

    pub async fn record_copied(&self, task_id: i64, file_id: &str) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO copied_files (task_id, file_id) VALUES (?1, ?2)
             ON CONFLICT DO NOTHING",
        )
        .bind(task_id)
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn copied_file_ids(&self, task_id: i64) -> Result<HashSet<String>, LedgerError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT file_id FROM copied_files WHERE task_id = ?1")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn copied_count(&self, task_id: i64) -> Result<u64, LedgerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM copied_files WHERE task_id = ?1")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(to_u64(count))
    }

    pub async fn get_summary(&self, folder_id: &str) -> Result<Option<CachedSummary>, LedgerError> {
        let row = sqlx::query(
            "SELECT file_count, folder_count, total_size, computed_at, stale
             FROM folder_summaries WHERE folder_id = ?1",
        )
        .bind(folder_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let stale: i64 = row.try_get("stale")?;
        Ok(Some(CachedSummary {
            summary: FolderSummary {
                file_count: to_u64(row.try_get("file_count")?),
                folder_count: to_u64(row.try_get("folder_count")?),
                total_size: to_u64(row.try_get("total_size")?),
            },
            computed_at: row.try_get("computed_at")?,
            stale: stale != 0,
        }))
    }

    pub async fn put_summary(
        &self,
        folder_id: &str,
        summary: &FolderSummary,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO folder_summaries (folder_id, file_count, folder_count, total_size, computed_at, stale)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)
             ON CONFLICT(folder_id) DO UPDATE SET
                file_count = excluded.file_count,
                folder_count = excluded.folder_count,
                total_size = excluded.total_size,
                computed_at = excluded.computed_at,
                stale = 0",
        )
        .bind(folder_id)
        .bind(to_i64(summary.file_count))
        .bind(to_i64(summary.folder_count))
        .bind(to_i64(summary.total_size))
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks the folder's summary stale and drops its cached listing, so the
    /// next count lists it again.
    pub async fn invalidate_folder(&self, folder_id: &str) -> Result<(), LedgerError> {
        sqlx::query("UPDATE folder_summaries SET stale = 1 WHERE folder_id = ?1")
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM folder_listings WHERE folder_id = ?1")
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn cached_listing(&self, folder_id: &str) -> Result<Option<Vec<Entry>>, LedgerError> {
        let entries: Option<String> =
            sqlx::query_scalar("SELECT entries FROM folder_listings WHERE folder_id = ?1")
                .bind(folder_id)
                .fetch_optional(&self.pool)
                .await?;
        entries
            .map(|raw| serde_json::from_str(&raw).map_err(LedgerError::from))
            .transpose()
    }

    pub async fn store_listing(&self, folder_id: &str, entries: &[Entry]) -> Result<(), LedgerError> {
        let raw = serde_json::to_string(entries)?;
        sqlx::query(
            "INSERT INTO folder_listings (folder_id, entries, listed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(folder_id) DO UPDATE SET
                entries = excluded.entries,
                listed_at = excluded.listed_at",
        )
        .bind(folder_id)
        .bind(raw)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn task_progress(&self, task_id: i64) -> Result<TaskProgress, LedgerError> {
        let task = self
            .get_task(task_id)
            .await?
            .ok_or(LedgerError::TaskNotFound(task_id))?;
        let mapping = self.mapping(task_id).await?;
        let files_done = self.copied_count(task_id).await?;
        let folders_done = (mapping.len() as u64).saturating_sub(1);
        let totals = self.get_summary(&task.source).await?.map(|cached| cached.summary);

        let percent = totals.and_then(|summary| {
            let total = summary.file_count + summary.folder_count;
            if total == 0 {
                return (task.status == TaskStatus::Finished).then_some(100);
            }
            let done = (files_done + folders_done).min(total);
            Some((done * 100 / total) as u8)
        });

        Ok(TaskProgress {
            root_target: mapping.first().map(|root| root.target_id.clone()),
            folders_done,
            files_done,
            folders_total: totals.map(|s| s.folder_count),
            files_total: totals.map(|s| s.file_count),
            total_size: totals.map(|s| s.total_size),
            percent,
            task,
        })
    }
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskRecord, LedgerError> {
    let status: String = row.try_get("status")?;
    Ok(TaskRecord {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        target: row.try_get("target")?,
        status: TaskStatus::parse(&status)?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
        error: row.try_get("error")?,
    })
}

fn ensure_touched(rows: u64, task_id: i64) -> Result<(), LedgerError> {
    if rows == 0 {
        Err(LedgerError::TaskNotFound(task_id))
    } else {
        Ok(())
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub fn default_db_path() -> Result<PathBuf, LedgerError> {
    let mut path = dirs::data_dir().ok_or(LedgerError::MissingDataDir)?;
    path.push("driveclone");
    path.push("ledger.db");
    Ok(path)
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
