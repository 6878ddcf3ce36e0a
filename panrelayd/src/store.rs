use std::{fs, path::PathBuf};

use sqlx::{Row, SqlitePool, sqlite::SqliteConnectOptions};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid task status: {0}")]
    InvalidStatus(String),
    #[error("task not found after insert")]
    MissingTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Downloading,
    Renaming,
    CoverUploading,
    Completed,
    CoverUploadFailed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Renaming => "renaming",
            TaskStatus::CoverUploading => "cover_uploading",
            TaskStatus::Completed => "completed",
            TaskStatus::CoverUploadFailed => "cover_upload_failed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(TaskStatus::Pending),
            "downloading" => Ok(TaskStatus::Downloading),
            "renaming" => Ok(TaskStatus::Renaming),
            "cover_uploading" => Ok(TaskStatus::CoverUploading),
            "completed" => Ok(TaskStatus::Completed),
            "cover_upload_failed" => Ok(TaskStatus::CoverUploadFailed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }

    /// Terminal statuses are never picked up by the monitor again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::CoverUploadFailed | TaskStatus::Failed
        )
    }
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub owner_id: String,
    pub video_id: String,
    pub title: String,
    pub rename_target: String,
    pub folder_path: String,
    pub folder_id: i64,
    pub download_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub owner_id: String,
    pub video_id: String,
    pub title: String,
    pub rename_target: String,
    pub folder_path: String,
    pub folder_id: i64,
    pub download_url: String,
    pub provider_handle: Option<i64>,
    pub file_id: Option<i64>,
    pub status: TaskStatus,
    pub progress: f64,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantRecord {
    pub owner_id: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub root_dir_id: Option<i64>,
}

const TASK_COLUMNS: &str = "id, owner_id, video_id, title, rename_target, folder_path, folder_id, download_url, provider_handle, file_id, status, progress, retry_count, error_message, created_at, updated_at";

// Statuses the monitor still has work to do for.
const ACTIVE_STATUSES: &str = "('downloading', 'renaming', 'cover_uploading')";

pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        let db_path = default_db_path()?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                video_id TEXT NOT NULL,
                title TEXT NOT NULL,
                rename_target TEXT NOT NULL,
                folder_path TEXT NOT NULL,
                folder_id INTEGER NOT NULL,
                download_url TEXT NOT NULL,
                provider_handle INTEGER,
                file_id INTEGER,
                status TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_owner_status ON tasks (owner_id, status);",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS covers (
                owner_id TEXT NOT NULL,
                video_id TEXT NOT NULL,
                data BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (owner_id, video_id)
            );",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tenants (
                owner_id TEXT PRIMARY KEY,
                client_id TEXT,
                client_secret TEXT,
                username TEXT,
                password TEXT,
                root_dir_id INTEGER
            );",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_task(&self, task: &NewTask) -> Result<TaskRecord, StoreError> {
        let now = now_ts();
        sqlx::query(
            "INSERT INTO tasks (
                id, owner_id, video_id, title, rename_target, folder_path, folder_id,
                download_url, status, progress, retry_count, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', 0, 0, ?9, ?9)",
        )
        .bind(&task.id)
        .bind(&task.owner_id)
        .bind(&task.video_id)
        .bind(&task.title)
        .bind(&task.rename_target)
        .bind(&task.folder_path)
        .bind(task.folder_id)
        .bind(&task.download_url)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_task(&task.id).await?.ok_or(StoreError::MissingTask)
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(task_from_row).transpose()
    }

    pub async fn list_tasks(
        &self,
        owner_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE owner_id = ?1 AND status = ?2
                     ORDER BY created_at DESC, id ASC"
                ))
                .bind(owner_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE owner_id = ?1
                     ORDER BY created_at DESC, id ASC"
                ))
                .bind(owner_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(task_from_row).collect()
    }

    pub async fn list_active_tasks(&self, owner_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE owner_id = ?1 AND status IN {ACTIVE_STATUSES}
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(task_from_row).collect()
    }

    pub async fn list_owners_with_active_tasks(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT owner_id FROM tasks WHERE status IN {ACTIVE_STATUSES} ORDER BY owner_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("owner_id").map_err(StoreError::from))
            .collect()
    }

    /// Finds an unfinished task for the same file, used for duplicate
    /// detection before anything exists remotely.
    pub async fn find_active_by_video(
        &self,
        owner_id: &str,
        video_id: &str,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE owner_id = ?1 AND video_id = ?2
               AND status IN ('pending', 'downloading', 'renaming', 'cover_uploading')
             LIMIT 1"
        ))
        .bind(owner_id)
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(task_from_row).transpose()
    }

    /// Most recent task for a file regardless of status, used when a cover
    /// arrives after the download already finished.
    pub async fn find_latest_by_video(
        &self,
        owner_id: &str,
        video_id: &str,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE owner_id = ?1 AND video_id = ?2
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(owner_id)
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(task_from_row).transpose()
    }

    /// Compare-and-swap status transition. Returns false when the row is no
    /// longer in `from`, which means another actor moved it first.
    pub async fn transition(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?1, error_message = ?2, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
        )
        .bind(to.as_str())
        .bind(error_message)
        .bind(now_ts())
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records the provider job handle while moving pending -> downloading.
    pub async fn mark_submitted(&self, id: &str, provider_handle: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'downloading', provider_handle = ?1, error_message = NULL, updated_at = ?2
             WHERE id = ?3 AND status = 'pending'",
        )
        .bind(provider_handle)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Progress only moves forward; a stale poll result cannot rewind it.
    pub async fn record_progress(&self, id: &str, progress: f64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE tasks SET progress = ?1, updated_at = ?2
             WHERE id = ?3 AND progress <= ?1",
        )
        .bind(progress)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// File ids already attached to other tasks of this owner. Discovery
    /// must not hand the same remote file to two tasks.
    pub async fn claimed_file_ids(
        &self,
        owner_id: &str,
        exclude_task: &str,
    ) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query(
            "SELECT file_id FROM tasks
             WHERE owner_id = ?1 AND id != ?2 AND file_id IS NOT NULL",
        )
        .bind(owner_id)
        .bind(exclude_task)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("file_id").map_err(StoreError::from))
            .collect()
    }

    pub async fn set_file_id(&self, id: &str, file_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET file_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(file_id)
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Puts a failed task back at the start of the pipeline and counts the
    /// attempt. Only failed tasks may be retried. The creation timestamp is
    /// reset so the download timeout measures the new attempt.
    pub async fn reset_for_retry(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', progress = 0, provider_handle = NULL,
                    file_id = NULL, error_message = NULL,
                    retry_count = retry_count + 1, created_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'failed'",
        )
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_task(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fails every unfinished task of one owner in a single statement, used
    /// when the owner's credentials stop working.
    pub async fn fail_owner_tasks(
        &self,
        owner_id: &str,
        message: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE tasks SET status = 'failed', error_message = ?1, updated_at = ?2
             WHERE owner_id = ?3 AND status IN {ACTIVE_STATUSES}"
        ))
        .bind(message)
        .bind(now_ts())
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Fails pending rows older than the cutoff. A crash between insert and
    /// submission leaves a task in `pending` forever; moving it to `failed`
    /// makes it visible and retryable again.
    pub async fn fail_stale_pending(
        &self,
        max_age_secs: i64,
        message: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'failed', error_message = ?1, updated_at = ?2
             WHERE status = 'pending' AND created_at <= ?3",
        )
        .bind(message)
        .bind(now_ts())
        .bind(now_ts() - max_age_secs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn put_cover(
        &self,
        owner_id: &str,
        video_id: &str,
        data: &[u8],
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO covers (owner_id, video_id, data, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner_id, video_id) DO UPDATE SET
                data = excluded.data,
                created_at = excluded.created_at;",
        )
        .bind(owner_id)
        .bind(video_id)
        .bind(data)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_cover(
        &self,
        owner_id: &str,
        video_id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT data FROM covers WHERE owner_id = ?1 AND video_id = ?2")
            .bind(owner_id)
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get("data").map_err(StoreError::from))
            .transpose()
    }

    pub async fn delete_cover(&self, owner_id: &str, video_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM covers WHERE owner_id = ?1 AND video_id = ?2")
            .bind(owner_id)
            .bind(video_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_tenant(&self, owner_id: &str) -> Result<Option<TenantRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT owner_id, client_id, client_secret, username, password, root_dir_id
             FROM tenants WHERE owner_id = ?1",
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(TenantRecord {
            owner_id: row.try_get("owner_id")?,
            client_id: row.try_get("client_id")?,
            client_secret: row.try_get("client_secret")?,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            root_dir_id: row.try_get("root_dir_id")?,
        }))
    }

    pub async fn upsert_tenant(&self, tenant: &TenantRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tenants (owner_id, client_id, client_secret, username, password, root_dir_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(owner_id) DO UPDATE SET
                client_id = excluded.client_id,
                client_secret = excluded.client_secret,
                username = excluded.username,
                password = excluded.password,
                root_dir_id = excluded.root_dir_id;",
        )
        .bind(&tenant.owner_id)
        .bind(&tenant.client_id)
        .bind(&tenant.client_secret)
        .bind(&tenant.username)
        .bind(&tenant.password)
        .bind(tenant.root_dir_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn task_from_row(row: sqlx::sqlite::SqliteRow) -> Result<TaskRecord, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(TaskRecord {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        video_id: row.try_get("video_id")?,
        title: row.try_get("title")?,
        rename_target: row.try_get("rename_target")?,
        folder_path: row.try_get("folder_path")?,
        folder_id: row.try_get("folder_id")?,
        download_url: row.try_get("download_url")?,
        provider_handle: row.try_get("provider_handle")?,
        file_id: row.try_get("file_id")?,
        status: TaskStatus::parse(&status)?,
        progress: row.try_get("progress")?,
        retry_count: row.try_get("retry_count")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn now_ts() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("panrelay");
    path.push("tasks.db");
    Ok(path)
}
