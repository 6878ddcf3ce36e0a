use std::sync::Arc;

use panrelay_core::RemoteFile;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::finalize::{Finalizer, rename_target_for};
use crate::provider::CloudProvider;
use crate::resolver::{FolderResolver, find_duplicate};
use crate::store::{NewTask, TaskRecord, TaskStatus, TaskStore};

#[derive(Debug, Clone)]
pub struct PushRequest {
    pub owner_id: String,
    pub video_id: String,
    pub title: String,
    pub download_url: String,
    pub folder_path: String,
    /// Explicit final name; the sanitized title is used when absent.
    pub rename_name: Option<String>,
}

/// A duplicate is a soft success: the caller learns what already covers
/// the file instead of getting a second download.
#[derive(Debug)]
pub enum CreateOutcome {
    Created(TaskRecord),
    Duplicate { existing: String },
}

#[derive(Debug)]
pub enum CoverOutcome {
    /// Bytes stored, the monitor uploads them after the rename step.
    Stored,
    /// The task was already finished, so the upload happened inline.
    Uploaded,
}

#[derive(Debug, Clone)]
pub struct FolderReport {
    pub folder_exists: bool,
    pub folder_id: Option<i64>,
    pub root_dir_id: i64,
    pub anchor_id: i64,
    pub resolved_depth: usize,
    pub files: Vec<RemoteFile>,
    pub duplicate: Option<String>,
}

/// Requests that name no folder land here instead of the tenant root.
const UNCLASSIFIED_FOLDER: &str = "unclassified";

/// Front door for the task lifecycle: submission, listing, retry, delete,
/// folder checks, and cover intake.
pub struct TaskManager {
    store: Arc<TaskStore>,
    provider: Arc<dyn CloudProvider>,
    resolver: FolderResolver,
    finalizer: Finalizer,
    default_root_dir_id: i64,
}

impl TaskManager {
    pub fn new(
        store: Arc<TaskStore>,
        provider: Arc<dyn CloudProvider>,
        default_root_dir_id: i64,
    ) -> Self {
        Self {
            resolver: FolderResolver::new(provider.clone()),
            finalizer: Finalizer::new(store.clone(), provider.clone()),
            store,
            provider,
            default_root_dir_id,
        }
    }

    /// Accepts a download request. There is no lock between the duplicate
    /// check and the insert; two simultaneous submissions for the same
    /// not-yet-materialized file can both pass, which is accepted.
    pub async fn create(&self, request: PushRequest) -> Result<CreateOutcome, ServiceError> {
        validate_push(&request)?;
        let rename_target =
            rename_target_for(request.rename_name.as_deref().unwrap_or(&request.title));
        let folder_path = match request.folder_path.trim() {
            "" => UNCLASSIFIED_FOLDER.to_string(),
            path => path.to_string(),
        };

        if let Some(existing) = self
            .store
            .find_active_by_video(&request.owner_id, &request.video_id)
            .await?
        {
            return Ok(CreateOutcome::Duplicate {
                existing: format!("task {} is already handling this file", existing.id),
            });
        }

        let root = self.root_for(&request.owner_id).await?;
        let resolution = self
            .resolver
            .resolve(&request.owner_id, root, &folder_path)
            .await?;
        if resolution.folder_exists
            && let Some(name) =
                find_duplicate(&resolution.files, &rename_target, &request.video_id)
        {
            return Ok(CreateOutcome::Duplicate { existing: name });
        }
        let folder_id = self
            .resolver
            .create_remaining(&request.owner_id, &resolution, &folder_path)
            .await?;

        let task = self
            .store
            .insert_task(&NewTask {
                id: Uuid::new_v4().to_string(),
                owner_id: request.owner_id.clone(),
                video_id: request.video_id.clone(),
                title: request.title.clone(),
                rename_target,
                folder_path,
                folder_id,
                download_url: request.download_url.clone(),
            })
            .await?;

        match self
            .provider
            .submit_download(&request.owner_id, &request.download_url, folder_id)
            .await
        {
            Ok(handle) => {
                self.store.mark_submitted(&task.id, handle).await?;
                let task = self
                    .store
                    .get_task(&task.id)
                    .await?
                    .ok_or_else(|| ServiceError::NotFound(task.id.clone()))?;
                tracing::info!(task = %task.id, handle, "download submitted");
                Ok(CreateOutcome::Created(task))
            }
            Err(err) => {
                self.store
                    .transition(
                        &task.id,
                        TaskStatus::Pending,
                        TaskStatus::Failed,
                        Some(&format!("submit failed: {err}")),
                    )
                    .await?;
                Err(err.into())
            }
        }
    }

    pub async fn list(
        &self,
        owner_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRecord>, ServiceError> {
        Ok(self.store.list_tasks(owner_id, status).await?)
    }

    pub async fn get(&self, owner_id: &str, id: &str) -> Result<TaskRecord, ServiceError> {
        match self.store.get_task(id).await? {
            Some(task) if task.owner_id == owner_id => Ok(task),
            _ => Err(ServiceError::NotFound(format!("task {id}"))),
        }
    }

    /// Re-submits a failed task to the folder it was originally bound to.
    pub async fn retry(&self, owner_id: &str, id: &str) -> Result<TaskRecord, ServiceError> {
        let task = self.get(owner_id, id).await?;
        if task.status != TaskStatus::Failed {
            return Err(ServiceError::Conflict(format!(
                "task {id} is {}, only failed tasks can be retried",
                task.status.as_str()
            )));
        }
        if !self.store.reset_for_retry(id).await? {
            return Err(ServiceError::Conflict(format!(
                "task {id} changed state while retrying"
            )));
        }

        match self
            .provider
            .submit_download(owner_id, &task.download_url, task.folder_id)
            .await
        {
            Ok(handle) => {
                self.store.mark_submitted(id, handle).await?;
                tracing::info!(task = %id, handle, attempt = task.retry_count + 1, "retry submitted");
                self.get(owner_id, id).await
            }
            Err(err) => {
                self.store
                    .transition(
                        id,
                        TaskStatus::Pending,
                        TaskStatus::Failed,
                        Some(&format!("retry submit failed: {err}")),
                    )
                    .await?;
                Err(err.into())
            }
        }
    }

    /// Deletes a task row. Idempotent: a missing task reports false rather
    /// than an error. The remote file is left alone.
    pub async fn delete(&self, owner_id: &str, id: &str) -> Result<bool, ServiceError> {
        match self.store.get_task(id).await? {
            None => Ok(false),
            Some(task) if task.owner_id != owner_id => {
                Err(ServiceError::NotFound(format!("task {id}")))
            }
            Some(task) => {
                let deleted = self.store.delete_task(id).await?;
                self.store
                    .delete_cover(&task.owner_id, &task.video_id)
                    .await?;
                Ok(deleted)
            }
        }
    }

    pub async fn check_folder(
        &self,
        owner_id: &str,
        folder_path: &str,
        parent_dir_id: Option<i64>,
        title: Option<&str>,
        video_id: Option<&str>,
    ) -> Result<FolderReport, ServiceError> {
        let root = match parent_dir_id {
            Some(root) => root,
            None => self.root_for(owner_id).await?,
        };
        let resolution = self.resolver.resolve(owner_id, root, folder_path).await?;
        let target = title.map(rename_target_for).unwrap_or_default();
        let duplicate = if resolution.folder_exists {
            find_duplicate(&resolution.files, &target, video_id.unwrap_or(""))
        } else {
            None
        };
        Ok(FolderReport {
            folder_exists: resolution.folder_exists,
            folder_id: resolution.folder_id,
            root_dir_id: root,
            anchor_id: resolution.anchor_id,
            resolved_depth: resolution.resolved_depth,
            files: resolution.files,
            duplicate,
        })
    }

    /// Stores cover bytes for a file. When the matching task already
    /// finished, the upload happens right away instead of waiting for a
    /// monitor cycle that will never come.
    pub async fn store_cover(
        &self,
        owner_id: &str,
        video_id: &str,
        bytes: Vec<u8>,
    ) -> Result<CoverOutcome, ServiceError> {
        if video_id.trim().is_empty() {
            return Err(ServiceError::Invalid("video_id must not be empty".into()));
        }
        if bytes.is_empty() {
            return Err(ServiceError::Invalid("cover payload is empty".into()));
        }
        self.store.put_cover(owner_id, video_id, &bytes).await?;

        if let Some(task) = self.store.find_latest_by_video(owner_id, video_id).await?
            && matches!(
                task.status,
                TaskStatus::Completed | TaskStatus::CoverUploadFailed
            )
        {
            self.finalizer.upload_cover_now(&task, bytes).await?;
            return Ok(CoverOutcome::Uploaded);
        }
        Ok(CoverOutcome::Stored)
    }

    async fn root_for(&self, owner_id: &str) -> Result<i64, ServiceError> {
        let tenant = self.store.get_tenant(owner_id).await?;
        Ok(tenant
            .and_then(|t| t.root_dir_id)
            .unwrap_or(self.default_root_dir_id))
    }
}

fn validate_push(request: &PushRequest) -> Result<(), ServiceError> {
    if request.video_id.trim().is_empty() {
        return Err(ServiceError::Invalid("video_id must not be empty".into()));
    }
    if request.title.trim().is_empty() {
        return Err(ServiceError::Invalid("title must not be empty".into()));
    }
    let url = request.download_url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ServiceError::Invalid(
            "download_url must be an http(s) url".into(),
        ));
    }
    Ok(())
}
