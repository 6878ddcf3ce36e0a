use std::sync::Arc;

use panrelay_core::RemoteFile;

use crate::provider::{CloudProvider, ProviderError};
use crate::store::{StoreError, TaskRecord, TaskStatus, TaskStore};

/// Windows-illegal filename characters the remote drive rejects.
const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if ILLEGAL_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = cleaned.trim().trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn rename_target_for(title: &str) -> String {
    let sanitized = sanitize_title(title);
    if sanitized.to_lowercase().ends_with(".mp4") {
        sanitized
    } else {
        format!("{sanitized}.mp4")
    }
}

/// The cover is stored next to the video as "<stem>-poster.jpg".
pub fn poster_name_for(rename_target: &str) -> String {
    let stem = rename_target
        .strip_suffix(".mp4")
        .unwrap_or(rename_target);
    format!("{stem}-poster.jpg")
}

/// Picks the downloaded video out of a folder listing. Raw provider names
/// keep the form "<video_id>-<resolution>p.mp4" and win over anything else;
/// otherwise the newest unclaimed .mp4 is taken. A file already carrying
/// the rename target also qualifies, which is how an interrupted run
/// resumes without renaming twice.
pub fn pick_downloaded_file<'a>(
    files: &'a [RemoteFile],
    video_id: &str,
    claimed: &[i64],
) -> Option<&'a RemoteFile> {
    let candidates: Vec<&RemoteFile> = files
        .iter()
        .filter(|file| {
            !file.is_dir()
                && !file.is_trashed()
                && file.filename.to_lowercase().ends_with(".mp4")
                && !claimed.contains(&file.file_id)
        })
        .collect();

    let raw_prefix = format!("{video_id}-");
    candidates
        .iter()
        .filter(|file| file.filename.starts_with(&raw_prefix))
        .max_by_key(|file| file.file_id)
        .or_else(|| candidates.iter().max_by_key(|file| file.file_id))
        .copied()
}

/// Drives a task through the rename and cover-upload steps once its
/// download has finished. Terminal provider refusals move the task to a
/// failed state here; retryable and auth errors bubble up so the monitor
/// can leave the task untouched or fail the whole owner.
pub struct Finalizer {
    store: Arc<TaskStore>,
    provider: Arc<dyn CloudProvider>,
}

impl Finalizer {
    pub fn new(store: Arc<TaskStore>, provider: Arc<dyn CloudProvider>) -> Self {
        Self { store, provider }
    }

    pub async fn run(&self, task: &TaskRecord) -> Result<(), ProviderError> {
        match task.status {
            TaskStatus::Renaming => self.rename_step(task).await,
            TaskStatus::CoverUploading => self.cover_step(task).await,
            _ => Ok(()),
        }
    }

    async fn rename_step(&self, task: &TaskRecord) -> Result<(), ProviderError> {
        let files: Vec<RemoteFile> = self
            .provider
            .list_folder(&task.owner_id, task.folder_id)
            .await?
            .into_iter()
            .filter(|file| !file.is_trashed())
            .collect();
        let claimed = self
            .store
            .claimed_file_ids(&task.owner_id, &task.id)
            .await
            .map_err(store_err)?;

        let Some(candidate) = pick_downloaded_file(&files, &task.video_id, &claimed) else {
            tracing::warn!(task = %task.id, folder = task.folder_id, "no downloaded file found");
            self.store
                .transition(
                    &task.id,
                    TaskStatus::Renaming,
                    TaskStatus::Failed,
                    Some("downloaded file not found in target folder"),
                )
                .await
                .map_err(store_err)?;
            return Ok(());
        };

        if candidate.filename != task.rename_target {
            match self
                .provider
                .rename_file(&task.owner_id, candidate.file_id, &task.rename_target)
                .await
            {
                Ok(()) => {}
                Err(ProviderError::Terminal(message)) => {
                    self.store
                        .transition(
                            &task.id,
                            TaskStatus::Renaming,
                            TaskStatus::Failed,
                            Some(&format!("rename failed: {message}")),
                        )
                        .await
                        .map_err(store_err)?;
                    return Ok(());
                }
                Err(other) => return Err(other),
            }
        }
        self.store
            .set_file_id(&task.id, candidate.file_id)
            .await
            .map_err(store_err)?;

        let cover = self
            .store
            .get_cover(&task.owner_id, &task.video_id)
            .await
            .map_err(store_err)?;
        if cover.is_none() {
            self.store
                .transition(&task.id, TaskStatus::Renaming, TaskStatus::Completed, None)
                .await
                .map_err(store_err)?;
            return Ok(());
        }

        let moved = self
            .store
            .transition(
                &task.id,
                TaskStatus::Renaming,
                TaskStatus::CoverUploading,
                None,
            )
            .await
            .map_err(store_err)?;
        if !moved {
            return Ok(());
        }
        let mut task = task.clone();
        task.status = TaskStatus::CoverUploading;
        self.cover_step(&task).await
    }

    async fn cover_step(&self, task: &TaskRecord) -> Result<(), ProviderError> {
        let Some(bytes) = self
            .store
            .get_cover(&task.owner_id, &task.video_id)
            .await
            .map_err(store_err)?
        else {
            // Cover vanished between steps; nothing left to upload.
            self.store
                .transition(
                    &task.id,
                    TaskStatus::CoverUploading,
                    TaskStatus::Completed,
                    None,
                )
                .await
                .map_err(store_err)?;
            return Ok(());
        };

        let poster = poster_name_for(&task.rename_target);
        let etag = format!("{:x}", md5::compute(&bytes));
        match self
            .provider
            .upload_cover(&task.owner_id, task.folder_id, &poster, &etag, bytes)
            .await
        {
            Ok(()) => {
                self.store
                    .transition(
                        &task.id,
                        TaskStatus::CoverUploading,
                        TaskStatus::Completed,
                        None,
                    )
                    .await
                    .map_err(store_err)?;
                self.store
                    .delete_cover(&task.owner_id, &task.video_id)
                    .await
                    .map_err(store_err)?;
                Ok(())
            }
            Err(ProviderError::Terminal(message)) => {
                self.store
                    .transition(
                        &task.id,
                        TaskStatus::CoverUploading,
                        TaskStatus::CoverUploadFailed,
                        Some(&format!("cover upload failed: {message}")),
                    )
                    .await
                    .map_err(store_err)?;
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// Uploads a cover that arrived after the task already finished. On
    /// success a cover_upload_failed task is promoted back to completed.
    pub async fn upload_cover_now(
        &self,
        task: &TaskRecord,
        bytes: Vec<u8>,
    ) -> Result<(), ProviderError> {
        let poster = poster_name_for(&task.rename_target);
        let etag = format!("{:x}", md5::compute(&bytes));
        self.provider
            .upload_cover(&task.owner_id, task.folder_id, &poster, &etag, bytes)
            .await?;
        self.store
            .transition(
                &task.id,
                TaskStatus::CoverUploadFailed,
                TaskStatus::Completed,
                None,
            )
            .await
            .map_err(store_err)?;
        self.store
            .delete_cover(&task.owner_id, &task.video_id)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

// A database hiccup during finalization is retried on the next cycle.
pub(crate) fn store_err(err: StoreError) -> ProviderError {
    ProviderError::Transient(format!("storage error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewTask;
    use crate::testutil::{FakeFailure, FakeProvider};
    use sqlx::SqlitePool;

    #[test]
    fn sanitize_replaces_illegal_characters() {
        assert_eq!(sanitize_title("a<b>:c\"/d\\|?*e"), "a_b__c__d____e");
        assert_eq!(sanitize_title("  concert 2024.  "), "concert 2024");
        assert_eq!(sanitize_title("***"), "___");
        assert_eq!(sanitize_title("..."), "untitled");
        assert_eq!(sanitize_title(""), "untitled");
    }

    #[test]
    fn rename_target_appends_extension_once() {
        assert_eq!(rename_target_for("Spring Concert"), "Spring Concert.mp4");
        assert_eq!(rename_target_for("clip.mp4"), "clip.mp4");
        assert_eq!(rename_target_for("CLIP.MP4"), "CLIP.MP4");
    }

    #[test]
    fn poster_name_replaces_video_extension() {
        assert_eq!(
            poster_name_for("Spring Concert.mp4"),
            "Spring Concert-poster.jpg"
        );
    }

    fn remote(id: i64, name: &str) -> RemoteFile {
        RemoteFile {
            file_id: id,
            filename: name.to_string(),
            parent_file_id: 0,
            kind: 0,
            size: 1,
            etag: String::new(),
            status: 2,
            category: 2,
            trashed: 0,
            create_at: String::new(),
        }
    }

    #[test]
    fn raw_provider_name_wins_over_newer_files() {
        let files = vec![remote(1, "110650-1080p.mp4"), remote(2, "other.mp4")];
        let picked = pick_downloaded_file(&files, "110650", &[]).unwrap();
        assert_eq!(picked.file_id, 1);
    }

    #[test]
    fn falls_back_to_newest_unclaimed_mp4() {
        let files = vec![
            remote(1, "first.mp4"),
            remote(2, "second.mp4"),
            remote(3, "notes.txt"),
        ];
        let picked = pick_downloaded_file(&files, "110650", &[2]).unwrap();
        assert_eq!(picked.file_id, 1);
        assert!(pick_downloaded_file(&files, "110650", &[1, 2]).is_none());
    }

    async fn make_store() -> Arc<TaskStore> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = TaskStore::from_pool(pool);
        store.init().await.unwrap();
        Arc::new(store)
    }

    async fn renaming_task(store: &TaskStore, folder_id: i64) -> TaskRecord {
        store
            .insert_task(&NewTask {
                id: "t-1".into(),
                owner_id: "global".into(),
                video_id: "110650".into(),
                title: "Spring Concert".into(),
                rename_target: "Spring Concert.mp4".into(),
                folder_path: "2024/03".into(),
                folder_id,
                download_url: "https://videos.example/110650.mp4".into(),
            })
            .await
            .unwrap();
        store.mark_submitted("t-1", 55).await.unwrap();
        store
            .transition("t-1", TaskStatus::Downloading, TaskStatus::Renaming, None)
            .await
            .unwrap();
        store.get_task("t-1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn renames_and_completes_without_cover() {
        let store = make_store().await;
        let provider = Arc::new(FakeProvider::new());
        let folder = provider.add_dir(0, "03");
        let file_id = provider.add_file(folder, "110650-1080p.mp4");
        let task = renaming_task(&store, folder).await;

        let finalizer = Finalizer::new(store.clone(), provider.clone());
        finalizer.run(&task).await.unwrap();

        assert_eq!(provider.renames(), vec![(file_id, "Spring Concert.mp4".to_string())]);
        let task = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.file_id, Some(file_id));
    }

    #[tokio::test]
    async fn uploads_stored_cover_after_rename() {
        let store = make_store().await;
        let provider = Arc::new(FakeProvider::new());
        let folder = provider.add_dir(0, "03");
        provider.add_file(folder, "110650-1080p.mp4");
        let task = renaming_task(&store, folder).await;
        store
            .put_cover("global", "110650", &[0xff, 0xd8])
            .await
            .unwrap();

        let finalizer = Finalizer::new(store.clone(), provider.clone());
        finalizer.run(&task).await.unwrap();

        assert_eq!(
            provider.covers(),
            vec![(folder, "Spring Concert-poster.jpg".to_string())]
        );
        let task = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        // Consumed after a successful upload.
        assert!(store.get_cover("global", "110650").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_file_fails_the_task() {
        let store = make_store().await;
        let provider = Arc::new(FakeProvider::new());
        let folder = provider.add_dir(0, "03");
        provider.add_trashed_file(folder, "110650-1080p.mp4");
        let task = renaming_task(&store, folder).await;

        let finalizer = Finalizer::new(store.clone(), provider.clone());
        finalizer.run(&task).await.unwrap();

        let task = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn already_renamed_file_is_claimed_without_rename_call() {
        let store = make_store().await;
        let provider = Arc::new(FakeProvider::new());
        let folder = provider.add_dir(0, "03");
        let file_id = provider.add_file(folder, "Spring Concert.mp4");
        let task = renaming_task(&store, folder).await;

        let finalizer = Finalizer::new(store.clone(), provider.clone());
        finalizer.run(&task).await.unwrap();

        assert!(provider.renames().is_empty());
        let task = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.file_id, Some(file_id));
    }

    #[tokio::test]
    async fn terminal_cover_failure_parks_the_task() {
        let store = make_store().await;
        let provider = Arc::new(FakeProvider::new());
        let folder = provider.add_dir(0, "03");
        provider.add_file(folder, "110650-1080p.mp4");
        provider.fail_cover(FakeFailure::Terminal);
        let task = renaming_task(&store, folder).await;
        store.put_cover("global", "110650", &[0xff]).await.unwrap();

        let finalizer = Finalizer::new(store.clone(), provider.clone());
        finalizer.run(&task).await.unwrap();

        let task = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::CoverUploadFailed);
        // Bytes stay around for a later manual upload.
        assert!(store.get_cover("global", "110650").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn transient_rename_failure_leaves_state_untouched() {
        let store = make_store().await;
        let provider = Arc::new(FakeProvider::new());
        let folder = provider.add_dir(0, "03");
        provider.add_file(folder, "110650-1080p.mp4");
        provider.fail_rename(FakeFailure::Transient);
        let task = renaming_task(&store, folder).await;

        let finalizer = Finalizer::new(store.clone(), provider.clone());
        let err = finalizer.run(&task).await.unwrap_err();
        assert!(err.is_retryable());

        let task = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Renaming);
    }
}
