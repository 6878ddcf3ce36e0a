use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::finalize::{Finalizer, store_err};
use crate::provider::{CloudProvider, ProviderError};
use crate::store::{TaskRecord, TaskStatus, TaskStore};

/// A row still pending after this long means the submission never came
/// back, so the cycle fails it instead of leaving it invisible forever.
const STALE_PENDING_SECS: i64 = 300;

/// Polls the provider for every owner with unfinished tasks. Cycles are
/// spawned per tick; an owner whose previous cycle is still running is
/// skipped rather than polled twice.
pub struct Monitor {
    store: Arc<TaskStore>,
    provider: Arc<dyn CloudProvider>,
    finalizer: Finalizer,
    poll_interval: Duration,
    download_timeout: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
    busy: Mutex<HashSet<String>>,
}

impl Monitor {
    pub fn new(
        store: Arc<TaskStore>,
        provider: Arc<dyn CloudProvider>,
        poll_interval: Duration,
        download_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            finalizer: Finalizer::new(store.clone(), provider.clone()),
            store,
            provider,
            poll_interval,
            download_timeout,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            busy: Mutex::new(HashSet::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = tokio::time::sleep(monitor.poll_interval) => {
                        let cycle = monitor.clone();
                        monitor.tracker.spawn(async move { cycle.run_cycle().await });
                    }
                }
            }
        });
    }

    /// Stops ticking and waits for in-flight cycles to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub async fn run_cycle(&self) {
        match self
            .store
            .fail_stale_pending(STALE_PENDING_SECS, "submission never completed")
            .await
        {
            Ok(0) => {}
            Ok(swept) => tracing::warn!(swept, "failed stale pending tasks"),
            Err(err) => tracing::error!(error = %err, "failed to sweep stale pending tasks"),
        }

        let owners = match self.store.list_owners_with_active_tasks().await {
            Ok(owners) => owners,
            Err(err) => {
                tracing::error!(error = %err, "failed to list owners with active tasks");
                return;
            }
        };
        for owner in owners {
            if self.cancel.is_cancelled() {
                return;
            }
            if !self.begin(&owner) {
                tracing::debug!(owner, "previous cycle still running, skipping");
                continue;
            }
            self.poll_owner(&owner).await;
            self.finish(&owner);
        }
    }

    async fn poll_owner(&self, owner_id: &str) {
        let tasks = match self.store.list_active_tasks(owner_id).await {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::error!(owner = owner_id, error = %err, "failed to list active tasks");
                return;
            }
        };

        for task in tasks {
            if self.cancel.is_cancelled() {
                return;
            }
            let result = match task.status {
                TaskStatus::Downloading => self.poll_download(&task).await,
                TaskStatus::Renaming | TaskStatus::CoverUploading => {
                    self.finalizer.run(&task).await
                }
                _ => Ok(()),
            };
            match result {
                Ok(()) => {}
                Err(ProviderError::Auth(message)) => {
                    // One bad token affects every task of the owner; stop the
                    // cycle instead of hammering the provider.
                    tracing::error!(owner = owner_id, %message, "authentication failed");
                    if let Err(err) = self
                        .store
                        .fail_owner_tasks(
                            owner_id,
                            &format!("provider authentication failed: {message}"),
                        )
                        .await
                    {
                        tracing::error!(owner = owner_id, error = %err, "failed to fail owner tasks");
                    }
                    return;
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(task = %task.id, error = %err, "poll failed, will retry next cycle");
                }
                Err(err) => {
                    tracing::error!(task = %task.id, error = %err, "unexpected poll failure");
                }
            }
        }
    }

    async fn poll_download(&self, task: &TaskRecord) -> Result<(), ProviderError> {
        // The timeout check runs before the poll so a stuck job fails even
        // when the provider keeps answering.
        let age = OffsetDateTime::now_utc().unix_timestamp() - task.created_at;
        if age > self.download_timeout.as_secs() as i64 {
            self.store
                .transition(
                    &task.id,
                    TaskStatus::Downloading,
                    TaskStatus::Failed,
                    Some(&format!(
                        "download timed out after {}s",
                        self.download_timeout.as_secs()
                    )),
                )
                .await
                .map_err(store_err)?;
            return Ok(());
        }

        let Some(handle) = task.provider_handle else {
            self.store
                .transition(
                    &task.id,
                    TaskStatus::Downloading,
                    TaskStatus::Failed,
                    Some("task has no provider job handle"),
                )
                .await
                .map_err(store_err)?;
            return Ok(());
        };

        let report = match self.provider.download_progress(&task.owner_id, handle).await {
            Ok(report) => report,
            Err(ProviderError::Terminal(message)) => {
                self.store
                    .transition(
                        &task.id,
                        TaskStatus::Downloading,
                        TaskStatus::Failed,
                        Some(&format!("progress poll refused: {message}")),
                    )
                    .await
                    .map_err(store_err)?;
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        self.store
            .record_progress(&task.id, report.progress)
            .await
            .map_err(store_err)?;

        match report.status {
            panrelay_core::JobStatus::InProgress | panrelay_core::JobStatus::Retrying => Ok(()),
            panrelay_core::JobStatus::Failed => {
                self.store
                    .transition(
                        &task.id,
                        TaskStatus::Downloading,
                        TaskStatus::Failed,
                        Some("provider reported download failure"),
                    )
                    .await
                    .map_err(store_err)?;
                Ok(())
            }
            panrelay_core::JobStatus::Succeeded => {
                self.store
                    .record_progress(&task.id, 100.0)
                    .await
                    .map_err(store_err)?;
                let moved = self
                    .store
                    .transition(&task.id, TaskStatus::Downloading, TaskStatus::Renaming, None)
                    .await
                    .map_err(store_err)?;
                if !moved {
                    return Ok(());
                }
                let Some(task) = self.store.get_task(&task.id).await.map_err(store_err)? else {
                    return Ok(());
                };
                self.finalizer.run(&task).await
            }
        }
    }

    fn begin(&self, owner_id: &str) -> bool {
        self.busy
            .lock()
            .map(|mut busy| busy.insert(owner_id.to_string()))
            .unwrap_or(false)
    }

    fn finish(&self, owner_id: &str) {
        if let Ok(mut busy) = self.busy.lock() {
            busy.remove(owner_id);
        }
    }
}
