use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use panrelay_core::{JobProgress, RemoteFile};

use crate::provider::{CloudProvider, ProviderError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    Auth,
    RateLimited,
    Transient,
    Terminal,
}

impl FakeFailure {
    fn to_error(self) -> ProviderError {
        match self {
            FakeFailure::Auth => ProviderError::Auth("fake auth failure".into()),
            FakeFailure::RateLimited => ProviderError::RateLimited("fake rate limit".into()),
            FakeFailure::Transient => ProviderError::Transient("fake transient failure".into()),
            FakeFailure::Terminal => ProviderError::Terminal("fake terminal failure".into()),
        }
    }
}

#[derive(Default)]
struct FakeState {
    next_file_id: i64,
    next_job_id: i64,
    folders: HashMap<i64, Vec<RemoteFile>>,
    jobs: HashMap<i64, VecDeque<JobProgress>>,
    submissions: Vec<(String, String, i64)>,
    renames: Vec<(i64, String)>,
    covers: Vec<(i64, String)>,
    list_calls: usize,
    poll_calls: usize,
    fail_submit: Option<FakeFailure>,
    fail_poll: Option<FakeFailure>,
    fail_rename: Option<FakeFailure>,
    fail_cover: Option<FakeFailure>,
    fail_list: Option<FakeFailure>,
}

/// In-memory stand-in for the cloud, holding a folder tree and a queue of
/// scripted progress reports per job.
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_file_id: 1000,
                next_job_id: 1,
                ..Default::default()
            }),
        }
    }

    fn make_entry(state: &mut FakeState, parent: i64, name: &str, kind: i64) -> i64 {
        let id = state.next_file_id;
        state.next_file_id += 1;
        state.folders.entry(parent).or_default().push(RemoteFile {
            file_id: id,
            filename: name.to_string(),
            parent_file_id: parent,
            kind,
            size: if kind == 0 { 1024 } else { 0 },
            etag: String::new(),
            status: 2,
            category: if kind == 0 { 2 } else { 0 },
            trashed: 0,
            create_at: String::new(),
        });
        id
    }

    pub fn add_dir(&self, parent: i64, name: &str) -> i64 {
        let mut state = self.state.lock().unwrap();
        Self::make_entry(&mut state, parent, name, 1)
    }

    pub fn add_file(&self, parent: i64, name: &str) -> i64 {
        let mut state = self.state.lock().unwrap();
        Self::make_entry(&mut state, parent, name, 0)
    }

    pub fn add_trashed_file(&self, parent: i64, name: &str) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = Self::make_entry(&mut state, parent, name, 0);
        if let Some(children) = state.folders.get_mut(&parent)
            && let Some(file) = children.iter_mut().find(|f| f.file_id == id)
        {
            file.trashed = 1;
        }
        id
    }

    pub fn push_progress(&self, job_id: i64, progress: JobProgress) {
        let mut state = self.state.lock().unwrap();
        state.jobs.entry(job_id).or_default().push_back(progress);
    }

    pub fn fail_submit(&self, failure: FakeFailure) {
        self.state.lock().unwrap().fail_submit = Some(failure);
    }

    pub fn fail_poll(&self, failure: FakeFailure) {
        self.state.lock().unwrap().fail_poll = Some(failure);
    }

    pub fn fail_rename(&self, failure: FakeFailure) {
        self.state.lock().unwrap().fail_rename = Some(failure);
    }

    pub fn fail_cover(&self, failure: FakeFailure) {
        self.state.lock().unwrap().fail_cover = Some(failure);
    }

    pub fn fail_list(&self, failure: FakeFailure) {
        self.state.lock().unwrap().fail_list = Some(failure);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_submit = None;
        state.fail_poll = None;
        state.fail_rename = None;
        state.fail_cover = None;
        state.fail_list = None;
    }

    pub fn submissions(&self) -> Vec<(String, String, i64)> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn renames(&self) -> Vec<(i64, String)> {
        self.state.lock().unwrap().renames.clone()
    }

    pub fn covers(&self) -> Vec<(i64, String)> {
        self.state.lock().unwrap().covers.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    pub fn poll_calls(&self) -> usize {
        self.state.lock().unwrap().poll_calls
    }

    pub fn children_of(&self, parent: i64) -> Vec<RemoteFile> {
        self.state
            .lock()
            .unwrap()
            .folders
            .get(&parent)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    async fn create_folder(
        &self,
        _owner_id: &str,
        name: &str,
        parent_id: i64,
    ) -> Result<i64, ProviderError> {
        let mut state = self.state.lock().unwrap();
        Ok(Self::make_entry(&mut state, parent_id, name, 1))
    }

    async fn list_folder(
        &self,
        _owner_id: &str,
        parent_id: i64,
    ) -> Result<Vec<RemoteFile>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        if let Some(failure) = state.fail_list {
            return Err(failure.to_error());
        }
        Ok(state.folders.get(&parent_id).cloned().unwrap_or_default())
    }

    async fn submit_download(
        &self,
        owner_id: &str,
        url: &str,
        dir_id: i64,
    ) -> Result<i64, ProviderError> {
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.fail_submit {
            return Err(failure.to_error());
        }
        let job_id = state.next_job_id;
        state.next_job_id += 1;
        state
            .submissions
            .push((owner_id.to_string(), url.to_string(), dir_id));
        Ok(job_id)
    }

    async fn download_progress(
        &self,
        _owner_id: &str,
        job_id: i64,
    ) -> Result<JobProgress, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.poll_calls += 1;
        if let Some(failure) = state.fail_poll {
            return Err(failure.to_error());
        }
        let Some(queue) = state.jobs.get_mut(&job_id) else {
            return Err(ProviderError::Terminal(format!("unknown job {job_id}")));
        };
        // The last scripted report repeats on further polls.
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap_or_else(|| unreachable!()))
        } else {
            queue
                .front()
                .copied()
                .ok_or_else(|| ProviderError::Terminal(format!("job {job_id} has no reports")))
        }
    }

    async fn rename_file(
        &self,
        _owner_id: &str,
        file_id: i64,
        new_name: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.fail_rename {
            return Err(failure.to_error());
        }
        for children in state.folders.values_mut() {
            if let Some(file) = children.iter_mut().find(|f| f.file_id == file_id) {
                file.filename = new_name.to_string();
                state.renames.push((file_id, new_name.to_string()));
                return Ok(());
            }
        }
        Err(ProviderError::Terminal(format!("unknown file {file_id}")))
    }

    async fn upload_cover(
        &self,
        _owner_id: &str,
        parent_id: i64,
        file_name: &str,
        _etag: &str,
        _bytes: Vec<u8>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.fail_cover {
            return Err(failure.to_error());
        }
        state.covers.push((parent_id, file_name.to_string()));
        Ok(())
    }
}
