use async_trait::async_trait;
use panrelay_core::{ApiErrorClass, JobProgress, PanClient, PanError, RemoteFile};
use thiserror::Error;

use crate::tokens::{TokenError, TokenManager};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider refused the request: {0}")]
    Terminal(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::RateLimited(_) | ProviderError::Transient(_))
    }
}

impl From<PanError> for ProviderError {
    fn from(err: PanError) -> Self {
        match err.classification() {
            Some(ApiErrorClass::Auth) => ProviderError::Auth(err.to_string()),
            Some(ApiErrorClass::RateLimit) => ProviderError::RateLimited(err.to_string()),
            Some(ApiErrorClass::Transient) => ProviderError::Transient(err.to_string()),
            Some(ApiErrorClass::Permanent) => ProviderError::Terminal(err.to_string()),
            None => match err {
                PanError::Request(_) => ProviderError::Transient(err.to_string()),
                other => ProviderError::Terminal(other.to_string()),
            },
        }
    }
}

impl From<TokenError> for ProviderError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Transient(message) => ProviderError::Transient(message),
            other => ProviderError::Auth(other.to_string()),
        }
    }
}

/// The narrow surface the engine drives the cloud through. Owner-scoped so
/// implementations can pick the right tenant token per call; the fake used
/// in tests implements the same seam.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_folder(
        &self,
        owner_id: &str,
        name: &str,
        parent_id: i64,
    ) -> Result<i64, ProviderError>;

    async fn list_folder(
        &self,
        owner_id: &str,
        parent_id: i64,
    ) -> Result<Vec<RemoteFile>, ProviderError>;

    async fn submit_download(
        &self,
        owner_id: &str,
        url: &str,
        dir_id: i64,
    ) -> Result<i64, ProviderError>;

    async fn download_progress(
        &self,
        owner_id: &str,
        job_id: i64,
    ) -> Result<JobProgress, ProviderError>;

    async fn rename_file(
        &self,
        owner_id: &str,
        file_id: i64,
        new_name: &str,
    ) -> Result<(), ProviderError>;

    async fn upload_cover(
        &self,
        owner_id: &str,
        parent_id: i64,
        file_name: &str,
        etag: &str,
        bytes: Vec<u8>,
    ) -> Result<(), ProviderError>;
}

/// Production implementation backed by the open API client. Tokens that the
/// provider rejects are invalidated so the next cycle starts from a fresh
/// fetch.
pub struct PanProvider {
    client: PanClient,
    tokens: TokenManager,
    list_limit: u32,
}

impl PanProvider {
    pub fn new(client: PanClient, tokens: TokenManager, list_limit: u32) -> Self {
        Self {
            client,
            tokens,
            list_limit,
        }
    }

    async fn on_error(&self, owner_id: &str, err: PanError) -> ProviderError {
        let mapped = ProviderError::from(err);
        if matches!(mapped, ProviderError::Auth(_)) {
            self.tokens.invalidate(owner_id).await;
        }
        mapped
    }
}

#[async_trait]
impl CloudProvider for PanProvider {
    async fn create_folder(
        &self,
        owner_id: &str,
        name: &str,
        parent_id: i64,
    ) -> Result<i64, ProviderError> {
        let token = self.tokens.token_for(owner_id).await?;
        match self.client.create_folder(&token, name, parent_id).await {
            Ok(dir_id) => Ok(dir_id),
            Err(err) => Err(self.on_error(owner_id, err).await),
        }
    }

    async fn list_folder(
        &self,
        owner_id: &str,
        parent_id: i64,
    ) -> Result<Vec<RemoteFile>, ProviderError> {
        let token = self.tokens.token_for(owner_id).await?;
        match self.client.list_folder(&token, parent_id, self.list_limit).await {
            Ok(files) => Ok(files),
            Err(err) => Err(self.on_error(owner_id, err).await),
        }
    }

    async fn submit_download(
        &self,
        owner_id: &str,
        url: &str,
        dir_id: i64,
    ) -> Result<i64, ProviderError> {
        let token = self.tokens.token_for(owner_id).await?;
        match self
            .client
            .submit_offline_download(&token, url, dir_id, None)
            .await
        {
            Ok(job_id) => Ok(job_id),
            Err(err) => Err(self.on_error(owner_id, err).await),
        }
    }

    async fn download_progress(
        &self,
        owner_id: &str,
        job_id: i64,
    ) -> Result<JobProgress, ProviderError> {
        let token = self.tokens.token_for(owner_id).await?;
        match self.client.offline_download_progress(&token, job_id).await {
            Ok(progress) => Ok(progress),
            Err(err) => Err(self.on_error(owner_id, err).await),
        }
    }

    async fn rename_file(
        &self,
        owner_id: &str,
        file_id: i64,
        new_name: &str,
    ) -> Result<(), ProviderError> {
        let token = self.tokens.token_for(owner_id).await?;
        match self.client.rename_file(&token, file_id, new_name).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.on_error(owner_id, err).await),
        }
    }

    async fn upload_cover(
        &self,
        owner_id: &str,
        parent_id: i64,
        file_name: &str,
        etag: &str,
        bytes: Vec<u8>,
    ) -> Result<(), ProviderError> {
        let token = self.tokens.token_for(owner_id).await?;
        match self
            .client
            .upload_cover(&token, parent_id, file_name, etag, bytes)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => Err(self.on_error(owner_id, err).await),
        }
    }
}
